//! Security group handler.

use super::load_balancer::disallow_all_egress;
use super::Fragment;
use crate::core::synth::{logical_id, CfnResource, SynthContext};
use crate::core::types::{IngressRule, SecurityGroupSpec};
use serde_json::{json, Value};

/// Egress rule allowing everything.
pub fn allow_all_egress() -> Value {
    json!([{
        "CidrIp": "0.0.0.0/0",
        "Description": "Allow all outbound traffic by default",
        "IpProtocol": "-1",
    }])
}

fn ingress_rule(rule: &IngressRule) -> Value {
    let to_port = rule.to_port.unwrap_or(rule.port);
    let description = rule.description.clone().unwrap_or_else(|| {
        if to_port == rule.port {
            format!("from {}:{}", rule.peer, rule.port)
        } else {
            format!("from {}:{}-{}", rule.peer, rule.port, to_port)
        }
    });
    json!({
        "CidrIp": rule.peer,
        "Description": description,
        "FromPort": rule.port,
        "IpProtocol": rule.protocol.to_string(),
        "ToPort": to_port,
    })
}

/// Synthesize a security group declaration.
pub fn synthesize(
    ctx: &mut SynthContext,
    id: &str,
    spec: &SecurityGroupSpec,
) -> Result<Fragment, String> {
    let description = spec
        .description
        .clone()
        .unwrap_or_else(|| format!("{}/{}", ctx.stack, id));

    let mut props = serde_json::Map::new();
    props.insert("GroupDescription".to_string(), json!(description));
    if let Some(ref name) = spec.name {
        props.insert("GroupName".to_string(), json!(name));
    }
    props.insert(
        "SecurityGroupEgress".to_string(),
        if spec.allow_all_outbound {
            allow_all_egress()
        } else {
            disallow_all_egress()
        },
    );
    if !spec.ingress.is_empty() {
        let rules: Vec<Value> = spec.ingress.iter().map(ingress_rule).collect();
        props.insert("SecurityGroupIngress".to_string(), json!(rules));
    }
    props.insert("VpcId".to_string(), ctx.ref_of(&spec.vpc, "")?);

    Ok(vec![(
        logical_id(id),
        CfnResource::new("AWS::EC2::SecurityGroup", Value::Object(props)),
    )])
}
