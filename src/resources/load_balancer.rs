//! Application load balancing: load balancer, listener, target group.
//!
//! Every load balancer gets its own security group. Egress starts closed
//! (a rule no traffic can match) and is opened per attached service; an open
//! listener adds ingress from anywhere on its port.

use super::Fragment;
use crate::core::resolver::{self, QualifiedId};
use crate::core::synth::{logical_id, CfnResource, SynthContext};
use crate::core::types::*;
use serde_json::{json, Value};

/// Egress rule that matches nothing (icmp type 252, code 86).
pub fn disallow_all_egress() -> Value {
    json!([{
        "CidrIp": "255.255.255.255/32",
        "Description": "Disallow all traffic",
        "FromPort": 252,
        "IpProtocol": "icmp",
        "ToPort": 86,
    }])
}

/// Listeners (anywhere in the config) that forward to a target group.
pub fn listeners_forwarding_to<'a>(
    config: &'a InfraConfig,
    target_group: &QualifiedId,
) -> Vec<(QualifiedId, &'a ListenerSpec)> {
    let mut out = Vec::new();
    for (stack, decl) in &config.stacks {
        for (id, resource) in &decl.resources {
            if let ResourceKind::Listener(spec) = &resource.kind {
                let forwards = spec
                    .target_groups
                    .iter()
                    .any(|tg| &resolver::parse_ref(tg, stack) == target_group);
                if forwards {
                    out.push((QualifiedId::new(stack, id), spec));
                }
            }
        }
    }
    out
}

/// Listeners (anywhere in the config) on a load balancer.
pub fn listeners_on<'a>(
    config: &'a InfraConfig,
    load_balancer: &QualifiedId,
) -> Vec<(QualifiedId, &'a ListenerSpec)> {
    let mut out = Vec::new();
    for (stack, decl) in &config.stacks {
        for (id, resource) in &decl.resources {
            if let ResourceKind::Listener(spec) = &resource.kind {
                if &resolver::parse_ref(&spec.load_balancer, stack) == load_balancer {
                    out.push((QualifiedId::new(stack, id), spec));
                }
            }
        }
    }
    out
}

/// Synthesize a load balancer and its security group.
pub fn synthesize_load_balancer(
    ctx: &mut SynthContext,
    id: &str,
    spec: &LoadBalancerSpec,
) -> Result<Fragment, String> {
    let base = logical_id(id);
    let sg = format!("{}SecurityGroup", base);
    let this = QualifiedId::new(ctx.stack, id);

    let ingress: Vec<Value> = listeners_on(ctx.config, &this)
        .into_iter()
        .filter(|(_, l)| l.open)
        .map(|(_, l)| {
            json!({
                "CidrIp": "0.0.0.0/0",
                "Description": format!("Allow from anyone on port {}", l.port),
                "FromPort": l.port,
                "IpProtocol": "tcp",
                "ToPort": l.port,
            })
        })
        .collect();

    let mut sg_props = serde_json::Map::new();
    sg_props.insert(
        "GroupDescription".to_string(),
        json!(format!(
            "Automatically created Security Group for ELB {}{}",
            logical_id(ctx.stack),
            base
        )),
    );
    sg_props.insert("SecurityGroupEgress".to_string(), disallow_all_egress());
    if !ingress.is_empty() {
        sg_props.insert("SecurityGroupIngress".to_string(), json!(ingress));
    }
    sg_props.insert("VpcId".to_string(), ctx.ref_of(&spec.vpc, "")?);

    let subnets = ctx.subnet_ids(&spec.vpc, spec.subnet_tier())?;

    let mut lb_props = serde_json::Map::new();
    if let Some(ref name) = spec.name {
        lb_props.insert("Name".to_string(), json!(name));
    }
    lb_props.insert(
        "LoadBalancerAttributes".to_string(),
        json!([{ "Key": "deletion_protection.enabled", "Value": "false" }]),
    );
    lb_props.insert(
        "Scheme".to_string(),
        json!(if spec.internet_facing { "internet-facing" } else { "internal" }),
    );
    lb_props.insert(
        "SecurityGroups".to_string(),
        json!([{ "Fn::GetAtt": [sg, "GroupId"] }]),
    );
    lb_props.insert("Subnets".to_string(), json!(subnets));
    lb_props.insert("Type".to_string(), json!("application"));

    Ok(vec![
        (
            sg,
            CfnResource::new("AWS::EC2::SecurityGroup", Value::Object(sg_props)),
        ),
        (
            base,
            CfnResource::new(
                "AWS::ElasticLoadBalancingV2::LoadBalancer",
                Value::Object(lb_props),
            ),
        ),
    ])
}

/// Synthesize a listener forwarding to its target groups.
pub fn synthesize_listener(
    ctx: &mut SynthContext,
    id: &str,
    spec: &ListenerSpec,
) -> Result<Fragment, String> {
    let mut target_groups = Vec::new();
    for tg in &spec.target_groups {
        target_groups.push(ctx.ref_of(tg, "")?);
    }

    let action = match target_groups.as_slice() {
        [] => json!({
            "Type": "fixed-response",
            "FixedResponseConfig": { "StatusCode": "503" },
        }),
        [single] => json!({ "Type": "forward", "TargetGroupArn": single }),
        many => {
            let weighted: Vec<Value> = many
                .iter()
                .map(|arn| json!({ "TargetGroupArn": arn, "Weight": 1 }))
                .collect();
            json!({ "Type": "forward", "ForwardConfig": { "TargetGroups": weighted } })
        }
    };

    let mut props = serde_json::Map::new();
    if !spec.certificate_arns.is_empty() {
        let certs: Vec<Value> = spec
            .certificate_arns
            .iter()
            .map(|arn| json!({ "CertificateArn": arn }))
            .collect();
        props.insert("Certificates".to_string(), json!(certs));
    }
    props.insert("DefaultActions".to_string(), json!([action]));
    props.insert(
        "LoadBalancerArn".to_string(),
        ctx.ref_of(&spec.load_balancer, "")?,
    );
    props.insert("Port".to_string(), json!(spec.port));
    props.insert("Protocol".to_string(), json!(spec.protocol.to_string()));

    Ok(vec![(
        logical_id(id),
        CfnResource::new("AWS::ElasticLoadBalancingV2::Listener", Value::Object(props)),
    )])
}

/// Synthesize a target group.
pub fn synthesize_target_group(
    ctx: &mut SynthContext,
    id: &str,
    spec: &TargetGroupSpec,
) -> Result<Fragment, String> {
    let hc = &spec.health_check;
    let mut props = serde_json::Map::new();
    props.insert("HealthCheckPath".to_string(), json!(hc.path));
    if let Some(v) = hc.interval_seconds {
        props.insert("HealthCheckIntervalSeconds".to_string(), json!(v));
    }
    if let Some(v) = hc.timeout_seconds {
        props.insert("HealthCheckTimeoutSeconds".to_string(), json!(v));
    }
    if let Some(v) = hc.healthy_threshold {
        props.insert("HealthyThresholdCount".to_string(), json!(v));
    }
    if let Some(v) = hc.unhealthy_threshold {
        props.insert("UnhealthyThresholdCount".to_string(), json!(v));
    }
    if let Some(ref codes) = hc.matcher {
        props.insert("Matcher".to_string(), json!({ "HttpCode": codes }));
    }
    if let Some(ref name) = spec.name {
        props.insert("Name".to_string(), json!(name));
    }
    props.insert("Port".to_string(), json!(spec.port));
    props.insert("Protocol".to_string(), json!(spec.protocol.to_string()));
    if let Some(delay) = spec.deregistration_delay_seconds {
        props.insert(
            "TargetGroupAttributes".to_string(),
            json!([{ "Key": "deregistration_delay.timeout_seconds", "Value": delay.to_string() }]),
        );
    }
    props.insert("TargetType".to_string(), json!(spec.target_type.to_string()));
    props.insert("VpcId".to_string(), ctx.ref_of(&spec.vpc, "")?);

    Ok(vec![(
        logical_id(id),
        CfnResource::new(
            "AWS::ElasticLoadBalancingV2::TargetGroup",
            Value::Object(props),
        ),
    )])
}
