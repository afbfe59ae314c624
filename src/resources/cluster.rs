//! ECS cluster handler.

use super::Fragment;
use crate::core::synth::{logical_id, CfnResource, SynthContext};
use crate::core::types::ClusterSpec;
use serde_json::json;

/// Synthesize a cluster declaration. The VPC is not part of the cluster
/// resource; services read it to pick their subnets.
pub fn synthesize(ctx: &mut SynthContext, id: &str, spec: &ClusterSpec) -> Result<Fragment, String> {
    ctx.vpc(&spec.vpc)?;

    let mut props = serde_json::Map::new();
    if let Some(ref name) = spec.name {
        props.insert("ClusterName".to_string(), json!(name));
    }
    if spec.container_insights {
        props.insert(
            "ClusterSettings".to_string(),
            json!([{ "Name": "containerInsights", "Value": "enabled" }]),
        );
    }

    Ok(vec![(
        logical_id(id),
        CfnResource::new("AWS::ECS::Cluster", serde_json::Value::Object(props)),
    )])
}
