//! Resource handlers: turn one declaration into CloudFormation resources.
//!
//! Each handler returns the resources it synthesizes as `(logical ID,
//! resource)` pairs. Logical IDs start with the declaration's own logical ID so
//! fragments from different declarations cannot collide unless the
//! declarations do.

pub mod cluster;
pub mod iam;
pub mod load_balancer;
pub mod security_group;
pub mod service;
pub mod task;
pub mod vpc;

use crate::core::synth::CfnResource;
use serde_json::{json, Value};

/// Resources synthesized from one declaration.
pub type Fragment = Vec<(String, CfnResource)>;

/// `Tags` entry naming the resource in the console.
pub fn name_tag(name: &str) -> Value {
    json!([{ "Key": "Name", "Value": name }])
}

/// IAM policy document wrapping a list of statements.
pub fn policy_document(statements: &[Value]) -> Value {
    json!({ "Version": "2012-10-17", "Statement": statements })
}

/// One IAM statement. Single-element lists collapse to a scalar.
pub fn statement(effect: &str, actions: &[String], resources: &[Value]) -> Value {
    let action = if actions.len() == 1 {
        json!(actions[0])
    } else {
        json!(actions)
    };
    let resource = if resources.len() == 1 {
        resources[0].clone()
    } else {
        json!(resources)
    };
    json!({ "Effect": effect, "Action": action, "Resource": resource })
}

/// Trust policy letting a service principal assume a role.
pub fn assume_role_document(principal: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": "sts:AssumeRole",
            "Principal": { "Service": principal },
        }],
    })
}
