//! IAM role handler, plus the policy helper the task handler reuses.

use super::{assume_role_document, policy_document, statement, Fragment};
use crate::core::synth::{logical_id, CfnResource, SynthContext};
use crate::core::types::{PolicyStatement, RoleSpec};
use serde_json::{json, Value};

/// Statement JSON for a declared policy statement.
pub fn declared_statement(s: &PolicyStatement) -> Value {
    let resources: Vec<Value> = s.resources.iter().map(|r| json!(r)).collect();
    statement(&s.effect.to_string(), &s.actions, &resources)
}

/// An `AWS::IAM::Policy` attached to one role.
pub fn attached_policy(policy_logical: &str, role: Value, statements: &[Value]) -> CfnResource {
    CfnResource::new(
        "AWS::IAM::Policy",
        json!({
            "PolicyName": policy_logical,
            "PolicyDocument": policy_document(statements),
            "Roles": [role],
        }),
    )
}

/// Synthesize a role declaration.
pub fn synthesize(_ctx: &mut SynthContext, id: &str, spec: &RoleSpec) -> Result<Fragment, String> {
    let base = logical_id(id);

    let mut props = serde_json::Map::new();
    props.insert(
        "AssumeRolePolicyDocument".to_string(),
        assume_role_document(&spec.assumed_by),
    );
    if !spec.managed_policies.is_empty() {
        props.insert("ManagedPolicyArns".to_string(), json!(spec.managed_policies));
    }
    if let Some(ref name) = spec.name {
        props.insert("RoleName".to_string(), json!(name));
    }

    let mut out: Fragment = vec![(
        base.clone(),
        CfnResource::new("AWS::IAM::Role", Value::Object(props)),
    )];

    if !spec.statements.is_empty() {
        let policy = format!("{}InlinePolicy", base);
        let statements: Vec<Value> = spec.statements.iter().map(declared_statement).collect();
        out.push((
            policy.clone(),
            attached_policy(&policy, json!({ "Ref": base }), &statements),
        ));
    }

    Ok(out)
}
