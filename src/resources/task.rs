//! Task definition handler.
//!
//! Besides the task definition itself this synthesizes:
//! - the task role containers run as, with the declared task role policy
//! - one retained log group per container that logs
//! - a policy on the execution role allowing log delivery to those groups
//!   and reads of the containers' environment files

use super::iam::{attached_policy, declared_statement};
use super::{assume_role_document, statement, Fragment};
use crate::core::synth::{logical_id, CfnResource, SynthContext};
use crate::core::types::{ContainerSpec, ResourceKind, TaskDefinitionSpec};
use serde_json::{json, Value};
use std::collections::HashSet;

/// Trust principal of task roles.
pub const ECS_TASKS_PRINCIPAL: &str = "ecs-tasks.amazonaws.com";

/// Logical ID of a container's log group.
pub fn log_group_id(task_logical: &str, container: &str) -> String {
    format!("{}{}LogGroup", task_logical, logical_id(container))
}

fn container_definition(region: &str, task_logical: &str, c: &ContainerSpec) -> Value {
    let mut def = serde_json::Map::new();
    def.insert("Name".to_string(), json!(c.name));
    def.insert("Image".to_string(), json!(c.image));
    def.insert("Essential".to_string(), json!(c.essential));
    if let Some(mem) = c.memory_limit_mib {
        def.insert("Memory".to_string(), json!(mem));
    }
    if !c.port_mappings.is_empty() {
        let mappings: Vec<Value> = c
            .port_mappings
            .iter()
            .map(|p| json!({ "ContainerPort": p.container_port, "Protocol": p.protocol.to_string() }))
            .collect();
        def.insert("PortMappings".to_string(), json!(mappings));
    }
    if let Some(ref log) = c.logging {
        def.insert(
            "LogConfiguration".to_string(),
            json!({
                "LogDriver": "awslogs",
                "Options": {
                    "awslogs-group": { "Ref": log_group_id(task_logical, &c.name) },
                    "awslogs-stream-prefix": log.stream_prefix,
                    "awslogs-region": region,
                },
            }),
        );
    }
    if !c.environment_files.is_empty() {
        let files: Vec<Value> = c
            .environment_files
            .iter()
            .map(|f| json!({ "Type": "s3", "Value": f.object_arn() }))
            .collect();
        def.insert("EnvironmentFiles".to_string(), json!(files));
    }
    if !c.environment.is_empty() {
        let vars: Vec<Value> = c
            .environment
            .iter()
            .map(|(k, v)| json!({ "Name": k, "Value": v }))
            .collect();
        def.insert("Environment".to_string(), json!(vars));
    }
    Value::Object(def)
}

/// Statements the execution role needs for logging and environment files.
/// Containers sharing a bucket or file yield each statement once, in first
/// occurrence order.
fn execution_statements(task_logical: &str, containers: &[ContainerSpec]) -> Vec<Value> {
    let mut out = Vec::new();
    for c in containers {
        if c.logging.is_some() {
            out.push(statement(
                "Allow",
                &["logs:CreateLogStream".to_string(), "logs:PutLogEvents".to_string()],
                &[json!({ "Fn::GetAtt": [log_group_id(task_logical, &c.name), "Arn"] })],
            ));
        }
        for f in &c.environment_files {
            out.push(statement(
                "Allow",
                &["s3:GetBucketLocation".to_string()],
                &[json!(f.bucket_arn)],
            ));
            out.push(statement(
                "Allow",
                &["s3:GetObject".to_string()],
                &[json!(f.object_arn())],
            ));
        }
    }
    let mut seen = HashSet::new();
    out.retain(|s: &Value| seen.insert(s.to_string()));
    out
}

/// Synthesize a task definition declaration.
pub fn synthesize(
    ctx: &mut SynthContext,
    id: &str,
    spec: &TaskDefinitionSpec,
) -> Result<Fragment, String> {
    let base = logical_id(id);
    let (role_q, role) = ctx.resolve(&spec.execution_role)?;
    if !matches!(role.kind, ResourceKind::Role(_)) {
        return Err(format!(
            "task definition '{}': execution role '{}' is a {}",
            id, role_q, role.kind
        ));
    }
    let execution_role_arn = ctx.get_att(&spec.execution_role, "", "Arn")?;
    let execution_role_ref = ctx.ref_of(&spec.execution_role, "")?;

    let mut out: Fragment = Vec::new();

    let task_role = format!("{}TaskRole", base);
    out.push((
        task_role.clone(),
        CfnResource::new(
            "AWS::IAM::Role",
            json!({ "AssumeRolePolicyDocument": assume_role_document(ECS_TASKS_PRINCIPAL) }),
        ),
    ));
    if !spec.task_role_policy.is_empty() {
        let policy = format!("{}TaskRoleDefaultPolicy", base);
        let statements: Vec<Value> = spec.task_role_policy.iter().map(declared_statement).collect();
        out.push((
            policy.clone(),
            attached_policy(&policy, json!({ "Ref": task_role }), &statements),
        ));
    }

    for c in &spec.containers {
        if let Some(ref log) = c.logging {
            let mut props = serde_json::Map::new();
            if let Some(days) = log.retention_days {
                props.insert("RetentionInDays".to_string(), json!(days));
            }
            out.push((
                log_group_id(&base, &c.name),
                CfnResource::new("AWS::Logs::LogGroup", Value::Object(props)).retain(),
            ));
        }
    }

    let exec_statements = execution_statements(&base, &spec.containers);
    if !exec_statements.is_empty() {
        let policy = format!("{}ExecutionPolicy", base);
        out.push((
            policy.clone(),
            attached_policy(&policy, execution_role_ref, &exec_statements),
        ));
    }

    let family = spec
        .family
        .clone()
        .unwrap_or_else(|| format!("{}{}", logical_id(ctx.stack), base));
    let region = ctx.region();
    let containers: Vec<Value> = spec
        .containers
        .iter()
        .map(|c| container_definition(region, &base, c))
        .collect();

    out.push((
        base,
        CfnResource::new(
            "AWS::ECS::TaskDefinition",
            json!({
                "Family": family,
                "Cpu": spec.cpu.to_string(),
                "Memory": spec.memory_mib.to_string(),
                "NetworkMode": spec.network_mode.to_string(),
                "RequiresCompatibilities": spec.compatibility.launch_types(),
                "ExecutionRoleArn": execution_role_arn,
                "TaskRoleArn": { "Fn::GetAtt": [task_role, "Arn"] },
                "ContainerDefinitions": containers,
            }),
        ),
    ));

    Ok(out)
}
