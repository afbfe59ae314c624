//! Consistency checks over the synthesized templates and the declarations
//! behind them: who can do what to which ARN, and whether traffic reaching a
//! load balancer can make it to the container.

use super::resolver::{self, QualifiedId};
use super::synth::StackTemplate;
use super::types::*;
use crate::resources::load_balancer::listeners_forwarding_to;
use crate::resources::service::registered_target;
use serde::Serialize;
use serde_json::Value;

/// One IAM statement and the resources it applies to.
#[derive(Debug, Clone, Serialize)]
pub struct IamScope {
    pub stack: String,
    /// Logical ID of the policy resource
    pub policy: String,
    /// Declaration the policy was synthesized from
    pub source: String,
    pub effect: String,
    pub actions: Vec<String>,
    /// Resource scope; intrinsics are rendered as compact JSON
    pub resources: Vec<String>,
}

impl IamScope {
    pub fn is_wildcard(&self) -> bool {
        self.resources.iter().any(|r| r == "*")
    }
}

fn strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().flat_map(strings).collect(),
        Value::String(s) => vec![s.clone()],
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

/// Every IAM policy statement in the templates, in template order.
pub fn iam_scopes(templates: &[StackTemplate]) -> Vec<IamScope> {
    let mut scopes = Vec::new();
    for template in templates {
        for (logical, r) in template.resources_of_type("AWS::IAM::Policy") {
            let statements = r.properties["PolicyDocument"]["Statement"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            for s in statements {
                scopes.push(IamScope {
                    stack: template.stack.clone(),
                    policy: logical.clone(),
                    source: r.source.clone(),
                    effect: s["Effect"].as_str().unwrap_or("Allow").to_string(),
                    actions: strings(&s["Action"]),
                    resources: strings(&s["Resource"]),
                });
            }
        }
    }
    scopes
}

/// Allow statements whose resource scope is `*`.
pub fn wildcard_grants(templates: &[StackTemplate]) -> Vec<IamScope> {
    iam_scopes(templates)
        .into_iter()
        .filter(|s| s.effect == "Allow" && s.is_wildcard())
        .collect()
}

/// Result of one port check on a service attachment.
#[derive(Debug, Clone, Serialize)]
pub struct PortCheck {
    pub service: String,
    pub check: &'static str,
    pub passed: bool,
    pub detail: String,
}

fn check(service: &QualifiedId, name: &'static str, passed: bool, detail: String) -> PortCheck {
    PortCheck {
        service: service.to_string(),
        check: name,
        passed,
        detail,
    }
}

fn task_of<'a>(config: &'a InfraConfig, q: &QualifiedId) -> Option<&'a TaskDefinitionSpec> {
    match &resolver::lookup(config, q)?.kind {
        ResourceKind::TaskDefinition(t) => Some(t),
        _ => None,
    }
}

fn target_group_of<'a>(config: &'a InfraConfig, q: &QualifiedId) -> Option<&'a TargetGroupSpec> {
    match &resolver::lookup(config, q)?.kind {
        ResourceKind::TargetGroup(t) => Some(t),
        _ => None,
    }
}

fn declared_groups<'a>(
    config: &'a InfraConfig,
    stack: &str,
    spec: &FargateServiceSpec,
) -> Vec<(QualifiedId, &'a SecurityGroupSpec)> {
    spec.security_groups
        .iter()
        .filter_map(|raw| {
            let q = resolver::parse_ref(raw, stack);
            match &resolver::lookup(config, &q)?.kind {
                ResourceKind::SecurityGroup(sg) => Some((q, sg)),
                _ => None,
            }
        })
        .collect()
}

/// Synthesized ingress rules of a service that admit `port` from another
/// security group, by logical ID.
fn synthesized_ingress(templates: &[StackTemplate], service: &QualifiedId, port: u16) -> Vec<String> {
    let Some(template) = templates.iter().find(|t| t.stack == service.stack) else {
        return Vec::new();
    };
    template
        .resources_of_type("AWS::EC2::SecurityGroupIngress")
        .filter(|(_, r)| r.source == service.id)
        .filter(|(_, r)| !r.properties["SourceSecurityGroupId"].is_null())
        .filter(|(_, r)| {
            let from = r.properties["FromPort"].as_u64();
            let to = r.properties["ToPort"].as_u64();
            matches!((from, to), (Some(f), Some(t)) if f <= u64::from(port) && u64::from(port) <= t)
        })
        .map(|(logical, _)| logical.clone())
        .collect()
}

/// Follow every service attachment from listener to container port.
///
/// For each target group a service registers with:
/// - listener protocol matches the target group protocol
/// - the registered container maps the registered port
/// - the health check path is absolute
/// - a synthesized load balancer rule or a declared group admits the
///   registered port
pub fn port_consistency(config: &InfraConfig, templates: &[StackTemplate]) -> Vec<PortCheck> {
    let mut checks = Vec::new();

    for (stack, decl) in &config.stacks {
        for (id, resource) in &decl.resources {
            let ResourceKind::FargateService(spec) = &resource.kind else {
                continue;
            };
            if spec.target_groups.is_empty() {
                continue;
            }
            let service = QualifiedId::new(stack, id);
            let task_q = resolver::parse_ref(&spec.task_definition, stack);
            let Some(task) = task_of(config, &task_q) else {
                checks.push(check(
                    &service,
                    "container",
                    false,
                    format!("task definition '{}' not found", task_q),
                ));
                continue;
            };

            let target = registered_target(spec, task);
            let port = match target {
                Some((c, port)) => {
                    checks.push(check(
                        &service,
                        "container",
                        c.maps_port(port),
                        format!("container '{}' port {}", c.name, port),
                    ));
                    Some(port)
                }
                None => {
                    checks.push(check(
                        &service,
                        "container",
                        false,
                        "no container port to register".to_string(),
                    ));
                    None
                }
            };

            for raw in &spec.target_groups {
                let tg_q = resolver::parse_ref(raw, stack);
                let Some(tg) = target_group_of(config, &tg_q) else {
                    continue;
                };
                let listeners = listeners_forwarding_to(config, &tg_q);
                if listeners.is_empty() {
                    checks.push(check(
                        &service,
                        "listener",
                        false,
                        format!("no listener forwards to '{}'", tg_q),
                    ));
                }
                for (l_q, l) in &listeners {
                    checks.push(check(
                        &service,
                        "protocol",
                        l.protocol == tg.protocol,
                        format!(
                            "listener '{}' {}:{} -> target group '{}' {}:{}",
                            l_q, l.protocol, l.port, tg_q, tg.protocol, tg.port
                        ),
                    ));
                }
                checks.push(check(
                    &service,
                    "health_check",
                    tg.health_check.path.starts_with('/'),
                    format!("'{}' checks {}", tg_q, tg.health_check.path),
                ));
            }

            if let Some(port) = port {
                let groups = declared_groups(config, stack, spec);
                let covering: Vec<String> = groups
                    .iter()
                    .filter(|(_, sg)| sg.ingress.iter().any(|rule| rule.covers(port)))
                    .map(|(q, _)| q.to_string())
                    .collect();
                let rules = synthesized_ingress(templates, &service, port);
                let passed = !covering.is_empty() || !rules.is_empty();
                let detail = match (covering.is_empty(), rules.is_empty()) {
                    (true, true) => format!("port {} not admitted by any security group rule", port),
                    (true, false) => format!(
                        "port {} admitted only by load balancer rules ({}); declared groups do not cover it",
                        port,
                        rules.join(", ")
                    ),
                    _ => format!("port {} admitted by {}", port, covering.join(", ")),
                };
                checks.push(check(&service, "security_group", passed, detail));
            }
        }
    }

    checks
}
