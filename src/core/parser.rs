//! YAML parsing and validation.
//!
//! Parsing expands `{{...}}` templates inside `stacks` before deserializing,
//! so templated lists and numbers land in typed fields. Validation collects
//! every problem instead of stopping at the first:
//! - version, name, account, and region
//! - references resolve and point at the expected kind
//! - address layout, task sizing, IAM syntax, health checks
//! - listener, target group, and service attachment consistency

use super::network::{self, Ipv4Cidr, MAX_PREFIX, MIN_VPC_PREFIX};
use super::resolver::{self, QualifiedId};
use super::types::*;
use crate::resources::service::registered_target;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

static ACCOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{12}$").expect("account pattern"));
static REGION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]{2}(-gov|-iso[a-z]*)?-[a-z]+-\d$").expect("region pattern")
});
static ARN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:aws[a-z-]*:[a-z0-9-]+:[a-z0-9-]*:(\d{12}|aws)?:.+$").expect("ARN pattern")
});
static ACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9-]+:[A-Za-z0-9*]+|\*)$").expect("action pattern")
});
static PRINCIPAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9.-]+\.amazonaws\.com$").expect("principal pattern")
});
static STACK_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$").expect("stack name pattern")
});

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse an infra.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<InfraConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse an infra.yaml from a string, expanding templates.
pub fn parse_config(yaml: &str) -> Result<InfraConfig, String> {
    let mut raw: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))?;

    let params: HashMap<String, serde_yaml_ng::Value> = match raw.get("params") {
        Some(p) => serde_yaml_ng::from_value(p.clone())
            .map_err(|e| format!("YAML parse error in params: {}", e))?,
        None => HashMap::new(),
    };
    let env: Environment = match raw.get("env") {
        Some(e) => serde_yaml_ng::from_value(e.clone())
            .map_err(|e| format!("YAML parse error in env: {}", e))?,
        None => return Err("YAML parse error: missing field `env`".to_string()),
    };

    if let Some(stacks) = raw.get_mut("stacks") {
        resolver::expand_templates(stacks, &params, &env)
            .map_err(|e| format!("template error: {}", e))?;
    }

    serde_yaml_ng::from_value(raw).map_err(|e| format!("YAML parse error: {}", e))
}

fn err(errors: &mut Vec<ValidationError>, message: String) {
    errors.push(ValidationError { message });
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &InfraConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        err(
            &mut errors,
            format!("version must be \"1.0\", got \"{}\"", config.version),
        );
    }
    if config.name.is_empty() {
        err(&mut errors, "name must not be empty".to_string());
    }
    if !ACCOUNT_RE.is_match(&config.env.account) {
        err(
            &mut errors,
            format!("env.account '{}' must be 12 digits", config.env.account),
        );
    }
    if !REGION_RE.is_match(&config.env.region) {
        err(
            &mut errors,
            format!("env.region '{}' is not a valid region", config.env.region),
        );
    }
    if config.policy.cli.trim().is_empty() {
        err(&mut errors, "policy.cli must not be empty".to_string());
    }
    if config.stacks.is_empty() {
        err(&mut errors, "no stacks declared".to_string());
    }

    let before_refs = errors.len();
    for (stack_name, stack) in &config.stacks {
        if !STACK_NAME_RE.is_match(stack_name) {
            err(
                &mut errors,
                format!(
                    "stack name '{}' must start with a letter and contain only letters, digits, and '-'",
                    stack_name
                ),
            );
        }
        for dep in &stack.depends_on {
            if dep == stack_name {
                err(&mut errors, format!("stack '{}' depends on itself", stack_name));
            } else if !config.stacks.contains_key(dep) {
                err(
                    &mut errors,
                    format!("stack '{}' depends on unknown stack '{}'", stack_name, dep),
                );
            }
        }
        for (id, resource) in &stack.resources {
            let q = QualifiedId::new(stack_name, id);
            validate_id(&q, &mut errors);
            validate_references(config, &q, resource, &mut errors);
        }
    }
    // Graph errors are only meaningful once every reference resolves
    if errors.len() == before_refs {
        if let Err(e) = resolver::build_stack_order(config) {
            err(&mut errors, e);
        }
    }

    for (stack_name, stack) in &config.stacks {
        for (id, resource) in &stack.resources {
            let q = QualifiedId::new(stack_name, id);
            match &resource.kind {
                ResourceKind::Vpc(spec) => validate_vpc(&q, spec, &mut errors),
                ResourceKind::Cluster(_) => {}
                ResourceKind::Role(spec) => validate_role(&q, spec, &mut errors),
                ResourceKind::TaskDefinition(spec) => validate_task(&q, spec, &mut errors),
                ResourceKind::LoadBalancer(_) => {}
                ResourceKind::Listener(spec) => validate_listener(config, &q, spec, &mut errors),
                ResourceKind::TargetGroup(spec) => validate_target_group(&q, spec, &mut errors),
                ResourceKind::SecurityGroup(spec) => {
                    validate_security_group(&q, spec, &mut errors)
                }
                ResourceKind::FargateService(spec) => {
                    validate_service(config, &q, spec, &mut errors)
                }
            }
        }
    }

    errors
}

fn validate_id(q: &QualifiedId, errors: &mut Vec<ValidationError>) {
    if q.id.contains('/') {
        err(errors, format!("resource ID '{}' must not contain '/'", q));
    } else if q.id.chars().all(|c| !c.is_ascii_alphanumeric()) {
        err(
            errors,
            format!("resource ID '{}' needs at least one letter or digit", q),
        );
    }
}

fn validate_references(
    config: &InfraConfig,
    q: &QualifiedId,
    resource: &Resource,
    errors: &mut Vec<ValidationError>,
) {
    for r in resolver::references(resource) {
        let target = resolver::parse_ref(r.raw, &q.stack);
        if &target == q {
            err(errors, format!("resource '{}' depends on itself", q));
            continue;
        }
        let Some(found) = resolver::lookup(config, &target) else {
            err(
                errors,
                format!("resource '{}' references unknown '{}' in {}", q, target, r.field),
            );
            continue;
        };
        if let Some(expected) = r.expected {
            if found.kind.type_name() != expected {
                err(
                    errors,
                    format!(
                        "resource '{}' {} must reference a {}, '{}' is a {}",
                        q, r.field, expected, target, found.kind
                    ),
                );
            }
        }
    }
}

fn validate_vpc(q: &QualifiedId, spec: &VpcSpec, errors: &mut Vec<ValidationError>) {
    let block: Ipv4Cidr = match spec.cidr.parse() {
        Ok(b) => b,
        Err(e) => {
            err(errors, format!("vpc '{}': {}", q, e));
            return;
        }
    };
    if block.prefix() < MIN_VPC_PREFIX || block.prefix() > MAX_PREFIX {
        err(
            errors,
            format!(
                "vpc '{}': prefix /{} must be between /{} and /{}",
                q,
                block.prefix(),
                MIN_VPC_PREFIX,
                MAX_PREFIX
            ),
        );
    }
    if spec.max_azs == 0 {
        err(errors, format!("vpc '{}': max_azs must be at least 1", q));
    }
    if spec.subnets.is_empty() {
        err(errors, format!("vpc '{}': no subnet groups", q));
    }

    let mut seen = HashSet::new();
    for group in &spec.subnets {
        if !seen.insert(group.name.as_str()) {
            err(
                errors,
                format!("vpc '{}': duplicate subnet group '{}'", q, group.name),
            );
        }
        if group.cidr_mask < block.prefix() || group.cidr_mask > MAX_PREFIX {
            err(
                errors,
                format!(
                    "vpc '{}': subnet group '{}' mask /{} must be between /{} and /{}",
                    q,
                    group.name,
                    group.cidr_mask,
                    block.prefix(),
                    MAX_PREFIX
                ),
            );
        }
    }

    let has_public = spec.subnets.iter().any(|g| g.tier == SubnetTier::Public);
    let needs_nat = spec
        .subnets
        .iter()
        .any(|g| g.tier == SubnetTier::PrivateWithNat);
    if needs_nat && !has_public {
        err(
            errors,
            format!("vpc '{}': private_with_nat subnets need a public subnet group", q),
        );
    }
    if needs_nat && spec.nat_gateways == 0 {
        err(
            errors,
            format!("vpc '{}': private_with_nat subnets need nat_gateways >= 1", q),
        );
    }
    if spec.nat_gateways > 0 && !has_public {
        err(
            errors,
            format!("vpc '{}': NAT gateways need a public subnet group", q),
        );
    }
    if spec.nat_gateways > spec.max_azs {
        err(
            errors,
            format!(
                "vpc '{}': {} NAT gateways exceed {} availability zones",
                q, spec.nat_gateways, spec.max_azs
            ),
        );
    }

    if !errors.iter().any(|e| e.message.starts_with(&format!("vpc '{}'", q))) {
        if let Err(e) = network::plan_subnets(spec) {
            err(errors, format!("vpc '{}': {}", q, e));
        }
    }
}

/// Fargate CPU units and the memory sizes (MiB) each supports.
pub fn fargate_memory_options(cpu: u32) -> Option<Vec<u32>> {
    let (min, max, step) = match cpu {
        256 => return Some(vec![512, 1024, 2048]),
        512 => (1024, 4096, 1024),
        1024 => (2048, 8192, 1024),
        2048 => (4096, 16384, 1024),
        4096 => (8192, 30720, 1024),
        8192 => (16384, 61440, 4096),
        16384 => (32768, 122880, 8192),
        _ => return None,
    };
    Some((min..=max).step_by(step).collect())
}

fn validate_task(q: &QualifiedId, spec: &TaskDefinitionSpec, errors: &mut Vec<ValidationError>) {
    if spec.compatibility.includes_fargate() {
        match fargate_memory_options(spec.cpu) {
            None => err(
                errors,
                format!(
                    "task definition '{}': cpu {} is not a Fargate size (256, 512, 1024, 2048, 4096, 8192, 16384)",
                    q, spec.cpu
                ),
            ),
            Some(options) if !options.contains(&spec.memory_mib) => err(
                errors,
                format!(
                    "task definition '{}': memory {} MiB is not valid with cpu {} (valid: {:?})",
                    q, spec.memory_mib, spec.cpu, options
                ),
            ),
            Some(_) => {}
        }
        if spec.network_mode != NetworkMode::Awsvpc {
            err(
                errors,
                format!(
                    "task definition '{}': Fargate requires network_mode awsvpc, got {}",
                    q, spec.network_mode
                ),
            );
        }
    }
    if spec.containers.is_empty() {
        err(errors, format!("task definition '{}': no containers", q));
    }

    let mut names = HashSet::new();
    for c in &spec.containers {
        let at = format!("task definition '{}' container '{}'", q, c.name);
        if !names.insert(c.name.as_str()) {
            err(errors, format!("{}: duplicate container name", at));
        }
        if c.image.trim().is_empty() {
            err(errors, format!("{}: image must not be empty", at));
        }
        if let Some(mem) = c.memory_limit_mib {
            if mem > spec.memory_mib {
                err(
                    errors,
                    format!(
                        "{}: memory limit {} MiB exceeds task memory {} MiB",
                        at, mem, spec.memory_mib
                    ),
                );
            }
        }
        for p in &c.port_mappings {
            if p.container_port == 0 {
                err(errors, format!("{}: port 0 is not a valid container port", at));
            }
        }
        if let Some(ref log) = c.logging {
            if log.stream_prefix.trim().is_empty() {
                err(errors, format!("{}: log stream_prefix must not be empty", at));
            }
        }
        for f in &c.environment_files {
            if !f.bucket_arn.starts_with("arn:aws:s3:::") || f.bucket_arn.len() == 13 {
                err(
                    errors,
                    format!("{}: environment file bucket '{}' is not an S3 bucket ARN", at, f.bucket_arn),
                );
            }
            if f.key.trim().is_empty() {
                err(errors, format!("{}: environment file key must not be empty", at));
            }
        }
    }

    for (i, s) in spec.task_role_policy.iter().enumerate() {
        validate_statement(&format!("task definition '{}' task_role_policy[{}]", q, i), s, errors);
    }
}

fn validate_statement(at: &str, s: &PolicyStatement, errors: &mut Vec<ValidationError>) {
    if s.actions.is_empty() {
        err(errors, format!("{}: no actions", at));
    }
    for a in &s.actions {
        if !ACTION_RE.is_match(a) {
            err(
                errors,
                format!("{}: action '{}' must be 'service:Action' or '*'", at, a),
            );
        }
    }
    if s.resources.is_empty() {
        err(errors, format!("{}: no resources", at));
    }
    for r in &s.resources {
        if r != "*" && !ARN_RE.is_match(r) {
            err(errors, format!("{}: resource '{}' is not '*' or an ARN", at, r));
        }
    }
}

fn validate_role(q: &QualifiedId, spec: &RoleSpec, errors: &mut Vec<ValidationError>) {
    if !PRINCIPAL_RE.is_match(&spec.assumed_by) {
        err(
            errors,
            format!(
                "role '{}': principal '{}' is not a service principal (*.amazonaws.com)",
                q, spec.assumed_by
            ),
        );
    }
    for arn in &spec.managed_policies {
        if !ARN_RE.is_match(arn) || !arn.contains(":policy/") {
            err(
                errors,
                format!("role '{}': managed policy '{}' is not a policy ARN", q, arn),
            );
        }
    }
    for (i, s) in spec.statements.iter().enumerate() {
        validate_statement(&format!("role '{}' statements[{}]", q, i), s, errors);
    }
}

fn validate_target_group(
    q: &QualifiedId,
    spec: &TargetGroupSpec,
    errors: &mut Vec<ValidationError>,
) {
    let at = format!("target group '{}'", q);
    let hc = &spec.health_check;
    if spec.port == 0 {
        err(errors, format!("{}: port must be 1-65535", at));
    }
    if !hc.path.starts_with('/') {
        err(errors, format!("{}: health check path '{}' must start with '/'", at, hc.path));
    }
    let interval = hc.effective_interval();
    let timeout = hc.effective_timeout();
    if !(5..=300).contains(&interval) {
        err(errors, format!("{}: health check interval {}s must be 5-300", at, interval));
    }
    if !(2..=120).contains(&timeout) {
        err(errors, format!("{}: health check timeout {}s must be 2-120", at, timeout));
    }
    if timeout >= interval {
        err(
            errors,
            format!(
                "{}: health check timeout {}s must be less than interval {}s",
                at, timeout, interval
            ),
        );
    }
    for (label, value) in [
        ("healthy_threshold", hc.healthy_threshold),
        ("unhealthy_threshold", hc.unhealthy_threshold),
    ] {
        if let Some(v) = value {
            if !(2..=10).contains(&v) {
                err(errors, format!("{}: {} {} must be 2-10", at, label, v));
            }
        }
    }
    if let Some(delay) = spec.deregistration_delay_seconds {
        if delay > 3600 {
            err(
                errors,
                format!("{}: deregistration delay {}s must be 0-3600", at, delay),
            );
        }
    }
}

fn target_group_of<'a>(config: &'a InfraConfig, q: &QualifiedId) -> Option<&'a TargetGroupSpec> {
    match &resolver::lookup(config, q)?.kind {
        ResourceKind::TargetGroup(tg) => Some(tg),
        _ => None,
    }
}

fn validate_listener(
    config: &InfraConfig,
    q: &QualifiedId,
    spec: &ListenerSpec,
    errors: &mut Vec<ValidationError>,
) {
    if spec.port == 0 {
        err(errors, format!("listener '{}': port must be 1-65535", q));
    }
    if spec.protocol == AppProtocol::Https && spec.certificate_arns.is_empty() {
        err(errors, format!("listener '{}': HTTPS needs a certificate", q));
    }
    for arn in &spec.certificate_arns {
        if !ARN_RE.is_match(arn) {
            err(errors, format!("listener '{}': certificate '{}' is not an ARN", q, arn));
        }
    }
    for raw in &spec.target_groups {
        let tg_q = resolver::parse_ref(raw, &q.stack);
        if let Some(tg) = target_group_of(config, &tg_q) {
            if tg.protocol != spec.protocol {
                err(
                    errors,
                    format!(
                        "listener '{}' ({}) forwards to target group '{}' ({})",
                        q, spec.protocol, tg_q, tg.protocol
                    ),
                );
            }
        }
    }
}

fn validate_security_group(
    q: &QualifiedId,
    spec: &SecurityGroupSpec,
    errors: &mut Vec<ValidationError>,
) {
    for rule in &spec.ingress {
        if let Err(e) = rule.peer.parse::<Ipv4Cidr>() {
            err(errors, format!("security group '{}': {}", q, e));
        }
        if let Some(to) = rule.to_port {
            if to < rule.port {
                err(
                    errors,
                    format!(
                        "security group '{}': port range {}-{} is reversed",
                        q, rule.port, to
                    ),
                );
            }
        }
    }
}

fn validate_service(
    config: &InfraConfig,
    q: &QualifiedId,
    spec: &FargateServiceSpec,
    errors: &mut Vec<ValidationError>,
) {
    let at = format!("service '{}'", q);
    let task_q = resolver::parse_ref(&spec.task_definition, &q.stack);
    let task = match resolver::lookup(config, &task_q).map(|r| &r.kind) {
        Some(ResourceKind::TaskDefinition(t)) => Some(t),
        _ => None,
    };

    if let Some(task) = task {
        if !task.compatibility.includes_fargate() {
            err(
                errors,
                format!("{}: task definition '{}' is not Fargate-compatible", at, task_q),
            );
        }
        if let Some(ref name) = spec.container {
            if task.container(name).is_none() {
                err(
                    errors,
                    format!("{}: container '{}' is not in task definition '{}'", at, name, task_q),
                );
            }
        }
        if !spec.target_groups.is_empty() {
            match registered_target(spec, task) {
                None => err(
                    errors,
                    format!("{}: no container port to register with the target groups", at),
                ),
                Some((c, port)) if !c.maps_port(port) => err(
                    errors,
                    format!("{}: container '{}' does not map port {}", at, c.name, port),
                ),
                Some(_) => {}
            }
        }
        for raw in &spec.target_groups {
            let tg_q = resolver::parse_ref(raw, &q.stack);
            if let Some(tg) = target_group_of(config, &tg_q) {
                if task.network_mode == NetworkMode::Awsvpc && tg.target_type != TargetType::Ip {
                    err(
                        errors,
                        format!(
                            "{}: awsvpc tasks need target type ip, '{}' is {}",
                            at, tg_q, tg.target_type
                        ),
                    );
                }
            }
        }
    }

    if let Some(ref scaling) = spec.auto_scaling {
        if scaling.min_capacity > scaling.max_capacity {
            err(
                errors,
                format!(
                    "{}: min_capacity {} exceeds max_capacity {}",
                    at, scaling.min_capacity, scaling.max_capacity
                ),
            );
        } else if spec.desired_count < scaling.min_capacity
            || spec.desired_count > scaling.max_capacity
        {
            err(
                errors,
                format!(
                    "{}: desired_count {} is outside {}-{}",
                    at, spec.desired_count, scaling.min_capacity, scaling.max_capacity
                ),
            );
        }
        let mut names = HashSet::new();
        for p in &scaling.policies {
            if !names.insert(p.name.as_str()) {
                err(errors, format!("{}: duplicate scaling policy '{}'", at, p.name));
            }
            if !(1..=100).contains(&p.target_utilization_percent) {
                err(
                    errors,
                    format!(
                        "{}: scaling policy '{}' target {}% must be 1-100",
                        at, p.name, p.target_utilization_percent
                    ),
                );
            }
        }
    }
}
