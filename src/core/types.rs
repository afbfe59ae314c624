//! Schema types for infra.yaml, state locks, plans, and provenance events.
//!
//! Every declaration type derives Serialize/Deserialize so a config can be
//! read from YAML, dumped back, and hashed deterministically.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Top-level infra.yaml
// ============================================================================

/// Root configuration: the desired state of every stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Application name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Target AWS account and region
    pub env: Environment,

    /// Global parameters (templatable)
    #[serde(default)]
    pub params: HashMap<String, serde_yaml_ng::Value>,

    /// Stack declarations (order-preserving)
    pub stacks: IndexMap<String, StackDecl>,

    /// Deployment policy
    #[serde(default)]
    pub policy: Policy,
}

/// Deployment target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    /// 12-digit AWS account ID
    pub account: String,

    /// AWS region (e.g. us-east-1)
    pub region: String,
}

/// A named group of resources deployed and versioned as a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackDecl {
    #[serde(default)]
    pub description: Option<String>,

    /// Stacks that must be deployed first, beyond those implied by references
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Tags propagated to every resource of the stack
    #[serde(default)]
    pub tags: IndexMap<String, String>,

    /// Resource declarations (order-preserving)
    #[serde(default)]
    pub resources: IndexMap<String, Resource>,
}

// ============================================================================
// Resources
// ============================================================================

/// A single resource declaration.
///
/// References to other resources are plain strings: `id` for a resource in the
/// same stack, `Stack/id` for a resource in another stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Explicit ordering dependencies (resource references)
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(flatten)]
    pub kind: ResourceKind,
}

/// Resource kind, selected by the `type` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceKind {
    Vpc(VpcSpec),
    Cluster(ClusterSpec),
    Role(RoleSpec),
    TaskDefinition(TaskDefinitionSpec),
    LoadBalancer(LoadBalancerSpec),
    Listener(ListenerSpec),
    TargetGroup(TargetGroupSpec),
    SecurityGroup(SecurityGroupSpec),
    FargateService(FargateServiceSpec),
}

impl ResourceKind {
    /// The `type` key this kind is declared with.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Vpc(_) => "vpc",
            Self::Cluster(_) => "cluster",
            Self::Role(_) => "role",
            Self::TaskDefinition(_) => "task_definition",
            Self::LoadBalancer(_) => "load_balancer",
            Self::Listener(_) => "listener",
            Self::TargetGroup(_) => "target_group",
            Self::SecurityGroup(_) => "security_group",
            Self::FargateService(_) => "fargate_service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

// -- Network -----------------------------------------------------------------

/// Virtual network with subnet groups spread over availability zones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpcSpec {
    #[serde(default)]
    pub name: Option<String>,

    /// IPv4 block in CIDR notation
    pub cidr: String,

    /// Number of availability zones to spread subnets over
    #[serde(default = "default_max_azs")]
    pub max_azs: u8,

    /// NAT gateways for egress from private subnets
    #[serde(default)]
    pub nat_gateways: u8,

    /// Subnet groups, allocated in declaration order
    pub subnets: Vec<SubnetGroup>,
}

fn default_max_azs() -> u8 {
    2
}

/// One subnet per availability zone with the same mask and tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetGroup {
    pub name: String,
    pub cidr_mask: u8,
    pub tier: SubnetTier,
}

/// Subnet access tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetTier {
    Public,
    PrivateWithNat,
    PrivateIsolated,
}

impl SubnetTier {
    pub fn is_private(self) -> bool {
        !matches!(self, Self::Public)
    }
}

impl fmt::Display for SubnetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::PrivateWithNat => write!(f, "private_with_nat"),
            Self::PrivateIsolated => write!(f, "private_isolated"),
        }
    }
}

/// Security group with explicit ingress rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityGroupSpec {
    #[serde(default)]
    pub name: Option<String>,

    pub vpc: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_true")]
    pub allow_all_outbound: bool,

    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

/// Inbound rule from a CIDR peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default = "default_any_ipv4")]
    pub peer: String,

    pub port: u16,

    /// Upper bound of a port range; defaults to `port`
    #[serde(default)]
    pub to_port: Option<u16>,

    #[serde(default)]
    pub protocol: IpProtocol,

    #[serde(default)]
    pub description: Option<String>,
}

impl IngressRule {
    pub fn covers(&self, port: u16) -> bool {
        port >= self.port && port <= self.to_port.unwrap_or(self.port)
    }
}

fn default_any_ipv4() -> String {
    "0.0.0.0/0".to_string()
}

/// Transport protocol for ports and security group rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpProtocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

// -- Containers --------------------------------------------------------------

/// ECS cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default)]
    pub name: Option<String>,

    /// Network the cluster's services run in
    pub vpc: String,

    #[serde(default)]
    pub container_insights: bool,
}

/// Task definition: a template for one or more containers run as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinitionSpec {
    #[serde(default)]
    pub family: Option<String>,

    #[serde(default)]
    pub compatibility: Compatibility,

    /// CPU units (1024 = 1 vCPU)
    pub cpu: u32,

    pub memory_mib: u32,

    #[serde(default)]
    pub network_mode: NetworkMode,

    /// Role the agent uses to pull images, fetch env files, and ship logs
    pub execution_role: String,

    /// Statements granted to the task role the containers run as
    #[serde(default)]
    pub task_role_policy: Vec<PolicyStatement>,

    pub containers: Vec<ContainerSpec>,
}

impl TaskDefinitionSpec {
    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// The container load balancers attach to when none is named.
    pub fn default_container(&self) -> Option<&ContainerSpec> {
        self.containers
            .iter()
            .find(|c| c.essential)
            .or_else(|| self.containers.first())
    }
}

/// Launch type compatibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compatibility {
    #[default]
    Fargate,
    Ec2,
    Ec2AndFargate,
}

impl Compatibility {
    pub fn includes_fargate(self) -> bool {
        matches!(self, Self::Fargate | Self::Ec2AndFargate)
    }

    pub fn launch_types(self) -> &'static [&'static str] {
        match self {
            Self::Fargate => &["FARGATE"],
            Self::Ec2 => &["EC2"],
            Self::Ec2AndFargate => &["EC2", "FARGATE"],
        }
    }
}

/// Task network mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Awsvpc,
    Bridge,
    Host,
    None,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Awsvpc => write!(f, "awsvpc"),
            Self::Bridge => write!(f, "bridge"),
            Self::Host => write!(f, "host"),
            Self::None => write!(f, "none"),
        }
    }
}

/// A container within a task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,

    /// Image reference, pulled by tag
    pub image: String,

    /// Hard memory limit
    #[serde(default)]
    pub memory_limit_mib: Option<u32>,

    #[serde(default = "default_true")]
    pub essential: bool,

    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,

    #[serde(default)]
    pub logging: Option<LogSpec>,

    #[serde(default)]
    pub environment_files: Vec<EnvironmentFile>,

    #[serde(default)]
    pub environment: IndexMap<String, String>,
}

impl ContainerSpec {
    pub fn maps_port(&self, port: u16) -> bool {
        self.port_mappings.iter().any(|p| p.container_port == port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,

    #[serde(default)]
    pub protocol: IpProtocol,
}

/// Log destination for a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSpec {
    #[serde(default)]
    pub driver: LogDriver,

    pub stream_prefix: String,

    /// Log group retention; unset keeps logs forever
    #[serde(default)]
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDriver {
    #[default]
    Awslogs,
}

/// Environment file read from object storage at container start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentFile {
    /// Bucket ARN (arn:aws:s3:::bucket)
    pub bucket_arn: String,

    /// Object key within the bucket
    pub key: String,
}

impl EnvironmentFile {
    pub fn object_arn(&self) -> String {
        format!("{}/{}", self.bucket_arn.trim_end_matches('/'), self.key)
    }
}

// -- IAM ---------------------------------------------------------------------

/// IAM role assumed by a service principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    #[serde(default)]
    pub name: Option<String>,

    /// Service principal (e.g. ecs-tasks.amazonaws.com)
    pub assumed_by: String,

    #[serde(default)]
    pub managed_policies: Vec<String>,

    /// Inline policy statements
    #[serde(default)]
    pub statements: Vec<PolicyStatement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyStatement {
    #[serde(default)]
    pub effect: Effect,

    pub actions: Vec<String>,

    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "Allow"),
            Self::Deny => write!(f, "Deny"),
        }
    }
}

// -- Load balancing ----------------------------------------------------------

/// Application load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    #[serde(default)]
    pub name: Option<String>,

    pub vpc: String,

    #[serde(default)]
    pub internet_facing: bool,

    /// Subnet tier to place the load balancer in; public when internet-facing
    #[serde(default)]
    pub subnets: Option<SubnetTier>,
}

impl LoadBalancerSpec {
    pub fn subnet_tier(&self) -> SubnetTier {
        self.subnets.unwrap_or(if self.internet_facing {
            SubnetTier::Public
        } else {
            SubnetTier::PrivateWithNat
        })
    }
}

/// Listener on a load balancer forwarding to target groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub load_balancer: String,

    pub port: u16,

    #[serde(default)]
    pub protocol: AppProtocol,

    /// Allow inbound traffic from anywhere on the listener port
    #[serde(default)]
    pub open: bool,

    #[serde(default)]
    pub certificate_arns: Vec<String>,

    #[serde(default)]
    pub target_groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppProtocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for AppProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "HTTP"),
            Self::Https => write!(f, "HTTPS"),
        }
    }
}

/// Routable endpoints tracked with health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetGroupSpec {
    #[serde(default)]
    pub name: Option<String>,

    pub vpc: String,

    #[serde(default)]
    pub protocol: AppProtocol,

    pub port: u16,

    #[serde(default)]
    pub target_type: TargetType,

    #[serde(default)]
    pub health_check: HealthCheck,

    #[serde(default)]
    pub deregistration_delay_seconds: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[default]
    Instance,
    Ip,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance => write!(f, "instance"),
            Self::Ip => write!(f, "ip"),
        }
    }
}

/// Target group health check. Unset fields take the provider defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default)]
    pub interval_seconds: Option<u32>,

    #[serde(default)]
    pub timeout_seconds: Option<u32>,

    #[serde(default)]
    pub healthy_threshold: Option<u32>,

    #[serde(default)]
    pub unhealthy_threshold: Option<u32>,

    /// HTTP codes counted as healthy (e.g. "200-299")
    #[serde(default)]
    pub matcher: Option<String>,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_seconds: None,
            timeout_seconds: None,
            healthy_threshold: None,
            unhealthy_threshold: None,
            matcher: None,
        }
    }
}

impl HealthCheck {
    pub fn effective_interval(&self) -> u32 {
        self.interval_seconds.unwrap_or(30)
    }

    pub fn effective_timeout(&self) -> u32 {
        self.timeout_seconds.unwrap_or(5)
    }
}

fn default_health_path() -> String {
    "/".to_string()
}

// -- Services ----------------------------------------------------------------

/// Long-running Fargate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FargateServiceSpec {
    #[serde(default)]
    pub name: Option<String>,

    pub cluster: String,

    pub task_definition: String,

    #[serde(default = "default_one")]
    pub desired_count: u32,

    /// Security groups; a default group is created when empty
    #[serde(default)]
    pub security_groups: Vec<String>,

    #[serde(default)]
    pub assign_public_ip: bool,

    /// Subnet tier; public with a public IP, otherwise private
    #[serde(default)]
    pub subnets: Option<SubnetTier>,

    #[serde(default)]
    pub target_groups: Vec<String>,

    /// Container registered with the target groups (default: first essential)
    #[serde(default)]
    pub container: Option<String>,

    /// Port registered with the target groups (default: first mapping)
    #[serde(default)]
    pub container_port: Option<u16>,

    #[serde(default)]
    pub health_check_grace_period_seconds: Option<u32>,

    #[serde(default)]
    pub auto_scaling: Option<AutoScaling>,
}

impl FargateServiceSpec {
    pub fn subnet_tier(&self) -> SubnetTier {
        self.subnets.unwrap_or(if self.assign_public_ip {
            SubnetTier::Public
        } else {
            SubnetTier::PrivateWithNat
        })
    }
}

fn default_one() -> u32 {
    1
}

/// Task-count autoscaling bounds and target-tracking policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoScaling {
    pub min_capacity: u32,
    pub max_capacity: u32,

    #[serde(default)]
    pub policies: Vec<ScalingPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub name: String,
    pub metric: ScalingMetric,
    pub target_utilization_percent: u32,

    #[serde(default)]
    pub scale_in_cooldown_seconds: Option<u32>,

    #[serde(default)]
    pub scale_out_cooldown_seconds: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMetric {
    Cpu,
    Memory,
}

impl ScalingMetric {
    pub fn predefined_metric(self) -> &'static str {
        match self {
            Self::Cpu => "ECSServiceAverageCPUUtilization",
            Self::Memory => "ECSServiceAverageMemoryUtilization",
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Deployment policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Failure handling across stacks
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Append provenance events on every deploy
    #[serde(default = "default_true")]
    pub tripwire: bool,

    /// Persist BLAKE3 state after deploy
    #[serde(default = "default_true")]
    pub lock_file: bool,

    /// Command prefix used to reach the provider (e.g. `aws --profile prod`)
    #[serde(default = "default_cli")]
    pub cli: String,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            tripwire: true,
            lock_file: true,
            cli: default_cli(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cli() -> String {
    "aws".to_string()
}

/// Failure handling strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    StopOnFirst,
    ContinueIndependent,
}

// ============================================================================
// State / Lock file
// ============================================================================

/// Per-stack state lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLock {
    /// Schema version
    pub schema: String,

    /// Stack name
    pub stack: String,

    /// Region the stack was deployed to
    pub region: String,

    /// When the lock was generated
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// BLAKE3 version
    pub blake3_version: String,

    /// Hash of the rendered template last deployed
    #[serde(default)]
    pub template_hash: String,

    /// Template artifact last deployed
    #[serde(default)]
    pub template_path: Option<String>,

    /// Provider-reported stack status after the last deploy
    #[serde(default)]
    pub stack_status: Option<String>,

    /// Per-resource state, keyed by logical ID
    pub resources: IndexMap<String, ResourceLock>,
}

/// Per-resource lock entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    /// Provider resource type (e.g. AWS::EC2::VPC)
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Declaration the resource was synthesized from
    pub source: String,

    /// Convergence status
    pub status: ResourceStatus,

    #[serde(default)]
    pub applied_at: Option<String>,

    #[serde(default)]
    pub duration_seconds: Option<f64>,

    /// BLAKE3 hash of the synthesized resource
    pub hash: String,
}

/// Resource convergence status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Converged,
    Failed,
    Drifted,
    Unknown,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "CONVERGED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Drifted => write!(f, "DRIFTED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource or stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned resource change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    /// Logical ID in the stack template
    pub logical_id: String,

    /// Declaration the resource comes from
    pub source: String,

    /// Provider resource type
    pub resource_type: String,

    pub action: PlanAction,

    /// Human-readable description
    pub description: String,
}

/// Planned changes for one stack.
#[derive(Debug, Clone)]
pub struct StackPlan {
    pub stack: String,
    pub action: PlanAction,
    pub template_hash: String,
    pub changes: Vec<PlannedChange>,
}

/// Full execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Config name
    pub name: String,

    /// Per-stack plans in deployment order
    pub stacks: Vec<StackPlan>,

    /// Summary counts
    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
}

impl ExecutionPlan {
    pub fn stack(&self, name: &str) -> Option<&StackPlan> {
        self.stacks.iter().find(|s| s.stack == name)
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    DeployStarted {
        stack: String,
        run_id: String,
        tool_version: String,
    },
    StackConverged {
        stack: String,
        duration_seconds: f64,
        template_hash: String,
        stack_status: Option<String>,
    },
    StackFailed {
        stack: String,
        error: String,
    },
    DeployCompleted {
        stack: String,
        run_id: String,
        resources_changed: u32,
        resources_unchanged: u32,
        resources_failed: u32,
        total_seconds: f64,
    },
    StackDestroyed {
        stack: String,
        run_id: String,
        duration_seconds: f64,
    },
    DriftDetected {
        stack: String,
        artifact: String,
        expected_hash: String,
        actual_hash: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Deploy result
// ============================================================================

/// What happened to a stack during a deploy or destroy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackOutcome {
    Deployed,
    Unchanged,
    Destroyed,
    Failed,
    Skipped,
}

impl fmt::Display for StackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployed => write!(f, "deployed"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of deploying a single stack.
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub stack: String,
    pub outcome: StackOutcome,
    pub resources_changed: u32,
    pub resources_unchanged: u32,
    pub resources_failed: u32,
    pub total_duration: std::time::Duration,
}

// ============================================================================
// Template helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for template resolution.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parse() {
        let yaml = r#"
version: "1.0"
name: test-infra
env:
  account: "123456789012"
  region: eu-west-1
params:
  bucket: demo
stacks:
  Net:
    resources:
      vpc:
        type: vpc
        cidr: 10.1.0.0/16
        nat_gateways: 1
        subnets:
          - name: app
            cidr_mask: 24
            tier: private_with_nat
          - name: edge
            cidr_mask: 24
            tier: public
policy:
  failure: stop_on_first
  tripwire: true
"#;
        let config: InfraConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.env.region, "eu-west-1");
        assert_eq!(config.stacks.len(), 1);
        let vpc = &config.stacks["Net"].resources["vpc"];
        match &vpc.kind {
            ResourceKind::Vpc(spec) => {
                assert_eq!(spec.max_azs, 2);
                assert_eq!(spec.subnets[0].tier, SubnetTier::PrivateWithNat);
                assert_eq!(spec.subnets[1].cidr_mask, 24);
            }
            other => panic!("expected vpc, got {}", other),
        }
        assert!(vpc.depends_on.is_empty());
    }

    #[test]
    fn test_resource_depends_on_with_flattened_kind() {
        let yaml = r#"
type: cluster
vpc: Net/vpc
depends_on: [other]
"#;
        let r: Resource = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(r.depends_on, vec!["other"]);
        assert_eq!(r.kind.type_name(), "cluster");
    }

    #[test]
    fn test_unknown_resource_type_rejected() {
        let yaml = r#"
type: lambda
handler: index.main
"#;
        assert!(serde_yaml_ng::from_str::<Resource>(yaml).is_err());
    }

    #[test]
    fn test_task_definition_defaults() {
        let yaml = r#"
type: task_definition
cpu: 256
memory_mib: 512
execution_role: role
containers:
  - name: app
    image: nginx:latest
    port_mappings:
      - container_port: 8080
"#;
        let r: Resource = serde_yaml_ng::from_str(yaml).unwrap();
        let ResourceKind::TaskDefinition(td) = r.kind else {
            panic!("expected task definition");
        };
        assert_eq!(td.compatibility, Compatibility::Fargate);
        assert_eq!(td.network_mode, NetworkMode::Awsvpc);
        assert!(td.containers[0].essential);
        assert_eq!(td.containers[0].port_mappings[0].protocol, IpProtocol::Tcp);
        assert_eq!(td.default_container().unwrap().name, "app");
        assert!(td.container("ghost").is_none());
    }

    #[test]
    fn test_subnet_tier_defaults() {
        let lb = LoadBalancerSpec {
            name: None,
            vpc: "vpc".to_string(),
            internet_facing: true,
            subnets: None,
        };
        assert_eq!(lb.subnet_tier(), SubnetTier::Public);

        let internal = LoadBalancerSpec {
            internet_facing: false,
            ..lb
        };
        assert_eq!(internal.subnet_tier(), SubnetTier::PrivateWithNat);
        assert!(SubnetTier::PrivateIsolated.is_private());
        assert!(!SubnetTier::Public.is_private());
    }

    #[test]
    fn test_ingress_rule_covers_range() {
        let single = IngressRule {
            peer: default_any_ipv4(),
            port: 80,
            to_port: None,
            protocol: IpProtocol::Tcp,
            description: None,
        };
        assert!(single.covers(80));
        assert!(!single.covers(8080));

        let range = IngressRule {
            to_port: Some(9000),
            ..single
        };
        assert!(range.covers(8080));
        assert!(!range.covers(9001));
    }

    #[test]
    fn test_environment_file_object_arn() {
        let f = EnvironmentFile {
            bucket_arn: "arn:aws:s3:::wipercheck".to_string(),
            key: "service.env".to_string(),
        };
        assert_eq!(f.object_arn(), "arn:aws:s3:::wipercheck/service.env");
    }

    #[test]
    fn test_policy_defaults() {
        let p = Policy::default();
        assert_eq!(p.failure, FailurePolicy::StopOnFirst);
        assert!(p.tripwire);
        assert!(p.lock_file);
        assert_eq!(p.cli, "aws");
    }

    #[test]
    fn test_display_impls() {
        assert_eq!(AppProtocol::Http.to_string(), "HTTP");
        assert_eq!(NetworkMode::Awsvpc.to_string(), "awsvpc");
        assert_eq!(Effect::Allow.to_string(), "Allow");
        assert_eq!(ResourceStatus::Converged.to_string(), "CONVERGED");
        assert_eq!(PlanAction::NoOp.to_string(), "NO-OP");
        assert_eq!(StackOutcome::Failed.to_string(), "FAILED");
        assert_eq!(
            ScalingMetric::Memory.predefined_metric(),
            "ECSServiceAverageMemoryUtilization"
        );
    }

    #[test]
    fn test_state_lock_roundtrip() {
        let lock = StateLock {
            schema: "1.0".to_string(),
            stack: "Net".to_string(),
            region: "us-east-1".to_string(),
            generated_at: "2026-02-16T14:00:00Z".to_string(),
            generator: "wipercheck-infra 0.3.0".to_string(),
            blake3_version: "1.8".to_string(),
            template_hash: "blake3:tmpl".to_string(),
            template_path: Some("synth.out/Net.template.json".to_string()),
            stack_status: Some("CREATE_COMPLETE".to_string()),
            resources: IndexMap::from([(
                "Vpc".to_string(),
                ResourceLock {
                    resource_type: "AWS::EC2::VPC".to_string(),
                    source: "vpc".to_string(),
                    status: ResourceStatus::Converged,
                    applied_at: Some("2026-02-16T14:00:01Z".to_string()),
                    duration_seconds: Some(1.5),
                    hash: "blake3:abc123".to_string(),
                },
            )]),
        };
        let yaml = serde_yaml_ng::to_string(&lock).unwrap();
        assert!(yaml.contains("type: AWS::EC2::VPC"));
        let lock2: StateLock = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(lock2.stack, "Net");
        assert_eq!(lock2.resources["Vpc"].status, ResourceStatus::Converged);
    }

    #[test]
    fn test_provenance_event_serde() {
        let event = ProvenanceEvent::DeployStarted {
            stack: "Net".to_string(),
            run_id: "r-abc".to_string(),
            tool_version: "0.3.0".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"deploy_started\""));
        assert!(json.contains("\"run_id\":\"r-abc\""));
    }

    #[test]
    fn test_yaml_value_to_string() {
        assert_eq!(
            yaml_value_to_string(&serde_yaml_ng::Value::String("hello".into())),
            "hello"
        );
        assert_eq!(yaml_value_to_string(&serde_yaml_ng::Value::Bool(true)), "true");
        assert_eq!(yaml_value_to_string(&serde_yaml_ng::Value::Null), "");
    }
}
