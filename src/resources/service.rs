//! Fargate service handler.
//!
//! Synthesizes the ECS service, a default security group when none is
//! declared, the security group rules letting each attached load balancer
//! reach the registered container port, and task-count autoscaling.

use super::load_balancer::listeners_forwarding_to;
use super::security_group::allow_all_egress;
use super::Fragment;
use crate::core::resolver::{self, QualifiedId};
use crate::core::synth::{logical_id, CfnResource, SynthContext};
use crate::core::types::*;
use serde_json::{json, Value};

/// Grace period applied when a service sits behind a load balancer.
pub const DEFAULT_GRACE_PERIOD_SECONDS: u32 = 60;

const AUTOSCALING_ROLE_PATH: &str = ":role/aws-service-role/ecs.application-autoscaling.amazonaws.com/AWSServiceRoleForApplicationAutoScaling_ECSService";

/// The container and port registered with the target groups.
pub fn registered_target<'a>(
    service: &FargateServiceSpec,
    task: &'a TaskDefinitionSpec,
) -> Option<(&'a ContainerSpec, u16)> {
    let container = match service.container {
        Some(ref name) => task.container(name)?,
        None => task.default_container()?,
    };
    let port = match service.container_port {
        Some(p) => p,
        None => container.port_mappings.first()?.container_port,
    };
    Some((container, port))
}

fn cluster<'a>(ctx: &SynthContext<'a>, raw: &str) -> Result<(QualifiedId, &'a ClusterSpec), String> {
    let (q, r) = ctx.resolve(raw)?;
    match &r.kind {
        ResourceKind::Cluster(spec) => Ok((q, spec)),
        other => Err(format!("'{}' is a {}, expected a cluster", q, other)),
    }
}

fn task_definition<'a>(
    ctx: &SynthContext<'a>,
    raw: &str,
) -> Result<(QualifiedId, &'a TaskDefinitionSpec), String> {
    let (q, r) = ctx.resolve(raw)?;
    match &r.kind {
        ResourceKind::TaskDefinition(spec) => Ok((q, spec)),
        other => Err(format!("'{}' is a {}, expected a task_definition", q, other)),
    }
}

/// Synthesize a Fargate service declaration.
pub fn synthesize(
    ctx: &mut SynthContext,
    id: &str,
    spec: &FargateServiceSpec,
) -> Result<Fragment, String> {
    let base = logical_id(id);
    let (cluster_q, cluster_spec) = cluster(ctx, &spec.cluster)?;
    let (task_q, task) = task_definition(ctx, &spec.task_definition)?;
    let vpc_raw = resolver::parse_ref(&cluster_spec.vpc, &cluster_q.stack).to_string();

    let mut out: Fragment = Vec::new();

    // Security groups as (logical name fragment, GroupId value)
    let mut groups: Vec<(String, Value)> = Vec::new();
    if spec.security_groups.is_empty() {
        let sg = format!("{}SecurityGroup", base);
        out.push((
            sg.clone(),
            CfnResource::new(
                "AWS::EC2::SecurityGroup",
                json!({
                    "GroupDescription": format!("{}/{}/SecurityGroup", ctx.stack, id),
                    "SecurityGroupEgress": allow_all_egress(),
                    "VpcId": ctx.ref_of(&vpc_raw, "")?,
                }),
            ),
        ));
        groups.push(("SecurityGroup".to_string(), json!({ "Fn::GetAtt": [sg, "GroupId"] })));
    } else {
        for raw in &spec.security_groups {
            let (q, _) = ctx.resolve(raw)?;
            groups.push((logical_id(&q.id), ctx.get_att(raw, "", "GroupId")?));
        }
    }

    let mut depends_on = Vec::new();
    let mut load_balancers = Vec::new();
    if !spec.target_groups.is_empty() {
        let (container, port) = registered_target(spec, task).ok_or_else(|| {
            format!(
                "service '{}': task definition '{}' has no container port to register",
                id, task_q
            )
        })?;

        let mut balancers: Vec<QualifiedId> = Vec::new();
        for raw in &spec.target_groups {
            let (tg_q, _) = ctx.resolve(raw)?;
            load_balancers.push(json!({
                "ContainerName": container.name,
                "ContainerPort": port,
                "TargetGroupArn": ctx.ref_of(raw, "")?,
            }));
            for (listener_q, listener) in listeners_forwarding_to(ctx.config, &tg_q) {
                if listener_q.stack == ctx.stack {
                    depends_on.push(logical_id(&listener_q.id));
                }
                let lb_q = resolver::parse_ref(&listener.load_balancer, &listener_q.stack);
                if !balancers.contains(&lb_q) {
                    balancers.push(lb_q);
                }
            }
        }

        for lb_q in &balancers {
            let lb_raw = lb_q.to_string();
            let lb_logical = logical_id(&lb_q.id);
            let lb_group = ctx.get_att(&lb_raw, "SecurityGroup", "GroupId")?;
            for (sg_name, sg_id) in &groups {
                out.push((
                    format!("{}{}From{}{}", base, sg_name, lb_logical, port),
                    CfnResource::new(
                        "AWS::EC2::SecurityGroupIngress",
                        json!({
                            "Description": "Load balancer to target",
                            "FromPort": port,
                            "GroupId": sg_id,
                            "IpProtocol": "tcp",
                            "SourceSecurityGroupId": lb_group,
                            "ToPort": port,
                        }),
                    ),
                ));
                out.push((
                    format!("{}{}To{}{}", base, lb_logical, sg_name, port),
                    CfnResource::new(
                        "AWS::EC2::SecurityGroupEgress",
                        json!({
                            "Description": "Load balancer to target",
                            "DestinationSecurityGroupId": sg_id,
                            "FromPort": port,
                            "GroupId": lb_group,
                            "IpProtocol": "tcp",
                            "ToPort": port,
                        }),
                    ),
                ));
            }
        }
    }

    if task_q.stack == ctx.stack {
        depends_on.push(format!("{}TaskRole", logical_id(&task_q.id)));
    }

    let subnets = ctx.subnet_ids(&vpc_raw, spec.subnet_tier())?;
    let security_groups: Vec<Value> = groups.iter().map(|(_, v)| v.clone()).collect();

    let mut props = serde_json::Map::new();
    props.insert("Cluster".to_string(), ctx.ref_of(&spec.cluster, "")?);
    props.insert(
        "DeploymentConfiguration".to_string(),
        json!({ "MaximumPercent": 200, "MinimumHealthyPercent": 50 }),
    );
    props.insert("DesiredCount".to_string(), json!(spec.desired_count));
    props.insert("EnableECSManagedTags".to_string(), json!(false));
    let grace = spec.health_check_grace_period_seconds.or(if load_balancers.is_empty() {
        None
    } else {
        Some(DEFAULT_GRACE_PERIOD_SECONDS)
    });
    if let Some(g) = grace {
        props.insert("HealthCheckGracePeriodSeconds".to_string(), json!(g));
    }
    props.insert("LaunchType".to_string(), json!("FARGATE"));
    if !load_balancers.is_empty() {
        props.insert("LoadBalancers".to_string(), json!(load_balancers));
    }
    props.insert(
        "NetworkConfiguration".to_string(),
        json!({
            "AwsvpcConfiguration": {
                "AssignPublicIp": if spec.assign_public_ip { "ENABLED" } else { "DISABLED" },
                "SecurityGroups": security_groups,
                "Subnets": subnets,
            }
        }),
    );
    if let Some(ref name) = spec.name {
        props.insert("ServiceName".to_string(), json!(name));
    }
    props.insert(
        "TaskDefinition".to_string(),
        ctx.ref_of(&spec.task_definition, "")?,
    );

    out.push((
        base.clone(),
        CfnResource::new("AWS::ECS::Service", Value::Object(props)).with_depends_on(depends_on),
    ));

    if let Some(ref scaling) = spec.auto_scaling {
        out.extend(autoscaling(ctx, &base, &spec.cluster, scaling)?);
    }

    Ok(out)
}

fn autoscaling(
    ctx: &mut SynthContext,
    base: &str,
    cluster_raw: &str,
    scaling: &AutoScaling,
) -> Result<Fragment, String> {
    let target = format!("{}TaskCountTarget", base);
    let mut out: Fragment = vec![(
        target.clone(),
        CfnResource::new(
            "AWS::ApplicationAutoScaling::ScalableTarget",
            json!({
                "MaxCapacity": scaling.max_capacity,
                "MinCapacity": scaling.min_capacity,
                "ResourceId": { "Fn::Join": ["", [
                    "service/",
                    ctx.ref_of(cluster_raw, "")?,
                    "/",
                    { "Fn::GetAtt": [base, "Name"] },
                ]] },
                "RoleARN": { "Fn::Join": ["", [
                    "arn:",
                    { "Ref": "AWS::Partition" },
                    ":iam::",
                    { "Ref": "AWS::AccountId" },
                    AUTOSCALING_ROLE_PATH,
                ]] },
                "ScalableDimension": "ecs:service:DesiredCount",
                "ServiceNamespace": "ecs",
            }),
        ),
    )];

    for policy in &scaling.policies {
        let logical = format!("{}{}", target, logical_id(&policy.name));
        let mut tracking = serde_json::Map::new();
        tracking.insert(
            "PredefinedMetricSpecification".to_string(),
            json!({ "PredefinedMetricType": policy.metric.predefined_metric() }),
        );
        if let Some(s) = policy.scale_in_cooldown_seconds {
            tracking.insert("ScaleInCooldown".to_string(), json!(s));
        }
        if let Some(s) = policy.scale_out_cooldown_seconds {
            tracking.insert("ScaleOutCooldown".to_string(), json!(s));
        }
        tracking.insert(
            "TargetValue".to_string(),
            json!(policy.target_utilization_percent),
        );
        out.push((
            logical.clone(),
            CfnResource::new(
                "AWS::ApplicationAutoScaling::ScalingPolicy",
                json!({
                    "PolicyName": format!("{}{}", logical_id(ctx.stack), logical),
                    "PolicyType": "TargetTrackingScaling",
                    "ScalingTargetId": { "Ref": target },
                    "TargetTrackingScalingPolicyConfiguration": Value::Object(tracking),
                }),
            ),
        ));
    }

    Ok(out)
}
