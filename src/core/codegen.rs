//! Resource dispatch and provider scripts.
//!
//! `synthesize_resource` routes a declaration to its handler in
//! `crate::resources`. The script generators wrap the provider CLI:
//! - deploy: create or update a stack from its template artifact
//! - destroy: delete a stack and wait for the deletion to finish
//! - status query: print the provider's stack status

use super::synth::SynthContext;
use super::synth::StackTemplate;
use super::types::{InfraConfig, Resource, ResourceKind};
use crate::resources::{self, Fragment};
use std::path::Path;

/// Synthesize one resource declaration.
pub fn synthesize_resource(
    ctx: &mut SynthContext,
    id: &str,
    resource: &Resource,
) -> Result<Fragment, String> {
    match &resource.kind {
        ResourceKind::Vpc(spec) => resources::vpc::synthesize(ctx, id, spec),
        ResourceKind::Cluster(spec) => resources::cluster::synthesize(ctx, id, spec),
        ResourceKind::Role(spec) => resources::iam::synthesize(ctx, id, spec),
        ResourceKind::TaskDefinition(spec) => resources::task::synthesize(ctx, id, spec),
        ResourceKind::LoadBalancer(spec) => {
            resources::load_balancer::synthesize_load_balancer(ctx, id, spec)
        }
        ResourceKind::Listener(spec) => resources::load_balancer::synthesize_listener(ctx, id, spec),
        ResourceKind::TargetGroup(spec) => {
            resources::load_balancer::synthesize_target_group(ctx, id, spec)
        }
        ResourceKind::SecurityGroup(spec) => resources::security_group::synthesize(ctx, id, spec),
        ResourceKind::FargateService(spec) => resources::service::synthesize(ctx, id, spec),
    }
    .map_err(|e| format!("{}/{}: {}", ctx.stack, id, e))
}

/// Single-quote a word for bash.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Generate the script that creates or updates a stack.
pub fn deploy_script(config: &InfraConfig, template: &StackTemplate, template_path: &Path) -> String {
    let mut lines = vec![
        "set -euo pipefail".to_string(),
        format!("{} cloudformation deploy \\", config.policy.cli),
        format!("  --stack-name {} \\", shell_quote(&template.stack)),
        format!(
            "  --template-file {} \\",
            shell_quote(&template_path.display().to_string())
        ),
        format!("  --region {} \\", shell_quote(&config.env.region)),
        "  --capabilities CAPABILITY_NAMED_IAM \\".to_string(),
    ];
    if template.tags.is_empty() {
        lines.push("  --no-fail-on-empty-changeset".to_string());
    } else {
        lines.push("  --no-fail-on-empty-changeset \\".to_string());
        let tags: Vec<String> = template
            .tags
            .iter()
            .map(|(k, v)| shell_quote(&format!("{}={}", k, v)))
            .collect();
        lines.push(format!("  --tags {}", tags.join(" ")));
    }
    lines.join("\n")
}

/// Generate the script that deletes a stack.
pub fn destroy_script(config: &InfraConfig, stack: &str) -> String {
    let stack = shell_quote(stack);
    let region = shell_quote(&config.env.region);
    format!(
        "set -euo pipefail\n\
         {cli} cloudformation delete-stack --stack-name {stack} --region {region}\n\
         {cli} cloudformation wait stack-delete-complete --stack-name {stack} --region {region}",
        cli = config.policy.cli,
        stack = stack,
        region = region,
    )
}

/// Generate the script that prints a stack's provider status.
pub fn status_query_script(config: &InfraConfig, stack: &str) -> String {
    format!(
        "{} cloudformation describe-stacks --stack-name {} --region {} \
         --query 'Stacks[0].StackStatus' --output text",
        config.policy.cli,
        shell_quote(stack),
        shell_quote(&config.env.region)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{parser, synth};

    fn bundled() -> (InfraConfig, Vec<StackTemplate>) {
        let config = parser::parse_config(include_str!("../../infra.yaml")).unwrap();
        let templates = synth::synthesize(&config).unwrap();
        (config, templates)
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_deploy_script() {
        let (config, templates) = bundled();
        let script = deploy_script(
            &config,
            &templates[0],
            Path::new("synth.out/WipercheckVpcStack.template.json"),
        );
        assert!(script.starts_with("set -euo pipefail\n"));
        assert!(script.contains("aws cloudformation deploy"));
        assert!(script.contains("--stack-name 'WipercheckVpcStack'"));
        assert!(script.contains("--template-file 'synth.out/WipercheckVpcStack.template.json'"));
        assert!(script.contains("--region 'us-east-1'"));
        assert!(script.contains("CAPABILITY_NAMED_IAM"));
        assert!(script.contains("--no-fail-on-empty-changeset"));
    }

    #[test]
    fn test_deploy_script_tags() {
        let (config, mut templates) = bundled();
        templates[0].tags.insert("team".to_string(), "wiper's".to_string());
        templates[0].tags.insert("env".to_string(), "prod".to_string());
        let script = deploy_script(&config, &templates[0], Path::new("t.json"));
        assert!(script.contains("--no-fail-on-empty-changeset \\\n"));
        assert!(script.ends_with("--tags 'team=wiper'\\''s' 'env=prod'"));
    }

    #[test]
    fn test_custom_cli_prefix() {
        let (mut config, _) = bundled();
        config.policy.cli = "aws --profile prod".to_string();
        let script = destroy_script(&config, "WipercheckLoaderStack");
        assert!(script.contains("aws --profile prod cloudformation delete-stack"));
        assert!(script.contains("wait stack-delete-complete --stack-name 'WipercheckLoaderStack'"));
    }

    #[test]
    fn test_status_query_script() {
        let (config, _) = bundled();
        let script = status_query_script(&config, "WipercheckVpcStack");
        assert!(script.contains("describe-stacks --stack-name 'WipercheckVpcStack'"));
        assert!(script.contains("--query 'Stacks[0].StackStatus' --output text"));
    }

    #[test]
    fn test_dispatch_error_names_resource() {
        let yaml = r#"
version: "1.0"
name: test
env:
  account: "123456789012"
  region: us-east-1
stacks:
  S:
    resources:
      task:
        type: task_definition
        cpu: 256
        memory_mib: 512
        execution_role: not-a-role
        containers:
          - name: app
            image: app:latest
      not-a-role:
        type: cluster
        vpc: vpc
      vpc:
        type: vpc
        cidr: 10.0.0.0/16
        subnets:
          - { name: a, cidr_mask: 24, tier: private_isolated }
"#;
        let config = parser::parse_config(yaml).unwrap();
        let err = synth::synthesize(&config).unwrap_err();
        assert!(err.starts_with("S/task: "), "{}", err);
        assert!(err.contains("is a cluster"));
    }
}
