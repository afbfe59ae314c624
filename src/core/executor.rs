//! Deploy and teardown loops.
//!
//! Deploy runs stacks in dependency order:
//! synth → verify → write artifacts → plan → per stack: script → transport →
//! status query → lock → events.
//! Destroy walks the same order backwards and removes locks as it goes.

use super::codegen;
use super::planner;
use super::resolver;
use super::state;
use super::synth::{self, StackTemplate};
use super::types::*;
use crate::transport;
use crate::tripwire::eventlog;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

/// Configuration for a deploy run.
pub struct DeployConfig<'a> {
    pub config: &'a InfraConfig,
    pub state_dir: &'a Path,
    /// Where template artifacts are written
    pub out_dir: &'a Path,
    /// Redeploy stacks the plan says are unchanged
    pub force: bool,
    /// Print the provider scripts and change nothing
    pub dry_run: bool,
    /// Deploy only this stack; its dependencies must already be converged
    pub stack_filter: Option<&'a str>,
}

/// Configuration for a destroy run.
pub struct DestroyConfig<'a> {
    pub config: &'a InfraConfig,
    pub state_dir: &'a Path,
    pub dry_run: bool,
    /// Destroy only this stack (declared, or known only from state)
    pub stack_filter: Option<&'a str>,
}

/// Whether a lock records a complete, successful deploy.
pub fn stack_converged(lock: &StateLock) -> bool {
    !lock.template_hash.is_empty()
        && lock
            .resources
            .values()
            .all(|r| r.status == ResourceStatus::Converged)
}

fn log_tripwire(state_dir: &Path, stack: &str, tripwire: bool, event: ProvenanceEvent) {
    if tripwire {
        if let Err(e) = eventlog::append_event(state_dir, stack, event) {
            eprintln!("warning: event log for {}: {}", stack, e);
        }
    }
}

fn result(stack: &str, outcome: StackOutcome) -> DeployResult {
    DeployResult {
        stack: stack.to_string(),
        outcome,
        resources_changed: 0,
        resources_unchanged: 0,
        resources_failed: 0,
        total_duration: std::time::Duration::ZERO,
    }
}

/// Execute the deploy loop.
pub fn deploy(cfg: &DeployConfig) -> Result<Vec<DeployResult>, String> {
    let templates = synth::synthesize(cfg.config)?;
    let problems = synth::verify_templates(&templates);
    if !problems.is_empty() {
        return Err(format!(
            "synthesized templates are inconsistent:\n  {}",
            problems.join("\n  ")
        ));
    }

    if let Some(filter) = cfg.stack_filter {
        if !templates.iter().any(|t| t.stack == filter) {
            return Err(format!("unknown stack '{}'", filter));
        }
    }

    let mut names: Vec<String> = templates.iter().map(|t| t.stack.clone()).collect();
    names.extend(state::list_locked_stacks(cfg.state_dir)?);
    let locks = state::load_locks(cfg.state_dir, &names)?;
    let plan = planner::plan(cfg.config, &templates, &locks);

    if let Some(filter) = cfg.stack_filter {
        check_dependencies_converged(&templates, filter, &locks)?;
    }

    let selected: Vec<&StackTemplate> = templates
        .iter()
        .filter(|t| cfg.stack_filter.is_none_or(|f| f == t.stack))
        .collect();

    if cfg.dry_run {
        for template in &selected {
            let action = plan
                .stack(&template.stack)
                .map(|s| s.action.clone())
                .unwrap_or(PlanAction::Create);
            let path = cfg.out_dir.join(template.file_name());
            println!("# {} ({})", template.stack, action);
            println!("{}", codegen::deploy_script(cfg.config, template, &path));
            println!();
        }
        return Ok(selected
            .iter()
            .map(|t| result(&t.stack, StackOutcome::Skipped))
            .collect());
    }

    let paths = synth::write_templates(cfg.config, &templates, cfg.out_dir)?;
    let artifact: HashMap<&str, &Path> = templates
        .iter()
        .zip(&paths)
        .map(|(t, p)| (t.stack.as_str(), p.as_path()))
        .collect();

    let run_id = eventlog::generate_run_id();
    let mut results = Vec::new();
    let mut blocked: HashSet<String> = HashSet::new();
    let mut stopped = false;

    for template in selected {
        let stack = template.stack.as_str();
        let Some(stack_plan) = plan.stack(stack) else {
            continue;
        };

        if stopped {
            results.push(result(stack, StackOutcome::Skipped));
            continue;
        }
        if let Some(dep) = template.dependencies.iter().find(|d| blocked.contains(*d)) {
            eprintln!("skipping {}: dependency {} did not deploy", stack, dep);
            blocked.insert(stack.to_string());
            results.push(result(stack, StackOutcome::Skipped));
            continue;
        }

        let changed = stack_plan
            .changes
            .iter()
            .filter(|c| c.action != PlanAction::NoOp)
            .count() as u32;
        let unchanged = stack_plan.changes.len() as u32 - changed;

        if stack_plan.action == PlanAction::NoOp && !cfg.force {
            let mut r = result(stack, StackOutcome::Unchanged);
            r.resources_unchanged = unchanged;
            results.push(r);
            continue;
        }

        let path = artifact.get(stack).copied().unwrap_or(cfg.out_dir);
        let r = deploy_stack(
            cfg,
            template,
            path,
            &run_id,
            locks.get(stack),
            changed,
            unchanged,
        )?;

        if r.outcome == StackOutcome::Failed {
            blocked.insert(stack.to_string());
            if cfg.config.policy.failure == FailurePolicy::StopOnFirst {
                eprintln!("stopping after failure on {}", stack);
                stopped = true;
            }
        }
        results.push(r);
    }

    for orphan in plan
        .stacks
        .iter()
        .filter(|s| s.action == PlanAction::Destroy && cfg.stack_filter.is_none())
    {
        eprintln!(
            "note: stack {} is no longer declared; `destroy --stack {}` removes it",
            orphan.stack, orphan.stack
        );
    }

    Ok(results)
}

fn check_dependencies_converged(
    templates: &[StackTemplate],
    stack: &str,
    locks: &HashMap<String, StateLock>,
) -> Result<(), String> {
    let Some(template) = templates.iter().find(|t| t.stack == stack) else {
        return Ok(());
    };
    for dep in &template.dependencies {
        match locks.get(dep) {
            Some(lock) if stack_converged(lock) => {}
            Some(_) => {
                return Err(format!(
                    "stack '{}' depends on '{}', whose last deploy did not converge",
                    stack, dep
                ))
            }
            None => {
                return Err(format!(
                    "stack '{}' depends on '{}', which has not been deployed",
                    stack, dep
                ))
            }
        }
    }
    Ok(())
}

fn deploy_stack(
    cfg: &DeployConfig,
    template: &StackTemplate,
    path: &Path,
    run_id: &str,
    previous: Option<&StateLock>,
    changed: u32,
    unchanged: u32,
) -> Result<DeployResult, String> {
    let stack = template.stack.as_str();
    let tripwire = cfg.config.policy.tripwire;
    let start = Instant::now();

    log_tripwire(
        cfg.state_dir,
        stack,
        tripwire,
        ProvenanceEvent::DeployStarted {
            stack: stack.to_string(),
            run_id: run_id.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );

    let script = codegen::deploy_script(cfg.config, template, path);
    let error = match transport::exec_script(&script) {
        Ok(out) if out.success() => None,
        Ok(out) => Some(format!("exit code {}: {}", out.exit_code, out.error_summary())),
        Err(e) => Some(format!("transport error: {}", e)),
    };
    let duration = start.elapsed().as_secs_f64();

    let mut lock = previous
        .cloned()
        .unwrap_or_else(|| state::new_lock(stack, &cfg.config.env.region));
    lock.generated_at = eventlog::now_iso8601();
    lock.region = cfg.config.env.region.clone();

    let outcome = match error {
        None => {
            let status =
                transport::query(&codegen::status_query_script(cfg.config, stack)).ok();
            record_success(&mut lock, template, path, status.clone(), duration);
            log_tripwire(
                cfg.state_dir,
                stack,
                tripwire,
                ProvenanceEvent::StackConverged {
                    stack: stack.to_string(),
                    duration_seconds: duration,
                    template_hash: lock.template_hash.clone(),
                    stack_status: status,
                },
            );
            StackOutcome::Deployed
        }
        Some(error) => {
            eprintln!("{}: {}", stack, error);
            record_failure(&mut lock, template, duration);
            log_tripwire(
                cfg.state_dir,
                stack,
                tripwire,
                ProvenanceEvent::StackFailed {
                    stack: stack.to_string(),
                    error,
                },
            );
            StackOutcome::Failed
        }
    };

    if cfg.config.policy.lock_file {
        state::save_lock(cfg.state_dir, &lock)?;
    }

    let (resources_changed, resources_failed) = match outcome {
        StackOutcome::Failed => (0, changed),
        _ => (changed, 0),
    };
    log_tripwire(
        cfg.state_dir,
        stack,
        tripwire,
        ProvenanceEvent::DeployCompleted {
            stack: stack.to_string(),
            run_id: run_id.to_string(),
            resources_changed,
            resources_unchanged: unchanged,
            resources_failed,
            total_seconds: start.elapsed().as_secs_f64(),
        },
    );

    Ok(DeployResult {
        stack: stack.to_string(),
        outcome,
        resources_changed,
        resources_unchanged: unchanged,
        resources_failed,
        total_duration: start.elapsed(),
    })
}

/// The lock becomes an exact record of the deployed template.
fn record_success(
    lock: &mut StateLock,
    template: &StackTemplate,
    path: &Path,
    status: Option<String>,
    duration: f64,
) {
    let applied_at = eventlog::now_iso8601();
    lock.template_hash = template.template_hash();
    lock.template_path = Some(path.display().to_string());
    lock.stack_status = status;
    lock.resources = template
        .resources
        .iter()
        .map(|(logical, r)| {
            let previous = lock.resources.get(logical);
            let unchanged = previous.is_some_and(|p| {
                p.status == ResourceStatus::Converged && p.hash == r.hash()
            });
            let entry = match previous {
                Some(p) if unchanged => p.clone(),
                _ => ResourceLock {
                    resource_type: r.resource_type.clone(),
                    source: r.source.clone(),
                    status: ResourceStatus::Converged,
                    applied_at: Some(applied_at.clone()),
                    duration_seconds: Some(duration),
                    hash: r.hash(),
                },
            };
            (logical.clone(), entry)
        })
        .collect();
}

/// The provider rolls a failed stack back, so previously converged entries
/// stay; everything the deploy touched is marked failed. The template hash
/// is cleared so the stack stops counting as converged, also when only its
/// outputs changed.
fn record_failure(lock: &mut StateLock, template: &StackTemplate, duration: f64) {
    let applied_at = eventlog::now_iso8601();
    lock.template_hash = String::new();
    for (logical, r) in &template.resources {
        let hash = r.hash();
        let same = lock
            .resources
            .get(logical)
            .is_some_and(|p| p.status == ResourceStatus::Converged && p.hash == hash);
        if same {
            continue;
        }
        let entry = lock
            .resources
            .entry(logical.clone())
            .or_insert_with(|| ResourceLock {
                resource_type: r.resource_type.clone(),
                source: r.source.clone(),
                status: ResourceStatus::Failed,
                applied_at: None,
                duration_seconds: None,
                hash: String::new(),
            });
        entry.status = ResourceStatus::Failed;
        entry.applied_at = Some(applied_at.clone());
        entry.duration_seconds = Some(duration);
    }
    lock.stack_status = None;
}

/// Stacks to tear down, dependents first. Stacks known only from state come
/// before every declared stack.
fn destroy_order(cfg: &DestroyConfig) -> Result<Vec<String>, String> {
    let declared = resolver::build_stack_order(cfg.config)?;
    let mut order: Vec<String> = state::list_locked_stacks(cfg.state_dir)?
        .into_iter()
        .filter(|s| !declared.contains(s))
        .collect();
    order.extend(declared.into_iter().rev());
    Ok(order)
}

/// Execute the teardown loop.
pub fn destroy(cfg: &DestroyConfig) -> Result<Vec<DeployResult>, String> {
    let order = destroy_order(cfg)?;
    let graph_deps: HashMap<String, Vec<String>> = synth::synthesize(cfg.config)?
        .into_iter()
        .map(|t| (t.stack, t.dependencies))
        .collect();

    let selected: Vec<String> = match cfg.stack_filter {
        Some(filter) => {
            if !order.iter().any(|s| s == filter) {
                return Err(format!("unknown stack '{}'", filter));
            }
            let dependents: Vec<&String> = graph_deps
                .iter()
                .filter(|(_, deps)| deps.iter().any(|d| d == filter))
                .map(|(s, _)| s)
                .filter(|s| state::lock_file_path(cfg.state_dir, s).exists())
                .collect();
            if let Some(dependent) = dependents.first() {
                return Err(format!(
                    "stack '{}' is still needed by deployed stack '{}'; destroy that first",
                    filter, dependent
                ));
            }
            vec![filter.to_string()]
        }
        None => order,
    };

    if cfg.dry_run {
        for stack in &selected {
            println!("# {} (DESTROY)", stack);
            println!("{}", codegen::destroy_script(cfg.config, stack));
            println!();
        }
        return Ok(selected
            .iter()
            .map(|s| result(s, StackOutcome::Skipped))
            .collect());
    }

    let run_id = eventlog::generate_run_id();
    let tripwire = cfg.config.policy.tripwire;
    let mut results = Vec::new();
    // Stacks that failed to delete; their dependencies must stay
    let mut kept: HashSet<String> = HashSet::new();
    let mut stopped = false;

    for stack in &selected {
        let still_needed = graph_deps
            .iter()
            .any(|(s, deps)| kept.contains(s) && deps.contains(stack));
        if stopped || still_needed {
            kept.insert(stack.clone());
            results.push(result(stack, StackOutcome::Skipped));
            continue;
        }

        let lock = state::load_lock(cfg.state_dir, stack)?;
        let start = Instant::now();
        let out = transport::exec_script(&codegen::destroy_script(cfg.config, stack));
        let error = match out {
            Ok(out) if out.success() => None,
            Ok(out) => Some(format!("exit code {}: {}", out.exit_code, out.error_summary())),
            Err(e) => Some(format!("transport error: {}", e)),
        };
        let duration = start.elapsed();
        let resources = lock.map(|l| l.resources.len() as u32).unwrap_or(0);

        match error {
            None => {
                state::remove_lock(cfg.state_dir, stack)?;
                log_tripwire(
                    cfg.state_dir,
                    stack,
                    tripwire,
                    ProvenanceEvent::StackDestroyed {
                        stack: stack.clone(),
                        run_id: run_id.clone(),
                        duration_seconds: duration.as_secs_f64(),
                    },
                );
                let mut r = result(stack, StackOutcome::Destroyed);
                r.resources_changed = resources;
                r.total_duration = duration;
                results.push(r);
            }
            Some(error) => {
                eprintln!("{}: {}", stack, error);
                log_tripwire(
                    cfg.state_dir,
                    stack,
                    tripwire,
                    ProvenanceEvent::StackFailed {
                        stack: stack.clone(),
                        error,
                    },
                );
                kept.insert(stack.clone());
                if cfg.config.policy.failure == FailurePolicy::StopOnFirst {
                    eprintln!("stopping after failure on {}", stack);
                    stopped = true;
                }
                let mut r = result(stack, StackOutcome::Failed);
                r.resources_failed = resources;
                r.total_duration = duration;
                results.push(r);
            }
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser;
    use std::path::PathBuf;

    const VPC: &str = "WipercheckVpcStack";
    const LOADER: &str = "WipercheckLoaderStack";
    const SERVICE: &str = "WipercheckServiceStack";

    /// Provider stand-in: logs its arguments, fails for one stack name.
    struct Stub {
        dir: tempfile::TempDir,
    }

    impl Stub {
        fn new(fail_on: &str) -> Self {
            let stub = Stub {
                dir: tempfile::tempdir().unwrap(),
            };
            stub.fail_on(fail_on);
            stub
        }

        /// Rewrite the script so it fails for `stack` ("" never fails).
        fn fail_on(&self, fail_on: &str) {
            let log = self.dir.path().join("calls.log");
            let script = format!(
                "echo \"$*\" >> '{log}'\n\
                 case \"$*\" in\n\
                 *describe-stacks*) echo UPDATE_COMPLETE ;;\n\
                 *\" {fail} \"*) echo 'An error occurred: {fail} rolled back' >&2; exit 255 ;;\n\
                 esac\n",
                log = log.display(),
                fail = if fail_on.is_empty() { "no-such-stack" } else { fail_on },
            );
            std::fs::write(self.dir.path().join("stub.sh"), script).unwrap();
        }

        fn config(&self) -> InfraConfig {
            let mut config = parser::parse_config(include_str!("../../infra.yaml")).unwrap();
            config.policy.cli = format!("bash {}", self.dir.path().join("stub.sh").display());
            config
        }

        fn state(&self) -> PathBuf {
            self.dir.path().join("state")
        }

        fn out(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn deploy(&self, config: &InfraConfig, force: bool, stack: Option<&str>) -> Result<Vec<DeployResult>, String> {
            let state_dir = self.state();
            let out_dir = self.out();
            deploy(&DeployConfig {
                config,
                state_dir: &state_dir,
                out_dir: &out_dir,
                force,
                dry_run: false,
                stack_filter: stack,
            })
        }

        fn destroy(&self, config: &InfraConfig, stack: Option<&str>) -> Result<Vec<DeployResult>, String> {
            let state_dir = self.state();
            destroy(&DestroyConfig {
                config,
                state_dir: &state_dir,
                dry_run: false,
                stack_filter: stack,
            })
        }
    }

    fn outcomes(results: &[DeployResult]) -> Vec<(&str, StackOutcome)> {
        results
            .iter()
            .map(|r| (r.stack.as_str(), r.outcome.clone()))
            .collect()
    }

    #[test]
    fn test_deploy_all_in_order() {
        let stub = Stub::new("");
        let config = stub.config();
        let results = stub.deploy(&config, false, None).unwrap();
        assert_eq!(
            outcomes(&results),
            vec![
                (VPC, StackOutcome::Deployed),
                (LOADER, StackOutcome::Deployed),
                (SERVICE, StackOutcome::Deployed)
            ]
        );

        let deploys: Vec<String> = stub
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("cloudformation deploy"))
            .collect();
        assert_eq!(deploys.len(), 3);
        assert!(deploys[0].contains(VPC));
        assert!(deploys[0].contains("CAPABILITY_NAMED_IAM"));

        let lock = state::load_lock(&stub.state(), VPC).unwrap().unwrap();
        assert!(stack_converged(&lock));
        assert_eq!(lock.stack_status.as_deref(), Some("UPDATE_COMPLETE"));
        let artifact = lock.template_path.clone().unwrap();
        assert!(artifact.ends_with("WipercheckVpcStack.template.json"));
        assert_eq!(
            crate::tripwire::hasher::hash_file(Path::new(&artifact)).unwrap(),
            lock.template_hash
        );
        assert!(stub.out().join(synth::MANIFEST_FILE).exists());
    }

    #[test]
    fn test_redeploy_is_unchanged_until_forced() {
        let stub = Stub::new("");
        let config = stub.config();
        stub.deploy(&config, false, None).unwrap();
        let calls_after_first = stub.calls().len();

        let again = stub.deploy(&config, false, None).unwrap();
        assert!(again.iter().all(|r| r.outcome == StackOutcome::Unchanged));
        assert!(again.iter().all(|r| r.resources_unchanged > 0));
        assert_eq!(stub.calls().len(), calls_after_first);

        let forced = stub.deploy(&config, true, Some(LOADER)).unwrap();
        assert_eq!(outcomes(&forced), vec![(LOADER, StackOutcome::Deployed)]);
    }

    #[test]
    fn test_config_change_redeploys_one_stack() {
        let stub = Stub::new("");
        let mut config = stub.config();
        stub.deploy(&config, false, None).unwrap();

        let ResourceKind::Cluster(ref mut cluster) = config
            .stacks
            .get_mut(LOADER)
            .unwrap()
            .resources
            .get_mut("wipercheck-loader-cluster")
            .unwrap()
            .kind
        else {
            panic!("expected cluster");
        };
        cluster.container_insights = true;

        let results = stub.deploy(&config, false, None).unwrap();
        assert_eq!(
            outcomes(&results),
            vec![
                (VPC, StackOutcome::Unchanged),
                (LOADER, StackOutcome::Deployed),
                (SERVICE, StackOutcome::Unchanged)
            ]
        );
        assert_eq!(results[1].resources_changed, 1);
    }

    #[test]
    fn test_stop_on_first_failure() {
        let stub = Stub::new(LOADER);
        let config = stub.config();
        let results = stub.deploy(&config, false, None).unwrap();
        assert_eq!(
            outcomes(&results),
            vec![
                (VPC, StackOutcome::Deployed),
                (LOADER, StackOutcome::Failed),
                (SERVICE, StackOutcome::Skipped)
            ]
        );
        let lock = state::load_lock(&stub.state(), LOADER).unwrap().unwrap();
        assert!(!stack_converged(&lock));
        assert!(lock
            .resources
            .values()
            .all(|r| r.status == ResourceStatus::Failed));
        assert!(state::load_lock(&stub.state(), SERVICE).unwrap().is_none());

        let events = eventlog::read_events(&stub.state(), LOADER).unwrap();
        assert!(events.iter().any(|e| matches!(
            e.event,
            ProvenanceEvent::StackFailed { ref error, .. } if error.contains("rolled back")
        )));
    }

    #[test]
    fn test_failed_output_only_change_is_not_converged() {
        let stub = Stub::new("");
        let mut config = stub.config();
        stub.deploy(&config, false, None).unwrap();

        // Private load balancer subnets only add exports to the network stack
        let ResourceKind::LoadBalancer(ref mut lb) = config
            .stacks
            .get_mut(SERVICE)
            .unwrap()
            .resources
            .get_mut("wipercheck-service-load-balancer")
            .unwrap()
            .kind
        else {
            panic!("expected load balancer");
        };
        lb.subnets = Some(SubnetTier::PrivateWithNat);

        stub.fail_on(VPC);
        let results = stub.deploy(&config, false, None).unwrap();
        assert_eq!(
            outcomes(&results),
            vec![
                (VPC, StackOutcome::Failed),
                (LOADER, StackOutcome::Skipped),
                (SERVICE, StackOutcome::Skipped)
            ]
        );
        assert_eq!(results[0].resources_changed, 0);

        let lock = state::load_lock(&stub.state(), VPC).unwrap().unwrap();
        assert!(lock.template_hash.is_empty());
        assert!(!stack_converged(&lock));
        assert!(lock
            .resources
            .values()
            .all(|r| r.status == ResourceStatus::Converged));
        assert!(crate::tripwire::drift::detect_drift(&lock).is_none());

        let err = stub.deploy(&config, false, Some(SERVICE)).unwrap_err();
        assert!(err.contains("whose last deploy did not converge"), "{}", err);

        stub.fail_on("");
        let retry = stub.deploy(&config, false, None).unwrap();
        assert_eq!(retry[0].outcome, StackOutcome::Deployed);
        let lock = state::load_lock(&stub.state(), VPC).unwrap().unwrap();
        assert!(stack_converged(&lock));
    }

    #[test]
    fn test_continue_independent() {
        let stub = Stub::new(LOADER);
        let mut config = stub.config();
        config.policy.failure = FailurePolicy::ContinueIndependent;
        let results = stub.deploy(&config, false, None).unwrap();
        assert_eq!(results[1].outcome, StackOutcome::Failed);
        assert_eq!(results[2].outcome, StackOutcome::Deployed);

        // The failed stack is planned again on the next run
        let results = stub.deploy(&config, false, None).unwrap();
        assert_eq!(results[1].outcome, StackOutcome::Failed);
        assert_eq!(results[0].outcome, StackOutcome::Unchanged);
    }

    #[test]
    fn test_dependency_failure_skips_dependents() {
        let stub = Stub::new(VPC);
        let mut config = stub.config();
        config.policy.failure = FailurePolicy::ContinueIndependent;
        let results = stub.deploy(&config, false, None).unwrap();
        assert_eq!(
            outcomes(&results),
            vec![
                (VPC, StackOutcome::Failed),
                (LOADER, StackOutcome::Skipped),
                (SERVICE, StackOutcome::Skipped)
            ]
        );
    }

    #[test]
    fn test_single_stack_needs_converged_dependencies() {
        let stub = Stub::new("");
        let config = stub.config();
        let err = stub.deploy(&config, false, Some(SERVICE)).unwrap_err();
        assert!(err.contains("depends on 'WipercheckVpcStack', which has not been deployed"));

        stub.deploy(&config, false, Some(VPC)).unwrap();
        let results = stub.deploy(&config, false, Some(SERVICE)).unwrap();
        assert_eq!(outcomes(&results), vec![(SERVICE, StackOutcome::Deployed)]);

        assert!(stub.deploy(&config, false, Some("Nope")).unwrap_err().contains("unknown stack"));
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let stub = Stub::new("");
        let config = stub.config();
        let state_dir = stub.state();
        let out_dir = stub.out();
        let results = deploy(&DeployConfig {
            config: &config,
            state_dir: &state_dir,
            out_dir: &out_dir,
            force: false,
            dry_run: true,
            stack_filter: None,
        })
        .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.outcome == StackOutcome::Skipped));
        assert!(stub.calls().is_empty());
        assert!(!state_dir.exists());
        assert!(!out_dir.exists());
    }

    #[test]
    fn test_lock_file_disabled() {
        let stub = Stub::new("");
        let mut config = stub.config();
        config.policy.lock_file = false;
        config.policy.tripwire = false;
        stub.deploy(&config, false, Some(VPC)).unwrap();
        assert!(state::load_lock(&stub.state(), VPC).unwrap().is_none());
        assert!(eventlog::read_events(&stub.state(), VPC).unwrap().is_empty());
    }

    #[test]
    fn test_events_for_deploy() {
        let stub = Stub::new("");
        let config = stub.config();
        stub.deploy(&config, false, Some(VPC)).unwrap();
        let events = eventlog::read_events(&stub.state(), VPC).unwrap();
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e.event {
                ProvenanceEvent::DeployStarted { .. } => "started",
                ProvenanceEvent::StackConverged { .. } => "converged",
                ProvenanceEvent::DeployCompleted { .. } => "completed",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["started", "converged", "completed"]);
    }

    #[test]
    fn test_destroy_reverse_order() {
        let stub = Stub::new("");
        let config = stub.config();
        stub.deploy(&config, false, None).unwrap();

        let results = stub.destroy(&config, None).unwrap();
        assert_eq!(
            outcomes(&results),
            vec![
                (SERVICE, StackOutcome::Destroyed),
                (LOADER, StackOutcome::Destroyed),
                (VPC, StackOutcome::Destroyed)
            ]
        );
        assert!(state::list_locked_stacks(&stub.state()).unwrap().is_empty());
        let deletes: Vec<String> = stub
            .calls()
            .into_iter()
            .filter(|c| c.contains("delete-stack"))
            .collect();
        assert_eq!(deletes.len(), 3);
        assert!(deletes[0].contains(SERVICE));
    }

    #[test]
    fn test_destroy_refuses_needed_stack() {
        let stub = Stub::new("");
        let config = stub.config();
        stub.deploy(&config, false, None).unwrap();
        let err = stub.destroy(&config, Some(VPC)).unwrap_err();
        assert!(err.contains("still needed by deployed stack"));

        stub.destroy(&config, Some(SERVICE)).unwrap();
        stub.destroy(&config, Some(LOADER)).unwrap();
        let results = stub.destroy(&config, Some(VPC)).unwrap();
        assert_eq!(outcomes(&results), vec![(VPC, StackOutcome::Destroyed)]);
    }

    #[test]
    fn test_destroy_failure_keeps_dependencies() {
        let stub = Stub::new(SERVICE);
        let mut config = stub.config();
        config.policy.failure = FailurePolicy::ContinueIndependent;
        // Deploy with a working provider first
        let ok = Stub::new("");
        let mut ok_config = config.clone();
        ok_config.policy.cli = ok.config().policy.cli;
        let state_dir = stub.state();
        let out_dir = stub.out();
        deploy(&DeployConfig {
            config: &ok_config,
            state_dir: &state_dir,
            out_dir: &out_dir,
            force: false,
            dry_run: false,
            stack_filter: None,
        })
        .unwrap();

        let results = stub.destroy(&config, None).unwrap();
        assert_eq!(
            outcomes(&results),
            vec![
                (SERVICE, StackOutcome::Failed),
                (LOADER, StackOutcome::Destroyed),
                (VPC, StackOutcome::Skipped)
            ]
        );
        assert!(state::load_lock(&state_dir, VPC).unwrap().is_some());
    }

    #[test]
    fn test_destroy_orphan_stack() {
        let stub = Stub::new("");
        let config = stub.config();
        let mut orphan = state::new_lock("RetiredStack", "us-east-1");
        orphan.template_hash = "blake3:0".to_string();
        state::save_lock(&stub.state(), &orphan).unwrap();

        let order = destroy_order(&DestroyConfig {
            config: &config,
            state_dir: &stub.state(),
            dry_run: false,
            stack_filter: None,
        })
        .unwrap();
        assert_eq!(order[0], "RetiredStack");

        let results = stub.destroy(&config, Some("RetiredStack")).unwrap();
        assert_eq!(outcomes(&results), vec![("RetiredStack", StackOutcome::Destroyed)]);
        assert!(state::load_lock(&stub.state(), "RetiredStack").unwrap().is_none());
    }

    #[test]
    fn test_destroy_dry_run() {
        let stub = Stub::new("");
        let config = stub.config();
        let state_dir = stub.state();
        let results = destroy(&DestroyConfig {
            config: &config,
            state_dir: &state_dir,
            dry_run: true,
            stack_filter: None,
        })
        .unwrap();
        assert_eq!(results.len(), 3);
        assert!(stub.calls().is_empty());
    }
}
