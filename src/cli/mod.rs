//! CLI subcommands: init, validate, graph, synth, audit, plan, deploy,
//! destroy, drift, status.

use crate::core::{audit, codegen, executor, parser, planner, resolver, state, synth, types};
use crate::transport;
use crate::tripwire::{drift, eventlog};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a starter infra.yaml and state directory
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate infra.yaml without calling the provider
    Validate {
        /// Path to infra.yaml
        #[arg(short, long, default_value = "infra.yaml")]
        file: PathBuf,
    },

    /// Show stack and resource dependency order
    Graph {
        #[arg(short, long, default_value = "infra.yaml")]
        file: PathBuf,

        /// Emit Graphviz DOT instead of text
        #[arg(long)]
        dot: bool,
    },

    /// Write one CloudFormation template per stack plus a manifest
    Synth {
        #[arg(short, long, default_value = "infra.yaml")]
        file: PathBuf,

        /// Output directory for template artifacts
        #[arg(short, long, default_value = "synth.out")]
        out: PathBuf,

        /// Print one stack's template to stdout instead of writing files
        #[arg(short, long)]
        stack: Option<String>,
    },

    /// Report IAM scopes, wildcard grants, and port consistency
    Audit {
        #[arg(short, long, default_value = "infra.yaml")]
        file: PathBuf,

        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Show execution plan (diff templates vs lock state)
    Plan {
        #[arg(short, long, default_value = "infra.yaml")]
        file: PathBuf,

        /// Target a specific stack
        #[arg(short, long)]
        stack: Option<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Deploy stacks in dependency order
    Deploy {
        #[arg(short, long, default_value = "infra.yaml")]
        file: PathBuf,

        /// Deploy a single stack (its dependencies must be converged)
        #[arg(short, long)]
        stack: Option<String>,

        /// Redeploy stacks with no planned changes
        #[arg(long)]
        force: bool,

        /// Print the provider scripts without running them
        #[arg(long)]
        dry_run: bool,

        #[arg(short, long, default_value = "synth.out")]
        out: PathBuf,

        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Delete stacks in reverse dependency order
    Destroy {
        #[arg(short, long, default_value = "infra.yaml")]
        file: PathBuf,

        /// Delete a single stack (declared or known only from state)
        #[arg(short, long)]
        stack: Option<String>,

        /// Print the provider scripts without running them
        #[arg(long)]
        dry_run: bool,

        /// Confirm deletion
        #[arg(long)]
        yes: bool,

        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Detect template artifacts that changed since deploy
    Drift {
        #[arg(short, long)]
        stack: Option<String>,

        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Exit non-zero on any drift (for CI/cron)
        #[arg(long)]
        tripwire: bool,
    },

    /// Show current state from lock files
    Status {
        #[arg(short, long)]
        stack: Option<String>,

        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Also ask the provider for each stack's status
        #[arg(long)]
        live: bool,

        /// Config used to reach the provider with --live
        #[arg(short, long, default_value = "infra.yaml")]
        file: PathBuf,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Graph { file, dot } => cmd_graph(&file, dot),
        Commands::Synth { file, out, stack } => cmd_synth(&file, &out, stack.as_deref()),
        Commands::Audit { file, json } => cmd_audit(&file, json),
        Commands::Plan {
            file,
            stack,
            state_dir,
        } => cmd_plan(&file, &state_dir, stack.as_deref()),
        Commands::Deploy {
            file,
            stack,
            force,
            dry_run,
            out,
            state_dir,
        } => cmd_deploy(&file, &state_dir, &out, stack.as_deref(), force, dry_run),
        Commands::Destroy {
            file,
            stack,
            dry_run,
            yes,
            state_dir,
        } => cmd_destroy(&file, &state_dir, stack.as_deref(), dry_run, yes),
        Commands::Drift {
            stack,
            state_dir,
            tripwire,
        } => cmd_drift(&state_dir, stack.as_deref(), tripwire),
        Commands::Status {
            stack,
            state_dir,
            live,
            file,
        } => cmd_status(&state_dir, stack.as_deref(), live.then_some(file.as_path())),
    }
}

const STARTER: &str = r#"version: "1.0"
name: my-infrastructure
description: "Managed by wipercheck-infra"

env:
  account: "123456789012"
  region: us-east-1

params: {}

stacks:
  NetworkStack:
    resources:
      vpc:
        type: vpc
        cidr: 10.0.0.0/16
        nat_gateways: 1
        subnets:
          - name: public
            cidr_mask: 24
            tier: public
          - name: private
            cidr_mask: 24
            tier: private_with_nat

policy:
  failure: stop_on_first
  tripwire: true
  lock_file: true
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("infra.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;
    std::fs::write(&config_path, STARTER)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized wipercheck-infra project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        let resources: usize = config.stacks.values().map(|s| s.resources.len()).sum();
        println!(
            "OK: {} ({} stacks, {} resources)",
            config.name,
            config.stacks.len(),
            resources
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

/// Parse and validate a config file, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<types::InfraConfig, String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

fn cmd_graph(file: &Path, dot: bool) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let stacks = resolver::build_stack_order(&config)?;
    let graph = resolver::build_graph(&config)?;

    if dot {
        println!("digraph \"{}\" {{", config.name);
        for stack in &stacks {
            println!("  subgraph \"cluster_{}\" {{", stack);
            println!("    label=\"{}\";", stack);
            for id in resolver::build_resource_order(&config, stack)? {
                println!("    \"{}/{}\";", stack, id);
            }
            println!("  }}");
        }
        for (node, deps) in &graph.dependencies {
            for dep in deps {
                println!("  \"{}\" -> \"{}\";", dep, node);
            }
        }
        println!("}}");
        return Ok(());
    }

    for stack in &stacks {
        let deps = graph.stack_dependencies(stack);
        let explicit = &config.stacks[stack].depends_on;
        let mut all: Vec<&str> = deps.iter().map(String::as_str).collect();
        for d in explicit {
            if !all.contains(&d.as_str()) {
                all.push(d.as_str());
            }
        }
        if all.is_empty() {
            println!("{}", stack);
        } else {
            println!("{} (after {})", stack, all.join(", "));
        }
        for id in resolver::build_resource_order(&config, stack)? {
            let node = resolver::QualifiedId::new(stack, &id);
            let refs: Vec<String> = graph
                .dependencies
                .get(&node)
                .map(|d| d.iter().map(|q| q.to_string()).collect())
                .unwrap_or_default();
            if refs.is_empty() {
                println!("  {}", id);
            } else {
                println!("  {} <- {}", id, refs.join(", "));
            }
        }
    }
    Ok(())
}

fn synthesize_checked(config: &types::InfraConfig) -> Result<Vec<synth::StackTemplate>, String> {
    let templates = synth::synthesize(config)?;
    let problems = synth::verify_templates(&templates);
    if problems.is_empty() {
        return Ok(templates);
    }
    for p in &problems {
        eprintln!("  ERROR: {}", p);
    }
    Err(format!("{} template problem(s)", problems.len()))
}

fn cmd_synth(file: &Path, out: &Path, stack: Option<&str>) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let templates = synthesize_checked(&config)?;

    if let Some(name) = stack {
        let template = templates
            .iter()
            .find(|t| t.stack == name)
            .ok_or_else(|| format!("unknown stack '{}'", name))?;
        print!("{}", template.render());
        return Ok(());
    }

    let paths = synth::write_templates(&config, &templates, out)?;
    for (template, path) in templates.iter().zip(&paths) {
        println!(
            "{}: {} resources, {} outputs -> {}",
            template.stack,
            template.resources.len(),
            template.outputs.len(),
            path.display()
        );
        println!("  {}", template.template_hash());
    }
    println!("Manifest: {}", out.join(synth::MANIFEST_FILE).display());
    Ok(())
}

fn cmd_audit(file: &Path, json: bool) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let templates = synthesize_checked(&config)?;
    let scopes = audit::iam_scopes(&templates);
    let wildcards = audit::wildcard_grants(&templates);
    let ports = audit::port_consistency(&config, &templates);
    let failed = ports.iter().filter(|c| !c.passed).count();

    if json {
        let report = serde_json::json!({
            "iam": scopes,
            "wildcards": wildcards,
            "ports": ports,
        });
        println!("{:#}", report);
    } else {
        println!("IAM statements:");
        for s in &scopes {
            println!(
                "  {}/{} {} {} on {}",
                s.stack,
                s.policy,
                s.effect,
                s.actions.join(","),
                s.resources.join(", ")
            );
        }
        println!();
        println!("Wildcard grants: {}", wildcards.len());
        for w in &wildcards {
            println!("  WILDCARD: {}/{} ({}) {}", w.stack, w.policy, w.source, w.actions.join(","));
        }
        println!();
        println!("Port checks:");
        for c in &ports {
            let mark = if c.passed { "ok" } else { "FAIL" };
            println!("  [{}] {} {}: {}", mark, c.service, c.check, c.detail);
        }
    }

    if failed > 0 {
        return Err(format!("{} port check(s) failed", failed));
    }
    Ok(())
}

fn load_plan(
    config: &types::InfraConfig,
    templates: &[synth::StackTemplate],
    state_dir: &Path,
) -> Result<types::ExecutionPlan, String> {
    let mut names: Vec<String> = templates.iter().map(|t| t.stack.clone()).collect();
    names.extend(state::list_locked_stacks(state_dir)?);
    let locks = state::load_locks(state_dir, &names)?;
    Ok(planner::plan(config, templates, &locks))
}

fn cmd_plan(file: &Path, state_dir: &Path, stack_filter: Option<&str>) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let templates = synthesize_checked(&config)?;
    let plan = load_plan(&config, &templates, state_dir)?;
    if let Some(filter) = stack_filter {
        if plan.stack(filter).is_none() {
            return Err(format!("unknown stack '{}'", filter));
        }
    }
    print_plan(&plan, stack_filter);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(plan: &types::ExecutionPlan, stack_filter: Option<&str>) {
    let total: usize = plan.stacks.iter().map(|s| s.changes.len()).sum();
    println!("Planning: {} ({} stacks, {} resources)", plan.name, plan.stacks.len(), total);
    println!();

    for stack in &plan.stacks {
        if stack_filter.is_some_and(|f| f != stack.stack) {
            continue;
        }
        println!("{} ({}):", stack.stack, stack.action);
        for change in &stack.changes {
            let symbol = match change.action {
                types::PlanAction::Create => "+",
                types::PlanAction::Update => "~",
                types::PlanAction::Destroy => "-",
                types::PlanAction::NoOp => " ",
            };
            println!("  {} {}", symbol, change.description);
        }
    }

    println!();
    println!(
        "Plan: {} to add, {} to change, {} to destroy, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_destroy, plan.unchanged
    );
}

fn print_results(verb: &str, results: &[types::DeployResult]) -> Result<(), String> {
    let mut failed = 0;
    for r in results {
        println!(
            "{}: {} ({} changed, {} unchanged, {} failed, {:.1}s)",
            r.stack,
            r.outcome,
            r.resources_changed,
            r.resources_unchanged,
            r.resources_failed,
            r.total_duration.as_secs_f64()
        );
        if r.outcome == types::StackOutcome::Failed {
            failed += 1;
        }
    }
    println!();
    if failed > 0 {
        println!("{} completed with errors: {} stack(s) FAILED", verb, failed);
        return Err(format!("{} stack(s) failed", failed));
    }
    println!("{} complete.", verb);
    Ok(())
}

fn cmd_deploy(
    file: &Path,
    state_dir: &Path,
    out: &Path,
    stack_filter: Option<&str>,
    force: bool,
    dry_run: bool,
) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let results = executor::deploy(&executor::DeployConfig {
        config: &config,
        state_dir,
        out_dir: out,
        force,
        dry_run,
        stack_filter,
    })?;

    if dry_run {
        println!("Dry run: no changes applied.");
        return Ok(());
    }
    print_results("Deploy", &results)
}

fn cmd_destroy(
    file: &Path,
    state_dir: &Path,
    stack_filter: Option<&str>,
    dry_run: bool,
    yes: bool,
) -> Result<(), String> {
    if !dry_run && !yes {
        return Err("destroy deletes provider stacks; pass --yes to confirm".to_string());
    }
    let config = parse_and_validate(file)?;
    let results = executor::destroy(&executor::DestroyConfig {
        config: &config,
        state_dir,
        dry_run,
        stack_filter,
    })?;

    if dry_run {
        println!("Dry run: nothing deleted.");
        return Ok(());
    }
    print_results("Destroy", &results)
}

fn cmd_drift(state_dir: &Path, stack_filter: Option<&str>, tripwire_mode: bool) -> Result<(), String> {
    let mut locks = Vec::new();
    for name in state::list_locked_stacks(state_dir)? {
        if stack_filter.is_some_and(|f| f != name) {
            continue;
        }
        if let Some(lock) = state::load_lock(state_dir, &name)? {
            println!(
                "Checking {} ({})...",
                name,
                lock.template_path.as_deref().unwrap_or("no artifact recorded")
            );
            locks.push(lock);
        }
    }

    let findings = drift::detect_all(&locks);
    for f in &findings {
        println!("  DRIFTED: {}", f.detail);
        println!("    Expected: {}", f.expected_hash);
        println!("    Actual:   {}", f.actual_hash);
        eventlog::append_event(
            state_dir,
            &f.stack,
            types::ProvenanceEvent::DriftDetected {
                stack: f.stack.clone(),
                artifact: f.artifact.clone(),
                expected_hash: f.expected_hash.clone(),
                actual_hash: f.actual_hash.clone(),
            },
        )?;
    }

    if findings.is_empty() {
        println!("No drift detected.");
        return Ok(());
    }
    println!();
    println!("Drift detected: {} stack(s)", findings.len());
    if tripwire_mode {
        return Err(format!("{} drift finding(s)", findings.len()));
    }
    Ok(())
}

fn cmd_status(state_dir: &Path, stack_filter: Option<&str>, live: Option<&Path>) -> Result<(), String> {
    let config = live.map(parser::parse_config_file).transpose()?;
    let mut found = false;

    for name in state::list_locked_stacks(state_dir)? {
        if stack_filter.is_some_and(|f| f != name) {
            continue;
        }
        let Some(lock) = state::load_lock(state_dir, &name)? else {
            continue;
        };
        found = true;
        let converged = if executor::stack_converged(&lock) {
            "converged"
        } else {
            "NOT converged"
        };
        println!("Stack: {} ({}, {})", lock.stack, lock.region, converged);
        println!("  Generated: {}", lock.generated_at);
        println!("  Generator: {}", lock.generator);
        println!("  Template:  {}", lock.template_hash);
        if let Some(ref status) = lock.stack_status {
            println!("  Provider:  {} (at deploy)", status);
        }
        if let Some(ref config) = config {
            let live_status = transport::query(&codegen::status_query_script(config, &name))
                .unwrap_or_else(|e| format!("unavailable: {}", e));
            println!("  Live:      {}", live_status);
        }
        if let Some(last) = eventlog::read_events(state_dir, &name)?.last() {
            println!("  Last event: {} {}", last.ts, event_name(&last.event));
        }
        println!("  Resources: {}", lock.resources.len());
        for (id, rl) in &lock.resources {
            let duration = rl
                .duration_seconds
                .map(|d| format!(" ({:.2}s)", d))
                .unwrap_or_default();
            println!("    {}: {} [{}]{}", id, rl.status, rl.resource_type, duration);
        }
        println!();
    }

    if !found {
        println!("No state found. Run `wipercheck-infra deploy` first.");
    }

    Ok(())
}

fn event_name(event: &types::ProvenanceEvent) -> &'static str {
    use types::ProvenanceEvent::*;
    match event {
        DeployStarted { .. } => "deploy_started",
        StackConverged { .. } => "stack_converged",
        StackFailed { .. } => "stack_failed",
        DeployCompleted { .. } => "deploy_completed",
        StackDestroyed { .. } => "stack_destroyed",
        DriftDetected { .. } => "drift_detected",
    }
}
