//! Plan generation: diff synthesized templates against the stack locks.

use super::synth::{CfnResource, StackTemplate};
use super::types::*;
use std::collections::HashMap;

/// Generate an execution plan by comparing templates to lock state.
///
/// Templates are expected in deployment order. Stacks that only exist in
/// `locks` are appended as Destroy, sorted by name.
pub fn plan(
    config: &InfraConfig,
    templates: &[StackTemplate],
    locks: &HashMap<String, StateLock>,
) -> ExecutionPlan {
    let mut stacks = Vec::new();

    for template in templates {
        stacks.push(plan_stack(template, locks.get(&template.stack)));
    }

    let mut orphans: Vec<&StateLock> = locks
        .values()
        .filter(|lock| !templates.iter().any(|t| t.stack == lock.stack))
        .collect();
    orphans.sort_by(|a, b| a.stack.cmp(&b.stack));
    for lock in orphans {
        stacks.push(plan_orphan(lock));
    }

    let mut execution = ExecutionPlan {
        name: config.name.clone(),
        stacks,
        to_create: 0,
        to_update: 0,
        to_destroy: 0,
        unchanged: 0,
    };
    for change in execution.stacks.iter().flat_map(|s| &s.changes) {
        match change.action {
            PlanAction::Create => execution.to_create += 1,
            PlanAction::Update => execution.to_update += 1,
            PlanAction::Destroy => execution.to_destroy += 1,
            PlanAction::NoOp => execution.unchanged += 1,
        }
    }
    execution
}

fn plan_stack(template: &StackTemplate, lock: Option<&StateLock>) -> StackPlan {
    let mut changes = Vec::new();

    for (logical, resource) in &template.resources {
        let action = determine_action(logical, resource, lock);
        changes.push(PlannedChange {
            logical_id: logical.clone(),
            source: resource.source.clone(),
            resource_type: resource.resource_type.clone(),
            description: describe_action(logical, &resource.resource_type, &action),
            action,
        });
    }

    if let Some(lock) = lock {
        for (logical, rl) in &lock.resources {
            if template.resources.contains_key(logical) {
                continue;
            }
            changes.push(PlannedChange {
                logical_id: logical.clone(),
                source: rl.source.clone(),
                resource_type: rl.resource_type.clone(),
                action: PlanAction::Destroy,
                description: describe_action(logical, &rl.resource_type, &PlanAction::Destroy),
            });
        }
    }

    let template_hash = template.template_hash();
    let action = match lock {
        None => PlanAction::Create,
        Some(lock)
            if lock.template_hash == template_hash
                && changes.iter().all(|c| c.action == PlanAction::NoOp) =>
        {
            PlanAction::NoOp
        }
        Some(_) => PlanAction::Update,
    };

    StackPlan {
        stack: template.stack.clone(),
        action,
        template_hash,
        changes,
    }
}

fn plan_orphan(lock: &StateLock) -> StackPlan {
    let changes = lock
        .resources
        .iter()
        .map(|(logical, rl)| PlannedChange {
            logical_id: logical.clone(),
            source: rl.source.clone(),
            resource_type: rl.resource_type.clone(),
            action: PlanAction::Destroy,
            description: describe_action(logical, &rl.resource_type, &PlanAction::Destroy),
        })
        .collect();
    StackPlan {
        stack: lock.stack.clone(),
        action: PlanAction::Destroy,
        template_hash: lock.template_hash.clone(),
        changes,
    }
}

/// Determine what to do with one synthesized resource.
fn determine_action(logical: &str, resource: &CfnResource, lock: Option<&StateLock>) -> PlanAction {
    let Some(rl) = lock.and_then(|l| l.resources.get(logical)) else {
        return PlanAction::Create;
    };
    if rl.status == ResourceStatus::Converged && rl.hash == resource.hash() {
        return PlanAction::NoOp;
    }
    // Hash changed, or previously failed or drifted
    PlanAction::Update
}

fn describe_action(logical: &str, resource_type: &str, action: &PlanAction) -> String {
    match action {
        PlanAction::Create => format!("{}: create {}", logical, resource_type),
        PlanAction::Update => format!("{}: update {}", logical, resource_type),
        PlanAction::Destroy => format!("{}: delete {}", logical, resource_type),
        PlanAction::NoOp => format!("{}: no changes", logical),
    }
}
