//! Template resolution, reference parsing, and dependency DAG construction.
//!
//! Resolves `{{params.key}}`, `{{env.account}}`, and `{{env.region}}`.
//! Builds DAGs from resource references and explicit depends_on edges and
//! computes topological orders using Kahn's algorithm with deterministic
//! (alphabetical) tie-breaking.

use super::types::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

/// Resolve all template variables in a string.
pub fn resolve_template(
    template: &str,
    params: &HashMap<String, serde_yaml_ng::Value>,
    env: &Environment,
) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = if let Some(param_key) = key.strip_prefix("params.") {
            params
                .get(param_key)
                .map(yaml_value_to_string)
                .ok_or_else(|| format!("unknown param: {}", param_key))?
        } else if let Some(field) = key.strip_prefix("env.") {
            match field {
                "account" => env.account.clone(),
                "region" => env.region.clone(),
                _ => return Err(format!("unknown env field: {}", field)),
            }
        } else {
            return Err(format!("unknown template variable: {}", key));
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// A string that is exactly one `{{params.key}}` naming a list or mapping.
fn whole_param<'a>(
    s: &str,
    params: &'a HashMap<String, serde_yaml_ng::Value>,
) -> Option<&'a serde_yaml_ng::Value> {
    let key = s.trim().strip_prefix("{{")?.strip_suffix("}}")?.trim();
    let value = params.get(key.strip_prefix("params.")?)?;
    match value {
        serde_yaml_ng::Value::Sequence(_) | serde_yaml_ng::Value::Mapping(_) => Some(value),
        _ => None,
    }
}

/// Resolve templates in every string of a YAML tree, in place. A string that
/// is exactly one list- or mapping-valued param is replaced by that value.
pub fn expand_templates(
    value: &mut serde_yaml_ng::Value,
    params: &HashMap<String, serde_yaml_ng::Value>,
    env: &Environment,
) -> Result<(), String> {
    match value {
        serde_yaml_ng::Value::String(s) if s.contains("{{") => {
            if let Some(structured) = whole_param(s, params) {
                *value = structured.clone();
            } else {
                *s = resolve_template(s, params, env)?;
            }
        }
        serde_yaml_ng::Value::Sequence(items) => {
            for item in items {
                expand_templates(item, params, env)?;
            }
        }
        serde_yaml_ng::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_templates(v, params, env)?;
            }
        }
        _ => {}
    }
    Ok(())
}

// ============================================================================
// References
// ============================================================================

/// A resource addressed by stack and ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedId {
    pub stack: String,
    pub id: String,
}

impl QualifiedId {
    pub fn new(stack: &str, id: &str) -> Self {
        Self {
            stack: stack.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stack, self.id)
    }
}

/// Parse `id` (same stack) or `Stack/id` (cross-stack).
pub fn parse_ref(raw: &str, current_stack: &str) -> QualifiedId {
    match raw.split_once('/') {
        Some((stack, id)) => QualifiedId::new(stack, id),
        None => QualifiedId::new(current_stack, raw),
    }
}

/// Look up a qualified resource.
pub fn lookup<'a>(config: &'a InfraConfig, q: &QualifiedId) -> Option<&'a Resource> {
    config.stacks.get(&q.stack)?.resources.get(&q.id)
}

/// A reference held by a resource field.
#[derive(Debug, Clone)]
pub struct Reference<'a> {
    /// Field the reference appears in
    pub field: &'static str,
    pub raw: &'a str,
    /// Expected target type; None for plain ordering edges
    pub expected: Option<&'static str>,
}

/// Every reference a resource makes, including explicit depends_on.
pub fn references(resource: &Resource) -> Vec<Reference<'_>> {
    fn typed<'a>(field: &'static str, raw: &'a str, expected: &'static str) -> Reference<'a> {
        Reference {
            field,
            raw,
            expected: Some(expected),
        }
    }

    let mut refs = Vec::new();
    match &resource.kind {
        ResourceKind::Vpc(_) | ResourceKind::Role(_) => {}
        ResourceKind::Cluster(c) => refs.push(typed("vpc", &c.vpc, "vpc")),
        ResourceKind::TaskDefinition(t) => {
            refs.push(typed("execution_role", &t.execution_role, "role"))
        }
        ResourceKind::LoadBalancer(lb) => refs.push(typed("vpc", &lb.vpc, "vpc")),
        ResourceKind::Listener(l) => {
            refs.push(typed("load_balancer", &l.load_balancer, "load_balancer"));
            for tg in &l.target_groups {
                refs.push(typed("target_groups", tg, "target_group"));
            }
        }
        ResourceKind::TargetGroup(tg) => refs.push(typed("vpc", &tg.vpc, "vpc")),
        ResourceKind::SecurityGroup(sg) => refs.push(typed("vpc", &sg.vpc, "vpc")),
        ResourceKind::FargateService(s) => {
            refs.push(typed("cluster", &s.cluster, "cluster"));
            refs.push(typed("task_definition", &s.task_definition, "task_definition"));
            for sg in &s.security_groups {
                refs.push(typed("security_groups", sg, "security_group"));
            }
            for tg in &s.target_groups {
                refs.push(typed("target_groups", tg, "target_group"));
            }
        }
    }

    for dep in &resource.depends_on {
        refs.push(Reference {
            field: "depends_on",
            raw: dep,
            expected: None,
        });
    }

    refs
}

// ============================================================================
// Dependency graphs
// ============================================================================

/// Kahn's algorithm with sorted tie-breaking. Edges are (dependency, dependent).
/// On a cycle, returns the IDs that could not be ordered.
fn toposort(ids: &[String], edges: &[(String, String)]) -> Result<Vec<String>, Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for id in ids {
        in_degree.insert(id.as_str(), 0);
        adjacency.insert(id.as_str(), Vec::new());
    }

    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    for (dep, dependent) in edges {
        if !seen.insert((dep.as_str(), dependent.as_str())) {
            continue;
        }
        let Some(degree) = in_degree.get_mut(dependent.as_str()) else {
            continue;
        };
        if let Some(list) = adjacency.get_mut(dep.as_str()) {
            list.push(dependent.as_str());
            *degree += 1;
        }
    }

    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut zero_degree: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    zero_degree.sort_unstable();
    queue.extend(zero_degree);

    let mut order = Vec::new();
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut next_ready: Vec<&str> = Vec::new();
        if let Some(neighbors) = adjacency.get(current) {
            for neighbor in neighbors {
                if let Some(degree) = in_degree.get_mut(neighbor) {
                    *degree -= 1;
                    if *degree == 0 {
                        next_ready.push(*neighbor);
                    }
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != ids.len() {
        let ordered: HashSet<&str> = order.iter().map(|s| s.as_str()).collect();
        let mut cycle_members: Vec<String> = ids
            .iter()
            .filter(|id| !ordered.contains(id.as_str()))
            .cloned()
            .collect();
        cycle_members.sort();
        return Err(cycle_members);
    }

    Ok(order)
}

/// Whole-repository resource graph.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// Resources in topological order
    pub order: Vec<QualifiedId>,

    /// Each resource's direct dependencies
    pub dependencies: BTreeMap<QualifiedId, BTreeSet<QualifiedId>>,
}

impl ResourceGraph {
    /// Stacks a stack depends on through its resources' references.
    pub fn stack_dependencies(&self, stack: &str) -> BTreeSet<String> {
        self.dependencies
            .iter()
            .filter(|(node, _)| node.stack == stack)
            .flat_map(|(_, deps)| deps.iter())
            .filter(|dep| dep.stack != stack)
            .map(|dep| dep.stack.clone())
            .collect()
    }
}

/// Build the resource graph across all stacks. Fails on unknown references
/// and on cycles.
pub fn build_graph(config: &InfraConfig) -> Result<ResourceGraph, String> {
    let mut ids = Vec::new();
    let mut edges = Vec::new();
    let mut dependencies: BTreeMap<QualifiedId, BTreeSet<QualifiedId>> = BTreeMap::new();

    for (stack_name, stack) in &config.stacks {
        for (id, resource) in &stack.resources {
            let node = QualifiedId::new(stack_name, id);
            let deps = dependencies.entry(node.clone()).or_default();
            for r in references(resource) {
                let target = parse_ref(r.raw, stack_name);
                if lookup(config, &target).is_none() {
                    return Err(format!(
                        "resource '{}' references unknown '{}'",
                        node, target
                    ));
                }
                edges.push((target.to_string(), node.to_string()));
                deps.insert(target);
            }
            ids.push(node.to_string());
        }
    }

    let order = toposort(&ids, &edges).map_err(|members| {
        format!(
            "dependency cycle detected involving: {}",
            members.join(", ")
        )
    })?;

    let order = order
        .iter()
        .map(|s| {
            let (stack, id) = s.split_once('/').unwrap_or(("", s.as_str()));
            QualifiedId::new(stack, id)
        })
        .collect();

    Ok(ResourceGraph {
        order,
        dependencies,
    })
}

/// Build the stack deployment order from cross-stack references and explicit
/// stack depends_on.
pub fn build_stack_order(config: &InfraConfig) -> Result<Vec<String>, String> {
    let graph = build_graph(config)?;
    let ids: Vec<String> = config.stacks.keys().cloned().collect();
    let mut edges = Vec::new();

    for (name, stack) in &config.stacks {
        for dep in &stack.depends_on {
            if !config.stacks.contains_key(dep) {
                return Err(format!("stack '{}' depends on unknown stack '{}'", name, dep));
            }
            edges.push((dep.clone(), name.clone()));
        }
        for dep in graph.stack_dependencies(name) {
            edges.push((dep, name.clone()));
        }
    }

    toposort(&ids, &edges).map_err(|members| {
        format!(
            "stack dependency cycle detected involving: {}",
            members.join(", ")
        )
    })
}

/// Build the resource order within one stack.
pub fn build_resource_order(config: &InfraConfig, stack: &str) -> Result<Vec<String>, String> {
    let decl = config
        .stacks
        .get(stack)
        .ok_or_else(|| format!("unknown stack '{}'", stack))?;
    let ids: Vec<String> = decl.resources.keys().cloned().collect();
    let mut edges = Vec::new();

    for (id, resource) in &decl.resources {
        for r in references(resource) {
            let target = parse_ref(r.raw, stack);
            if target.stack == stack {
                if !decl.resources.contains_key(&target.id) {
                    return Err(format!(
                        "resource '{}/{}' references unknown '{}'",
                        stack, id, target
                    ));
                }
                edges.push((target.id, id.clone()));
            }
        }
    }

    toposort(&ids, &edges).map_err(|members| {
        format!(
            "dependency cycle detected in stack '{}' involving: {}",
            stack,
            members.join(", ")
        )
    })
}
