//! Template synthesis: one CloudFormation template per stack.
//!
//! Stacks are synthesized in dependency order. Within a stack, resources are
//! synthesized in topological order and dispatched to the resource handlers.
//! A reference to a resource in another stack becomes `Fn::ImportValue`; the
//! matching `Outputs` export is added to the producing stack.

use super::codegen;
use super::network::{self, PlannedSubnet};
use super::resolver::{self, QualifiedId};
use super::types::*;
use crate::tripwire::hasher;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// CloudFormation logical ID for a declaration ID: `wipercheck-vpc` → `WipercheckVpc`.
pub fn logical_id(id: &str) -> String {
    id.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

// ============================================================================
// Template model
// ============================================================================

/// A single synthesized provider resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CfnResource {
    pub resource_type: String,
    pub properties: Value,
    pub depends_on: Vec<String>,
    pub deletion_policy: Option<String>,
    /// Declaration ID the resource was synthesized from
    pub source: String,
}

impl CfnResource {
    pub fn new(resource_type: &str, properties: Value) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
            source: String::new(),
        }
    }

    /// Add explicit ordering edges (kept sorted and unique).
    pub fn with_depends_on<I: IntoIterator<Item = String>>(mut self, ids: I) -> Self {
        self.depends_on.extend(ids);
        self.depends_on.sort();
        self.depends_on.dedup();
        self
    }

    /// Keep the physical resource when it is removed from the template.
    pub fn retain(mut self) -> Self {
        self.deletion_policy = Some("Retain".to_string());
        self
    }

    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("Type".to_string(), json!(self.resource_type));
        obj.insert("Properties".to_string(), self.properties.clone());
        if !self.depends_on.is_empty() {
            obj.insert("DependsOn".to_string(), json!(self.depends_on));
        }
        if let Some(ref policy) = self.deletion_policy {
            obj.insert("DeletionPolicy".to_string(), json!(policy));
            obj.insert("UpdateReplacePolicy".to_string(), json!(policy));
        }
        Value::Object(obj)
    }

    /// BLAKE3 of the canonical JSON form.
    pub fn hash(&self) -> String {
        hasher::hash_string(&self.to_json().to_string())
    }
}

/// A stack output exported for other stacks.
#[derive(Debug, Clone, PartialEq)]
pub struct CfnOutput {
    pub value: Value,
    pub export_name: String,
}

/// The synthesized form of one stack.
#[derive(Debug, Clone)]
pub struct StackTemplate {
    pub stack: String,
    pub description: Option<String>,
    pub resources: IndexMap<String, CfnResource>,
    pub outputs: IndexMap<String, CfnOutput>,
    /// Stacks this one must be deployed after
    pub dependencies: Vec<String>,
    pub tags: IndexMap<String, String>,
}

impl StackTemplate {
    pub fn to_json(&self) -> Value {
        let resources: serde_json::Map<String, Value> = self
            .resources
            .iter()
            .map(|(id, r)| (id.clone(), r.to_json()))
            .collect();

        let mut obj = serde_json::Map::new();
        obj.insert(
            "AWSTemplateFormatVersion".to_string(),
            json!("2010-09-09"),
        );
        if let Some(ref d) = self.description {
            obj.insert("Description".to_string(), json!(d));
        }
        obj.insert("Resources".to_string(), Value::Object(resources));
        if !self.outputs.is_empty() {
            let outputs: serde_json::Map<String, Value> = self
                .outputs
                .iter()
                .map(|(key, o)| {
                    (
                        key.clone(),
                        json!({"Value": o.value, "Export": {"Name": o.export_name}}),
                    )
                })
                .collect();
            obj.insert("Outputs".to_string(), Value::Object(outputs));
        }
        Value::Object(obj)
    }

    /// Pretty-printed template body.
    pub fn render(&self) -> String {
        format!("{:#}\n", self.to_json())
    }

    pub fn template_hash(&self) -> String {
        hasher::hash_string(&self.render())
    }

    pub fn resource_hash(&self, logical: &str) -> Option<String> {
        self.resources.get(logical).map(CfnResource::hash)
    }

    pub fn file_name(&self) -> String {
        format!("{}.template.json", self.stack)
    }

    /// All resources of one provider type.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a CfnResource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }
}

// ============================================================================
// Synthesis context
// ============================================================================

#[derive(Debug, Default)]
struct Exports {
    by_stack: IndexMap<String, IndexMap<String, CfnOutput>>,
}

/// Per-stack state shared with the resource handlers.
pub struct SynthContext<'a> {
    pub config: &'a InfraConfig,
    pub stack: &'a str,
    exports: &'a mut Exports,
    imports: BTreeSet<String>,
}

impl<'a> SynthContext<'a> {
    pub fn region(&self) -> &'a str {
        &self.config.env.region
    }

    /// Resolve a reference made from the current stack.
    pub fn resolve(&self, raw: &str) -> Result<(QualifiedId, &'a Resource), String> {
        let q = resolver::parse_ref(raw, self.stack);
        let resource = resolver::lookup(self.config, &q)
            .ok_or_else(|| format!("stack '{}' references unknown '{}'", self.stack, q))?;
        Ok((q, resource))
    }

    /// Make a value owned by `owner_stack` usable from the current stack.
    fn expose(&mut self, owner_stack: &str, key: &str, value: Value) -> Value {
        if owner_stack == self.stack {
            return value;
        }
        let export_name = format!("{}:{}", owner_stack, key);
        self.exports
            .by_stack
            .entry(owner_stack.to_string())
            .or_default()
            .entry(format!("Export{}", key))
            .or_insert_with(|| CfnOutput {
                value,
                export_name: export_name.clone(),
            });
        self.imports.insert(owner_stack.to_string());
        json!({ "Fn::ImportValue": export_name })
    }

    /// `Ref` of the resource synthesized as `<logical_id(id)><suffix>`.
    pub fn ref_of(&mut self, raw: &str, suffix: &str) -> Result<Value, String> {
        let (q, _) = self.resolve(raw)?;
        let logical = format!("{}{}", logical_id(&q.id), suffix);
        let key = format!("{}Ref", logical);
        Ok(self.expose(&q.stack, &key, json!({ "Ref": logical })))
    }

    /// `Fn::GetAtt` of the resource synthesized as `<logical_id(id)><suffix>`.
    pub fn get_att(&mut self, raw: &str, suffix: &str, attr: &str) -> Result<Value, String> {
        let (q, _) = self.resolve(raw)?;
        let logical = format!("{}{}", logical_id(&q.id), suffix);
        let key = format!("{}{}", logical, attr.replace('.', ""));
        Ok(self.expose(&q.stack, &key, json!({ "Fn::GetAtt": [logical, attr] })))
    }

    /// Resolve a reference that must point at a VPC.
    pub fn vpc(&self, raw: &str) -> Result<(QualifiedId, &'a VpcSpec), String> {
        let (q, resource) = self.resolve(raw)?;
        match &resource.kind {
            ResourceKind::Vpc(spec) => Ok((q, spec)),
            other => Err(format!("'{}' is a {}, expected a vpc", q, other)),
        }
    }

    /// IDs of a VPC's subnets in a tier. A missing private tier falls back to
    /// the other private tier.
    pub fn subnet_ids(&mut self, vpc_raw: &str, tier: SubnetTier) -> Result<Vec<Value>, String> {
        let (q, spec) = self.vpc(vpc_raw)?;
        let layout = network::plan_subnets(spec)?;
        let mut chosen: Vec<&PlannedSubnet> = network::subnets_of_tier(&layout, tier);
        if chosen.is_empty() && tier.is_private() {
            chosen = layout.iter().filter(|s| s.tier.is_private()).collect();
        }
        if chosen.is_empty() {
            return Err(format!("'{}' has no {} subnets", q, tier));
        }
        let names: Vec<String> = chosen.iter().map(|s| s.name()).collect();
        let mut ids = Vec::new();
        for name in names {
            ids.push(self.ref_of(vpc_raw, &name)?);
        }
        Ok(ids)
    }

    fn into_imports(self) -> BTreeSet<String> {
        self.imports
    }
}

// ============================================================================
// Synthesis
// ============================================================================

/// Synthesize every stack, in deployment order.
pub fn synthesize(config: &InfraConfig) -> Result<Vec<StackTemplate>, String> {
    let order = resolver::build_stack_order(config)?;
    let graph = resolver::build_graph(config)?;
    let mut exports = Exports::default();
    let mut templates = Vec::new();

    for stack_name in &order {
        let decl = &config.stacks[stack_name];
        let resource_order = resolver::build_resource_order(config, stack_name)?;
        let mut ctx = SynthContext {
            config,
            stack: stack_name,
            exports: &mut exports,
            imports: BTreeSet::new(),
        };

        let mut resources: IndexMap<String, CfnResource> = IndexMap::new();
        for id in &resource_order {
            let resource = &decl.resources[id];
            for (logical, mut cfn) in codegen::synthesize_resource(&mut ctx, id, resource)? {
                if let Some(existing) = resources.get(&logical) {
                    return Err(format!(
                        "stack '{}': logical ID '{}' from '{}' collides with '{}'",
                        stack_name, logical, id, existing.source
                    ));
                }
                cfn.source = id.clone();
                resources.insert(logical, cfn);
            }
        }
        apply_explicit_dependencies(stack_name, decl, &mut resources);

        let mut dependencies = ctx.into_imports();
        dependencies.extend(graph.stack_dependencies(stack_name));
        dependencies.extend(decl.depends_on.iter().cloned());

        templates.push(StackTemplate {
            stack: stack_name.clone(),
            description: decl.description.clone(),
            resources,
            outputs: IndexMap::new(),
            dependencies: dependencies.into_iter().collect(),
            tags: decl.tags.clone(),
        });
    }

    for template in &mut templates {
        if let Some(outputs) = exports.by_stack.shift_remove(&template.stack) {
            template.outputs = outputs;
        }
    }

    Ok(templates)
}

/// Turn same-stack `depends_on` declarations into `DependsOn` edges.
fn apply_explicit_dependencies(
    stack: &str,
    decl: &StackDecl,
    resources: &mut IndexMap<String, CfnResource>,
) {
    let mut by_source: HashMap<String, Vec<String>> = HashMap::new();
    for (logical, r) in resources.iter() {
        by_source
            .entry(r.source.clone())
            .or_default()
            .push(logical.clone());
    }

    for (id, resource) in &decl.resources {
        let targets: Vec<String> = resource
            .depends_on
            .iter()
            .map(|raw| resolver::parse_ref(raw, stack))
            .filter(|q| q.stack == stack)
            .flat_map(|q| by_source.get(&q.id).cloned().unwrap_or_default())
            .collect();
        if targets.is_empty() {
            continue;
        }
        for r in resources.values_mut().filter(|r| &r.source == id) {
            r.depends_on.extend(targets.iter().cloned());
            r.depends_on.sort();
            r.depends_on.dedup();
        }
    }
}

// ============================================================================
// Verification
// ============================================================================

fn collect_intrinsics(value: &Value, refs: &mut Vec<String>, atts: &mut Vec<String>, imports: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get("Ref") {
                refs.push(target.clone());
            }
            if let Some(Value::Array(parts)) = map.get("Fn::GetAtt") {
                if let Some(Value::String(target)) = parts.first() {
                    atts.push(target.clone());
                }
            }
            if let Some(Value::String(name)) = map.get("Fn::ImportValue") {
                imports.push(name.clone());
            }
            for v in map.values() {
                collect_intrinsics(v, refs, atts, imports);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_intrinsics(v, refs, atts, imports);
            }
        }
        _ => {}
    }
}

/// Check that every intra-template reference and every cross-stack import
/// resolves. Returns a list of problems (empty = consistent).
pub fn verify_templates(templates: &[StackTemplate]) -> Vec<String> {
    let mut problems = Vec::new();
    let mut exported: HashMap<String, String> = HashMap::new();

    for template in templates {
        let mut refs = Vec::new();
        let mut atts = Vec::new();
        let mut imports = Vec::new();
        for r in template.resources.values() {
            collect_intrinsics(&r.properties, &mut refs, &mut atts, &mut imports);
        }
        for o in template.outputs.values() {
            collect_intrinsics(&o.value, &mut refs, &mut atts, &mut imports);
        }

        for target in refs.iter().filter(|t| !t.starts_with("AWS::")) {
            if !template.resources.contains_key(target) {
                problems.push(format!("{}: Ref to unknown '{}'", template.stack, target));
            }
        }
        for target in &atts {
            if !template.resources.contains_key(target) {
                problems.push(format!("{}: GetAtt of unknown '{}'", template.stack, target));
            }
        }
        for (logical, r) in &template.resources {
            for dep in &r.depends_on {
                if !template.resources.contains_key(dep) {
                    problems.push(format!(
                        "{}: {} depends on unknown '{}'",
                        template.stack, logical, dep
                    ));
                }
            }
        }
        for name in &imports {
            match exported.get(name) {
                Some(producer) if template.dependencies.contains(producer) => {}
                Some(producer) => problems.push(format!(
                    "{}: imports '{}' from {} without depending on it",
                    template.stack, name, producer
                )),
                None => problems.push(format!(
                    "{}: imports '{}' which no earlier stack exports",
                    template.stack, name
                )),
            }
        }

        for o in template.outputs.values() {
            if let Some(prev) = exported.insert(o.export_name.clone(), template.stack.clone()) {
                problems.push(format!(
                    "export '{}' declared by both {} and {}",
                    o.export_name, prev, template.stack
                ));
            }
        }
    }

    problems
}

// ============================================================================
// Artifacts
// ============================================================================

pub const MANIFEST_FILE: &str = "manifest.json";

/// Write every template plus a manifest into `out_dir`.
pub fn write_templates(
    config: &InfraConfig,
    templates: &[StackTemplate],
    out_dir: &Path,
) -> Result<Vec<PathBuf>, String> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| format!("cannot create {}: {}", out_dir.display(), e))?;

    let mut paths = Vec::new();
    let mut entries = Vec::new();
    let mut hashes = Vec::new();
    for template in templates {
        let path = out_dir.join(template.file_name());
        let body = template.render();
        std::fs::write(&path, &body)
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
        let hash = hasher::hash_string(&body);
        entries.push(json!({
            "name": template.stack,
            "template": template.file_name(),
            "hash": hash,
            "depends_on": template.dependencies,
            "resources": template.resources.len(),
        }));
        hashes.push(hash);
        paths.push(path);
    }
    let refs: Vec<&str> = hashes.iter().map(String::as_str).collect();

    let manifest = json!({
        "version": config.version,
        "name": config.name,
        "account": config.env.account,
        "region": config.env.region,
        "generator": format!("wipercheck-infra {}", env!("CARGO_PKG_VERSION")),
        "assembly_hash": hasher::composite_hash(&refs),
        "stacks": entries,
    });
    let manifest_path = out_dir.join(MANIFEST_FILE);
    std::fs::write(&manifest_path, format!("{:#}\n", manifest))
        .map_err(|e| format!("cannot write {}: {}", manifest_path.display(), e))?;

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser;

    pub(crate) const BUNDLED: &str = include_str!("../../infra.yaml");

    fn bundled() -> InfraConfig {
        parser::parse_config(BUNDLED).unwrap()
    }

    fn template<'a>(templates: &'a [StackTemplate], stack: &str) -> &'a StackTemplate {
        templates.iter().find(|t| t.stack == stack).unwrap()
    }

    #[test]
    fn test_logical_id() {
        assert_eq!(logical_id("wipercheck-vpc"), "WipercheckVpc");
        assert_eq!(logical_id("private-data"), "PrivateData");
        assert_eq!(logical_id("ecs_scale-mem"), "EcsScaleMem");
        assert_eq!(logical_id("--x--"), "X");
    }

    #[test]
    fn test_stack_order_and_dependencies() {
        let templates = synthesize(&bundled()).unwrap();
        let names: Vec<_> = templates.iter().map(|t| t.stack.as_str()).collect();
        assert_eq!(
            names,
            vec!["WipercheckVpcStack", "WipercheckLoaderStack", "WipercheckServiceStack"]
        );
        assert!(templates[0].dependencies.is_empty());
        assert_eq!(templates[1].dependencies, vec!["WipercheckVpcStack"]);
        assert_eq!(templates[2].dependencies, vec!["WipercheckVpcStack"]);
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let a = synthesize(&bundled()).unwrap();
        let b = synthesize(&bundled()).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.render(), y.render());
            assert_eq!(x.template_hash(), y.template_hash());
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_layout_variants_synthesize_consistently(
            octet in 0u8..=255,
            mask in 20u8..=28,
        ) {
            let yaml = BUNDLED
                .replace("cidr: 10.0.0.0/16", &format!("cidr: 10.{}.0.0/16", octet))
                .replace("cidr_mask: 26", &format!("cidr_mask: {}", mask));
            let config = parser::parse_config(&yaml).unwrap();
            let a = synthesize(&config).unwrap();
            let b = synthesize(&config).unwrap();
            proptest::prop_assert!(verify_templates(&a).is_empty());
            for (x, y) in a.iter().zip(b.iter()) {
                proptest::prop_assert_eq!(x.template_hash(), y.template_hash());
            }
        }
    }

    #[test]
    fn test_templates_verify_clean() {
        let templates = synthesize(&bundled()).unwrap();
        let problems = verify_templates(&templates);
        assert!(problems.is_empty(), "{:?}", problems);
    }

    #[test]
    fn test_cross_stack_imports_resolve_to_network_stack() {
        let templates = synthesize(&bundled()).unwrap();
        let vpc = template(&templates, "WipercheckVpcStack");
        let exports: BTreeSet<&str> = vpc.outputs.values().map(|o| o.export_name.as_str()).collect();
        assert!(!exports.is_empty());
        assert!(exports.iter().all(|e| e.starts_with("WipercheckVpcStack:")));
        assert!(exports.contains("WipercheckVpcStack:WipercheckVpcRef"));

        for stack in ["WipercheckServiceStack", "WipercheckLoaderStack"] {
            let t = template(&templates, stack);
            let mut refs = Vec::new();
            let mut atts = Vec::new();
            let mut imports = Vec::new();
            for r in t.resources.values() {
                collect_intrinsics(&r.properties, &mut refs, &mut atts, &mut imports);
            }
            for name in &imports {
                assert!(exports.contains(name.as_str()), "{} imports {}", stack, name);
            }
        }
    }

    #[test]
    fn test_network_stack_shape() {
        let templates = synthesize(&bundled()).unwrap();
        let vpc = template(&templates, "WipercheckVpcStack");
        let count = |ty: &str| vpc.resources_of_type(ty).count();
        assert_eq!(count("AWS::EC2::VPC"), 1);
        assert_eq!(count("AWS::EC2::Subnet"), 4);
        assert_eq!(count("AWS::EC2::NatGateway"), 1);
        assert_eq!(count("AWS::EC2::EIP"), 1);
        assert_eq!(count("AWS::EC2::InternetGateway"), 1);
        assert_eq!(count("AWS::EC2::RouteTable"), 4);

        let props = &vpc.resources["WipercheckVpc"].properties;
        assert_eq!(props["CidrBlock"], "10.0.0.0/16");
        let public1 = &vpc.resources["WipercheckVpcPublicDataSubnet1"].properties;
        assert_eq!(public1["CidrBlock"], "10.0.0.128/26");
        assert_eq!(public1["MapPublicIpOnLaunch"], true);
    }

    #[test]
    fn test_logical_id_collision_detected() {
        let yaml = r#"
version: "1.0"
name: test
env:
  account: "123456789012"
  region: us-east-1
stacks:
  S:
    resources:
      app-role:
        type: role
        assumed_by: ecs-tasks.amazonaws.com
      app_role:
        type: role
        assumed_by: ecs-tasks.amazonaws.com
"#;
        let config = parser::parse_config(yaml).unwrap();
        let err = synthesize(&config).unwrap_err();
        assert!(err.contains("collides"));
    }

    #[test]
    fn test_explicit_depends_on_becomes_depends_on() {
        let yaml = r#"
version: "1.0"
name: test
env:
  account: "123456789012"
  region: us-east-1
stacks:
  S:
    resources:
      first:
        type: role
        assumed_by: ecs-tasks.amazonaws.com
      second:
        type: role
        assumed_by: ecs-tasks.amazonaws.com
        depends_on: [first]
"#;
        let config = parser::parse_config(yaml).unwrap();
        let templates = synthesize(&config).unwrap();
        let second = &templates[0].resources["Second"];
        assert_eq!(second.depends_on, vec!["First"]);
        assert!(verify_templates(&templates).is_empty());
    }

    #[test]
    fn test_verify_flags_dangling_ref_and_import() {
        let mut templates = synthesize(&bundled()).unwrap();
        templates[0].outputs.clear();
        let problems = verify_templates(&templates);
        assert!(problems.iter().any(|p| p.contains("no earlier stack exports")));

        let mut templates = synthesize(&bundled()).unwrap();
        templates[0]
            .resources
            .insert("Dangling".to_string(), CfnResource::new("AWS::EC2::EIP", json!({"InstanceId": {"Ref": "Ghost"}})));
        let problems = verify_templates(&templates);
        assert!(problems.iter().any(|p| p.contains("Ref to unknown 'Ghost'")));
    }

    #[test]
    fn test_write_templates_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = bundled();
        let templates = synthesize(&config).unwrap();
        let paths = write_templates(&config, &templates, dir.path()).unwrap();
        assert_eq!(paths.len(), 3);
        assert!(dir.path().join("WipercheckVpcStack.template.json").exists());

        let body = std::fs::read_to_string(&paths[0]).unwrap();
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(hasher::hash_string(&body), templates[0].template_hash());

        let manifest: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap())
                .unwrap();
        assert_eq!(manifest["region"], "us-east-1");
        assert_eq!(manifest["stacks"][2]["name"], "WipercheckServiceStack");
        let assembly = manifest["assembly_hash"].as_str().unwrap();
        assert!(hasher::is_hash(assembly));
        let hashes: Vec<String> = templates.iter().map(|t| t.template_hash()).collect();
        let refs: Vec<&str> = hashes.iter().map(String::as_str).collect();
        assert_eq!(assembly, hasher::composite_hash(&refs));
    }

    #[test]
    fn test_resource_hash_changes_with_properties() {
        let a = CfnResource::new("AWS::ECS::Cluster", json!({"ClusterName": "a"}));
        let b = CfnResource::new("AWS::ECS::Cluster", json!({"ClusterName": "b"}));
        assert_eq!(a.hash(), a.clone().hash());
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), a.clone().retain().hash());
    }
}
