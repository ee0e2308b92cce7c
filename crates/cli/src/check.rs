//! Offline Bundle checks: parsing budgets, graph shape and example-driven substitution.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value as Json;
use tether_core::{Bundle, ResourceSpec};
use tether_reconcile::processing_order;
use tether_resolve::SpecProcessor;

fn max_yaml_bytes() -> usize {
    std::env::var("TETHER_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("TETHER_MAX_YAML_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(100_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// Parses a Bundle document, refusing oversized or overly deep input.
pub fn parse_bundle(yaml: &str) -> Result<Bundle> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).context("parsing YAML")?;
    let json = serde_json::to_value(val).context("converting YAML to JSON")?;
    if node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(anyhow!("YAML document too complex (>{} nodes)", max_yaml_nodes()));
    }
    Bundle::from_json(json).context("decoding Bundle")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub bundle: String,
    pub order: Vec<String>,
    pub issues: Vec<Issue>,
}

impl Report {
    pub fn ok(&self) -> bool {
        self.issues.is_empty()
    }
}

fn issue(resource: &str, message: impl Into<String>) -> Issue {
    Issue { resource: Some(resource.to_string()), message: message.into() }
}

/// Everything that can be told about a Bundle without a cluster.
pub fn check(bundle: &Bundle) -> Report {
    let mut issues = Vec::new();
    let order = match processing_order(bundle) {
        Ok(order) => order,
        Err(e) => {
            issues.push(Issue { resource: None, message: e.message.clone() });
            Vec::new()
        }
    };

    for res in &bundle.spec.resources {
        match &res.spec {
            ResourceSpec::Object(obj) => {
                match res.object_kind() {
                    None => issues.push(issue(&res.name, "object has no apiVersion/kind")),
                    Some(Err(e)) => issues.push(issue(&res.name, e.to_string())),
                    Some(Ok(_)) => {}
                }
                if res.object_name().is_none() {
                    issues.push(issue(&res.name, "object has no metadata.name"));
                }
                match SpecProcessor::example(&res.references) {
                    Ok(processor) => {
                        let mut doc = obj.clone();
                        if let Err(e) = processor.process(&mut doc) {
                            issues.push(issue(&res.name, e.to_string()));
                        }
                    }
                    Err(e) if e.is_no_example() => {}
                    Err(e) => issues.push(issue(&res.name, e.to_string())),
                }
            }
            ResourceSpec::Plugin(p) => {
                if p.object_name.is_empty() {
                    issues.push(issue(&res.name, "plugin resource has no objectName"));
                }
                if let Ok(processor) = SpecProcessor::example(&res.references) {
                    let mut spec = p.spec.clone();
                    if let Err(e) = processor.process_map(&mut spec) {
                        issues.push(issue(&res.name, e.to_string()));
                    }
                }
            }
        }
    }

    Report { bundle: bundle.key(), order, issues }
}
