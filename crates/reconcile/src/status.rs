//! Status aggregation: per-resource conditions and the bundle summary.

use chrono::{SecondsFormat, Utc};
use tether_core::{
    find_condition, Bundle, BundleStatus, Condition, ConditionStatus, ConditionType, ObjectToDelete, PluginHealth,
    PluginStatus, ResourceSpec, ResourceStatusEntry,
};

use crate::error::BundleError;
use crate::plugin::PluginRegistry;
use crate::resource::{ResourceInfo, ResourceState};

pub const REASON_RETRIABLE: &str = "RetriableError";
pub const REASON_TERMINAL: &str = "TerminalError";
pub const REASON_DEPENDENCIES_NOT_READY: &str = "DependenciesNotReady";

pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn flag(b: bool) -> ConditionStatus {
    if b {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    }
}

fn error_reason(retriable: bool) -> &'static str {
    if retriable {
        REASON_RETRIABLE
    } else {
        REASON_TERMINAL
    }
}

/// Carries `lastTransitionTime` over from `prev` unless the status flipped.
fn stamp(next: Vec<Condition>, prev: &[Condition], now: &str) -> Vec<Condition> {
    next.into_iter()
        .map(|mut c| {
            c.last_transition_time = match find_condition(prev, c.type_) {
                Some(p) if p.status == c.status => p.last_transition_time.clone(),
                _ => Some(now.to_string()),
            };
            c
        })
        .collect()
}

pub fn resource_conditions(state: &ResourceState) -> Vec<Condition> {
    let (blocked, in_progress, ready) = match state {
        ResourceState::Ready => (None, false, true),
        ResourceState::InProgress => (None, true, false),
        ResourceState::Blocked(deps) => (Some(deps.join(", ")), false, false),
        ResourceState::Error(e) => (None, e.retriable, false),
    };
    let mut blocked_c = Condition::new(ConditionType::Blocked, flag(blocked.is_some()));
    if let Some(deps) = blocked {
        blocked_c = blocked_c.with_reason(REASON_DEPENDENCIES_NOT_READY, format!("waiting for: {}", deps));
    }
    let mut error_c = Condition::new(ConditionType::Error, ConditionStatus::False);
    if let ResourceState::Error(e) = state {
        error_c = Condition::new(ConditionType::Error, ConditionStatus::True).with_reason(error_reason(e.retriable), e.to_string());
    }
    vec![
        blocked_c,
        Condition::new(ConditionType::InProgress, flag(in_progress)),
        Condition::new(ConditionType::Ready, flag(ready)),
        error_c,
    ]
}

pub fn plugin_statuses(bundle: &Bundle, plugins: &PluginRegistry) -> Vec<PluginStatus> {
    let mut out: Vec<PluginStatus> = Vec::new();
    for res in &bundle.spec.resources {
        let ResourceSpec::Plugin(p) = &res.spec else { continue };
        if out.iter().any(|s| s.name == p.name) {
            continue;
        }
        out.push(match plugins.get(&p.name) {
            Some(plugin) => {
                let kind = plugin.describe().kind;
                PluginStatus { name: p.name.clone(), group: kind.group, version: kind.version, kind: kind.kind, status: PluginHealth::Ok }
            }
            None => PluginStatus {
                name: p.name.clone(),
                group: String::new(),
                version: String::new(),
                kind: String::new(),
                status: PluginHealth::NoSuchPlugin,
            },
        });
    }
    out
}

/// Inputs gathered over one pass.
pub struct PassResult<'a> {
    /// Processed resources in processing order.
    pub resources: Vec<(&'a str, &'a ResourceInfo)>,
    pub bundle_error: Option<&'a BundleError>,
    pub objects_to_delete: Vec<ObjectToDelete>,
    pub plugin_statuses: Vec<PluginStatus>,
}

/// Status after this pass. Ready iff every declared resource is Ready and
/// there is no bundle-level error; the Error condition is retriable only if
/// every contributing error is.
pub fn aggregate(bundle: &Bundle, pass: PassResult<'_>, now: &str) -> BundleStatus {
    let prev = &bundle.status;
    let mut resource_statuses = Vec::with_capacity(pass.resources.len());
    let mut errors: Vec<(String, bool)> = Vec::new();
    for (name, info) in &pass.resources {
        let prev_conditions = prev.resource(name).map(|r| r.conditions.as_slice()).unwrap_or_default();
        resource_statuses.push(ResourceStatusEntry {
            name: name.to_string(),
            conditions: stamp(resource_conditions(&info.state), prev_conditions, now),
        });
        if let Some(e) = info.error() {
            errors.push((format!("resource {:?}: {}", name, e), e.retriable));
        }
    }
    if let Some(e) = pass.bundle_error {
        errors.insert(0, (e.to_string(), e.retriable));
    }

    let all_ready = pass.bundle_error.is_none()
        && pass.resources.len() == bundle.spec.resources.len()
        && pass.resources.iter().all(|(_, i)| i.is_ready());
    let retriable = errors.iter().all(|(_, r)| *r);
    let terminal = !errors.is_empty() && !retriable;

    let mut error_c = Condition::new(ConditionType::Error, flag(!errors.is_empty()));
    if !errors.is_empty() {
        let message = errors.iter().map(|(m, _)| m.as_str()).collect::<Vec<_>>().join("; ");
        error_c = error_c.with_reason(error_reason(retriable), message);
    }
    let conditions = stamp(
        vec![
            Condition::new(ConditionType::InProgress, flag(!all_ready && !terminal)),
            Condition::new(ConditionType::Ready, flag(all_ready)),
            error_c,
        ],
        &prev.conditions,
        now,
    );

    BundleStatus {
        observed_generation: bundle.metadata.generation,
        conditions,
        resource_statuses,
        objects_to_delete: pass.objects_to_delete,
        plugin_statuses: pass.plugin_statuses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Reason, ResourceError};
    use serde_json::json;
    use smallvec::smallvec;
    use tether_core::Resource;

    fn info(state: ResourceState) -> ResourceInfo {
        ResourceInfo { kind: None, object_name: None, actual: None, state, secret_output: None, inputs: Vec::new() }
    }

    fn bundle(n: usize) -> Bundle {
        let mut b = Bundle::default();
        b.metadata.generation = Some(4);
        b.spec.resources = (0..n).map(|i| Resource::object(&format!("r{i}"), json!({}))).collect();
        b
    }

    fn cond(s: &BundleStatus, t: ConditionType) -> ConditionStatus {
        s.condition(t).map(|c| c.status).unwrap_or(ConditionStatus::Unknown)
    }

    #[test]
    fn all_ready_bundle() {
        let b = bundle(2);
        let (r0, r1) = (info(ResourceState::Ready), info(ResourceState::Ready));
        let pass = PassResult {
            resources: vec![("r0", &r0), ("r1", &r1)],
            bundle_error: None,
            objects_to_delete: vec![],
            plugin_statuses: vec![],
        };
        let s = aggregate(&b, pass, "t1");
        assert_eq!(cond(&s, ConditionType::Ready), ConditionStatus::True);
        assert_eq!(cond(&s, ConditionType::InProgress), ConditionStatus::False);
        assert_eq!(cond(&s, ConditionType::Error), ConditionStatus::False);
        assert_eq!(s.observed_generation, Some(4));
        assert_eq!(s.resource_statuses.len(), 2);
    }

    #[test]
    fn terminal_error_stops_progress() {
        let b = bundle(2);
        let r0 = info(ResourceState::Error(ResourceError::terminal(Reason::NotOwned, "x")));
        let r1 = info(ResourceState::Blocked(smallvec!["r0".to_string()]));
        let pass = PassResult { resources: vec![("r0", &r0), ("r1", &r1)], bundle_error: None, objects_to_delete: vec![], plugin_statuses: vec![] };
        let s = aggregate(&b, pass, "t1");
        assert_eq!(cond(&s, ConditionType::Ready), ConditionStatus::False);
        assert_eq!(cond(&s, ConditionType::InProgress), ConditionStatus::False);
        let err = s.condition(ConditionType::Error).unwrap();
        assert_eq!(err.reason.as_deref(), Some(REASON_TERMINAL));
        assert!(err.message.as_deref().unwrap_or_default().contains("NotOwned"));

        let blocked = &s.resource("r1").unwrap().conditions;
        let c = find_condition(blocked, ConditionType::Blocked).unwrap();
        assert!(c.is_true());
        assert_eq!(c.message.as_deref(), Some("waiting for: r0"));
    }

    #[test]
    fn retriable_only_when_every_error_is() {
        let b = bundle(2);
        let r0 = info(ResourceState::Error(ResourceError::retriable(Reason::WriteFailed, "x")));
        let r1 = info(ResourceState::Error(ResourceError::retriable(Reason::StoreUnavailable, "y")));
        let pass = PassResult { resources: vec![("r0", &r0), ("r1", &r1)], bundle_error: None, objects_to_delete: vec![], plugin_statuses: vec![] };
        let s = aggregate(&b, pass, "t1");
        assert_eq!(s.condition(ConditionType::Error).unwrap().reason.as_deref(), Some(REASON_RETRIABLE));
        assert_eq!(cond(&s, ConditionType::InProgress), ConditionStatus::True);

        let gc = BundleError::terminal(Reason::InvalidGraph, "cycle");
        let pass = PassResult { resources: vec![("r0", &r0)], bundle_error: Some(&gc), objects_to_delete: vec![], plugin_statuses: vec![] };
        let s = aggregate(&b, pass, "t1");
        assert_eq!(s.condition(ConditionType::Error).unwrap().reason.as_deref(), Some(REASON_TERMINAL));
        assert_eq!(cond(&s, ConditionType::InProgress), ConditionStatus::False);
    }

    #[test]
    fn transition_time_moves_only_on_flip() {
        let mut b = bundle(1);
        let r0 = info(ResourceState::InProgress);
        let first = aggregate(&b, PassResult { resources: vec![("r0", &r0)], bundle_error: None, objects_to_delete: vec![], plugin_statuses: vec![] }, "t1");
        b.status = first.clone();

        let again = aggregate(&b, PassResult { resources: vec![("r0", &r0)], bundle_error: None, objects_to_delete: vec![], plugin_statuses: vec![] }, "t2");
        assert_eq!(again, first);

        let ready = info(ResourceState::Ready);
        let flipped = aggregate(&b, PassResult { resources: vec![("r0", &ready)], bundle_error: None, objects_to_delete: vec![], plugin_statuses: vec![] }, "t3");
        assert_eq!(flipped.condition(ConditionType::Ready).unwrap().last_transition_time.as_deref(), Some("t3"));
        assert_eq!(
            flipped.condition(ConditionType::Error).unwrap().last_transition_time.as_deref(),
            Some("t1"),
            "Error stayed False"
        );
    }
}
