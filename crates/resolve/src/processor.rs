use std::collections::{BTreeMap, HashSet};

use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value as Json};
use tether_core::{well_known, ObjectKind, Reference, ResourceName, MODIFIER_SECRET_OUTPUT};
use tracing::trace;

use crate::path::{self, Segment};
use crate::ResolveError;

/// Auxiliary output captured from a Ready resource, e.g. generated credentials.
pub type SecretOutput = BTreeMap<String, Vec<u8>>;

/// What a processed upstream resource contributes to reference resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedDependency {
    pub actual: Option<Json>,
    pub secret_output: Option<SecretOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Values come from live upstream objects.
    Real,
    /// Values come from each reference's declared example.
    Example,
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^!\{([^{}]+)\}$").expect("placeholder regex"));

pub struct SpecProcessor {
    mode: Mode,
    values: BTreeMap<String, Json>,
}

fn check_unique(references: &[Reference]) -> Result<(), ResolveError> {
    let mut seen = HashSet::new();
    for name in references.iter().filter_map(|r| r.name.as_deref()) {
        if !seen.insert(name) {
            return Err(ResolveError::DuplicateReference(name.to_string()));
        }
    }
    Ok(())
}

impl SpecProcessor {
    /// Resolves every named reference against processed upstream resources.
    /// All failures are reported together.
    pub fn real(references: &[Reference], deps: &BTreeMap<ResourceName, ResolvedDependency>) -> Result<Self, ResolveError> {
        check_unique(references)?;
        let mut values = BTreeMap::new();
        let mut errors = Vec::new();
        for r in references {
            let Some(name) = r.name.as_deref() else { continue };
            match resolve_one(name, r, deps) {
                Ok(v) => {
                    values.insert(name.to_string(), v);
                }
                Err(e) => errors.push(e),
            }
        }
        ResolveError::collect(errors)?;
        Ok(Self { mode: Mode::Real, values })
    }

    /// Uses declared examples; a named reference without one yields `NoExample`.
    pub fn example(references: &[Reference]) -> Result<Self, ResolveError> {
        check_unique(references)?;
        let mut values = BTreeMap::new();
        for r in references {
            let Some(name) = r.name.as_deref() else { continue };
            let v = r.example.clone().ok_or_else(|| ResolveError::NoExample(name.to_string()))?;
            values.insert(name.to_string(), v);
        }
        Ok(Self { mode: Mode::Example, values })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn values(&self) -> &BTreeMap<String, Json> {
        &self.values
    }

    /// Rewrites `spec` in place. Every placeholder naming an unknown reference
    /// is reported; substitutions that did resolve are still applied.
    pub fn process(&self, spec: &mut Json) -> Result<(), ResolveError> {
        let mut errors = Vec::new();
        self.walk(spec, &mut errors);
        ResolveError::collect(errors)
    }

    pub fn process_map(&self, spec: &mut Map<String, Json>) -> Result<(), ResolveError> {
        let mut errors = Vec::new();
        for v in spec.values_mut() {
            self.walk(v, &mut errors);
        }
        ResolveError::collect(errors)
    }

    fn walk(&self, v: &mut Json, errors: &mut Vec<ResolveError>) {
        match v {
            Json::Object(map) => map.values_mut().for_each(|x| self.walk(x, errors)),
            Json::Array(items) => items.iter_mut().for_each(|x| self.walk(x, errors)),
            Json::String(s) => {
                let Some(caps) = PLACEHOLDER.captures(s) else { return };
                let name = caps.get(1).map_or("", |m| m.as_str());
                match self.values.get(name) {
                    Some(val) => {
                        trace!(reference = name, "substituted");
                        *v = val.clone();
                    }
                    None => errors.push(ResolveError::UnknownReference(s.clone())),
                }
            }
            _ => {}
        }
    }
}

fn resolve_one(name: &str, r: &Reference, deps: &BTreeMap<ResourceName, ResolvedDependency>) -> Result<Json, ResolveError> {
    let not_processed = || ResolveError::DependencyNotProcessed { reference: name.to_string(), resource: r.resource.clone() };
    let dep = deps.get(&r.resource).ok_or_else(not_processed)?;
    let segments = r.path.as_deref().map(path::parse).transpose()?;

    match r.modifier.as_deref() {
        None => {
            let actual = dep.actual.as_ref().ok_or_else(not_processed)?;
            let Some(segments) = segments else { return Ok(actual.clone()) };
            let found = path::extract(actual, &segments).ok_or_else(|| ResolveError::FieldNotFound {
                reference: name.to_string(),
                path: r.path.clone().unwrap_or_default(),
            })?;
            if is_secret_data(actual, &segments) {
                if let Json::String(encoded) = found {
                    return decode_secret_value(name, encoded);
                }
            }
            Ok(found.clone())
        }
        Some(MODIFIER_SECRET_OUTPUT) => {
            let output = dep.secret_output.as_ref().ok_or_else(|| ResolveError::NoSecretOutput {
                reference: name.to_string(),
                resource: r.resource.clone(),
            })?;
            match segments {
                None => {
                    let mut map = Map::new();
                    for (k, bytes) in output {
                        map.insert(k.clone(), utf8(name, bytes.clone())?);
                    }
                    Ok(Json::Object(map))
                }
                Some(segments) => {
                    let key = output_key(&segments).ok_or_else(|| ResolveError::InvalidPath {
                        path: r.path.clone().unwrap_or_default(),
                        reason: "secret output paths name a single key".into(),
                    })?;
                    let bytes = output.get(key).ok_or_else(|| ResolveError::FieldNotFound {
                        reference: name.to_string(),
                        path: r.path.clone().unwrap_or_default(),
                    })?;
                    utf8(name, bytes.clone())
                }
            }
        }
        Some(other) => Err(ResolveError::UnknownModifier { reference: name.to_string(), modifier: other.to_string() }),
    }
}

/// `data.<key>` of a Secret holds base64-encoded bytes.
fn is_secret_data(actual: &Json, segments: &[Segment]) -> bool {
    segments.len() == 2
        && segments[0] == Segment::Key("data".into())
        && ObjectKind::of(actual).map_or(false, |k| k == well_known::secret())
}

fn decode_secret_value(reference: &str, encoded: &str) -> Result<Json, ResolveError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| ResolveError::NotUtf8 { reference: reference.to_string() })?;
    utf8(reference, bytes)
}

fn utf8(reference: &str, bytes: Vec<u8>) -> Result<Json, ResolveError> {
    String::from_utf8(bytes)
        .map(Json::String)
        .map_err(|_| ResolveError::NotUtf8 { reference: reference.to_string() })
}

fn output_key(segments: &[Segment]) -> Option<&str> {
    match segments {
        [Segment::Key(k)] => Some(k),
        [Segment::Key(d), Segment::Key(k)] if d == "data" => Some(k),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deps(entries: &[(&str, Json)]) -> BTreeMap<ResourceName, ResolvedDependency> {
        entries
            .iter()
            .map(|(n, v)| (n.to_string(), ResolvedDependency { actual: Some(v.clone()), secret_output: None }))
            .collect()
    }

    #[test]
    fn substitutes_whole_values_preserving_type() {
        let upstream = json!({"status": {"port": 5432, "tls": true, "hosts": ["a", "b"], "host": "db"}});
        let refs = vec![
            Reference::named("port", "db", "status.port"),
            Reference::named("tls", "db", "status.tls"),
            Reference::named("hosts", "db", "status.hosts"),
            Reference::named("host", "db", "status.host"),
        ];
        let p = SpecProcessor::real(&refs, &deps(&[("db", upstream)])).unwrap();
        let mut spec = json!({
            "port": "!{port}",
            "nested": {"deeper": [{"tls": "!{tls}"}, "!{hosts}"]},
            "url": "postgres://!{host}:5432",
            "escaped": "!!{host}",
            "plain": "host"
        });
        p.process(&mut spec).unwrap();
        assert_eq!(
            spec,
            json!({
                "port": 5432,
                "nested": {"deeper": [{"tls": true}, ["a", "b"]]},
                "url": "postgres://!{host}:5432",
                "escaped": "!!{host}",
                "plain": "host"
            })
        );
    }

    #[test]
    fn missing_path_yields_whole_object() {
        let upstream = json!({"apiVersion": "v1", "kind": "ConfigMap", "data": {"a": "1"}});
        let refs = vec![Reference { path: None, ..Reference::named("cm", "c", "") }];
        let p = SpecProcessor::real(&refs, &deps(&[("c", upstream.clone())])).unwrap();
        assert_eq!(p.values()["cm"], upstream);
    }

    #[test]
    fn unnamed_references_are_ignored() {
        let p = SpecProcessor::real(&[Reference::to("missing")], &BTreeMap::new()).unwrap();
        assert!(p.values().is_empty());
        let mut spec = json!({"x": "!{missing}"});
        assert_eq!(p.process(&mut spec).unwrap_err(), ResolveError::UnknownReference("!{missing}".into()));
    }

    #[test]
    fn real_mode_aggregates_failures() {
        let refs = vec![
            Reference::named("a", "db", "status.nope"),
            Reference::named("b", "ghost", "x"),
            Reference::named("c", "db", "status.port"),
        ];
        let err = SpecProcessor::real(&refs, &deps(&[("db", json!({"status": {"port": 1}}))])).err().unwrap();
        match &err {
            ResolveError::Multiple(all) => assert_eq!(all.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("status.nope"));
        assert!(err.to_string().contains("ghost"));
        assert!(err.is_retriable());
    }

    #[test]
    fn secret_data_is_decoded() {
        let secret = json!({"apiVersion": "v1", "kind": "Secret", "data": {"password": "aHVudGVyMg==", "bin": "/w=="}});
        let ok = SpecProcessor::real(&[Reference::named("pw", "s", "data.password")], &deps(&[("s", secret.clone())])).unwrap();
        assert_eq!(ok.values()["pw"], json!("hunter2"));

        let err = SpecProcessor::real(&[Reference::named("b", "s", "data.bin")], &deps(&[("s", secret)])).err().unwrap();
        assert_eq!(err, ResolveError::NotUtf8 { reference: "b".into() });
    }

    #[test]
    fn secret_output_modifier() {
        let mut out = SecretOutput::new();
        out.insert("token".into(), b"abc".to_vec());
        out.insert("raw".into(), vec![0xff, 0xfe]);
        let mut d = BTreeMap::new();
        d.insert("binding".to_string(), ResolvedDependency { actual: Some(json!({})), secret_output: Some(out) });

        let r = Reference::named("t", "binding", "data.token").with_modifier(MODIFIER_SECRET_OUTPUT);
        assert_eq!(SpecProcessor::real(&[r], &d).unwrap().values()["t"], json!("abc"));

        let r = Reference::named("t", "binding", "raw").with_modifier(MODIFIER_SECRET_OUTPUT);
        assert!(matches!(SpecProcessor::real(&[r], &d), Err(ResolveError::NotUtf8 { .. })));

        let r = Reference::named("t", "binding", "token").with_modifier("sideways");
        assert!(matches!(SpecProcessor::real(&[r], &d), Err(ResolveError::UnknownModifier { .. })));
    }

    #[test]
    fn example_mode() {
        let refs = vec![Reference::named("port", "db", "status.port").with_example(json!(1234)), Reference::to("other")];
        let p = SpecProcessor::example(&refs).unwrap();
        assert_eq!(p.mode(), Mode::Example);
        let mut spec = json!({"port": "!{port}"});
        p.process(&mut spec).unwrap();
        assert_eq!(spec, json!({"port": 1234}));

        let err = SpecProcessor::example(&[Reference::named("host", "db", "status.host")]).err().unwrap();
        assert!(err.is_no_example());
    }

    #[test]
    fn duplicate_reference_names_are_rejected() {
        let refs = vec![Reference::named("x", "a", "p").with_example(json!(1)), Reference::named("x", "b", "p").with_example(json!(2))];
        assert_eq!(SpecProcessor::example(&refs).err(), Some(ResolveError::DuplicateReference("x".into())));
    }
}
