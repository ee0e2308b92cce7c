//! Garbage collection of objects the bundle controls but no longer declares.
//!
//! An object annotated with a deletion delay is first stamped with the time it
//! was found orphaned; it is deleted once that much time has passed, counted
//! from the first observation.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as Json;
use tether_core::{meta, Bundle, DeleteOptions, ObjectKind, ObjectToDelete, DELETION_DELAY_ANNOTATION, ORPHANED_AT_ANNOTATION};
use tracing::{debug, info, warn};

use crate::engine::Engine;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct GcOutcome {
    /// Orphans still waiting for their delay, or whose delete failed.
    pub pending: Vec<ObjectToDelete>,
    pub requeue_after: Option<Duration>,
    pub errors: Vec<String>,
}

impl GcOutcome {
    fn requeue_within(&mut self, d: Duration) {
        self.requeue_after = Some(self.requeue_after.map_or(d, |cur| cur.min(d)));
    }
}

/// Parses `90s`, `5m`, `1h30m` or a bare number of seconds.
pub fn parse_delay(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let mut total = 0u64;
    let mut num = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let n: u64 = num.parse().ok()?;
        num.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return None,
        };
        total = total.checked_add(n.checked_mul(unit)?)?;
    }
    if !num.is_empty() {
        return None;
    }
    Some(Duration::from_secs(total))
}

fn to_delete(kind: &ObjectKind, name: &str) -> ObjectToDelete {
    ObjectToDelete { group: kind.group.clone(), version: kind.version.clone(), kind: kind.kind.clone(), name: name.to_string() }
}

/// Deletes every object controlled by `bundle` that is not in `declared`.
pub async fn collect(engine: &Engine, bundle: &Bundle, declared: &[(ObjectKind, String)], now: DateTime<Utc>) -> GcOutcome {
    let mut out = GcOutcome::default();
    let namespace = bundle.namespace();
    let controlled = match engine.store.list_controlled_by(namespace, bundle.uid()).await {
        Ok(c) => c,
        Err(e) => {
            out.errors.push(format!("listing controlled objects: {}", e));
            return out;
        }
    };

    for (kind, obj) in controlled {
        let Some(name) = meta::name(&obj).map(str::to_string) else { continue };
        if declared.iter().any(|(k, n)| k.same_group_kind(&kind) && *n == name) {
            continue;
        }
        if meta::is_being_deleted(&obj) {
            debug!(bundle = %bundle.key(), kind = %kind, name = %name, "orphan already being deleted");
            continue;
        }

        let delay = match meta::annotation(&obj, DELETION_DELAY_ANNOTATION) {
            None => Duration::ZERO,
            Some(raw) => parse_delay(raw).unwrap_or_else(|| {
                warn!(bundle = %bundle.key(), kind = %kind, name = %name, value = raw, "unparseable deletion delay; deleting now");
                Duration::ZERO
            }),
        };
        if !delay.is_zero() {
            match orphaned_for(&obj, now) {
                Some(elapsed) if elapsed >= delay => {}
                Some(elapsed) => {
                    out.requeue_within(delay - elapsed);
                    out.pending.push(to_delete(&kind, &name));
                    continue;
                }
                None => {
                    mark_orphaned(engine, namespace, &kind, obj, now, &mut out).await;
                    out.requeue_within(delay);
                    out.pending.push(to_delete(&kind, &name));
                    continue;
                }
            }
        }

        let opts = DeleteOptions { uid: meta::uid(&obj).map(str::to_string), foreground: false };
        match engine.client.delete(&kind, namespace, &name, &opts).await {
            Ok(()) => info!(bundle = %bundle.key(), kind = %kind, name = %name, "deleted undeclared object"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(bundle = %bundle.key(), kind = %kind, name = %name, error = %e, "delete failed");
                out.errors.push(format!("deleting {} {:?}: {}", kind.kind, name, e));
                out.pending.push(to_delete(&kind, &name));
            }
        }
    }
    out.pending.sort();
    out
}

fn orphaned_for(obj: &Json, now: DateTime<Utc>) -> Option<Duration> {
    let raw = meta::annotation(obj, ORPHANED_AT_ANNOTATION)?;
    let at = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
    Some((now - at).to_std().unwrap_or(Duration::ZERO))
}

async fn mark_orphaned(engine: &Engine, namespace: &str, kind: &ObjectKind, mut obj: Json, now: DateTime<Utc>, out: &mut GcOutcome) {
    meta::set_annotation(&mut obj, ORPHANED_AT_ANNOTATION, &now.to_rfc3339_opts(SecondsFormat::Secs, true));
    match engine.client.update(kind, namespace, &obj).await {
        Ok(_) => debug!(kind = %kind, name = meta::name(&obj).unwrap_or_default(), "marked orphaned"),
        Err(e) if e.is_conflict() => {}
        Err(e) => out.errors.push(format!("marking {} {:?} orphaned: {}", kind.kind, meta::name(&obj).unwrap_or_default(), e)),
    }
}
