//! Conflict resolution strategies.
//!
//! A conflict arises when the server reports a newer version than the base a
//! local mutation was derived from. The resolver compares the local and
//! server snapshots under a [`ConflictStrategy`] and either picks a winner,
//! produces a merged payload, or escalates to a user-visible `Conflict`.

use crate::config::StrategyKind;
use serde_json::{Map, Value};
use sitehero_types::{VersionSnapshot, changed_fields};
use std::fmt;
use std::sync::Arc;

/// Field-level merge callback: `(field, local, server) -> merged`.
///
/// Absent fields are passed as `Value::Null`. Returning `None` declines the
/// merge, which escalates the whole entity.
pub type FieldMergeFn = Arc<dyn Fn(&str, &Value, &Value) -> Option<Value> + Send + Sync>;

/// How divergent local and server versions are reconciled.
#[derive(Clone)]
pub enum ConflictStrategy {
    /// The later `modified_at` wins. Ties go to the server.
    LastWriteWins,
    PreferLocal,
    PreferServer,
    /// Disjoint field edits merge; overlapping edits go to the callback.
    FieldMerge(FieldMergeFn),
}

impl ConflictStrategy {
    /// Field merge with a callback that declines every overlapping field.
    pub fn field_merge_escalating() -> Self {
        ConflictStrategy::FieldMerge(Arc::new(|_, _, _| None))
    }

    pub fn field_merge(f: impl Fn(&str, &Value, &Value) -> Option<Value> + Send + Sync + 'static) -> Self {
        ConflictStrategy::FieldMerge(Arc::new(f))
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            ConflictStrategy::LastWriteWins => StrategyKind::LastWriteWins,
            ConflictStrategy::PreferLocal => StrategyKind::PreferLocal,
            ConflictStrategy::PreferServer => StrategyKind::PreferServer,
            ConflictStrategy::FieldMerge(_) => StrategyKind::FieldMerge,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind() {
            StrategyKind::LastWriteWins => "last_write_wins",
            StrategyKind::PreferLocal => "prefer_local",
            StrategyKind::PreferServer => "prefer_server",
            StrategyKind::FieldMerge => "field_merge",
        }
    }
}

impl From<StrategyKind> for ConflictStrategy {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::LastWriteWins => ConflictStrategy::LastWriteWins,
            StrategyKind::PreferLocal => ConflictStrategy::PreferLocal,
            StrategyKind::PreferServer => ConflictStrategy::PreferServer,
            StrategyKind::FieldMerge => ConflictStrategy::field_merge_escalating(),
        }
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Server,
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// One side wins unchanged.
    Keep(Side),
    /// A merged payload that must be written locally and sent to the server.
    Merged(Value),
    /// Needs a human. `fields` lists the contested fields (empty for
    /// delete-versus-edit).
    Escalate { fields: Vec<String> },
}

/// Applies conflict strategies.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    skew_tolerance_ms: i64,
}

impl ConflictResolver {
    pub fn new(skew_tolerance_ms: i64) -> Self {
        Self {
            skew_tolerance_ms: skew_tolerance_ms.max(0),
        }
    }

    /// Resolves `local` against `server`. `base` is the last payload both
    /// sides agreed on; field merges diff each side against it.
    pub fn resolve(
        &self,
        local: &VersionSnapshot,
        server: &VersionSnapshot,
        base: Option<&Value>,
        strategy: &ConflictStrategy,
    ) -> Resolution {
        match strategy {
            ConflictStrategy::PreferLocal => Resolution::Keep(Side::Local),
            ConflictStrategy::PreferServer => Resolution::Keep(Side::Server),
            ConflictStrategy::LastWriteWins => self.last_write_wins(local, server),
            ConflictStrategy::FieldMerge(merge) => field_merge(local, server, base, merge.as_ref()),
        }
    }

    fn last_write_wins(&self, local: &VersionSnapshot, server: &VersionSnapshot) -> Resolution {
        // Within the skew tolerance the two clocks cannot be ordered.
        if local.modified_at - server.modified_at > self.skew_tolerance_ms {
            Resolution::Keep(Side::Local)
        } else {
            Resolution::Keep(Side::Server)
        }
    }
}

fn field_merge(
    local: &VersionSnapshot,
    server: &VersionSnapshot,
    base: Option<&Value>,
    merge: &(dyn Fn(&str, &Value, &Value) -> Option<Value> + Send + Sync),
) -> Resolution {
    let (local_payload, server_payload) = match (&local.payload, &server.payload) {
        (Some(l), Some(s)) => (l, s),
        (None, None) => return Resolution::Keep(Side::Server),
        _ => return Resolution::Escalate { fields: Vec::new() },
    };

    let local_changed = changed_fields(base, local_payload);
    let server_changed = changed_fields(base, server_payload);

    let empty = Map::new();
    let local_fields = local_payload.as_object().unwrap_or(&empty);
    let mut merged = server_payload.as_object().cloned().unwrap_or_default();
    let mut declined = Vec::new();

    for field in &local_changed {
        let local_value = local_fields.get(field);
        if !server_changed.contains(field) {
            match local_value {
                Some(v) => merged.insert(field.clone(), v.clone()),
                None => merged.remove(field),
            };
            continue;
        }
        let server_value = merged.get(field);
        if local_value == server_value {
            continue;
        }
        let l = local_value.cloned().unwrap_or(Value::Null);
        let s = server_value.cloned().unwrap_or(Value::Null);
        match merge(field, &l, &s) {
            Some(v) => {
                merged.insert(field.clone(), v);
            }
            None => declined.push(field.clone()),
        }
    }

    if !declined.is_empty() {
        return Resolution::Escalate { fields: declined };
    }
    let merged = Value::Object(merged);
    if &merged == server_payload {
        Resolution::Keep(Side::Server)
    } else {
        Resolution::Merged(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(payload: Value, at: i64) -> VersionSnapshot {
        VersionSnapshot {
            payload: Some(payload),
            version: None,
            modified_at: at,
        }
    }

    #[test]
    fn skew_tolerance_widens_the_tie() {
        let r = ConflictResolver::new(500);
        let local = snap(json!({"a": 1}), 1_400);
        let server = snap(json!({"a": 2}), 1_000);
        assert_eq!(
            r.resolve(&local, &server, None, &ConflictStrategy::LastWriteWins),
            Resolution::Keep(Side::Server)
        );
    }

    #[test]
    fn strategy_names_match_config_kinds() {
        let s: ConflictStrategy = StrategyKind::FieldMerge.into();
        assert_eq!(s.name(), "field_merge");
        assert_eq!(s.kind(), StrategyKind::FieldMerge);
    }
}
