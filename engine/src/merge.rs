//! Field-level merge algorithms.
//!
//! This module implements the three merge primitives the resolvers build
//! on: a single-field resolver driven by per-field policies, a two-way
//! merge for when no common ancestor is known, and a three-way merge for
//! when one is. Key iteration is always in sorted order so the same
//! inputs produce the same merged output.

use crate::conflict::{ConflictField, ResolutionStrategy};
use crate::Confidence;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

/// Per-field preferred strategies.
///
/// Unknown fields fall back to last-writer-wins.
#[derive(Debug, Clone)]
pub struct FieldPolicies {
    policies: HashMap<String, ResolutionStrategy>,
}

impl Default for FieldPolicies {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            "attendance_status".to_string(),
            ResolutionStrategy::LastWriterWins,
        );
        policies.insert("timestamp".to_string(), ResolutionStrategy::LastWriterWins);
        policies.insert("notes".to_string(), ResolutionStrategy::AutoMerge);
        policies.insert("settings".to_string(), ResolutionStrategy::UserGuided);
        Self { policies }
    }
}

impl FieldPolicies {
    /// Preferred strategy for a field.
    pub fn strategy_for(&self, field: &str) -> ResolutionStrategy {
        self.policies
            .get(field)
            .copied()
            .unwrap_or(ResolutionStrategy::LastWriterWins)
    }
}

/// Outcome of a record-level merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The merged record
    pub merged: Value,
    /// Fields that truly conflicted and how each was settled
    pub conflicts: Vec<ConflictField>,
    /// Trust in the merge as a whole; a merge is only as trustworthy as
    /// its weakest field
    pub confidence: Confidence,
    /// Whether a human should review before the merge is final
    pub requires_user_input: bool,
}

/// Resolve a single field according to its preferred strategy.
pub fn resolve_field(
    policies: &FieldPolicies,
    field_path: &str,
    local: Option<&Value>,
    server: Option<&Value>,
    base: Option<&Value>,
) -> ConflictField {
    let strategy = policies.strategy_for(field_path);
    let (resolution, confidence) = match strategy {
        ResolutionStrategy::LastWriterWins => resolve_last_writer(local, server),
        ResolutionStrategy::AutoMerge => resolve_auto_merge(local, server, base),
        ResolutionStrategy::AcceptBoth => resolve_accept_both(local, server),
        // Everything else defers the field to the server side
        _ => (server.cloned().unwrap_or(Value::Null), 30),
    };

    ConflictField {
        field_path: field_path.to_string(),
        local_value: local.cloned(),
        server_value: server.cloned(),
        base_value: base.cloned(),
        resolution,
        strategy,
        confidence,
    }
}

/// Local wins only when it is an object whose `timestamp` is strictly
/// greater than the server's; plain scalars always default to the server.
fn resolve_last_writer(local: Option<&Value>, server: Option<&Value>) -> (Value, Confidence) {
    let embedded_timestamp =
        |value: Option<&Value>| value?.as_object()?.get("timestamp")?.as_i64();

    let local_newer = match (embedded_timestamp(local), embedded_timestamp(server)) {
        (Some(local_ts), Some(server_ts)) => local_ts > server_ts,
        _ => false,
    };

    let winner = if local_newer { local } else { server };
    (winner.cloned().unwrap_or(Value::Null), 80)
}

fn resolve_auto_merge(
    local: Option<&Value>,
    server: Option<&Value>,
    base: Option<&Value>,
) -> (Value, Confidence) {
    // One-side-unchanged shortcut: a base equal to one side means only the
    // other side actually changed, so its value is taken verbatim.
    if let Some(base) = base {
        if local == Some(base) {
            return (server.cloned().unwrap_or(Value::Null), 60);
        }
        if server == Some(base) {
            return (local.cloned().unwrap_or(Value::Null), 60);
        }
    }

    match (local, server) {
        (Some(Value::String(l)), Some(Value::String(s))) => {
            (Value::String(format!("{l} | {s}")), 60)
        }
        (Some(Value::Array(l)), Some(Value::Array(s))) => {
            (Value::Array(union_values(l, s)), 70)
        }
        _ => (server.cloned().unwrap_or(Value::Null), 30),
    }
}

fn resolve_accept_both(local: Option<&Value>, server: Option<&Value>) -> (Value, Confidence) {
    match (local, server) {
        (Some(Value::Array(l)), Some(Value::Array(s))) => {
            (Value::Array(union_values(l, s)), 85)
        }
        _ => {
            let mut both = Map::new();
            both.insert("local".to_string(), local.cloned().unwrap_or(Value::Null));
            both.insert("server".to_string(), server.cloned().unwrap_or(Value::Null));
            (Value::Object(both), 50)
        }
    }
}

/// Union of two arrays with duplicates removed, first occurrence wins.
fn union_values(left: &[Value], right: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(left.len() + right.len());
    for value in left.iter().chain(right.iter()) {
        if !merged.contains(value) {
            merged.push(value.clone());
        }
    }
    merged
}

/// Merge two versions against their common ancestor.
///
/// Per field: if both sides agree, keep either; if only one side changed
/// relative to the base, take that side; if all three differ pairwise,
/// the field truly conflicts and is settled by [`resolve_field`].
pub fn three_way_merge(
    policies: &FieldPolicies,
    local: &Value,
    server: &Value,
    base: &Value,
) -> MergeOutcome {
    let mut merged = Map::new();
    let mut conflicts = Vec::new();

    for key in key_union(&[local, server, base]) {
        let l = local.get(&key);
        let s = server.get(&key);
        let b = base.get(&key);

        if l == s {
            if let Some(value) = l {
                merged.insert(key, value.clone());
            }
        } else if l == b {
            // Local unchanged; the server made the only change
            if let Some(value) = s {
                merged.insert(key, value.clone());
            }
        } else if s == b {
            // Server unchanged; the local side made the only change
            if let Some(value) = l {
                merged.insert(key, value.clone());
            }
        } else {
            let field = resolve_field(policies, &key, l, s, b);
            merged.insert(key, field.resolution.clone());
            conflicts.push(field);
        }
    }

    let confidence = min_confidence(&conflicts, 95);
    let requires_user_input = conflicts.iter().any(|field| field.confidence < 70);

    MergeOutcome {
        merged: Value::Object(merged),
        conflicts,
        confidence,
        requires_user_input,
    }
}

/// Merge two versions with no common ancestor.
///
/// Starts from a full copy of the server version; every differing field
/// is settled by [`resolve_field`] and overwritten in the result. The bar
/// for escalation is lower than in the three-way case since there is no
/// ancestor to distinguish one-sided changes.
pub fn two_way_merge(policies: &FieldPolicies, local: &Value, server: &Value) -> MergeOutcome {
    let mut merged = server.as_object().cloned().unwrap_or_default();
    let mut conflicts = Vec::new();

    for key in key_union(&[local, server]) {
        let l = local.get(&key);
        let s = server.get(&key);

        if l != s {
            let field = resolve_field(policies, &key, l, s, None);
            merged.insert(key, field.resolution.clone());
            conflicts.push(field);
        }
    }

    let confidence = min_confidence(&conflicts, 80);
    let requires_user_input = conflicts.iter().any(|field| field.confidence < 50);

    MergeOutcome {
        merged: Value::Object(merged),
        conflicts,
        confidence,
        requires_user_input,
    }
}

/// Sorted union of the object keys of all given values.
fn key_union(values: &[&Value]) -> Vec<String> {
    let mut keys = BTreeSet::new();
    for value in values {
        if let Some(object) = value.as_object() {
            keys.extend(object.keys().cloned());
        }
    }
    keys.into_iter().collect()
}

fn min_confidence(conflicts: &[ConflictField], clean: Confidence) -> Confidence {
    conflicts
        .iter()
        .map(|field| field.confidence)
        .min()
        .unwrap_or(clean)
}
