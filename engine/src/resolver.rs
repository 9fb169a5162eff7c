//! Built-in resolvers, one per conflict category.
//!
//! All resolvers are pure: they take a [`ConflictData`] plus the engine's
//! field policies and produce a [`ResolutionResult`] without touching IO.
//! Each one encodes a domain-specific policy for its category; the generic
//! fallback covers anything the engine cannot otherwise make sense of.

use crate::conflict::{ConflictData, ConflictField, ResolutionResult, ResolutionStrategy};
use crate::error::Result;
use crate::merge::{self, FieldPolicies};
use crate::Timestamp;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Resolve attendance-status conflicts.
///
/// A confirmed check-in beats a recorded absence unconditionally: a false
/// absence is worse than overriding a stale one. Anything else falls back
/// to last-writer-wins on `updated_at`, ties going to the server.
pub fn attendance_status(
    conflict: &ConflictData,
    policies: &FieldPolicies,
) -> Result<ResolutionResult> {
    let (Some(local), Some(server)) = (&conflict.local_version, &conflict.server_version) else {
        return Ok(generic_resolution(conflict, policies));
    };

    let local_status = local.get("status").and_then(Value::as_str);
    let server_status = server.get("status").and_then(Value::as_str);

    if let Some(winner) = match (local_status, server_status) {
        (Some("present"), Some("absent")) => Some(local),
        (Some("absent"), Some("present")) => Some(server),
        _ => None,
    } {
        return Ok(ResolutionResult {
            strategy: ResolutionStrategy::AutoMerge,
            resolved_data: winner.clone(),
            requires_user_input: false,
            conflicts: Vec::new(),
            confidence: 85,
            explanation: "Presence takes precedence over absence for attendance".to_string(),
        });
    }

    let local_ts = change_timestamp(local);
    let server_ts = change_timestamp(server);
    let local_wins = local_ts > server_ts;
    let winner = if local_wins { local } else { server };

    Ok(ResolutionResult {
        strategy: ResolutionStrategy::LastWriterWins,
        resolved_data: winner.clone(),
        requires_user_input: false,
        conflicts: Vec::new(),
        confidence: 90,
        explanation: format!(
            "Most recent attendance update wins (local {local_ts}, server {server_ts})"
        ),
    })
}

/// Resolve student-record conflicts by merging field by field: three-way
/// when the last agreed version is known, two-way otherwise.
pub fn student_data(conflict: &ConflictData, policies: &FieldPolicies) -> Result<ResolutionResult> {
    let (Some(local), Some(server)) = (&conflict.local_version, &conflict.server_version) else {
        return Ok(generic_resolution(conflict, policies));
    };

    let (outcome, explanation) = match &conflict.base_version {
        Some(base) => (
            merge::three_way_merge(policies, local, server, base),
            "Three-way merge of student record against the last agreed version".to_string(),
        ),
        None => (
            merge::two_way_merge(policies, local, server),
            "Field-level merge of student record without a common ancestor".to_string(),
        ),
    };

    Ok(ResolutionResult {
        strategy: ResolutionStrategy::AutoMerge,
        resolved_data: outcome.merged,
        requires_user_input: outcome.requires_user_input,
        conflicts: outcome.conflicts,
        confidence: outcome.confidence,
        explanation,
    })
}

/// Session configuration is never merged silently: the result defaults to
/// the server version and is flagged for review, with per-field
/// suggestions surfaced so a human can settle each one.
pub fn session_config(
    conflict: &ConflictData,
    policies: &FieldPolicies,
) -> Result<ResolutionResult> {
    let Some(server) = &conflict.server_version else {
        return Ok(generic_resolution(conflict, policies));
    };

    Ok(ResolutionResult {
        strategy: ResolutionStrategy::UserGuided,
        resolved_data: server.clone(),
        requires_user_input: true,
        conflicts: field_detail(conflict, policies),
        confidence: 30,
        explanation: "Session configuration changes need review; server version kept as default"
            .to_string(),
    })
}

/// Merge two bulk-operation sets: concatenate local-then-server,
/// deduplicate by operation `id` (first occurrence wins), then stable-sort
/// ascending by timestamp.
pub fn bulk_operation(
    conflict: &ConflictData,
    policies: &FieldPolicies,
) -> Result<ResolutionResult> {
    let (Some(local), Some(server)) = (&conflict.local_version, &conflict.server_version) else {
        return Ok(generic_resolution(conflict, policies));
    };

    let operations = |version: &Value| {
        version
            .get("operations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let local_ops = operations(local);
    let server_ops = operations(server);
    let (local_count, server_count) = (local_ops.len(), server_ops.len());

    let mut seen: HashSet<String> = HashSet::new();
    let mut merged_ops: Vec<Value> = Vec::with_capacity(local_count + server_count);
    for op in local_ops.into_iter().chain(server_ops) {
        let id = op.get("id").map(id_key);
        match id {
            Some(id) => {
                if seen.insert(id) {
                    merged_ops.push(op);
                }
            }
            // Operations without an id cannot be deduplicated; keep them
            None => merged_ops.push(op),
        }
    }
    merged_ops.sort_by_key(|op| op.get("timestamp").map_or(0, parse_timestamp));

    let mut resolved: Map<String, Value> = server.as_object().cloned().unwrap_or_default();
    let merged_count = merged_ops.len();
    resolved.insert("operations".to_string(), Value::Array(merged_ops));

    Ok(ResolutionResult {
        strategy: ResolutionStrategy::AutoMerge,
        resolved_data: Value::Object(resolved),
        requires_user_input: false,
        conflicts: Vec::new(),
        confidence: 70,
        explanation: format!(
            "Merged {local_count} local and {server_count} server operations into {merged_count}"
        ),
    })
}

/// Pure timestamp disagreements: the strictly later side wins wholesale,
/// ties going to the server.
pub fn timestamp_conflict(
    conflict: &ConflictData,
    policies: &FieldPolicies,
) -> Result<ResolutionResult> {
    let (Some(local), Some(server)) = (&conflict.local_version, &conflict.server_version) else {
        return Ok(generic_resolution(conflict, policies));
    };

    let local_ts = local.get("timestamp").map_or(0, parse_timestamp);
    let server_ts = server.get("timestamp").map_or(0, parse_timestamp);
    let winner = if local_ts > server_ts { local } else { server };

    Ok(ResolutionResult {
        strategy: ResolutionStrategy::LastWriterWins,
        resolved_data: winner.clone(),
        requires_user_input: false,
        conflicts: Vec::new(),
        confidence: 95,
        explanation: format!("Later timestamp wins (local {local_ts}, server {server_ts})"),
    })
}

/// Fallback for unknown types and malformed conflicts.
pub fn generic(conflict: &ConflictData, policies: &FieldPolicies) -> Result<ResolutionResult> {
    Ok(generic_resolution(conflict, policies))
}

/// Low-confidence default: keep the server version, flag for review, and
/// still surface per-field suggestions so a UI can render something.
pub(crate) fn generic_resolution(
    conflict: &ConflictData,
    policies: &FieldPolicies,
) -> ResolutionResult {
    ResolutionResult {
        strategy: ResolutionStrategy::LastWriterWins,
        resolved_data: conflict.server_version.clone().unwrap_or(Value::Null),
        requires_user_input: true,
        conflicts: field_detail(conflict, policies),
        confidence: 20,
        explanation: "Generic resolution: defaulting to the server version".to_string(),
    }
}

/// Run every suspected field through the single-field resolver.
fn field_detail(conflict: &ConflictData, policies: &FieldPolicies) -> Vec<ConflictField> {
    fn field_of<'a>(version: &'a Option<Value>, field: &str) -> Option<&'a Value> {
        version.as_ref().and_then(|value| value.get(field))
    }

    conflict
        .conflict_fields
        .iter()
        .map(|field| {
            merge::resolve_field(
                policies,
                field,
                field_of(&conflict.local_version, field),
                field_of(&conflict.server_version, field),
                field_of(&conflict.base_version, field),
            )
        })
        .collect()
}

/// Timestamp of a change payload: `updated_at`, falling back to
/// `timestamp`, falling back to 0.
fn change_timestamp(version: &Value) -> Timestamp {
    version
        .get("updated_at")
        .or_else(|| version.get("timestamp"))
        .map_or(0, parse_timestamp)
}

/// Parse a timestamp value: epoch milliseconds, or an RFC 3339 date
/// string; anything else counts as the epoch.
fn parse_timestamp(value: &Value) -> Timestamp {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0),
        _ => 0,
    }
}

/// Stable dedup key for an operation id (ids may be strings or numbers).
fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
