//! Conflict detection between local and server change lists.
//!
//! Given the queue's pending local changes and the server-reported
//! changes, the detector finds pairs that touch the same entity and
//! packages each as a [`ConflictData`] for the engine.

use crate::conflict::{ConflictData, ConflictType};
use crate::{EntityId, Timestamp};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

/// Finds overlapping changes across two change lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Create a new detector.
    pub fn new() -> Self {
        Self
    }

    /// Detect potential conflicts between two change lists.
    ///
    /// Two changes overlap when they share an `entity_id` or share an `id`;
    /// either match suffices. This is intentionally permissive and can
    /// over-detect when ids coincidentally collide across unrelated
    /// records. At most one conflict is emitted per entity per pass, so
    /// callers can batch-process the output idempotently. `now` becomes
    /// each conflict's detection timestamp.
    pub fn detect(
        &self,
        local_changes: &[Value],
        server_changes: &[Value],
        now: Timestamp,
    ) -> Vec<ConflictData> {
        let mut conflicts = Vec::new();
        let mut seen: HashSet<EntityId> = HashSet::new();

        for local in local_changes {
            for server in server_changes {
                let Some(entity_id) = overlap_key(local, server) else {
                    continue;
                };
                if !seen.insert(entity_id.clone()) {
                    continue;
                }

                let conflict_type = ConflictType::infer(local, server);
                let conflict_fields = differing_fields(local, server);
                debug!(
                    %entity_id,
                    ?conflict_type,
                    fields = conflict_fields.len(),
                    "potential conflict detected"
                );

                conflicts.push(
                    ConflictData::new(
                        conflict_type,
                        entity_id,
                        Some(local.clone()),
                        Some(server.clone()),
                        now,
                    )
                    .with_fields(conflict_fields),
                );
            }
        }

        info!(
            local = local_changes.len(),
            server = server_changes.len(),
            conflicts = conflicts.len(),
            "conflict detection pass complete"
        );
        conflicts
    }
}

/// Entity key when two changes overlap: a shared `entity_id`, or failing
/// that a shared `id`.
fn overlap_key(local: &Value, server: &Value) -> Option<EntityId> {
    for key in ["entity_id", "id"] {
        if let (Some(l), Some(s)) = (local.get(key), server.get(key)) {
            if l == s {
                return Some(id_string(l));
            }
        }
    }
    None
}

/// Stable string form of an id value; ids may be strings or numbers.
fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Sorted union of keys present on either side whose values differ.
fn differing_fields(local: &Value, server: &Value) -> Vec<String> {
    let mut keys: BTreeSet<&str> = BTreeSet::new();
    for value in [local, server] {
        if let Some(object) = value.as_object() {
            keys.extend(object.keys().map(String::as_str));
        }
    }

    keys.into_iter()
        .filter(|key| local.get(key) != server.get(key))
        .map(str::to_string)
        .collect()
}
