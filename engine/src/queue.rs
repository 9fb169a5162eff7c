//! Offline change queue.
//!
//! The contract between the resolution pipeline and offline storage: the
//! queue supplies pending local changes with entity id, timestamp and
//! payload, tracks per-entity versions for optimistic concurrency, and
//! accepts resolved outcomes to mark changes synced or replaced. This
//! in-memory implementation is the reference for the contract; durable
//! storage lives with the host application.

use crate::conflict::{ResolutionResult, ResolutionStrategy};
use crate::error::{Error, Result};
use crate::{ChangeId, EntityId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

/// Why a sync pass started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Connectivity returned after an offline period
    Reconnected,
    /// Explicit user-initiated sync
    Manual,
    /// Periodic background sync
    Interval,
}

/// A locally queued mutation waiting to be synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// Unique identifier for this change
    pub change_id: ChangeId,
    /// The entity the change applies to
    pub entity_id: EntityId,
    /// The changed record
    pub payload: Value,
    /// When the change was made locally (milliseconds since epoch)
    pub queued_at: Timestamp,
    /// Entity version the change was made against
    pub base_version: Version,
}

/// In-memory queue of changes made while offline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeQueue {
    pending: Vec<PendingChange>,
    versions: HashMap<EntityId, Version>,
}

impl ChangeQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a mutation made against a known entity version.
    ///
    /// Rejects non-object payloads, duplicate change ids, and stale
    /// versions (the caller saw an older entity version than the queue
    /// currently tracks and must rebase first).
    pub fn record(
        &mut self,
        change_id: impl Into<ChangeId>,
        entity_id: impl Into<EntityId>,
        payload: Value,
        queued_at: Timestamp,
        based_on: Version,
    ) -> Result<Version> {
        let change_id = change_id.into();
        let entity_id = entity_id.into();

        if !payload.is_object() {
            return Err(Error::InvalidChange(format!(
                "change '{change_id}' payload must be an object"
            )));
        }
        if self.pending.iter().any(|p| p.change_id == change_id) {
            return Err(Error::InvalidChange(format!(
                "duplicate change id '{change_id}'"
            )));
        }

        let current = self.entity_version(&entity_id);
        if based_on != current {
            return Err(Error::VersionMismatch {
                entity_id,
                expected: current,
                actual: based_on,
            });
        }

        debug!(%change_id, %entity_id, version = based_on, "change queued");
        self.pending.push(PendingChange {
            change_id,
            entity_id,
            payload,
            queued_at,
            base_version: based_on,
        });
        Ok(based_on)
    }

    /// All changes waiting to be synced, in queue order.
    pub fn pending(&self) -> &[PendingChange] {
        &self.pending
    }

    /// Pending change payloads, for handing to the conflict detector.
    pub fn payloads(&self) -> Vec<Value> {
        self.pending.iter().map(|p| p.payload.clone()).collect()
    }

    /// Count of pending changes.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the queue has no pending changes.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Current version of an entity; unseen entities start at 0.
    pub fn entity_version(&self, entity_id: &str) -> Version {
        self.versions.get(entity_id).copied().unwrap_or(0)
    }

    /// Snapshot the queue for a sync pass.
    pub fn begin_sync(&self, trigger: SyncTrigger) -> Vec<PendingChange> {
        info!(?trigger, pending = self.pending.len(), "sync pass started");
        self.pending.clone()
    }

    /// Mark changes as accepted by the server and drop them, bumping the
    /// version of each affected entity.
    pub fn acknowledge(&mut self, change_ids: &[ChangeId]) {
        let mut synced = Vec::new();
        self.pending.retain(|p| {
            if change_ids.contains(&p.change_id) {
                synced.push(p.entity_id.clone());
                false
            } else {
                true
            }
        });
        for entity_id in synced {
            self.bump(&entity_id);
        }
    }

    /// Replace the payload of a queued change, keeping it pending.
    pub fn supersede(&mut self, change_id: &str, payload: Value) -> Result<()> {
        let change = self
            .pending
            .iter_mut()
            .find(|p| p.change_id == change_id)
            .ok_or_else(|| Error::ChangeNotFound(change_id.to_string()))?;
        change.payload = payload;
        Ok(())
    }

    /// Apply a resolution outcome back to the queue.
    ///
    /// Outcomes flagged for user review leave the queue untouched.
    /// Rejected changes are dropped (the server won outright). Anything
    /// else keeps the newest pending change for the entity, superseding
    /// its payload with the resolved record, and drops older ones. The
    /// entity version is bumped for every applied outcome. Returns the
    /// ids of the changes that were dropped.
    pub fn integrate(&mut self, entity_id: &str, result: &ResolutionResult) -> Vec<ChangeId> {
        if result.requires_user_input {
            debug!(entity_id, "resolution needs review; pending changes left queued");
            return Vec::new();
        }

        let mut entity_changes: Vec<ChangeId> = self
            .pending
            .iter()
            .filter(|p| p.entity_id == entity_id)
            .map(|p| p.change_id.clone())
            .collect();

        let dropped = match result.strategy {
            ResolutionStrategy::RejectChanges => {
                self.pending.retain(|p| p.entity_id != entity_id);
                entity_changes
            }
            _ => {
                let keep = entity_changes.pop();
                if let Some(keep_id) = &keep {
                    let resolved = result.resolved_data.clone();
                    let next_version = self.entity_version(entity_id) + 1;
                    if let Some(change) =
                        self.pending.iter_mut().find(|p| p.change_id == *keep_id)
                    {
                        change.payload = resolved;
                        change.base_version = next_version;
                    }
                }
                self.pending
                    .retain(|p| p.entity_id != entity_id || Some(&p.change_id) == keep.as_ref());
                entity_changes
            }
        };

        self.bump(entity_id);
        debug!(
            entity_id,
            dropped = dropped.len(),
            strategy = ?result.strategy,
            "resolution integrated into queue"
        );
        dropped
    }

    fn bump(&mut self, entity_id: &str) {
        *self.versions.entry(entity_id.to_string()).or_insert(0) += 1;
    }
}
