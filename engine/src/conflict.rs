//! Conflict data model.
//!
//! A [`ConflictData`] is the unit of work submitted to the engine: two
//! disagreeing versions of one logical entity, optionally with the last
//! version both sides agreed on. A [`ResolutionResult`] is what the engine
//! hands back: the record to accept going forward, how it was produced,
//! and how much to trust it.

use crate::{Confidence, EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of a detected conflict.
///
/// Determines which resolver the engine dispatches to by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed a student's attendance status
    AttendanceStatus,
    /// Both sides changed a student record
    StudentData,
    /// Both sides changed session configuration
    SessionConfig,
    /// Both sides carry sets of bulk operations
    BulkOperation,
    /// The disagreement is purely about timestamps
    TimestampConflict,
}

impl ConflictType {
    /// Classify a pair of change payloads by inspecting which fields are
    /// present. Rules are checked in order and the first match wins:
    /// `status`, `operations` (on both sides), `student_id`, `timestamp`,
    /// otherwise session config.
    pub fn infer(local: &Value, server: &Value) -> Self {
        let either_has = |key: &str| local.get(key).is_some() || server.get(key).is_some();

        if either_has("status") {
            ConflictType::AttendanceStatus
        } else if local.get("operations").is_some() && server.get("operations").is_some() {
            ConflictType::BulkOperation
        } else if either_has("student_id") {
            ConflictType::StudentData
        } else if either_has("timestamp") {
            ConflictType::TimestampConflict
        } else {
            ConflictType::SessionConfig
        }
    }

    /// Default strategy for this conflict type.
    ///
    /// Used to partition batches into auto-resolvable and needs-user groups
    /// before anything is resolved.
    pub fn preferred_strategy(self) -> ResolutionStrategy {
        match self {
            ConflictType::AttendanceStatus | ConflictType::TimestampConflict => {
                ResolutionStrategy::LastWriterWins
            }
            ConflictType::StudentData | ConflictType::BulkOperation => {
                ResolutionStrategy::AutoMerge
            }
            ConflictType::SessionConfig => ResolutionStrategy::UserGuided,
        }
    }
}

/// How a conflict was (or must be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Merged automatically, field by field or by domain rule
    AutoMerge,
    /// The version with the more recent timestamp won
    LastWriterWins,
    /// The locally queued version won
    FirstWriterWins,
    /// A human must pick; the result carries a default only
    UserGuided,
    /// Local changes were discarded in favor of the server
    RejectChanges,
    /// Both versions were kept side by side
    AcceptBoth,
}

/// A detected disagreement between a locally queued change and a
/// server-observed change to the same logical entity.
///
/// Constructed once by the detector (or manually by a caller that already
/// knows two versions disagree) and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    /// Conflict category; drives resolver dispatch
    pub conflict_type: ConflictType,
    /// Stable identifier of the record in conflict, shared by both sides
    pub entity_id: EntityId,
    /// The locally queued version; `None` signals a delete on this side
    pub local_version: Option<Value>,
    /// The server-observed version; `None` signals a delete on this side
    pub server_version: Option<Value>,
    /// Last version both sides agreed on; enables three-way merge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Value>,
    /// When the conflict was detected (not when either version was created)
    pub detected_at: Timestamp,
    /// Field names known or suspected to differ; empty means the whole
    /// record is treated as one field
    pub conflict_fields: Vec<String>,
    /// Opaque pass-through; never interpreted by the engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ConflictData {
    /// Create a new conflict.
    pub fn new(
        conflict_type: ConflictType,
        entity_id: impl Into<EntityId>,
        local_version: Option<Value>,
        server_version: Option<Value>,
        detected_at: Timestamp,
    ) -> Self {
        Self {
            conflict_type,
            entity_id: entity_id.into(),
            local_version,
            server_version,
            base_version: None,
            detected_at,
            conflict_fields: Vec::new(),
            metadata: None,
        }
    }

    /// Attach the last commonly agreed version.
    pub fn with_base(mut self, base_version: Value) -> Self {
        self.base_version = Some(base_version);
        self
    }

    /// Attach the list of fields suspected to differ.
    pub fn with_fields(mut self, conflict_fields: Vec<String>) -> Self {
        self.conflict_fields = conflict_fields;
        self
    }

    /// Attach opaque caller metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// True when either side is missing its version data (delete-vs-update).
    pub fn is_missing_versions(&self) -> bool {
        self.local_version.is_none() || self.server_version.is_none()
    }
}

/// One field's resolution within a merged record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictField {
    /// Name of the field within the record
    pub field_path: String,
    /// Value on the local side, if the field was present there
    pub local_value: Option<Value>,
    /// Value on the server side, if the field was present there
    pub server_value: Option<Value>,
    /// Value in the base version, if one was available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_value: Option<Value>,
    /// The value accepted for this field
    pub resolution: Value,
    /// Strategy that produced the resolution
    pub strategy: ResolutionStrategy,
    /// Trust in this field's resolution, 0-100
    pub confidence: Confidence,
}

/// The engine's answer for one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    /// Strategy that was actually applied
    pub strategy: ResolutionStrategy,
    /// The record to accept going forward
    pub resolved_data: Value,
    /// True means `resolved_data` is a default, not a final answer;
    /// the caller must still prompt a human
    pub requires_user_input: bool,
    /// Per-field detail; empty for whole-record resolutions
    pub conflicts: Vec<ConflictField>,
    /// Trust in the resolution, 0-100; ranks batch ordering and decides
    /// auto-apply vs escalate
    pub confidence: Confidence,
    /// Human-readable justification; populated on every path
    pub explanation: String,
}
