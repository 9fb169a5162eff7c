//! # Rollcall Engine
//!
//! Offline-first conflict detection and resolution for classroom
//! attendance sync.
//!
//! Teachers mark attendance while offline; when connectivity returns the
//! queued changes are replayed against the server. When a locally queued
//! change and a server-side change disagree about the same entity, this
//! crate detects the disagreement and resolves it with per-type,
//! per-field strategies, producing a confidence-scored result the caller
//! can apply or surface for review.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of network, storage, or UI
//! - **Deterministic**: the same inputs always produce the same outputs
//! - **Never fail the pipeline**: every conflict produces an actionable
//!   result, however low the confidence
//! - **Schema-agnostic**: record versions are untyped field maps, driven
//!   by field paths rather than a fixed schema
//!
//! ## Core Concepts
//!
//! ### Conflicts
//!
//! A [`ConflictData`] carries two disagreeing versions of one entity,
//! optionally with the last version both sides agreed on (enabling
//! three-way merge). The [`ConflictDetector`] builds them from the
//! queue's pending changes and the server's change list.
//!
//! ### Resolution
//!
//! The [`ConflictEngine`] classifies each conflict, dispatches to the
//! resolver registered for its [`ConflictType`], and escalates to a user
//! handler when confidence is insufficient. Every path yields a
//! [`ResolutionResult`] with a strategy, a confidence score, and an
//! explanation.
//!
//! ### The offline queue
//!
//! The [`ChangeQueue`] tracks pending local changes and per-entity
//! versions, and accepts resolved outcomes to mark changes synced or
//! replaced.
//!
//! ## Quick Start
//!
//! ```rust
//! use rollcall_engine::{ConflictData, ConflictEngine, ConflictType};
//! use serde_json::json;
//!
//! let engine = ConflictEngine::new();
//!
//! // A student checked in locally while the server recorded an absence.
//! let conflict = ConflictData::new(
//!     ConflictType::AttendanceStatus,
//!     "student_123_session_456",
//!     Some(json!({"status": "present", "updated_at": 1706745600000i64})),
//!     Some(json!({"status": "absent", "updated_at": 1706745900000i64})),
//!     1706746000000,
//! );
//!
//! let result = engine.resolve_conflict(&conflict).unwrap();
//!
//! // Presence beats absence regardless of which side is newer.
//! assert_eq!(result.resolved_data["status"], "present");
//! assert!(!result.requires_user_input);
//! ```

pub mod conflict;
pub mod detect;
pub mod engine;
pub mod error;
pub mod merge;
pub mod queue;
pub mod resolver;

// Re-export main types at crate root
pub use conflict::{
    ConflictData, ConflictField, ConflictType, ResolutionResult, ResolutionStrategy,
};
pub use detect::ConflictDetector;
pub use engine::{ConflictEngine, Resolver, UserHandler};
pub use error::Error;
pub use merge::{FieldPolicies, MergeOutcome};
pub use queue::{ChangeQueue, PendingChange, SyncTrigger};

/// Type aliases for clarity
pub type EntityId = String;
pub type ChangeId = String;
pub type Timestamp = i64;
pub type Version = u64;
pub type Confidence = u8;
