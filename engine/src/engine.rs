//! The conflict resolution engine.
//!
//! Owns the resolver registry, the single user-escalation slot, and the
//! per-field policy table. Construct one engine per sync orchestrator and
//! inject it where resolution happens; there is no ambient instance.
//!
//! Two call paths with deliberately different error behavior:
//! [`ConflictEngine::resolve_conflict`] is strict and lets custom resolver
//! and handler errors reach the caller, while
//! [`ConflictEngine::batch_resolve`] absorbs per-item failures so one bad
//! conflict never aborts a sync pass.

use crate::conflict::{ConflictData, ConflictType, ResolutionResult, ResolutionStrategy};
use crate::detect::ConflictDetector;
use crate::error::Result;
use crate::merge::FieldPolicies;
use crate::resolver;
use crate::Timestamp;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// A resolver produces the resolution for one conflict.
pub type Resolver =
    Box<dyn Fn(&ConflictData, &FieldPolicies) -> Result<ResolutionResult> + Send + Sync>;

/// Callback invoked when a resolution needs human review.
///
/// Receives the conflict and the suggestion list (primary resolution
/// first, then keep-local and keep-server alternatives) and returns the
/// resolution to use instead.
pub type UserHandler =
    Box<dyn Fn(&ConflictData, &[ResolutionResult]) -> Result<ResolutionResult> + Send + Sync>;

/// Orchestrates conflict resolution: classifies, dispatches to the
/// matching resolver, escalates to the user handler when confidence is
/// insufficient, and batch-resolves with priority ordering.
pub struct ConflictEngine {
    resolvers: HashMap<ConflictType, Resolver>,
    user_handler: Option<UserHandler>,
    policies: FieldPolicies,
}

impl Default for ConflictEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictEngine {
    /// Create an engine with the five built-in resolvers registered.
    pub fn new() -> Self {
        let mut resolvers: HashMap<ConflictType, Resolver> = HashMap::new();
        resolvers.insert(
            ConflictType::AttendanceStatus,
            Box::new(resolver::attendance_status),
        );
        resolvers.insert(ConflictType::StudentData, Box::new(resolver::student_data));
        resolvers.insert(
            ConflictType::SessionConfig,
            Box::new(resolver::session_config),
        );
        resolvers.insert(
            ConflictType::BulkOperation,
            Box::new(resolver::bulk_operation),
        );
        resolvers.insert(
            ConflictType::TimestampConflict,
            Box::new(resolver::timestamp_conflict),
        );

        Self {
            resolvers,
            user_handler: None,
            policies: FieldPolicies::default(),
        }
    }

    /// Replace the resolver for a conflict type. Last registration wins;
    /// built-in types may be overridden.
    pub fn register_resolver<F>(&mut self, conflict_type: ConflictType, resolver: F)
    where
        F: Fn(&ConflictData, &FieldPolicies) -> Result<ResolutionResult> + Send + Sync + 'static,
    {
        self.resolvers.insert(conflict_type, Box::new(resolver));
    }

    /// Install the user escalation handler. Single slot; last setter wins.
    pub fn set_user_handler<F>(&mut self, handler: F)
    where
        F: Fn(&ConflictData, &[ResolutionResult]) -> Result<ResolutionResult>
            + Send
            + Sync
            + 'static,
    {
        self.user_handler = Some(Box::new(handler));
    }

    /// The engine's per-field policy table.
    pub fn policies(&self) -> &FieldPolicies {
        &self.policies
    }

    /// Resolve a single conflict.
    ///
    /// Conflicts missing a version on either side degrade to the generic
    /// resolver rather than failing. When the chosen resolver asks for
    /// user input and a handler is installed, the handler's answer is
    /// returned instead. Errors from custom resolvers and from the handler
    /// propagate to the caller; use [`Self::batch_resolve`] to absorb them.
    pub fn resolve_conflict(&self, conflict: &ConflictData) -> Result<ResolutionResult> {
        if conflict.is_missing_versions() {
            debug!(
                entity_id = %conflict.entity_id,
                "conflict missing version data; using generic resolution"
            );
            return Ok(resolver::generic_resolution(conflict, &self.policies));
        }

        let result = match self.resolvers.get(&conflict.conflict_type) {
            Some(resolve) => resolve(conflict, &self.policies)?,
            None => resolver::generic_resolution(conflict, &self.policies),
        };

        if result.requires_user_input {
            if let Some(handler) = &self.user_handler {
                debug!(entity_id = %conflict.entity_id, "escalating resolution to user handler");
                let suggestions = self.suggestions(conflict, result);
                return handler(conflict, &suggestions);
            }
        }

        Ok(result)
    }

    /// Resolve a batch of conflicts, strictly sequentially.
    ///
    /// Conflicts whose type can be resolved automatically come first,
    /// needs-user conflicts second; input order is preserved within each
    /// group. A failing entry becomes a reject-changes result with the
    /// error embedded in its explanation, and the batch continues: the
    /// output always holds one result per input conflict.
    pub fn batch_resolve(&self, conflicts: &[ConflictData]) -> Vec<ResolutionResult> {
        let (auto, needs_user): (Vec<&ConflictData>, Vec<&ConflictData>) =
            conflicts.iter().partition(|conflict| {
                conflict.conflict_type.preferred_strategy() != ResolutionStrategy::UserGuided
            });

        debug!(
            total = conflicts.len(),
            auto = auto.len(),
            needs_user = needs_user.len(),
            "batch resolution started"
        );

        auto.into_iter()
            .chain(needs_user)
            .map(|conflict| match self.resolve_conflict(conflict) {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        entity_id = %conflict.entity_id,
                        error = %err,
                        "resolution failed; rejecting local changes"
                    );
                    ResolutionResult {
                        strategy: ResolutionStrategy::RejectChanges,
                        resolved_data: conflict.server_version.clone().unwrap_or(Value::Null),
                        requires_user_input: false,
                        conflicts: Vec::new(),
                        confidence: 0,
                        explanation: format!(
                            "Resolution failed, keeping the server version: {err}"
                        ),
                    }
                }
            })
            .collect()
    }

    /// Detect potential conflicts between two change lists.
    ///
    /// Convenience wrapper around [`ConflictDetector::detect`] for callers
    /// that already hold an engine.
    pub fn detect_potential_conflicts(
        &self,
        local_changes: &[Value],
        server_changes: &[Value],
        now: Timestamp,
    ) -> Vec<ConflictData> {
        ConflictDetector::new().detect(local_changes, server_changes, now)
    }

    /// Suggestion list handed to the user handler: the primary resolution
    /// plus keep-local and keep-server alternatives.
    fn suggestions(
        &self,
        conflict: &ConflictData,
        primary: ResolutionResult,
    ) -> Vec<ResolutionResult> {
        let keep_local = ResolutionResult {
            strategy: ResolutionStrategy::FirstWriterWins,
            resolved_data: conflict.local_version.clone().unwrap_or(Value::Null),
            requires_user_input: false,
            conflicts: Vec::new(),
            confidence: 60,
            explanation: "Keep the locally queued version".to_string(),
        };
        let keep_server = ResolutionResult {
            strategy: ResolutionStrategy::LastWriterWins,
            resolved_data: conflict.server_version.clone().unwrap_or(Value::Null),
            requires_user_input: false,
            conflicts: Vec::new(),
            confidence: 60,
            explanation: "Keep the server version".to_string(),
        };
        vec![primary, keep_local, keep_server]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn attendance_conflict(local_status: &str, server_status: &str) -> ConflictData {
        ConflictData::new(
            ConflictType::AttendanceStatus,
            "student_1_session_1",
            Some(json!({"status": local_status, "updated_at": 1000})),
            Some(json!({"status": server_status, "updated_at": 2000})),
            5000,
        )
    }

    fn config_conflict(entity_id: &str) -> ConflictData {
        ConflictData::new(
            ConflictType::SessionConfig,
            entity_id,
            Some(json!({"room": "A1"})),
            Some(json!({"room": "B2"})),
            5000,
        )
        .with_fields(vec!["room".to_string()])
    }

    #[test]
    fn dispatches_to_builtin_resolver() {
        let engine = ConflictEngine::new();
        let result = engine
            .resolve_conflict(&attendance_conflict("present", "absent"))
            .unwrap();
        assert_eq!(result.resolved_data["status"], "present");
    }

    #[test]
    fn malformed_conflict_degrades_to_generic() {
        let engine = ConflictEngine::new();
        let conflict = ConflictData::new(
            ConflictType::AttendanceStatus,
            "student_1",
            None,
            Some(json!({"status": "absent"})),
            5000,
        );

        let result = engine.resolve_conflict(&conflict).unwrap();
        assert!(result.confidence < 50);
        assert!(result.requires_user_input);
        assert_eq!(result.resolved_data, json!({"status": "absent"}));
        assert!(result.explanation.len() > 10);
    }

    #[test]
    fn custom_resolver_overrides_builtin() {
        let mut engine = ConflictEngine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        engine.register_resolver(ConflictType::AttendanceStatus, move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(ResolutionResult {
                strategy: ResolutionStrategy::AcceptBoth,
                resolved_data: json!({"custom": true}),
                requires_user_input: false,
                conflicts: Vec::new(),
                confidence: 42,
                explanation: "custom resolver output".to_string(),
            })
        });

        let result = engine
            .resolve_conflict(&attendance_conflict("late", "present"))
            .unwrap();

        // Invoked exactly once, result returned verbatim
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.strategy, ResolutionStrategy::AcceptBoth);
        assert_eq!(result.resolved_data, json!({"custom": true}));
        assert_eq!(result.confidence, 42);
    }

    #[test]
    fn last_registration_wins() {
        let mut engine = ConflictEngine::new();
        engine.register_resolver(ConflictType::AttendanceStatus, |_, _| {
            Ok(ResolutionResult {
                strategy: ResolutionStrategy::RejectChanges,
                resolved_data: json!("first"),
                requires_user_input: false,
                conflicts: Vec::new(),
                confidence: 1,
                explanation: "first registration".to_string(),
            })
        });
        engine.register_resolver(ConflictType::AttendanceStatus, |_, _| {
            Ok(ResolutionResult {
                strategy: ResolutionStrategy::RejectChanges,
                resolved_data: json!("second"),
                requires_user_input: false,
                conflicts: Vec::new(),
                confidence: 2,
                explanation: "second registration".to_string(),
            })
        });

        let result = engine
            .resolve_conflict(&attendance_conflict("late", "present"))
            .unwrap();
        assert_eq!(result.resolved_data, json!("second"));
    }

    #[test]
    fn escalation_delegates_to_user_handler() {
        let mut engine = ConflictEngine::new();
        engine.set_user_handler(|_, suggestions| {
            // Primary first, then keep-local and keep-server at 60
            assert_eq!(suggestions.len(), 3);
            assert_eq!(suggestions[0].strategy, ResolutionStrategy::UserGuided);
            assert_eq!(
                suggestions[1].strategy,
                ResolutionStrategy::FirstWriterWins
            );
            assert_eq!(suggestions[1].confidence, 60);
            assert_eq!(suggestions[2].strategy, ResolutionStrategy::LastWriterWins);
            assert_eq!(suggestions[2].confidence, 60);
            Ok(suggestions[1].clone())
        });

        let result = engine.resolve_conflict(&config_conflict("session_7")).unwrap();
        assert_eq!(result.resolved_data, json!({"room": "A1"}));
    }

    #[test]
    fn no_handler_returns_default_with_flag() {
        let engine = ConflictEngine::new();
        let result = engine.resolve_conflict(&config_conflict("session_7")).unwrap();
        assert!(result.requires_user_input);
        assert_eq!(result.resolved_data, json!({"room": "B2"}));
    }

    #[test]
    fn custom_resolver_error_propagates_on_direct_call() {
        let mut engine = ConflictEngine::new();
        engine.register_resolver(ConflictType::AttendanceStatus, |conflict, _| {
            Err(Error::ResolverFailed {
                entity_id: conflict.entity_id.clone(),
                message: "deliberate failure".to_string(),
            })
        });

        let result = engine.resolve_conflict(&attendance_conflict("late", "present"));
        assert!(result.is_err());
    }

    #[test]
    fn batch_absorbs_resolver_errors() {
        let mut engine = ConflictEngine::new();
        engine.register_resolver(ConflictType::TimestampConflict, |conflict, _| {
            Err(Error::ResolverFailed {
                entity_id: conflict.entity_id.clone(),
                message: "deliberate failure".to_string(),
            })
        });

        let conflicts = vec![
            attendance_conflict("present", "absent"),
            ConflictData::new(
                ConflictType::TimestampConflict,
                "entity_2",
                Some(json!({"timestamp": 1})),
                Some(json!({"timestamp": 2, "room": "B2"})),
                5000,
            ),
        ];

        let results = engine.batch_resolve(&conflicts);

        // One result per input, failure converted rather than aborting
        assert_eq!(results.len(), 2);
        let failed = &results[1];
        assert_eq!(failed.strategy, ResolutionStrategy::RejectChanges);
        assert_eq!(failed.confidence, 0);
        assert_eq!(failed.resolved_data, json!({"timestamp": 2, "room": "B2"}));
        assert!(failed.explanation.contains("deliberate failure"));
    }

    #[test]
    fn batch_orders_auto_resolvable_first() {
        let engine = ConflictEngine::new();
        let conflicts = vec![
            config_conflict("session_1"),
            attendance_conflict("present", "absent"),
            config_conflict("session_2"),
            ConflictData::new(
                ConflictType::TimestampConflict,
                "entity_9",
                Some(json!({"timestamp": 5, "marker": "local"})),
                Some(json!({"timestamp": 1, "marker": "server"})),
                5000,
            ),
        ];

        let results = engine.batch_resolve(&conflicts);
        assert_eq!(results.len(), 4);

        // Auto-resolvable conflicts first (attendance, then timestamp,
        // preserving input order), user-guided ones after
        assert_eq!(results[0].resolved_data["status"], "present");
        assert_eq!(results[1].resolved_data["marker"], "local");
        assert_eq!(results[2].strategy, ResolutionStrategy::UserGuided);
        assert_eq!(results[3].strategy, ResolutionStrategy::UserGuided);
    }

    #[test]
    fn detect_then_resolve_roundtrip() {
        let engine = ConflictEngine::new();
        let local = vec![json!({"entity_id": "e1", "status": "present", "updated_at": 1})];
        let server = vec![json!({"entity_id": "e1", "status": "absent", "updated_at": 2})];

        let conflicts = engine.detect_potential_conflicts(&local, &server, 100);
        assert_eq!(conflicts.len(), 1);

        let result = engine.resolve_conflict(&conflicts[0]).unwrap();
        assert_eq!(result.resolved_data["status"], "present");
    }

    #[test]
    fn batch_empty_input() {
        let engine = ConflictEngine::new();
        assert!(engine.batch_resolve(&[]).is_empty());
    }

    #[test]
    fn explanations_always_populated() {
        let engine = ConflictEngine::new();
        let cases = vec![
            attendance_conflict("present", "absent"),
            attendance_conflict("late", "excused"),
            config_conflict("session_1"),
            ConflictData::new(
                ConflictType::StudentData,
                "student_2",
                Some(json!({"student_id": "s2", "name": "Bo"})),
                Some(json!({"student_id": "s2", "name": "Bob"})),
                5000,
            ),
            ConflictData::new(
                ConflictType::BulkOperation,
                "batch_1",
                Some(json!({"operations": []})),
                Some(json!({"operations": []})),
                5000,
            ),
            // Malformed input still explains itself
            ConflictData::new(ConflictType::StudentData, "student_3", None, None, 5000),
        ];

        for conflict in &cases {
            let result = engine.resolve_conflict(conflict).unwrap();
            assert!(
                result.explanation.len() > 10,
                "thin explanation for {:?}: {}",
                conflict.conflict_type,
                result.explanation
            );
        }
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_resolution_deterministic(
                local_ts in 0i64..100_000,
                server_ts in 0i64..100_000,
            ) {
                let engine = ConflictEngine::new();
                let conflict = ConflictData::new(
                    ConflictType::AttendanceStatus,
                    "student_1_session_1",
                    Some(json!({"status": "late", "updated_at": local_ts})),
                    Some(json!({"status": "excused", "updated_at": server_ts})),
                    5000,
                );

                let first = engine.resolve_conflict(&conflict).unwrap();
                let second = engine.resolve_conflict(&conflict).unwrap();
                prop_assert_eq!(first, second);
            }

            #[test]
            fn prop_presence_wins_under_any_timestamps(
                local_ts in 0i64..100_000,
                server_ts in 0i64..100_000,
                local_present in proptest::bool::ANY,
            ) {
                let engine = ConflictEngine::new();
                let (local_status, server_status) = if local_present {
                    ("present", "absent")
                } else {
                    ("absent", "present")
                };
                let conflict = ConflictData::new(
                    ConflictType::AttendanceStatus,
                    "student_1_session_1",
                    Some(json!({"status": local_status, "updated_at": local_ts})),
                    Some(json!({"status": server_status, "updated_at": server_ts})),
                    5000,
                );

                let result = engine.resolve_conflict(&conflict).unwrap();
                prop_assert_eq!(result.resolved_data["status"].as_str(), Some("present"));
                prop_assert!(result.confidence > 80);
                prop_assert!(!result.requires_user_input);
            }

            #[test]
            fn prop_batch_preserves_count(count in 0usize..20) {
                let engine = ConflictEngine::new();
                let conflicts: Vec<ConflictData> = (0..count)
                    .map(|i| ConflictData::new(
                        ConflictType::AttendanceStatus,
                        format!("student_{i}"),
                        Some(json!({"status": "late", "updated_at": i as i64})),
                        Some(json!({"status": "excused", "updated_at": 10})),
                        5000,
                    ))
                    .collect();

                let results = engine.batch_resolve(&conflicts);
                prop_assert_eq!(results.len(), count);
            }
        }
    }
}
