//! Deterministic, sticky user-to-variant assignment.
//!
//! A user's bucket rank is a pure function of `(user_id, test_id)`: FNV-1a
//! reduced to [1, 100]. Walking the variants in declaration order and
//! accumulating weight gives standard weighted-bucket assignment, so the
//! long-run frequency of each variant matches its configured weight.
//!
//! Stickiness comes from persisting the first computed assignment. Because
//! the computation is deterministic, concurrent first-assignments for the
//! same `(test, user)` write identical records and last-write-wins is safe;
//! no lock is held across store calls.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::constants::{RANK_MAX, WEIGHT_SUM_TARGET, WEIGHT_SUM_TOLERANCE};
use crate::errors::{EngineError, Result};
use crate::events::EventSink;
use crate::metrics;
use crate::store::{decode, encode, KeySpace, KeyValueStore};
use crate::types::{AssignmentRecord, Test, Variant};
use crate::validation::validate_user_id;

/// Stable pseudo-random rank in [1, 100] for a user within a test.
///
/// FNV-1a rather than the standard library hasher: the rank must be
/// reproducible across restarts, processes, and toolchain upgrades.
pub fn user_rank(test_id: &str, user_id: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(user_id.as_bytes());
    hasher.write(test_id.as_bytes());
    hasher.finish() % RANK_MAX + 1
}

/// Salted rank used to pick a deterministic fraction of users for migration.
fn migration_rank(test_id: &str, user_id: &str, from: &str, to: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(user_id.as_bytes());
    hasher.write(test_id.as_bytes());
    hasher.write(b"migrate");
    hasher.write(from.as_bytes());
    hasher.write(to.as_bytes());
    hasher.finish() % RANK_MAX + 1
}

/// Weighted-bucket walk: first variant whose cumulative weight reaches the
/// rank. The final variant absorbs floating-point drift.
fn pick_variant(test: &Test, rank: u64) -> Option<&Variant> {
    let mut cumulative = 0.0;
    for variant in &test.variants {
        cumulative += variant.weight;
        if cumulative + WEIGHT_SUM_TOLERANCE >= rank as f64 {
            return Some(variant);
        }
    }
    test.variants.last()
}

/// Observed-vs-configured allocation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceReport {
    /// 1.0 = observed split matches configured weights exactly
    pub score: f64,
    pub total_assignments: u64,
    /// Worst deviations first
    pub deviations: Vec<BalanceDeviation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceDeviation {
    pub variant_id: String,
    pub expected_pct: f64,
    pub observed_pct: f64,
    pub deviation_pct: f64,
}

/// Sticky assignment engine backed by the persistent store.
pub struct AssignmentEngine {
    store: Arc<dyn KeyValueStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
}

impl AssignmentEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            keys,
        }
    }

    /// Resolve the variant for a user, creating a sticky assignment on first
    /// access.
    ///
    /// Returns `Ok(None)` when the test is not currently active. Invalid
    /// weight configuration is surfaced as a validation error rather than
    /// silently defaulting. The new assignment is persisted before it is
    /// returned; a store failure is an error, never a silently-lost
    /// assignment.
    pub fn get_assignment(&self, test: &Test, user_id: &str) -> Result<Option<Variant>> {
        validate_user_id(user_id).map_err(|e| EngineError::Validation(vec![e.to_string()]))?;

        let now = self.clock.now();
        if !test.is_currently_active(now) {
            return Ok(None);
        }

        let weight_sum = test.weight_sum();
        if (weight_sum - WEIGHT_SUM_TARGET).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::Validation(vec![format!(
                "variant weights for test {} sum to {weight_sum}, expected {WEIGHT_SUM_TARGET}",
                test.id
            )]));
        }

        let key = self.keys.assignment_key(&test.id, user_id);
        if let Some(bytes) = self.store.get(&key)? {
            let record: AssignmentRecord = decode(&bytes)?;
            if let Some(variant) = test.variant(&record.variant_id) {
                metrics::ASSIGNMENTS_TOTAL.with_label_values(&["sticky"]).inc();
                return Ok(Some(variant.clone()));
            }
            // The assigned variant is gone from the test; recompute below
            tracing::warn!(
                test_id = %test.id,
                variant_id = %record.variant_id,
                "sticky assignment references a removed variant, reassigning"
            );
        }

        let rank = user_rank(&test.id, user_id);
        let Some(variant) = pick_variant(test, rank) else {
            return Err(EngineError::Validation(vec![format!(
                "test {} has no variants",
                test.id
            )]));
        };
        let record = AssignmentRecord {
            variant_id: variant.id.clone(),
            assigned_at: now,
            forced: false,
        };
        self.store.put(&key, &encode(&record)?)?;

        metrics::ASSIGNMENTS_TOTAL
            .with_label_values(&["computed"])
            .inc();
        self.events.emit(
            "assignment.created",
            serde_json::json!({
                "test_id": test.id,
                "user_id": user_id,
                "variant_id": variant.id,
                "rank": rank,
            }),
        );

        Ok(Some(variant.clone()))
    }

    /// Administrative override for debugging and QA. Overwrites any existing
    /// assignment.
    pub fn force_assignment(&self, test: &Test, user_id: &str, variant_id: &str) -> Result<()> {
        validate_user_id(user_id).map_err(|e| EngineError::Validation(vec![e.to_string()]))?;

        if test.variant(variant_id).is_none() {
            return Err(EngineError::VariantNotFound(format!(
                "{variant_id} (test {})",
                test.id
            )));
        }

        let record = AssignmentRecord {
            variant_id: variant_id.to_string(),
            assigned_at: self.clock.now(),
            forced: true,
        };
        let key = self.keys.assignment_key(&test.id, user_id);
        self.store.put(&key, &encode(&record)?)?;

        metrics::ASSIGNMENTS_TOTAL.with_label_values(&["forced"]).inc();
        self.events.emit(
            "assignment.forced",
            serde_json::json!({
                "test_id": test.id,
                "user_id": user_id,
                "variant_id": variant_id,
            }),
        );

        Ok(())
    }

    /// Remove a user's assignment. Returns whether one existed.
    pub fn remove_assignment(&self, test_id: &str, user_id: &str) -> Result<bool> {
        let key = self.keys.assignment_key(test_id, user_id);
        let existed = self.store.get(&key)?.is_some();
        if existed {
            self.store.delete(&key)?;
            self.events.emit(
                "assignment.removed",
                serde_json::json!({ "test_id": test_id, "user_id": user_id }),
            );
        }
        Ok(existed)
    }

    /// Assignment counts per variant id.
    pub fn get_assignment_distribution(&self, test_id: &str) -> Result<HashMap<String, u64>> {
        let prefix = self.keys.assignments_prefix(test_id);
        let mut counts: HashMap<String, u64> = HashMap::new();
        for (key, bytes) in self.store.scan_prefix(&prefix)? {
            match decode::<AssignmentRecord>(&bytes) {
                Ok(record) => *counts.entry(record.variant_id).or_insert(0) += 1,
                Err(e) => {
                    tracing::warn!(%key, error = %e, "skipping undecodable assignment record")
                }
            }
        }
        Ok(counts)
    }

    /// Score how closely the observed split matches configured weights.
    ///
    /// The score is 1 minus the total variation distance between the two
    /// allocations, so 1.0 is a perfect match and 0.0 is complete
    /// divergence. Useful for detecting assignment bugs or store
    /// corruption.
    pub fn calculate_balance_score(&self, test: &Test) -> Result<BalanceReport> {
        let counts = self.get_assignment_distribution(&test.id)?;
        let total: u64 = counts.values().sum();

        if total == 0 {
            return Ok(BalanceReport {
                score: 1.0,
                total_assignments: 0,
                deviations: Vec::new(),
            });
        }

        let mut deviations = Vec::new();
        let mut total_abs_dev = 0.0;
        for variant in &test.variants {
            let observed =
                *counts.get(&variant.id).unwrap_or(&0) as f64 / total as f64 * 100.0;
            let deviation = (observed - variant.weight).abs();
            total_abs_dev += deviation;
            deviations.push(BalanceDeviation {
                variant_id: variant.id.clone(),
                expected_pct: variant.weight,
                observed_pct: observed,
                deviation_pct: deviation,
            });
        }
        // Assignments pointing at variants no longer on the test count
        // fully against the score
        for (variant_id, count) in &counts {
            if test.variant(variant_id).is_none() {
                let observed = *count as f64 / total as f64 * 100.0;
                total_abs_dev += observed;
                deviations.push(BalanceDeviation {
                    variant_id: variant_id.clone(),
                    expected_pct: 0.0,
                    observed_pct: observed,
                    deviation_pct: observed,
                });
            }
        }

        deviations.sort_by(|a, b| {
            b.deviation_pct
                .partial_cmp(&a.deviation_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let score = (1.0 - total_abs_dev / 200.0).clamp(0.0, 1.0);
        Ok(BalanceReport {
            score,
            total_assignments: total,
            deviations,
        })
    }

    /// Re-bucket a deterministic fraction of users from one variant into
    /// another, for mid-test corrections. Returns the number of users
    /// moved. Repeated calls with the same arguments are idempotent: the
    /// selection is a salted hash of the user id, and moved users no longer
    /// match the source variant.
    pub fn migrate_assignments(
        &self,
        test: &Test,
        from: &str,
        to: &str,
        percentage: f64,
    ) -> Result<u64> {
        if test.variant(from).is_none() {
            return Err(EngineError::VariantNotFound(format!(
                "{from} (test {})",
                test.id
            )));
        }
        if test.variant(to).is_none() {
            return Err(EngineError::VariantNotFound(format!(
                "{to} (test {})",
                test.id
            )));
        }
        if !percentage.is_finite() || percentage <= 0.0 || percentage > 100.0 {
            return Err(EngineError::Validation(vec![format!(
                "migration percentage must be in (0, 100], got {percentage}"
            )]));
        }

        let prefix = self.keys.assignments_prefix(&test.id);
        let now = self.clock.now();
        let mut moved = 0u64;

        for (key, bytes) in self.store.scan_prefix(&prefix)? {
            let record: AssignmentRecord = match decode(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(%key, error = %e, "skipping undecodable assignment record");
                    continue;
                }
            };
            if record.variant_id != from {
                continue;
            }
            let Some(user_id) = key.strip_prefix(&prefix) else {
                continue;
            };
            if migration_rank(&test.id, user_id, from, to) as f64 > percentage {
                continue;
            }

            let updated = AssignmentRecord {
                variant_id: to.to_string(),
                assigned_at: now,
                forced: true,
            };
            self.store.put(&key, &encode(&updated)?)?;
            moved += 1;
        }

        tracing::info!(test_id = %test.id, from, to, percentage, moved, "assignments migrated");
        self.events.emit(
            "assignment.migrated",
            serde_json::json!({
                "test_id": test.id,
                "from": from,
                "to": to,
                "percentage": percentage,
                "moved": moved,
            }),
        );

        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::RecordingEventSink;
    use crate::store::MemoryStore;
    use chrono::{Duration, Utc};

    fn active_test(weights: &[(&str, f64)]) -> Test {
        let now = Utc::now();
        Test {
            id: "t1".to_string(),
            name: "t1".to_string(),
            description: String::new(),
            variants: weights
                .iter()
                .map(|(id, w)| Variant::new(*id, id.to_uppercase(), *w))
                .collect(),
            target_metric: "conversion".to_string(),
            minimum_sample_size: 10,
            confidence_level: 0.95,
            is_active: true,
            created_at: now - Duration::hours(1),
            started_at: Some(now - Duration::hours(1)),
            end_date: None,
            stop_reason: None,
            tags: Vec::new(),
        }
    }

    fn engine_with(store: Arc<MemoryStore>) -> (AssignmentEngine, Arc<RecordingEventSink>) {
        let sink = Arc::new(RecordingEventSink::new());
        let engine = AssignmentEngine::new(
            store,
            sink.clone(),
            Arc::new(ManualClock::new(Utc::now())),
            KeySpace::new("prayog"),
        );
        (engine, sink)
    }

    #[test]
    fn test_rank_is_deterministic_and_in_range() {
        for i in 0..1000 {
            let user = format!("user_{i}");
            let rank = user_rank("t1", &user);
            assert_eq!(rank, user_rank("t1", &user));
            assert!((1..=100).contains(&rank));
        }
        // Different tests bucket the same user independently
        assert_ne!(
            (1..=50).map(|i| user_rank("t1", &format!("u{i}"))).collect::<Vec<_>>(),
            (1..=50).map(|i| user_rank("t2", &format!("u{i}"))).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn test_assignment_is_sticky() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        let first = engine.get_assignment(&test, "alice").unwrap().unwrap();
        for _ in 0..10 {
            let again = engine.get_assignment(&test, "alice").unwrap().unwrap();
            assert_eq!(again.id, first.id);
        }
    }

    #[test]
    fn test_assignment_survives_engine_restart() {
        let store = Arc::new(MemoryStore::new());
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        let (engine, _) = engine_with(store.clone());
        let first = engine.get_assignment(&test, "alice").unwrap().unwrap();
        drop(engine);

        let (engine, _) = engine_with(store);
        let second = engine.get_assignment(&test, "alice").unwrap().unwrap();
        assert_eq!(second.id, first.id);
    }

    #[test]
    fn test_inactive_test_returns_none() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let mut test = active_test(&[("a", 50.0), ("b", 50.0)]);
        test.is_active = false;
        test.started_at = None;

        assert!(engine.get_assignment(&test, "alice").unwrap().is_none());
    }

    #[test]
    fn test_expired_test_returns_none() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let mut test = active_test(&[("a", 50.0), ("b", 50.0)]);
        test.end_date = Some(Utc::now() - Duration::hours(1));

        assert!(engine.get_assignment(&test, "alice").unwrap().is_none());
    }

    #[test]
    fn test_invalid_weights_surface_as_error() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 49.0)]);

        let err = engine.get_assignment(&test, "alice").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_weighted_split_roughly_matches_weights() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 30.0), ("b", 70.0)]);

        let mut counts: HashMap<String, u64> = HashMap::new();
        for i in 0..2000 {
            let user = format!("user_{i}");
            let variant = engine.get_assignment(&test, &user).unwrap().unwrap();
            *counts.entry(variant.id).or_insert(0) += 1;
        }

        let a_pct = *counts.get("a").unwrap() as f64 / 2000.0 * 100.0;
        assert!((25.0..35.0).contains(&a_pct), "a got {a_pct}%");
    }

    #[test]
    fn test_sticky_under_unrelated_variant_changes() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let mut test = active_test(&[("a", 50.0), ("b", 50.0)]);

        let before = engine.get_assignment(&test, "alice").unwrap().unwrap();

        // Reshuffle the variant list; alice's variant still exists
        test.variants = vec![
            Variant::new("c", "C", 20.0),
            Variant::new("a", "A", 40.0),
            Variant::new("b", "B", 40.0),
        ];
        let after = engine.get_assignment(&test, "alice").unwrap().unwrap();
        assert_eq!(after.id, before.id);
    }

    #[test]
    fn test_removed_variant_triggers_reassignment() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        engine.force_assignment(&test, "alice", "b").unwrap();

        let mut edited = test.clone();
        edited.variants = vec![Variant::new("a", "A", 60.0), Variant::new("c", "C", 40.0)];
        let reassigned = engine.get_assignment(&edited, "alice").unwrap().unwrap();
        assert_ne!(reassigned.id, "b");
    }

    #[test]
    fn test_force_assignment_overrides_and_sticks() {
        let (engine, sink) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        let natural = engine.get_assignment(&test, "alice").unwrap().unwrap();
        let other = if natural.id == "a" { "b" } else { "a" };

        engine.force_assignment(&test, "alice", other).unwrap();
        let forced = engine.get_assignment(&test, "alice").unwrap().unwrap();
        assert_eq!(forced.id, other);
        assert!(sink.names().contains(&"assignment.forced".to_string()));
    }

    #[test]
    fn test_force_unknown_variant_rejected() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        let err = engine.force_assignment(&test, "alice", "nope").unwrap_err();
        assert!(matches!(err, EngineError::VariantNotFound(_)));
    }

    #[test]
    fn test_remove_assignment() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        engine.get_assignment(&test, "alice").unwrap();
        assert!(engine.remove_assignment("t1", "alice").unwrap());
        assert!(!engine.remove_assignment("t1", "alice").unwrap());
    }

    #[test]
    fn test_distribution_counts() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        for i in 0..100 {
            engine
                .get_assignment(&test, &format!("user_{i}"))
                .unwrap()
                .unwrap();
        }

        let counts = engine.get_assignment_distribution("t1").unwrap();
        let total: u64 = counts.values().sum();
        assert_eq!(total, 100);
        assert!(counts.len() <= 2);
    }

    #[test]
    fn test_balance_score_perfect_when_empty() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        let report = engine.calculate_balance_score(&test).unwrap();
        assert_eq!(report.score, 1.0);
        assert_eq!(report.total_assignments, 0);
    }

    #[test]
    fn test_balance_score_detects_skew() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        // Force every user into one arm
        for i in 0..50 {
            engine
                .force_assignment(&test, &format!("user_{i}"), "a")
                .unwrap();
        }

        let report = engine.calculate_balance_score(&test).unwrap();
        assert!(report.score < 0.6, "score was {}", report.score);
        assert_eq!(report.deviations[0].deviation_pct, 50.0);
    }

    #[test]
    fn test_migration_moves_deterministic_fraction() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        for i in 0..200 {
            engine
                .force_assignment(&test, &format!("user_{i}"), "a")
                .unwrap();
        }

        let moved = engine.migrate_assignments(&test, "a", "b", 50.0).unwrap();
        assert!((50..150).contains(&moved), "moved {moved}");

        let counts = engine.get_assignment_distribution("t1").unwrap();
        assert_eq!(counts.get("b").copied().unwrap_or(0), moved);

        // Idempotent: the selected users are already moved
        let moved_again = engine.migrate_assignments(&test, "a", "b", 50.0).unwrap();
        assert_eq!(moved_again, 0);
    }

    #[test]
    fn test_migration_validates_arguments() {
        let (engine, _) = engine_with(Arc::new(MemoryStore::new()));
        let test = active_test(&[("a", 50.0), ("b", 50.0)]);

        assert!(matches!(
            engine.migrate_assignments(&test, "nope", "b", 10.0),
            Err(EngineError::VariantNotFound(_))
        ));
        assert!(matches!(
            engine.migrate_assignments(&test, "a", "b", 0.0),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            engine.migrate_assignments(&test, "a", "b", 150.0),
            Err(EngineError::Validation(_))
        ));
    }
}
