//! Test lifecycle manager and public engine API.
//!
//! Owns the catalog of tests and the append-only result log, validates
//! configuration, drives lifecycle transitions (draft -> running ->
//! stopped/completed), and composes the assignment engine and the
//! statistical analyzer.
//!
//! The engine is an explicitly constructed, dependency-injected service:
//! the store, event sink, and clock are handed in at construction and the
//! catalog is loaded from the store. Catalog mutation is write-through on
//! a clone: the store must accept the new state before the in-memory map
//! is touched, so a failed persist never leaves memory and disk disagreeing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assignment::{AssignmentEngine, BalanceReport};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::events::{EventSink, TracingEventSink};
use crate::metrics;
use crate::stats::{self, Comparison, Report};
use crate::store::{decode, decode_json, encode, encode_json, KeySpace, KeyValueStore, RocksDbStore};
use crate::types::{ResultRecord, Test, TestSpec, TestStatus, Variant, VariantStats};
use crate::validation;

/// Outcome of an auto-stop sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoStopOutcome {
    pub stopped: Vec<String>,
    /// test id -> human-readable reason
    pub reasons: HashMap<String, String>,
}

/// Catalog counts by lifecycle state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSummary {
    pub total: usize,
    pub draft: usize,
    pub running: usize,
    pub stopped: usize,
    pub completed: usize,
}

/// Experiment assignment and analysis engine.
pub struct ExperimentEngine {
    config: EngineConfig,
    store: Arc<dyn KeyValueStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    assignments: AssignmentEngine,
    keys: KeySpace,
    tests: RwLock<HashMap<String, Test>>,
}

impl ExperimentEngine {
    /// Construct with injected collaborators and load the catalog from the
    /// store.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let keys = KeySpace::new(config.key_prefix.clone());
        let mut tests = HashMap::new();
        for (key, bytes) in store.scan_prefix(&keys.tests_prefix())? {
            match decode_json::<Test>(&bytes) {
                Ok(test) => {
                    tests.insert(test.id.clone(), test);
                }
                Err(e) => tracing::warn!(%key, error = %e, "skipping undecodable test record"),
            }
        }
        tracing::info!(count = tests.len(), "test catalog loaded");

        let assignments =
            AssignmentEngine::new(store.clone(), events.clone(), clock.clone(), keys.clone());

        Ok(Self {
            config,
            store,
            events,
            clock,
            assignments,
            keys,
            tests: RwLock::new(tests),
        })
    }

    /// Open a production engine: RocksDB store at the configured path,
    /// tracing event sink, system clock.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(RocksDbStore::open(&config.storage_path)?);
        Self::new(
            config,
            store,
            Arc::new(TracingEventSink),
            Arc::new(SystemClock),
        )
    }

    /// Flush the store. Call during graceful shutdown.
    pub fn shutdown(&self) -> Result<()> {
        self.store.flush()?;
        tracing::info!("engine shut down, store flushed");
        Ok(())
    }

    /// Persist a test, then commit it to the in-memory catalog.
    fn persist_and_commit(&self, test: Test) -> Result<()> {
        let key = self.keys.test_key(&test.id);
        self.store.put(&key, &encode_json(&test)?)?;
        self.tests.write().insert(test.id.clone(), test);
        Ok(())
    }

    fn get_test_or_err(&self, test_id: &str) -> Result<Test> {
        self.tests
            .read()
            .get(test_id)
            .cloned()
            .ok_or_else(|| EngineError::TestNotFound(test_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Validate and admit a new test in the draft state. Every validation
    /// problem is reported in one pass.
    pub fn create_test(&self, spec: TestSpec) -> Result<String> {
        let now = self.clock.now();
        let mut errors = Vec::new();

        if let Some(id) = &spec.id {
            if let Err(e) = validation::validate_test_id(id) {
                errors.push(e.to_string());
            }
        }
        if let Err(e) = validation::validate_test_name(&spec.name) {
            errors.push(e.to_string());
        }
        errors.extend(validation::validate_variants(&spec.variants));
        if let Err(e) = validation::validate_minimum_sample_size(spec.minimum_sample_size) {
            errors.push(e.to_string());
        }
        if let Err(e) = validation::validate_confidence_level(spec.confidence_level) {
            errors.push(e.to_string());
        }

        {
            let tests = self.tests.read();
            if let Some(id) = &spec.id {
                if tests.contains_key(id) {
                    errors.push(format!("test id already exists: {id}"));
                }
            }
            let name_taken = tests.values().any(|t| {
                t.name == spec.name
                    && matches!(t.status(now), TestStatus::Draft | TestStatus::Running)
            });
            if name_taken {
                errors.push(format!(
                    "test name already in use by a draft or active test: {}",
                    spec.name
                ));
            }
        }

        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let test = Test {
            id: id.clone(),
            name: spec.name,
            description: spec.description,
            variants: spec.variants,
            target_metric: spec.target_metric,
            minimum_sample_size: spec.minimum_sample_size,
            confidence_level: spec.confidence_level,
            is_active: false,
            created_at: now,
            started_at: None,
            end_date: spec.end_date,
            stop_reason: None,
            tags: spec.tags,
        };
        self.persist_and_commit(test)?;

        tracing::info!(test_id = %id, "test created");
        self.events
            .emit("test.created", serde_json::json!({ "test_id": id }));
        Ok(id)
    }

    /// Activate a draft test and stamp its start date.
    pub fn start_test(&self, test_id: &str) -> Result<()> {
        let mut test = self.get_test_or_err(test_id)?;
        let now = self.clock.now();

        match test.status(now) {
            TestStatus::Draft => {}
            status => {
                return Err(EngineError::State(format!(
                    "cannot start test {test_id} in {status:?} state"
                )))
            }
        }

        test.is_active = true;
        test.started_at = Some(now);
        self.persist_and_commit(test)?;

        tracing::info!(test_id, "test started");
        self.events
            .emit("test.started", serde_json::json!({ "test_id": test_id }));
        Ok(())
    }

    /// Deactivate a running test and stamp its end date.
    pub fn stop_test(&self, test_id: &str, reason: Option<&str>) -> Result<()> {
        let mut test = self.get_test_or_err(test_id)?;
        let now = self.clock.now();

        if !test.is_active {
            return Err(EngineError::State(format!(
                "cannot stop test {test_id}: not active"
            )));
        }

        test.is_active = false;
        test.end_date = Some(now);
        test.stop_reason = Some(reason.unwrap_or("manual").to_string());
        self.persist_and_commit(test)?;

        tracing::info!(test_id, reason = reason.unwrap_or("manual"), "test stopped");
        self.events.emit(
            "test.stopped",
            serde_json::json!({ "test_id": test_id, "reason": reason.unwrap_or("manual") }),
        );
        Ok(())
    }

    /// Delete an inactive test, cascading to its assignments and results.
    pub fn delete_test(&self, test_id: &str) -> Result<()> {
        let test = self.get_test_or_err(test_id)?;
        if test.is_active {
            return Err(EngineError::State(format!(
                "cannot delete test {test_id}: still active"
            )));
        }

        for (key, _) in self
            .store
            .scan_prefix(&self.keys.assignments_prefix(test_id))?
        {
            self.store.delete(&key)?;
        }
        for (key, _) in self.store.scan_prefix(&self.keys.results_prefix(test_id))? {
            self.store.delete(&key)?;
        }
        self.store.delete(&self.keys.test_key(test_id))?;
        self.tests.write().remove(test_id);

        tracing::info!(test_id, "test deleted with assignments and results");
        self.events
            .emit("test.deleted", serde_json::json!({ "test_id": test_id }));
        Ok(())
    }

    /// Replace the variant list of a draft test that has no recorded data.
    ///
    /// Editing variants on a test with assignments or results would
    /// desynchronize historical stickiness from future allocation, so it is
    /// rejected; stop the test and create a new one instead.
    pub fn update_variants(&self, test_id: &str, variants: Vec<Variant>) -> Result<()> {
        let mut test = self.get_test_or_err(test_id)?;

        if test.is_active {
            return Err(EngineError::State(format!(
                "cannot edit variants of active test {test_id}; stop it and create a new test"
            )));
        }
        let has_assignments = !self
            .store
            .scan_prefix(&self.keys.assignments_prefix(test_id))?
            .is_empty();
        let has_results = !self
            .store
            .scan_prefix(&self.keys.results_prefix(test_id))?
            .is_empty();
        if has_assignments || has_results {
            return Err(EngineError::State(format!(
                "cannot edit variants of test {test_id}: it has recorded data"
            )));
        }

        let errors = validation::validate_variants(&variants);
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        test.variants = variants;
        self.persist_and_commit(test)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Assignment operations
    // ------------------------------------------------------------------

    /// Resolve the sticky variant for a user, or `None` when the test is
    /// not currently active.
    pub fn get_variant(&self, test_id: &str, user_id: &str) -> Result<Option<Variant>> {
        let test = self.get_test_or_err(test_id)?;
        self.assignments.get_assignment(&test, user_id)
    }

    pub fn force_assignment(&self, test_id: &str, user_id: &str, variant_id: &str) -> Result<()> {
        let test = self.get_test_or_err(test_id)?;
        self.assignments.force_assignment(&test, user_id, variant_id)
    }

    pub fn remove_assignment(&self, test_id: &str, user_id: &str) -> Result<bool> {
        self.get_test_or_err(test_id)?;
        self.assignments.remove_assignment(test_id, user_id)
    }

    pub fn get_assignment_distribution(&self, test_id: &str) -> Result<HashMap<String, u64>> {
        self.get_test_or_err(test_id)?;
        self.assignments.get_assignment_distribution(test_id)
    }

    pub fn calculate_balance_score(&self, test_id: &str) -> Result<BalanceReport> {
        let test = self.get_test_or_err(test_id)?;
        self.assignments.calculate_balance_score(&test)
    }

    pub fn migrate_assignments(
        &self,
        test_id: &str,
        from: &str,
        to: &str,
        percentage: f64,
    ) -> Result<u64> {
        let test = self.get_test_or_err(test_id)?;
        self.assignments
            .migrate_assignments(&test, from, to, percentage)
    }

    // ------------------------------------------------------------------
    // Results and analysis
    // ------------------------------------------------------------------

    /// Append an outcome to the test's result log with a server-assigned
    /// timestamp.
    pub fn record_result(
        &self,
        test_id: &str,
        variant_id: &str,
        metric: &str,
        value: f64,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<()> {
        let test = self.get_test_or_err(test_id)?;
        let now = self.clock.now();

        if !test.is_currently_active(now) {
            return Err(EngineError::State(format!(
                "cannot record result for test {test_id}: not active"
            )));
        }
        if test.variant(variant_id).is_none() {
            return Err(EngineError::VariantNotFound(format!(
                "{variant_id} (test {test_id})"
            )));
        }
        if !value.is_finite() {
            return Err(EngineError::Validation(vec![format!(
                "result value must be finite, got {value}"
            )]));
        }
        if let Some(user) = user_id {
            validation::validate_user_id(user)
                .map_err(|e| EngineError::Validation(vec![e.to_string()]))?;
        }

        let record = ResultRecord {
            test_id: test_id.to_string(),
            variant_id: variant_id.to_string(),
            metric: metric.to_string(),
            value,
            timestamp: now,
            user_id: user_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
        };
        let record_id = Uuid::new_v4();
        let nanos = now.timestamp_nanos_opt().unwrap_or(0);
        let key = self.keys.result_key(test_id, nanos, &record_id);

        if let Err(e) = self.store.put(&key, &encode(&record)?) {
            metrics::RESULTS_RECORDED_TOTAL
                .with_label_values(&["error"])
                .inc();
            return Err(e.into());
        }

        metrics::RESULTS_RECORDED_TOTAL
            .with_label_values(&["ok"])
            .inc();
        self.events.emit(
            "result.recorded",
            serde_json::json!({
                "test_id": test_id,
                "variant_id": variant_id,
                "metric": metric,
                "value": value,
            }),
        );
        Ok(())
    }

    /// Delete every recorded result for a test. Returns the number removed.
    pub fn clear_results(&self, test_id: &str) -> Result<u64> {
        self.get_test_or_err(test_id)?;
        let mut removed = 0u64;
        for (key, _) in self.store.scan_prefix(&self.keys.results_prefix(test_id))? {
            self.store.delete(&key)?;
            removed += 1;
        }
        tracing::info!(test_id, removed, "results cleared");
        self.events.emit(
            "results.cleared",
            serde_json::json!({ "test_id": test_id, "removed": removed }),
        );
        Ok(removed)
    }

    /// Per-variant value slices in variant declaration order, replayed from
    /// the result log.
    fn variant_samples(&self, test: &Test) -> Result<Vec<(String, Vec<f64>)>> {
        let mut samples: Vec<(String, Vec<f64>)> = test
            .variants
            .iter()
            .map(|v| (v.id.clone(), Vec::new()))
            .collect();

        for (key, bytes) in self.store.scan_prefix(&self.keys.results_prefix(&test.id))? {
            let record: ResultRecord = match decode(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(%key, error = %e, "skipping undecodable result record");
                    continue;
                }
            };
            match samples
                .iter_mut()
                .find(|(id, _)| id.as_str() == record.variant_id)
            {
                Some((_, values)) => values.push(record.value),
                None => tracing::debug!(
                    variant_id = %record.variant_id,
                    "result references a variant no longer on the test"
                ),
            }
        }
        Ok(samples)
    }

    /// Recompute per-variant statistics from the result log.
    pub fn get_stats(&self, test_id: &str) -> Result<Vec<VariantStats>> {
        let test = self.get_test_or_err(test_id)?;
        let timer = metrics::ANALYSIS_DURATION.start_timer();
        let samples = self.variant_samples(&test)?;
        let stats = samples
            .iter()
            .map(|(variant_id, values)| {
                stats::analyze_variant(
                    variant_id,
                    values,
                    test.minimum_sample_size,
                    test.confidence_level,
                )
            })
            .collect();
        timer.observe_duration();
        Ok(stats)
    }

    /// Full analysis with summary, recommendations, and winner.
    pub fn get_report(&self, test_id: &str) -> Result<Report> {
        let test = self.get_test_or_err(test_id)?;
        let samples = self.variant_samples(&test)?;
        Ok(stats::generate_report(&test, &samples, self.clock.now()))
    }

    /// Pairwise comparison of two variants over the recorded results.
    pub fn compare_variants(&self, test_id: &str, a_id: &str, b_id: &str) -> Result<Comparison> {
        let test = self.get_test_or_err(test_id)?;
        if test.variant(a_id).is_none() {
            return Err(EngineError::VariantNotFound(format!("{a_id} (test {test_id})")));
        }
        if test.variant(b_id).is_none() {
            return Err(EngineError::VariantNotFound(format!("{b_id} (test {test_id})")));
        }

        let samples = self.variant_samples(&test)?;
        let empty = Vec::new();
        let a_values = samples
            .iter()
            .find(|(id, _)| id.as_str() == a_id)
            .map(|(_, v)| v)
            .unwrap_or(&empty);
        let b_values = samples
            .iter()
            .find(|(id, _)| id.as_str() == b_id)
            .map(|(_, v)| v)
            .unwrap_or(&empty);
        Ok(stats::compare_variants(a_id, a_values, b_id, b_values))
    }

    // ------------------------------------------------------------------
    // Advisory operations
    // ------------------------------------------------------------------

    /// Stop tests that passed their end date, or that exceeded the
    /// configured multiple of their minimum sample size with at least one
    /// significant variant. Advisory: collaborator failures are logged and
    /// the sweep moves on.
    pub fn auto_stop_tests(&self) -> AutoStopOutcome {
        let mut outcome = AutoStopOutcome::default();
        let active: Vec<Test> = self
            .tests
            .read()
            .values()
            .filter(|t| t.is_active)
            .cloned()
            .collect();

        for test in active {
            let now = self.clock.now();
            let reason = if test.end_date.is_some_and(|end| now >= end) {
                Some("end date reached".to_string())
            } else {
                match self.conclusive_reason(&test) {
                    Ok(reason) => reason,
                    Err(e) => {
                        tracing::warn!(test_id = %test.id, error = %e, "auto-stop check failed");
                        continue;
                    }
                }
            };

            let Some(reason) = reason else { continue };
            if let Err(e) = self.stop_test(&test.id, Some(&reason)) {
                tracing::warn!(test_id = %test.id, error = %e, "auto-stop failed");
                continue;
            }
            metrics::TESTS_AUTO_STOPPED_TOTAL.inc();
            self.events.emit(
                "test.auto_stopped",
                serde_json::json!({ "test_id": test.id, "reason": reason }),
            );
            outcome.stopped.push(test.id.clone());
            outcome.reasons.insert(test.id.clone(), reason);
        }

        outcome
    }

    /// "Stop when conclusive" rule: total samples past the configured
    /// multiple of the minimum, with at least one significant variant.
    fn conclusive_reason(&self, test: &Test) -> Result<Option<String>> {
        let samples = self.variant_samples(test)?;
        let total: u64 = samples.iter().map(|(_, v)| v.len() as u64).sum();
        let threshold = test.minimum_sample_size as f64 * self.config.auto_stop_sample_factor;
        if (total as f64) <= threshold {
            return Ok(None);
        }

        let any_significant = samples.iter().any(|(variant_id, values)| {
            stats::analyze_variant(
                variant_id,
                values,
                test.minimum_sample_size,
                test.confidence_level,
            )
            .is_statistically_significant
        });

        Ok(any_significant.then(|| format!("conclusive after {total} samples")))
    }

    /// Textual guidance combining sample shortfall, balance warnings, and
    /// leading-variant callouts. Advisory: failures produce an empty list.
    pub fn get_test_recommendations(&self, test_id: &str) -> Vec<String> {
        let Ok(test) = self.get_test_or_err(test_id) else {
            return Vec::new();
        };
        let Ok(samples) = self.variant_samples(&test) else {
            return Vec::new();
        };

        let report = stats::generate_report(&test, &samples, self.clock.now());
        let mut recommendations = report.recommendations;

        if let Ok(balance) = self.assignments.calculate_balance_score(&test) {
            if balance.total_assignments > 0
                && balance.score < self.config.balance_warning_threshold
            {
                let worst = balance
                    .deviations
                    .first()
                    .map(|d| {
                        format!(
                            "; worst deviation: variant {} at {:.1}% vs {:.1}% expected",
                            d.variant_id, d.observed_pct, d.expected_pct
                        )
                    })
                    .unwrap_or_default();
                recommendations.push(format!(
                    "assignment balance score {:.2} is below {:.2}{worst}",
                    balance.score, self.config.balance_warning_threshold
                ));
            }
        }

        recommendations
    }

    /// Projected date at which the test reaches its per-variant minimum
    /// sample size across all variants, at the given daily traffic.
    pub fn projected_completion(
        &self,
        test_id: &str,
        daily_traffic: u64,
    ) -> Result<Option<DateTime<Utc>>> {
        let test = self.get_test_or_err(test_id)?;
        let samples = self.variant_samples(&test)?;
        let total: u64 = samples.iter().map(|(_, v)| v.len() as u64).sum();
        let target = test.minimum_sample_size * test.variants.len() as u64;

        Ok(
            stats::projected_days_remaining(total, target, daily_traffic)
                .map(|days| self.clock.now() + Duration::days(days as i64)),
        )
    }

    // ------------------------------------------------------------------
    // Catalog accessors
    // ------------------------------------------------------------------

    pub fn get_test(&self, test_id: &str) -> Option<Test> {
        self.tests.read().get(test_id).cloned()
    }

    pub fn list_tests(&self) -> Vec<Test> {
        let mut tests: Vec<Test> = self.tests.read().values().cloned().collect();
        tests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tests
    }

    pub fn summary(&self) -> EngineSummary {
        let now = self.clock.now();
        let tests = self.tests.read();
        let mut summary = EngineSummary {
            total: tests.len(),
            ..Default::default()
        };
        for test in tests.values() {
            match test.status(now) {
                TestStatus::Draft => summary.draft += 1,
                TestStatus::Running => summary.running += 1,
                TestStatus::Stopped => summary.stopped += 1,
                TestStatus::Completed => summary.completed += 1,
            }
        }
        summary
    }
}
