//! Lifecycle state machine and end-to-end analysis
//!
//! Covers lifecycle legality through the public API and the canonical
//! scenario: a 50/50 two-variant test where variant A converts 8/10 and
//! variant B 2/10, which must report both variants significant and A the
//! winner.

use std::sync::Arc;

use prayog::chrono::{Duration, Utc};
use prayog::{
    Clock, EngineConfig, EngineError, ExperimentEngine, ManualClock, MemoryStore, NullEventSink,
    TestSpec, TestStatus, Variant,
};

struct Harness {
    engine: ExperimentEngine,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = ExperimentEngine::new(
        EngineConfig::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(NullEventSink),
        clock.clone(),
    )
    .expect("engine construction");
    Harness { engine, clock }
}

fn spec_5050(name: &str, minimum_sample_size: u64) -> TestSpec {
    TestSpec::builder(name)
        .with_variant(Variant::new("A", "Variant A", 50.0))
        .with_variant(Variant::new("B", "Variant B", 50.0))
        .with_minimum_sample_size(minimum_sample_size)
        .build()
}

// ============================================================================
// LIFECYCLE LEGALITY
// ============================================================================

#[test]
fn test_draft_cannot_be_stopped() {
    let h = harness();
    let id = h.engine.create_test(spec_5050("draft-stop", 10)).unwrap();
    assert!(matches!(
        h.engine.stop_test(&id, None),
        Err(EngineError::State(_))
    ));
}

#[test]
fn test_running_cannot_be_started_again() {
    let h = harness();
    let id = h.engine.create_test(spec_5050("double-start", 10)).unwrap();
    h.engine.start_test(&id).unwrap();
    assert!(matches!(
        h.engine.start_test(&id),
        Err(EngineError::State(_))
    ));
}

#[test]
fn test_running_cannot_be_deleted_and_data_survives() {
    let h = harness();
    let id = h.engine.create_test(spec_5050("no-delete", 10)).unwrap();
    h.engine.start_test(&id).unwrap();
    h.engine.get_variant(&id, "alice").unwrap().unwrap();
    h.engine
        .record_result(&id, "A", "conversion", 1.0, Some("alice"), None)
        .unwrap();

    assert!(matches!(
        h.engine.delete_test(&id),
        Err(EngineError::State(_))
    ));

    // Everything still there
    assert!(h.engine.get_test(&id).is_some());
    assert_eq!(
        h.engine
            .get_assignment_distribution(&id)
            .unwrap()
            .values()
            .sum::<u64>(),
        1
    );
    assert_eq!(
        h.engine
            .get_stats(&id)
            .unwrap()
            .iter()
            .map(|s| s.sample_size)
            .sum::<u64>(),
        1
    );
}

#[test]
fn test_status_progression() {
    let h = harness();
    let id = h.engine.create_test(spec_5050("progression", 10)).unwrap();
    let now = h.clock.now();

    assert_eq!(h.engine.get_test(&id).unwrap().status(now), TestStatus::Draft);

    h.engine.start_test(&id).unwrap();
    assert_eq!(
        h.engine.get_test(&id).unwrap().status(h.clock.now()),
        TestStatus::Running
    );

    h.engine.stop_test(&id, Some("wrap up")).unwrap();
    let stopped = h.engine.get_test(&id).unwrap();
    assert_eq!(stopped.status(h.clock.now()), TestStatus::Stopped);
    assert!(stopped.end_date.is_some());
    assert_eq!(stopped.stop_reason.as_deref(), Some("wrap up"));
}

#[test]
fn test_scheduled_end_date_completes_test() {
    let h = harness();
    let mut spec = spec_5050("scheduled-end", 10);
    spec.end_date = Some(h.clock.now() + Duration::days(7));
    let id = h.engine.create_test(spec).unwrap();
    h.engine.start_test(&id).unwrap();

    // Inside the window: assignments flow
    assert!(h.engine.get_variant(&id, "alice").unwrap().is_some());

    h.clock.advance(Duration::days(8));
    let test = h.engine.get_test(&id).unwrap();
    assert_eq!(test.status(h.clock.now()), TestStatus::Completed);

    // Outside the window: no new assignments, no new results
    assert!(h.engine.get_variant(&id, "bob").unwrap().is_none());
    assert!(matches!(
        h.engine
            .record_result(&id, "A", "conversion", 1.0, None, None),
        Err(EngineError::State(_))
    ));

    // Auto-stop sweeps it into the stopped set
    let outcome = h.engine.auto_stop_tests();
    assert_eq!(outcome.stopped, vec![id.clone()]);
    assert!(!h.engine.get_test(&id).unwrap().is_active);
}

// ============================================================================
// END-TO-END SCENARIO
// ============================================================================

#[test]
fn test_clear_winner_scenario() {
    let h = harness();
    let id = h.engine.create_test(spec_5050("T1", 10)).unwrap();
    h.engine.start_test(&id).unwrap();

    // Probe synthetic users until each variant holds 10
    let mut a_users = Vec::new();
    let mut b_users = Vec::new();
    let mut i = 0;
    while a_users.len() < 10 || b_users.len() < 10 {
        let user = format!("user_{i}");
        i += 1;
        let variant = h.engine.get_variant(&id, &user).unwrap().unwrap();
        match variant.id.as_str() {
            "A" if a_users.len() < 10 => a_users.push(user),
            "B" if b_users.len() < 10 => b_users.push(user),
            _ => {}
        }
    }

    // A converts 8/10, B converts 2/10
    for (idx, user) in a_users.iter().enumerate() {
        let value = if idx < 8 { 1.0 } else { 0.0 };
        h.engine
            .record_result(&id, "A", "conversion", value, Some(user), None)
            .unwrap();
    }
    for (idx, user) in b_users.iter().enumerate() {
        let value = if idx < 2 { 1.0 } else { 0.0 };
        h.engine
            .record_result(&id, "B", "conversion", value, Some(user), None)
            .unwrap();
    }

    let stats = h.engine.get_stats(&id).unwrap();
    let a = stats.iter().find(|s| s.variant_id == "A").unwrap();
    let b = stats.iter().find(|s| s.variant_id == "B").unwrap();

    assert_eq!(a.sample_size, 10);
    assert!((a.conversion_rate - 0.8).abs() < 1e-9);
    assert!(a.is_statistically_significant);

    assert_eq!(b.sample_size, 10);
    assert!((b.conversion_rate - 0.2).abs() < 1e-9);
    assert!(b.is_statistically_significant);

    let report = h.engine.get_report(&id).unwrap();
    assert_eq!(report.winner.as_deref(), Some("A"));
    assert!(report.summary.contains("winner: A"));

    let cmp = h.engine.compare_variants(&id, "A", "B").unwrap();
    assert_eq!(cmp.winner.as_deref(), Some("A"));
    assert!((cmp.effect_size - 0.6).abs() < 1e-9);
}

#[test]
fn test_significance_gating_end_to_end() {
    let h = harness();
    let id = h.engine.create_test(spec_5050("gated", 1000)).unwrap();
    h.engine.start_test(&id).unwrap();

    // Extreme split, tiny sample: nothing is significant
    for _ in 0..5 {
        h.engine
            .record_result(&id, "A", "conversion", 1.0, None, None)
            .unwrap();
        h.engine
            .record_result(&id, "B", "conversion", 0.0, None, None)
            .unwrap();
    }

    let stats = h.engine.get_stats(&id).unwrap();
    assert!(stats.iter().all(|s| !s.is_statistically_significant));

    let report = h.engine.get_report(&id).unwrap();
    assert!(report.winner.is_none());
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.contains("more samples")));
}
