//! Persistence across restarts with the RocksDB store
//!
//! The sticky-assignment contract only means anything if it survives a
//! process restart; these tests exercise the real storage backend through
//! a temp directory.

use std::sync::Arc;

use tempfile::TempDir;

use prayog::chrono::Utc;
use prayog::{
    EngineConfig, ExperimentEngine, ManualClock, NullEventSink, RocksDbStore, TestSpec, Variant,
};

fn open_engine(dir: &TempDir) -> ExperimentEngine {
    let store = Arc::new(RocksDbStore::open(dir.path()).expect("rocksdb open"));
    ExperimentEngine::new(
        EngineConfig::default(),
        store,
        Arc::new(NullEventSink),
        Arc::new(ManualClock::new(Utc::now())),
    )
    .expect("engine construction")
}

fn spec_5050(name: &str) -> TestSpec {
    TestSpec::builder(name)
        .with_variant(Variant::new("a", "A", 50.0))
        .with_variant(Variant::new("b", "B", 50.0))
        .with_minimum_sample_size(10)
        .build()
}

#[test]
fn test_catalog_and_assignments_survive_restart() {
    let dir = TempDir::new().expect("temp dir");

    let (test_id, assignments) = {
        let engine = open_engine(&dir);
        let test_id = engine.create_test(spec_5050("restart")).unwrap();
        engine.start_test(&test_id).unwrap();

        let mut assignments = Vec::new();
        for i in 0..50 {
            let user = format!("user_{i}");
            let variant = engine.get_variant(&test_id, &user).unwrap().unwrap();
            assignments.push((user, variant.id));
        }
        engine.shutdown().unwrap();
        (test_id, assignments)
        // Engine and store dropped here; RocksDB lock released
    };

    let engine = open_engine(&dir);
    let test = engine.get_test(&test_id).expect("catalog reloaded");
    assert!(test.is_active);
    assert_eq!(test.variants.len(), 2);

    for (user, expected) in &assignments {
        let variant = engine.get_variant(&test_id, user).unwrap().unwrap();
        assert_eq!(&variant.id, expected, "assignment changed for {user}");
    }
}

#[test]
fn test_results_survive_restart() {
    let dir = TempDir::new().expect("temp dir");

    let test_id = {
        let engine = open_engine(&dir);
        let test_id = engine.create_test(spec_5050("results")).unwrap();
        engine.start_test(&test_id).unwrap();

        for i in 0..20 {
            let value = if i % 4 == 0 { 1.0 } else { 0.0 };
            engine
                .record_result(&test_id, "a", "conversion", value, None, None)
                .unwrap();
        }
        engine.shutdown().unwrap();
        test_id
    };

    let engine = open_engine(&dir);
    let stats = engine.get_stats(&test_id).unwrap();
    let a = stats.iter().find(|s| s.variant_id == "a").unwrap();
    assert_eq!(a.sample_size, 20);
    assert!((a.conversion_rate - 0.25).abs() < 1e-9);
    assert!(a.is_statistically_significant);
}

#[test]
fn test_delete_cascade_is_durable() {
    let dir = TempDir::new().expect("temp dir");

    let test_id = {
        let engine = open_engine(&dir);
        let test_id = engine.create_test(spec_5050("cascade")).unwrap();
        engine.start_test(&test_id).unwrap();
        for i in 0..10 {
            let user = format!("user_{i}");
            let variant = engine.get_variant(&test_id, &user).unwrap().unwrap();
            engine
                .record_result(&test_id, &variant.id, "conversion", 1.0, Some(&user), None)
                .unwrap();
        }
        engine.stop_test(&test_id, None).unwrap();
        engine.delete_test(&test_id).unwrap();
        engine.shutdown().unwrap();
        test_id
    };

    let engine = open_engine(&dir);
    assert!(engine.get_test(&test_id).is_none());
    assert!(engine.list_tests().is_empty());
}

#[test]
fn test_separate_prefixes_do_not_collide() {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(RocksDbStore::open(dir.path()).expect("rocksdb open"));

    let mut config_one = EngineConfig::default();
    config_one.key_prefix = "nav".to_string();
    let mut config_two = EngineConfig::default();
    config_two.key_prefix = "checkout".to_string();

    let engine_one = ExperimentEngine::new(
        config_one,
        store.clone(),
        Arc::new(NullEventSink),
        Arc::new(ManualClock::new(Utc::now())),
    )
    .unwrap();
    let engine_two = ExperimentEngine::new(
        config_two,
        store,
        Arc::new(NullEventSink),
        Arc::new(ManualClock::new(Utc::now())),
    )
    .unwrap();

    engine_one.create_test(spec_5050("shared-name")).unwrap();
    // Same name is fine in a different namespace
    engine_two.create_test(spec_5050("shared-name")).unwrap();

    assert_eq!(engine_one.list_tests().len(), 1);
    assert_eq!(engine_two.list_tests().len(), 1);
}
