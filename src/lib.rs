//! Prayog — experiment assignment and analysis engine
//!
//! Deterministic A/B testing core for embedding in a larger application:
//!
//! - Stable, sticky user-to-variant assignment under weighted allocation
//! - Incremental statistical significance testing (confidence intervals,
//!   coarse p-values, sample-size gating)
//! - Test lifecycle state machine (draft -> running -> stopped/completed)
//!   with auto-stop rules
//!
//! # Design
//! - Assignments are a pure function of `(user_id, test_id)` (FNV-1a rank),
//!   persisted for stickiness and reproducible across restarts
//! - The result log is append-only; all statistics are derived by replay
//! - Collaborators (store, event sink, clock) are injected traits; RocksDB
//!   backs the production store
//!
//! # Example
//!
//! ```ignore
//! let engine = ExperimentEngine::open(EngineConfig::from_env())?;
//!
//! let spec = TestSpec::builder("checkout-cta")
//!     .with_variant(Variant::new("control", "Blue button", 50.0))
//!     .with_variant(Variant::new("treatment", "Green button", 50.0))
//!     .with_minimum_sample_size(500)
//!     .build();
//! let test_id = engine.create_test(spec)?;
//! engine.start_test(&test_id)?;
//!
//! if let Some(variant) = engine.get_variant(&test_id, "user_123")? {
//!     // render `variant`, then later:
//!     engine.record_result(&test_id, &variant.id, "conversion", 1.0,
//!                          Some("user_123"), None)?;
//! }
//!
//! let report = engine.get_report(&test_id)?;
//! ```

pub mod assignment;
pub mod clock;
pub mod config;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod stats;
pub mod store;
pub mod tracing_setup;
pub mod types;
pub mod validation;

pub use assignment::{AssignmentEngine, BalanceReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{AutoStopOutcome, EngineSummary, ExperimentEngine};
pub use errors::{EngineError, Result};
pub use events::{EventSink, NullEventSink, RecordingEventSink, TracingEventSink};
pub use stats::{Comparison, Report};
pub use store::{KeyValueStore, MemoryStore, RocksDbStore};
pub use types::{
    AssignmentRecord, ResultRecord, Test, TestSpec, TestStatus, Variant, VariantStats,
};

// Re-export dependencies so tests and benchmarks use the same versions
pub use chrono;
pub use parking_lot;
pub use uuid;
