//! Engine-wide constants and tunable defaults.

/// Variant weights within a test must sum to this value.
pub const WEIGHT_SUM_TARGET: f64 = 100.0;

/// Floating-point tolerance when checking the weight sum.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// User bucketing ranks fall in [1, RANK_MAX].
pub const RANK_MAX: u64 = 100;

/// Default confidence level for new tests.
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;

/// Default minimum sample size before significance is considered.
pub const DEFAULT_MINIMUM_SAMPLE_SIZE: u64 = 100;

/// Auto-stop fires once total samples exceed this multiple of the minimum
/// sample size while at least one variant is significant.
pub const AUTO_STOP_SAMPLE_FACTOR: f64 = 1.5;

/// Balance scores below this threshold produce a recommendation warning.
pub const BALANCE_WARNING_THRESHOLD: f64 = 0.9;

/// Maximum lengths for identifiers and labels.
pub const MAX_TEST_ID_LENGTH: usize = 128;
pub const MAX_TEST_NAME_LENGTH: usize = 256;
pub const MAX_USER_ID_LENGTH: usize = 128;
pub const MAX_VARIANTS_PER_TEST: usize = 16;
