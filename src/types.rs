//! Core model types for tests, variants, assignments, and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CONFIDENCE_LEVEL, DEFAULT_MINIMUM_SAMPLE_SIZE};

/// One arm of a test, with a configured traffic-share weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    /// Unique within its test
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Traffic share in percent (0-100); all weights in a test sum to 100
    pub weight: f64,
    /// Opaque payload handed back to the caller on assignment
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Variant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            weight,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Lifecycle state of a test, derived from its flags and the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    /// Created, not yet started
    Draft,
    /// Active and within its date window
    Running,
    /// Manually ended before reaching its target
    Stopped,
    /// End date has passed
    Completed,
}

/// A named experiment comparing two or more variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    /// Unique identifier, immutable after creation
    pub id: String,
    /// Unique among draft and active tests
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Ordered list, length >= 2; order matters for bucket walking
    pub variants: Vec<Variant>,
    /// Opaque metric label results are recorded against
    pub target_metric: String,
    /// Samples required per variant before significance is considered
    pub minimum_sample_size: u64,
    /// Confidence level in (0, 1), e.g. 0.95
    pub confidence_level: f64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Scheduled end when set at creation; stamped on stop
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Test {
    /// Derived lifecycle state at `now`.
    pub fn status(&self, now: DateTime<Utc>) -> TestStatus {
        if self.is_active {
            match self.end_date {
                Some(end) if now >= end => TestStatus::Completed,
                _ => TestStatus::Running,
            }
        } else if self.started_at.is_some() {
            TestStatus::Stopped
        } else {
            TestStatus::Draft
        }
    }

    /// Whether the test is accepting assignments and results at `now`.
    pub fn is_currently_active(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.started_at.map_or(false, |start| now >= start)
            && self.end_date.map_or(true, |end| now < end)
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    pub fn weight_sum(&self) -> f64 {
        self.variants.iter().map(|v| v.weight).sum()
    }
}

/// Creation input for a test; validated by the engine before admission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSpec {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub variants: Vec<Variant>,
    pub target_metric: String,
    pub minimum_sample_size: u64,
    pub confidence_level: f64,
    /// Optional scheduled end; auto-stop enforces it
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TestSpec {
    pub fn builder(name: impl Into<String>) -> TestSpecBuilder {
        TestSpecBuilder::new(name)
    }
}

/// Builder for creating test specs.
pub struct TestSpecBuilder {
    spec: TestSpec,
}

impl TestSpecBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: TestSpec {
                id: None,
                name: name.into(),
                description: String::new(),
                variants: Vec::new(),
                target_metric: "conversion".to_string(),
                minimum_sample_size: DEFAULT_MINIMUM_SAMPLE_SIZE,
                confidence_level: DEFAULT_CONFIDENCE_LEVEL,
                end_date: None,
                tags: Vec::new(),
            },
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.spec.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.spec.description = description.into();
        self
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.spec.variants.push(variant);
        self
    }

    pub fn with_variants(mut self, variants: Vec<Variant>) -> Self {
        self.spec.variants = variants;
        self
    }

    pub fn with_target_metric(mut self, metric: impl Into<String>) -> Self {
        self.spec.target_metric = metric.into();
        self
    }

    pub fn with_minimum_sample_size(mut self, n: u64) -> Self {
        self.spec.minimum_sample_size = n;
        self
    }

    pub fn with_confidence_level(mut self, level: f64) -> Self {
        self.spec.confidence_level = level;
        self
    }

    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.spec.end_date = Some(end);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.spec.tags = tags;
        self
    }

    pub fn build(self) -> TestSpec {
        self.spec
    }
}

/// Durable sticky fact: (test, user) -> variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub variant_id: String,
    pub assigned_at: DateTime<Utc>,
    /// True when set by an administrative override or migration
    #[serde(default)]
    pub forced: bool,
}

/// An immutable outcome event appended to a test's result log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub test_id: String,
    pub variant_id: String,
    pub metric: String,
    /// In [0, 1] for binary conversions; arbitrary numeric otherwise
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Per-variant decision-grade statistics, recomputed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantStats {
    pub variant_id: String,
    pub sample_size: u64,
    pub conversion_rate: f64,
    /// Normal-approximation interval, clipped to [0, 1]
    pub confidence_interval: (f64, f64),
    /// Sample-size-gated flag, not a formal hypothesis test
    pub is_statistically_significant: bool,
    /// Coarse decision aid bucketed to {0.01, 0.05, 0.10, 0.5}
    pub p_value: f64,
}
