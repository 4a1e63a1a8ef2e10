//! Statistical analysis over recorded outcomes.
//!
//! Pure functions with no state and no I/O: the engine extracts per-variant
//! value slices from the result log and hands them here. Confidence
//! intervals use the normal approximation to a binomial proportion; the
//! per-variant p-value is a coarse, bucketed decision aid gated by sample
//! size rather than a formal hypothesis test. The pairwise comparison uses
//! a pooled two-proportion z statistic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Test, VariantStats};

/// z-scores for the supported confidence levels; unrecognized levels fall
/// back to 95%.
pub fn z_score_for_confidence(confidence_level: f64) -> f64 {
    if (confidence_level - 0.90).abs() < 1e-9 {
        1.645
    } else if (confidence_level - 0.95).abs() < 1e-9 {
        1.96
    } else if (confidence_level - 0.99).abs() < 1e-9 {
        2.576
    } else {
        1.96
    }
}

/// Bucket a z statistic into the coarse p-value scale {0.01, 0.05, 0.10, 0.5}.
fn coarse_p_value(z: f64) -> f64 {
    if z >= 2.576 {
        0.01
    } else if z >= 1.96 {
        0.05
    } else if z >= 1.645 {
        0.10
    } else {
        0.5
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Compute decision-grade statistics for one variant's recorded values.
///
/// Significance is deliberately conservative: the sample must reach the
/// test's minimum size AND the rate must be strictly between 0 and 1,
/// which protects against premature winner declaration on tiny or
/// degenerate samples.
pub fn analyze_variant(
    variant_id: &str,
    values: &[f64],
    minimum_sample_size: u64,
    confidence_level: f64,
) -> VariantStats {
    let sample_size = values.len() as u64;
    let rate = mean(values);

    let confidence_interval = if sample_size == 0 {
        (0.0, 0.0)
    } else {
        let z = z_score_for_confidence(confidence_level);
        let se = (rate * (1.0 - rate) / sample_size as f64).sqrt();
        let margin = z * se;
        ((rate - margin).max(0.0), (rate + margin).min(1.0))
    };

    let is_statistically_significant =
        sample_size >= minimum_sample_size && rate > 0.0 && rate < 1.0;

    // Deviation of the rate from 0.5, as a z statistic
    let p_value = if sample_size == 0 {
        0.5
    } else {
        let se_null = (0.25 / sample_size as f64).sqrt();
        coarse_p_value((rate - 0.5).abs() / se_null)
    };

    VariantStats {
        variant_id: variant_id.to_string(),
        sample_size,
        conversion_rate: rate,
        confidence_interval,
        is_statistically_significant,
        p_value,
    }
}

/// Outcome of a pairwise variant comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    /// Leading variant id; `None` means tie
    pub winner: Option<String>,
    /// Absolute conversion-rate difference
    pub effect_size: f64,
    pub p_value: f64,
}

/// Compare two variants by pooling both sample sets.
pub fn compare_variants(a_id: &str, a_values: &[f64], b_id: &str, b_values: &[f64]) -> Comparison {
    let n_a = a_values.len() as f64;
    let n_b = b_values.len() as f64;
    let rate_a = mean(a_values);
    let rate_b = mean(b_values);
    let effect_size = (rate_a - rate_b).abs();

    let p_value = if n_a == 0.0 || n_b == 0.0 {
        0.5
    } else {
        let pooled = (a_values.iter().sum::<f64>() + b_values.iter().sum::<f64>()) / (n_a + n_b);
        let se = (pooled * (1.0 - pooled) * (1.0 / n_a + 1.0 / n_b)).sqrt();
        if se == 0.0 {
            0.5
        } else {
            coarse_p_value(effect_size / se)
        }
    };

    let winner = if effect_size == 0.0 || (n_a == 0.0 && n_b == 0.0) {
        None
    } else if rate_a > rate_b {
        Some(a_id.to_string())
    } else {
        Some(b_id.to_string())
    };

    Comparison {
        winner,
        effect_size,
        p_value,
    }
}

/// Human-readable analysis of a whole test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub test_id: String,
    pub summary: String,
    pub recommendations: Vec<String>,
    pub stats: Vec<VariantStats>,
    /// Declared only among statistically significant variants
    pub winner: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// Run the analyzer across all of a test's variants and declare a winner
/// only among those that are statistically significant.
///
/// `samples` holds per-variant values in variant declaration order; variants
/// with no results are analyzed with an empty slice.
pub fn generate_report(test: &Test, samples: &[(String, Vec<f64>)], now: DateTime<Utc>) -> Report {
    let stats: Vec<VariantStats> = samples
        .iter()
        .map(|(variant_id, values)| {
            analyze_variant(
                variant_id,
                values,
                test.minimum_sample_size,
                test.confidence_level,
            )
        })
        .collect();

    let winner = stats
        .iter()
        .filter(|s| s.is_statistically_significant)
        .max_by(|a, b| {
            a.conversion_rate
                .partial_cmp(&b.conversion_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|s| s.variant_id.clone());

    let mut recommendations = Vec::new();
    for s in &stats {
        if s.sample_size < test.minimum_sample_size {
            recommendations.push(format!(
                "variant {} needs {} more samples to reach the minimum of {}",
                s.variant_id,
                test.minimum_sample_size - s.sample_size,
                test.minimum_sample_size
            ));
        }
    }

    if let Some(winner_id) = &winner {
        let leader = stats.iter().find(|s| &s.variant_id == winner_id);
        let runner_up = stats
            .iter()
            .filter(|s| &s.variant_id != winner_id)
            .max_by(|a, b| {
                a.conversion_rate
                    .partial_cmp(&b.conversion_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        if let (Some(leader), Some(runner_up)) = (leader, runner_up) {
            recommendations.push(format!(
                "variant {} leads with {:.1}% conversion ({:+.1} points over {})",
                winner_id,
                leader.conversion_rate * 100.0,
                (leader.conversion_rate - runner_up.conversion_rate) * 100.0,
                runner_up.variant_id
            ));
        }
    } else if recommendations.is_empty() {
        recommendations
            .push("no variant is statistically significant yet; keep collecting data".to_string());
    }

    let significant = stats
        .iter()
        .filter(|s| s.is_statistically_significant)
        .count();
    let total_samples: u64 = stats.iter().map(|s| s.sample_size).sum();
    let summary = match &winner {
        Some(id) => format!(
            "{significant} of {} variants significant across {total_samples} samples; winner: {id}",
            stats.len()
        ),
        None => format!(
            "{significant} of {} variants significant across {total_samples} samples; no winner yet",
            stats.len()
        ),
    };

    Report {
        test_id: test.id.clone(),
        summary,
        recommendations,
        stats,
        winner,
        generated_at: now,
    }
}

/// Required per-variant sample size for a two-proportion test.
///
/// Standard formula: n = (z_a + z_b)^2 * (p1(1-p1) + p2(1-p2)) / (p2-p1)^2
/// with p2 = baseline + minimum detectable effect. Returns `None` for
/// degenerate inputs.
pub fn required_sample_size(
    baseline_rate: f64,
    minimum_detectable_effect: f64,
    power: f64,
    alpha: f64,
) -> Option<u64> {
    if !(0.0..1.0).contains(&baseline_rate)
        || baseline_rate == 0.0
        || minimum_detectable_effect <= 0.0
        || !(0.0..1.0).contains(&power)
        || !(0.0..1.0).contains(&alpha)
        || alpha == 0.0
    {
        return None;
    }

    let p2 = (baseline_rate + minimum_detectable_effect).min(0.999_999);
    if p2 <= baseline_rate {
        return None;
    }

    let z_alpha = inverse_normal_cdf(1.0 - alpha / 2.0);
    let z_beta = inverse_normal_cdf(power);
    let variance = baseline_rate * (1.0 - baseline_rate) + p2 * (1.0 - p2);
    let n = (z_alpha + z_beta).powi(2) * variance / (p2 - baseline_rate).powi(2);

    Some(n.ceil() as u64)
}

/// Days until a test reaches its target sample size at the given daily
/// traffic. `None` when traffic is zero.
pub fn projected_days_remaining(
    current_sample_size: u64,
    target_sample_size: u64,
    daily_traffic: u64,
) -> Option<u64> {
    if daily_traffic == 0 {
        return None;
    }
    if current_sample_size >= target_sample_size {
        return Some(0);
    }
    let remaining = target_sample_size - current_sample_size;
    Some(remaining.div_ceil(daily_traffic))
}

/// Inverse normal CDF (Acklam's rational approximation).
fn inverse_normal_cdf(p: f64) -> f64 {
    let a = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    let b = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    let c = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    let d = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];

    let p_low = 0.02425;
    let p_high = 1.0 - p_low;

    if p < p_low {
        let q = (-2.0 * p.ln()).sqrt();
        (((((c[0] * q + c[1]) * q + c[2]) * q + c[3]) * q + c[4]) * q + c[5])
            / ((((d[0] * q + d[1]) * q + d[2]) * q + d[3]) * q + 1.0)
    } else if p <= p_high {
        let q = p - 0.5;
        let r = q * q;
        (((((a[0] * r + a[1]) * r + a[2]) * r + a[3]) * r + a[4]) * r + a[5]) * q
            / (((((b[0] * r + b[1]) * r + b[2]) * r + b[3]) * r + b[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((c[0] * q + c[1]) * q + c[2]) * q + c[3]) * q + c[4]) * q + c[5])
            / ((((d[0] * q + d[1]) * q + d[2]) * q + d[3]) * q + 1.0)
    }
}
