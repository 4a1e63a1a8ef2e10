//! Input validation for test configuration and identifiers.
//!
//! Each validator reports a single problem; the engine runs them all and
//! collects every message into one validation error so callers can surface
//! all problems at once.

use anyhow::{anyhow, Result};
use std::collections::HashSet;

use crate::constants::{
    MAX_TEST_ID_LENGTH, MAX_TEST_NAME_LENGTH, MAX_USER_ID_LENGTH, MAX_VARIANTS_PER_TEST,
    WEIGHT_SUM_TARGET, WEIGHT_SUM_TOLERANCE,
};
use crate::types::Variant;

/// Validate a test id. Ids end up inside store keys, so the charset is
/// restricted to keep the `:`-delimited key layout unambiguous.
pub fn validate_test_id(test_id: &str) -> Result<()> {
    if test_id.is_empty() {
        return Err(anyhow!("test id cannot be empty"));
    }

    if test_id.len() > MAX_TEST_ID_LENGTH {
        return Err(anyhow!(
            "test id too long: {} chars (max: {})",
            test_id.len(),
            MAX_TEST_ID_LENGTH
        ));
    }

    if !test_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(anyhow!(
            "test id contains invalid characters (allowed: alphanumeric, -, _, .)"
        ));
    }

    Ok(())
}

/// Validate a user id. Same charset restriction as test ids, plus `@` for
/// email-shaped identifiers.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(anyhow!("user id cannot be empty"));
    }

    if user_id.len() > MAX_USER_ID_LENGTH {
        return Err(anyhow!(
            "user id too long: {} chars (max: {})",
            user_id.len(),
            MAX_USER_ID_LENGTH
        ));
    }

    if !user_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '@' || c == '.')
    {
        return Err(anyhow!(
            "user id contains invalid characters (allowed: alphanumeric, -, _, @, .)"
        ));
    }

    Ok(())
}

pub fn validate_test_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("test name cannot be empty"));
    }

    if name.len() > MAX_TEST_NAME_LENGTH {
        return Err(anyhow!(
            "test name too long: {} chars (max: {})",
            name.len(),
            MAX_TEST_NAME_LENGTH
        ));
    }

    Ok(())
}

/// Validate the variant list: length, unique ids, weight range, weight sum.
pub fn validate_variants(variants: &[Variant]) -> Vec<String> {
    let mut errors = Vec::new();

    if variants.len() < 2 {
        errors.push(format!(
            "test needs at least 2 variants, got {}",
            variants.len()
        ));
    }

    if variants.len() > MAX_VARIANTS_PER_TEST {
        errors.push(format!(
            "too many variants: {} (max: {})",
            variants.len(),
            MAX_VARIANTS_PER_TEST
        ));
    }

    let mut seen = HashSet::new();
    for variant in variants {
        if variant.id.is_empty() {
            errors.push("variant id cannot be empty".to_string());
        }
        if !seen.insert(variant.id.as_str()) {
            errors.push(format!("duplicate variant id: {}", variant.id));
        }
        if !variant.weight.is_finite() || variant.weight < 0.0 || variant.weight > 100.0 {
            errors.push(format!(
                "variant {} weight must be in [0, 100], got {}",
                variant.id, variant.weight
            ));
        }
    }

    let sum: f64 = variants.iter().map(|v| v.weight).sum();
    if !variants.is_empty() && (sum - WEIGHT_SUM_TARGET).abs() > WEIGHT_SUM_TOLERANCE {
        errors.push(format!(
            "variant weights must sum to {WEIGHT_SUM_TARGET} (±{WEIGHT_SUM_TOLERANCE}), got {sum}"
        ));
    }

    errors
}

pub fn validate_minimum_sample_size(n: u64) -> Result<()> {
    if n == 0 {
        return Err(anyhow!("minimum sample size must be positive"));
    }
    Ok(())
}

pub fn validate_confidence_level(level: f64) -> Result<()> {
    if !level.is_finite() || level <= 0.0 || level >= 1.0 {
        return Err(anyhow!(
            "confidence level must be strictly between 0 and 1, got {level}"
        ));
    }
    Ok(())
}
