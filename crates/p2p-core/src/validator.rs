//! Elementwise comparison of a computed matrix against its expected value.

use serde::{Deserialize, Serialize};

/// Default tolerance for the transpose round trip.
pub const DEFAULT_EPSILON: f32 = 1e-6;

/// Outcome of comparing two buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Number of positions compared (length of the longer buffer).
    pub compared: usize,
    /// Positions where `|expected - actual| > epsilon`, plus unmatched positions.
    pub error_count: usize,
    /// Largest absolute difference over matched positions.
    pub max_abs_diff: f32,
    pub epsilon: f32,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.error_count == 0
    }
}

/// Counts positions where `expected` and `actual` differ by more than `epsilon`.
pub fn compare(expected: &[f32], actual: &[f32], epsilon: f32) -> usize {
    validate(expected, actual, epsilon).error_count
}

/// Compares two buffers and reports mismatch statistics.
///
/// A NaN on either side counts as a mismatch. When lengths differ, every
/// position present in only one buffer counts as a mismatch.
pub fn validate(expected: &[f32], actual: &[f32], epsilon: f32) -> ValidationReport {
    let mut error_count = 0;
    let mut max_abs_diff = 0.0f32;

    for (e, a) in expected.iter().zip(actual.iter()) {
        let diff = (e - a).abs();
        if diff.is_nan() || diff > epsilon {
            error_count += 1;
        }
        if diff > max_abs_diff {
            max_abs_diff = diff;
        }
    }

    let compared = expected.len().max(actual.len());
    error_count += compared - expected.len().min(actual.len());

    ValidationReport {
        compared,
        error_count,
        max_abs_diff,
        epsilon,
    }
}
