use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::field::MAX_CONFIDENCE;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdError {
    #[error("threshold {0} is outside 0..=100")]
    OutOfRange(f32),
    #[error("thresholds must satisfy low <= medium <= high (got {low}/{medium}/{high})")]
    Unordered { low: f32, medium: f32, high: f32 },
}

/// Confidence cut-offs on the service's 0–100 scale.
///
/// Scores at or above `high` are shown as-is; scores in `[low, high)` are
/// shown flagged for verification; scores below `low` are suppressed.
/// `medium` is carried for operators and reporting but does not split the
/// flagged band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    low: f32,
    medium: f32,
    high: f32,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self { low: 50.0, medium: 70.0, high: 90.0 }
    }
}

impl ConfidenceThresholds {
    pub fn new(low: f32, medium: f32, high: f32) -> Result<Self, ThresholdError> {
        for t in [low, medium, high] {
            if !(0.0..=MAX_CONFIDENCE).contains(&t) {
                return Err(ThresholdError::OutOfRange(t));
            }
        }
        if !(low <= medium && medium <= high) {
            return Err(ThresholdError::Unordered { low, medium, high });
        }
        Ok(Self { low, medium, high })
    }

    pub fn low(&self) -> f32 {
        self.low
    }

    pub fn medium(&self) -> f32 {
        self.medium
    }

    pub fn high(&self) -> f32 {
        self.high
    }
}
