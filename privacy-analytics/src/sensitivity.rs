//! Sensitivity of each query shape: the largest change one record can cause
//! in the released value.
//!
//! Means use the bounded-mean mechanism: every contribution is clamped to the
//! field's `[lo, hi]`, groups smaller than `min_group_size` are withheld, and
//! the sensitivity is `(hi - lo) / min_group_size`. The count is never
//! released alongside the mean, so no second budget charge is needed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::QueryShape;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueBounds {
    pub lo: f64,
    pub hi: f64,
}

impl ValueBounds {
    pub fn new(lo: f64, hi: f64) -> Result<Self, SensitivityError> {
        let bounds = Self { lo, hi };
        bounds.validate()?;
        Ok(bounds)
    }

    pub fn validate(&self) -> Result<(), SensitivityError> {
        if !self.lo.is_finite() || !self.hi.is_finite() || self.hi <= self.lo {
            return Err(SensitivityError::InvalidBounds {
                lo: self.lo,
                hi: self.hi,
            });
        }
        Ok(())
    }

    pub fn width(&self) -> f64 {
        self.hi - self.lo
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lo, self.hi)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensitivityError {
    #[error("{shape} query has no declared value bounds")]
    UnboundedDomain { shape: &'static str },
    #[error("value bounds [{lo}, {hi}] are not a finite, non-empty interval")]
    InvalidBounds { lo: f64, hi: f64 },
    #[error("minimum group size must be at least 1")]
    InvalidMinGroupSize,
}

/// Derived per query and discarded after noise calibration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensitivityProfile {
    pub shape: QueryShape,
    pub sensitivity: f64,
    pub bounds: Option<ValueBounds>,
    pub min_group_size: Option<u32>,
}

/// L1 sensitivity of a sum over values clamped to `bounds`.
pub fn sum_sensitivity(bounds: &ValueBounds) -> f64 {
    bounds.width()
}

pub fn bounded_mean_sensitivity(bounds: &ValueBounds, min_group_size: u32) -> f64 {
    sum_sensitivity(bounds) / f64::from(min_group_size)
}

pub fn sensitivity(
    shape: QueryShape,
    bounds: Option<ValueBounds>,
    min_group_size: u32,
) -> Result<SensitivityProfile, SensitivityError> {
    match shape {
        QueryShape::Count | QueryShape::GroupedCount => Ok(SensitivityProfile {
            shape,
            sensitivity: 1.0,
            bounds: None,
            min_group_size: None,
        }),
        QueryShape::Mean | QueryShape::GroupedMean => {
            let bounds = bounds.ok_or(SensitivityError::UnboundedDomain {
                shape: shape.as_str(),
            })?;
            bounds.validate()?;
            if min_group_size == 0 {
                return Err(SensitivityError::InvalidMinGroupSize);
            }
            Ok(SensitivityProfile {
                shape,
                sensitivity: bounded_mean_sensitivity(&bounds, min_group_size),
                bounds: Some(bounds),
                min_group_size: Some(min_group_size),
            })
        }
    }
}
