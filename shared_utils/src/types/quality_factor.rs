//! Quality Factor Type-Safe Wrapper
//!
//! Constant-quality encoder parameter for x264-style encoders.
//! Lower values mean higher fidelity at a higher bitrate cost.
//!
//! Validated once on creation so downstream code never re-checks the range.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Best quality (lossless for x264)
pub const QUALITY_FACTOR_MIN: u8 = 0;

/// Worst quality accepted by x264
pub const QUALITY_FACTOR_MAX: u8 = 51;

/// Encoder default
pub const QUALITY_FACTOR_DEFAULT: u8 = 23;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QualityFactorError {
    #[error("quality factor {value} out of range [{min}, {max}]")]
    OutOfRange { value: i64, min: u8, max: u8 },

    #[error("quality factor is NaN or infinite")]
    InvalidFloat,
}

/// Type-safe quality factor in `[0, 51]`.
///
/// # Examples
/// ```
/// use shared_utils::types::QualityFactor;
///
/// let qf = QualityFactor::new(23).unwrap();
/// assert_eq!(qf.value(), 23);
///
/// assert!(QualityFactor::new(60).is_err());
/// assert_eq!(QualityFactor::clamped(-5.0).value(), 0);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct QualityFactor(u8);

impl QualityFactor {
    pub fn new(value: i64) -> Result<Self, QualityFactorError> {
        if value < QUALITY_FACTOR_MIN as i64 || value > QUALITY_FACTOR_MAX as i64 {
            return Err(QualityFactorError::OutOfRange {
                value,
                min: QUALITY_FACTOR_MIN,
                max: QUALITY_FACTOR_MAX,
            });
        }
        Ok(Self(value as u8))
    }

    /// Rounds and validates a float, as produced by external advice.
    pub fn from_f64(value: f64) -> Result<Self, QualityFactorError> {
        if !value.is_finite() {
            return Err(QualityFactorError::InvalidFloat);
        }
        Self::new(value.round() as i64)
    }

    /// Rounds and clamps into range. NaN maps to the default.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self::default();
        }
        let v = value
            .round()
            .clamp(QUALITY_FACTOR_MIN as f64, QUALITY_FACTOR_MAX as f64);
        Self(v as u8)
    }

    #[inline]
    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl Default for QualityFactor {
    fn default() -> Self {
        Self(QUALITY_FACTOR_DEFAULT)
    }
}

impl fmt::Debug for QualityFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QualityFactor({})", self.0)
    }
}

impl fmt::Display for QualityFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for QualityFactor {
    type Error = QualityFactorError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QualityFactor> for u8 {
    fn from(qf: QualityFactor) -> Self {
        qf.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        assert!(QualityFactor::new(0).is_ok());
        assert!(QualityFactor::new(51).is_ok());
        assert!(QualityFactor::new(-1).is_err());
        assert!(QualityFactor::new(52).is_err());
    }

    #[test]
    fn test_from_f64() {
        assert_eq!(QualityFactor::from_f64(22.6).unwrap().value(), 23);
        assert_eq!(
            QualityFactor::from_f64(f64::NAN),
            Err(QualityFactorError::InvalidFloat)
        );
        assert!(matches!(
            QualityFactor::from_f64(70.0),
            Err(QualityFactorError::OutOfRange { value: 70, .. })
        ));
    }

    #[test]
    fn test_clamped() {
        assert_eq!(QualityFactor::clamped(-3.0).value(), 0);
        assert_eq!(QualityFactor::clamped(99.0).value(), 51);
        assert_eq!(QualityFactor::clamped(f64::NAN).value(), 23);
        assert_eq!(QualityFactor::clamped(f64::INFINITY).value(), 51);
    }

    #[test]
    fn test_serde() {
        let qf = QualityFactor::new(28).unwrap();
        assert_eq!(serde_json::to_string(&qf).unwrap(), "28");
        let back: QualityFactor = serde_json::from_str("28").unwrap();
        assert_eq!(back, qf);
        assert!(serde_json::from_str::<QualityFactor>("77").is_err());
    }
}
