//! Size budget
//!
//! `effective = target × (1 − margin)`, floored to whole bytes. Every plan
//! is checked against the effective figure, never the raw target.

use serde::{Deserialize, Serialize};
use shared_utils::FileSize;
use std::fmt;

use crate::errors::BudgetError;

pub const DEFAULT_SAFETY_MARGIN: f64 = 0.02;
pub const MAX_SAFETY_MARGIN: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeBudget {
    target_bytes: u64,
    safety_margin_fraction: f64,
}

impl SizeBudget {
    pub fn new(target_bytes: u64, safety_margin_fraction: f64) -> Result<Self, BudgetError> {
        if target_bytes == 0 {
            return Err(BudgetError::ZeroTarget);
        }
        if !(0.0..=MAX_SAFETY_MARGIN).contains(&safety_margin_fraction) {
            return Err(BudgetError::MarginOutOfRange(safety_margin_fraction));
        }
        Ok(Self {
            target_bytes,
            safety_margin_fraction,
        })
    }

    pub fn with_default_margin(target_bytes: u64) -> Result<Self, BudgetError> {
        Self::new(target_bytes, DEFAULT_SAFETY_MARGIN)
    }

    pub fn target_bytes(&self) -> u64 {
        self.target_bytes
    }

    pub fn safety_margin_fraction(&self) -> f64 {
        self.safety_margin_fraction
    }

    pub fn effective_bytes(&self) -> u64 {
        (self.target_bytes as f64 * (1.0 - self.safety_margin_fraction)).floor() as u64
    }
}

impl fmt::Display for SizeBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (effective {}, margin {:.1}%)",
            FileSize::new(self.target_bytes),
            FileSize::new(self.effective_bytes()),
            self.safety_margin_fraction * 100.0
        )
    }
}

/// Common upload limits. Sizes are binary megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TargetPreset {
    Discord,
    #[value(name = "wechat")]
    WeChat,
    Social,
    #[default]
    Max,
}

impl TargetPreset {
    pub fn megabytes(&self) -> u64 {
        match self {
            TargetPreset::Discord => 25,
            TargetPreset::WeChat => 100,
            TargetPreset::Social => 500,
            TargetPreset::Max => 999,
        }
    }

    pub fn bytes(&self) -> u64 {
        FileSize::from_mb(self.megabytes()).bytes()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetPreset::Discord => "Discord (25 MB)",
            TargetPreset::WeChat => "WeChat (100 MB)",
            TargetPreset::Social => "Social (500 MB)",
            TargetPreset::Max => "Max (999 MB)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_bytes() {
        let b = SizeBudget::new(25_000_000, 0.02).unwrap();
        assert_eq!(b.effective_bytes(), 24_500_000);
        assert_eq!(SizeBudget::new(1000, 0.0).unwrap().effective_bytes(), 1000);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert_eq!(SizeBudget::new(0, 0.02), Err(BudgetError::ZeroTarget));
        assert!(matches!(
            SizeBudget::new(100, 0.25),
            Err(BudgetError::MarginOutOfRange(_))
        ));
        assert!(matches!(
            SizeBudget::new(100, -0.01),
            Err(BudgetError::MarginOutOfRange(_))
        ));
        assert!(matches!(
            SizeBudget::new(100, f64::NAN),
            Err(BudgetError::MarginOutOfRange(_))
        ));
        assert!(SizeBudget::new(100, 0.2).is_ok());
    }

    #[test]
    fn test_presets() {
        assert_eq!(TargetPreset::Discord.bytes(), 25 * 1024 * 1024);
        assert_eq!(TargetPreset::WeChat.bytes(), 100 * 1024 * 1024);
        assert_eq!(TargetPreset::Social.megabytes(), 500);
        assert_eq!(TargetPreset::default(), TargetPreset::Max);
        assert_eq!(TargetPreset::Max.bytes(), 999 * 1024 * 1024);
    }
}
