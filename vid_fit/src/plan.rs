use serde::{Deserialize, Serialize};
use shared_utils::QualityFactor;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// x264 speed/efficiency presets, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetLevel {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl PresetLevel {
    pub const ALL: [PresetLevel; 9] = [
        PresetLevel::Ultrafast,
        PresetLevel::Superfast,
        PresetLevel::Veryfast,
        PresetLevel::Faster,
        PresetLevel::Fast,
        PresetLevel::Medium,
        PresetLevel::Slow,
        PresetLevel::Slower,
        PresetLevel::Veryslow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PresetLevel::Ultrafast => "ultrafast",
            PresetLevel::Superfast => "superfast",
            PresetLevel::Veryfast => "veryfast",
            PresetLevel::Faster => "faster",
            PresetLevel::Fast => "fast",
            PresetLevel::Medium => "medium",
            PresetLevel::Slow => "slow",
            PresetLevel::Slower => "slower",
            PresetLevel::Veryslow => "veryslow",
        }
    }
}

impl fmt::Display for PresetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown preset '{0}'")]
pub struct UnknownPreset(pub String);

impl FromStr for PresetLevel {
    type Err = UnknownPreset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        PresetLevel::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| UnknownPreset(s.to_string()))
    }
}

/// Parameters for one encode. Never mutated after creation; a retry gets a new plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingPlan {
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub quality_factor: QualityFactor,
    pub preset_level: PresetLevel,
    pub explanation: String,
}

impl EncodingPlan {
    pub fn total_bitrate_kbps(&self) -> u64 {
        self.video_bitrate_kbps as u64 + self.audio_bitrate_kbps as u64
    }

    /// `(video + audio) × 1000 × duration / 8`
    pub fn predicted_bytes(&self, duration_seconds: f64) -> f64 {
        predicted_bytes(self.total_bitrate_kbps(), duration_seconds)
    }

    pub fn fits(&self, duration_seconds: f64, effective_bytes: u64) -> bool {
        self.predicted_bytes(duration_seconds) <= effective_bytes as f64
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.output_width, self.output_height)
    }
}

pub fn predicted_bytes(total_kbps: u64, duration_seconds: f64) -> f64 {
    total_kbps as f64 * 1000.0 * duration_seconds / 8.0
}

/// Where the plan used for an attempt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlanSource {
    #[default]
    Planner,
    Advisor,
}
