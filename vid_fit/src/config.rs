use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::advice::DEFAULT_ADVICE_TIMEOUT;
use crate::budget::{SizeBudget, TargetPreset, DEFAULT_SAFETY_MARGIN};
use crate::errors::BudgetError;
use crate::executor::RateControl;
use crate::planner::PlannerTuning;

pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const OUTPUT_PREFIX: &str = "optimized_";

/// Every knob of one compression job.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub target_bytes: u64,
    pub safety_margin: f64,
    /// Retries after the first attempt; a job makes at most `max_retries + 1` encodes.
    pub max_retries: usize,
    /// Defaults to the input's directory.
    pub output_dir: Option<PathBuf>,
    pub advice_timeout: Duration,
    pub rate_control: RateControl,
    /// ffmpeg `-threads` for this job
    pub threads: usize,
    pub force: bool,
    pub keep_mtime: bool,
    pub tuning: PlannerTuning,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            target_bytes: TargetPreset::default().bytes(),
            safety_margin: DEFAULT_SAFETY_MARGIN,
            max_retries: DEFAULT_MAX_RETRIES,
            output_dir: None,
            advice_timeout: DEFAULT_ADVICE_TIMEOUT,
            rate_control: RateControl::default(),
            threads: 1,
            force: false,
            keep_mtime: false,
            tuning: PlannerTuning::default(),
        }
    }
}

impl CompressionConfig {
    pub fn budget(&self) -> Result<SizeBudget, BudgetError> {
        SizeBudget::new(self.target_bytes, self.safety_margin)
    }

    /// `<output dir>/optimized_<stem>.mp4`
    pub fn output_path_for(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let dir = match &self.output_dir {
            Some(dir) => dir.clone(),
            None => input
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        dir.join(format!("{}{}.mp4", OUTPUT_PREFIX, stem))
    }

    /// Directory the per-attempt temp artifacts live in.
    pub fn work_dir_for(&self, input: &Path) -> PathBuf {
        self.output_path_for(input)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
