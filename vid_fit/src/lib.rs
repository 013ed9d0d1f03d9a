//! vid-fit - Size-constrained video transcoding
//!
//! Fits a video under a byte budget:
//! - probe the source (duration, resolution, audio)
//! - plan bitrate, resolution, quality factor and preset against the budget
//! - optionally let an external advisor refine the plan (validated, time-boxed)
//! - encode with progress and cancellation
//! - verify the real size and retry with a tightened budget on overshoot
//!
//! ## Example
//! ```rust,ignore
//! use std::sync::Arc;
//! use vid_fit::{compress_file, CancelToken, CompressionConfig, FfmpegEncoder, FfprobeProber, JobRunner};
//!
//! let config = CompressionConfig { target_bytes: 25 * 1024 * 1024, ..Default::default() };
//! let encoder = FfmpegEncoder::detect(config.rate_control, config.threads)?;
//! let runner = JobRunner::new(Arc::new(FfprobeProber), Arc::new(encoder), config);
//! let report = compress_file(&runner, "clip.mov".as_ref(), &CancelToken::new(), &mut |_, _| {})?;
//! ```

pub mod advice;
pub mod budget;
pub mod config;
pub mod errors;
pub mod executor;
pub mod job;
pub mod media;
pub mod plan;
pub mod planner;

pub use advice::{
    refine_plan, validate_advice, with_timeout, AdviceRefiner, AdviceRequest, AdviceResponse,
    CommandAdvisor,
};
pub use budget::{SizeBudget, TargetPreset};
pub use config::CompressionConfig;
pub use errors::{AdviceError, BudgetError, ExecError, JobError, ProbeError};
pub use executor::{execute, Artifact, CancelToken, Encoder, FfmpegEncoder, RateControl};
pub use job::{
    compress_file, CompressionAttempt, CompressionJob, JobOutcome, JobReport, JobRunner, JobStatus,
};
pub use media::{probe_media, FfprobeProber, MediaDescriptor, Prober};
pub use plan::{EncodingPlan, PlanSource, PresetLevel};
pub use planner::{plan, plan_with, target_bytes_for, PlannerTuning};
