//! Shared Utilities for vid-fit tools
//!
//! Common functionality that knows nothing about budgets or plans:
//! - FFprobe wrapper for header-only media inspection
//! - FFmpeg process management (deadlock-free pipes, progress parsing)
//! - Logging initialisation and external tool records
//! - Type-safe size and quality-factor wrappers
//! - Batch input collection and summary reporting
//! - Error categories

pub mod batch;
pub mod error_handler;
pub mod ffmpeg_process;
pub mod ffprobe;
pub mod logging;
pub mod report;
pub mod types;

pub use batch::{collect_files, expand_inputs, BatchResult, SUPPORTED_VIDEO_EXTENSIONS};
pub use error_handler::{handle_error, ErrorCategory};
pub use ffmpeg_process::{format_ffmpeg_error, FfmpegProcess, FfmpegProgressParser};
pub use ffprobe::{is_ffprobe_available, probe_video, FFprobeError, FFprobeResult};
pub use logging::{init_logging, log_external_tool, LogConfig};
pub use report::{format_bytes, format_duration, print_summary_report};
pub use types::{FileSize, QualityFactor, QualityFactorError};
