//! Encoding Executor
//!
//! Drives one encode of one plan into a temp artifact.
//!
//! - progress is reported as a non-decreasing percentage that ends at
//!   exactly 100 on success
//! - cancellation is polled at least every [`CANCEL_POLL_INTERVAL`]
//! - the temp artifact is a [`TempPath`]: dropping it (error, cancellation,
//!   superseded attempt) deletes the file

use serde::{Deserialize, Serialize};
use shared_utils::ffmpeg_process::{
    format_ffmpeg_error, get_error_suggestion, is_encoder_missing, FfmpegProcess,
    FfmpegProgressParser,
};
use shared_utils::log_external_tool;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::errors::ExecError;
use crate::media::MediaDescriptor;
use crate::plan::EncodingPlan;

pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ═══════════════════════════════════════════════════════════════
// Cancellation and progress
// ═══════════════════════════════════════════════════════════════

/// Cooperative cancellation flag shared between the caller and running jobs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Clamps reports into [0, 100] and drops any that would go backwards.
pub struct ProgressTracker<'a> {
    last: f64,
    sink: &'a mut dyn FnMut(f64),
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a mut dyn FnMut(f64)) -> Self {
        Self { last: 0.0, sink }
    }

    pub fn report(&mut self, percent: f64) {
        if !percent.is_finite() {
            return;
        }
        // 100 is reserved for `finish`, once the artifact is known good.
        let clamped = percent.clamp(0.0, 99.9);
        if clamped > self.last {
            self.last = clamped;
            (self.sink)(clamped);
        }
    }

    pub fn finish(&mut self) {
        self.last = 100.0;
        (self.sink)(100.0);
    }

    pub fn last(&self) -> f64 {
        self.last
    }
}

// ═══════════════════════════════════════════════════════════════
// Artifact
// ═══════════════════════════════════════════════════════════════

/// Output of one successful encode.
///
/// Owns its temp file until [`Artifact::persist`] moves it to a final name.
#[derive(Debug)]
pub struct Artifact {
    path: TempPath,
    bytes: u64,
    actual_bitrate_kbps: f64,
    width: u32,
    height: u32,
}

impl Artifact {
    pub fn new(path: TempPath, duration_seconds: f64, width: u32, height: u32) -> std::io::Result<Self> {
        let bytes = std::fs::metadata(&path)?.len();
        let actual_bitrate_kbps = if duration_seconds > 0.0 {
            bytes as f64 * 8.0 / duration_seconds / 1000.0
        } else {
            0.0
        };
        Ok(Self {
            path,
            bytes,
            actual_bitrate_kbps,
            width,
            height,
        })
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn actual_bitrate_kbps(&self) -> f64 {
        self.actual_bitrate_kbps
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Moves the artifact to `dest`. Without `overwrite` an existing `dest` is an error
    /// and the temp file is removed.
    pub fn persist(self, dest: &Path, overwrite: bool) -> std::io::Result<PathBuf> {
        let result = if overwrite {
            self.path.persist(dest)
        } else {
            self.path.persist_noclobber(dest)
        };
        result.map_err(|e| e.error)?;
        Ok(dest.to_path_buf())
    }
}

// ═══════════════════════════════════════════════════════════════
// Encoder seam
// ═══════════════════════════════════════════════════════════════

pub struct EncodeRequest<'a> {
    pub input: &'a Path,
    pub descriptor: &'a MediaDescriptor,
    pub plan: &'a EncodingPlan,
    /// Pre-created temp file the encoder must overwrite.
    pub output: &'a Path,
}

/// Something that can turn a plan into bytes on disk.
///
/// Implementations report progress in percent and must return
/// [`ExecError::Cancelled`] within [`CANCEL_POLL_INTERVAL`] of `cancel` tripping.
pub trait Encoder: Send + Sync {
    fn encode(
        &self,
        request: &EncodeRequest<'_>,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), ExecError>;
}

/// Runs one encode into a fresh temp file under `work_dir`.
///
/// On any error the temp file is gone by the time this returns.
pub fn execute(
    encoder: &dyn Encoder,
    input: &Path,
    descriptor: &MediaDescriptor,
    plan: &EncodingPlan,
    work_dir: &Path,
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(f64),
) -> Result<Artifact, ExecError> {
    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled);
    }

    let temp = tempfile::Builder::new()
        .prefix(".vid-fit-")
        .suffix(".mp4")
        .tempfile_in(work_dir)
        .map_err(|e| ExecError::EncodeFailed(format!("cannot create temp file: {}", e)))?
        .into_temp_path();

    let mut tracker = ProgressTracker::new(on_progress);
    let request = EncodeRequest {
        input,
        descriptor,
        plan,
        output: &temp,
    };

    let started = Instant::now();
    encoder.encode(&request, cancel, &mut |p| tracker.report(p))?;

    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled);
    }

    let artifact = Artifact::new(
        temp,
        descriptor.duration_seconds,
        plan.output_width,
        plan.output_height,
    )
    .map_err(|e| ExecError::EncodeFailed(format!("cannot stat output: {}", e)))?;

    if artifact.bytes() == 0 {
        return Err(ExecError::EncodeFailed("encoder produced an empty file".to_string()));
    }

    tracker.finish();
    info!(
        bytes = artifact.bytes(),
        actual_kbps = artifact.actual_bitrate_kbps(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Encode finished"
    );
    Ok(artifact)
}

// ═══════════════════════════════════════════════════════════════
// FfmpegEncoder
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RateControl {
    /// Constant quality capped at the planned bitrate
    #[default]
    CappedCrf,
    /// Average bitrate at the planned rate
    Average,
}

impl fmt::Display for RateControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateControl::CappedCrf => f.write_str("capped-crf"),
            RateControl::Average => f.write_str("average"),
        }
    }
}

/// libx264 + AAC into MP4 via the system `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
    rate_control: RateControl,
    threads: usize,
}

impl FfmpegEncoder {
    pub fn new(program: PathBuf, rate_control: RateControl, threads: usize) -> Self {
        Self {
            program,
            rate_control,
            threads: threads.max(1),
        }
    }

    /// Locates `ffmpeg` on PATH.
    pub fn detect(rate_control: RateControl, threads: usize) -> Result<Self, ExecError> {
        let program = which::which("ffmpeg").map_err(|_| {
            ExecError::EncoderUnavailable("ffmpeg not found in PATH (install ffmpeg)".to_string())
        })?;
        Ok(Self::new(program, rate_control, threads))
    }

    pub fn build_args(&self, request: &EncodeRequest<'_>) -> Vec<String> {
        let plan = request.plan;
        let v = plan.video_bitrate_kbps;

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-threads".into(),
            self.threads.to_string(),
            "-i".into(),
            request.input.display().to_string(),
            "-map".into(),
            "0:v:0".into(),
        ];
        if plan.audio_bitrate_kbps > 0 {
            args.extend(["-map".into(), "0:a:0?".into()]);
        }

        args.extend([
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            plan.preset_level.as_str().into(),
        ]);
        match self.rate_control {
            RateControl::CappedCrf => args.extend([
                "-crf".into(),
                plan.quality_factor.value().to_string(),
                "-maxrate".into(),
                format!("{}k", v),
                "-bufsize".into(),
                format!("{}k", v.saturating_mul(2)),
            ]),
            RateControl::Average => args.extend([
                "-b:v".into(),
                format!("{}k", v),
                "-maxrate".into(),
                format!("{}k", v),
                "-bufsize".into(),
                format!("{}k", v.saturating_mul(2)),
            ]),
        }

        args.extend([
            "-vf".into(),
            format!("scale={}:{}", plan.output_width, plan.output_height),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]);

        if plan.audio_bitrate_kbps > 0 {
            args.extend([
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                format!("{}k", plan.audio_bitrate_kbps),
            ]);
        } else {
            args.push("-an".into());
        }

        args.extend([
            "-movflags".into(),
            "+faststart".into(),
            "-progress".into(),
            "pipe:1".into(),
            "-nostats".into(),
            "-f".into(),
            "mp4".into(),
            request.output.display().to_string(),
        ]);
        args
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(
        &self,
        request: &EncodeRequest<'_>,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), ExecError> {
        let args = self.build_args(request);
        let mut cmd = Command::new(&self.program);
        cmd.args(&args);

        let started = Instant::now();
        let mut process = FfmpegProcess::spawn(&mut cmd)
            .map_err(|e| ExecError::EncoderUnavailable(format!("{:#}", e)))?;
        let lines = process
            .progress_lines()
            .ok_or_else(|| ExecError::EncodeFailed("ffmpeg stdout unavailable".to_string()))?;

        let mut parser = FfmpegProgressParser::with_duration(request.descriptor.duration_seconds);
        loop {
            if cancel.is_cancelled() {
                info!(pid = process.id(), "Cancelling encode");
                if let Err(e) = process.kill() {
                    warn!(error = %e, "Failed to kill ffmpeg");
                }
                return Err(ExecError::Cancelled);
            }
            match lines.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(line) => {
                    if let Some(fraction) = parser.parse_line(&line) {
                        progress(fraction * 100.0);
                    }
                    if parser.is_finished() {
                        debug!(frame = parser.current_frame(), "ffmpeg reported progress=end");
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let (status, stderr) = process
            .wait_with_output()
            .map_err(|e| ExecError::EncodeFailed(format!("{:#}", e)))?;

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        log_external_tool("ffmpeg", &arg_refs, &stderr, status.code(), started.elapsed());

        if status.success() {
            debug!(speed = parser.current_speed(), "ffmpeg exited cleanly");
            return Ok(());
        }
        if is_encoder_missing(&stderr) {
            return Err(ExecError::EncoderUnavailable(format_ffmpeg_error(&stderr)));
        }
        let mut message = format_ffmpeg_error(&stderr);
        if let Some(hint) = get_error_suggestion(&stderr) {
            message.push_str(&format!(" ({})", hint));
        }
        Err(ExecError::EncodeFailed(message))
    }
}
