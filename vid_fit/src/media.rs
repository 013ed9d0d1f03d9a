//! Metadata Prober
//!
//! Header-only inspection of an input container into a [`MediaDescriptor`].
//! No frames are decoded; the probe process is always reaped before
//! returning.

use serde::{Deserialize, Serialize};
use shared_utils::ffprobe::{self, FFprobeResult, FALLBACK_FRAME_RATE};
use std::path::Path;
use tracing::{debug, info};

use crate::errors::ProbeError;

/// What the planner needs to know about a source. Immutable once probed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub original_bytes: u64,
    pub has_audio: bool,
    /// 0 when the container does not state it.
    pub audio_bitrate_kbps: u32,
    pub frame_rate: f64,
    #[serde(default)]
    pub video_codec: String,
    #[serde(default)]
    pub container: String,
}

impl MediaDescriptor {
    /// Silent 30 fps source; mostly for tests and the `plan` command.
    pub fn new(duration_seconds: f64, width: u32, height: u32, original_bytes: u64) -> Self {
        Self {
            duration_seconds,
            width,
            height,
            original_bytes,
            has_audio: false,
            audio_bitrate_kbps: 0,
            frame_rate: FALLBACK_FRAME_RATE,
            video_codec: String::new(),
            container: String::new(),
        }
    }

    pub fn with_audio(mut self, audio_bitrate_kbps: u32) -> Self {
        self.has_audio = true;
        self.audio_bitrate_kbps = audio_bitrate_kbps;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Rejects descriptors the planner cannot reason about.
    pub fn validate(&self) -> Result<(), ProbeError> {
        if !(self.duration_seconds.is_finite() && self.duration_seconds > 0.0) {
            return Err(ProbeError::CorruptHeader(format!(
                "invalid duration: {}",
                self.duration_seconds
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ProbeError::CorruptHeader(format!(
                "invalid dimensions: {}x{}",
                self.width, self.height
            )));
        }
        if self.original_bytes == 0 {
            return Err(ProbeError::CorruptHeader("empty file".to_string()));
        }
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(ProbeError::CorruptHeader(format!(
                "invalid frame rate: {}",
                self.frame_rate
            )));
        }
        Ok(())
    }
}

impl TryFrom<FFprobeResult> for MediaDescriptor {
    type Error = ProbeError;

    fn try_from(probe: FFprobeResult) -> Result<Self, Self::Error> {
        let audio_bitrate_kbps = if probe.has_audio {
            probe
                .audio_bit_rate
                .map(|bps| ((bps + 500) / 1000).min(u32::MAX as u64) as u32)
                .unwrap_or(0)
        } else {
            0
        };

        let descriptor = MediaDescriptor {
            duration_seconds: probe.duration,
            width: probe.width,
            height: probe.height,
            original_bytes: probe.size,
            has_audio: probe.has_audio,
            audio_bitrate_kbps,
            frame_rate: probe.frame_rate,
            video_codec: probe.video_codec,
            container: probe.format_name,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Source of media descriptors.
pub trait Prober: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError>;
}

/// Probes with the system `ffprobe`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfprobeProber;

impl Prober for FfprobeProber {
    fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError> {
        probe_media(path)
    }
}

pub fn probe_media(path: &Path) -> Result<MediaDescriptor, ProbeError> {
    debug!(path = %path.display(), "Probing media");
    let probe = ffprobe::probe_video(path)?;
    let descriptor = MediaDescriptor::try_from(probe)?;

    info!(
        path = %path.display(),
        duration_secs = descriptor.duration_seconds,
        width = descriptor.width,
        height = descriptor.height,
        fps = descriptor.frame_rate,
        bytes = descriptor.original_bytes,
        audio_kbps = descriptor.audio_bitrate_kbps,
        codec = %descriptor.video_codec,
        "Probed media"
    );
    Ok(descriptor)
}
