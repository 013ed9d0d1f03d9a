//! Bitrate Planner
//!
//! Pure, deterministic mapping from (descriptor, effective budget) to an
//! [`EncodingPlan`]. No I/O; extreme inputs are clamped, never rejected.
//!
//! ## Bound
//!
//! The predicted size `(video + audio) × 1000 × duration / 8` never exceeds
//! the effective budget as long as the budget carries at least 1 kbps for
//! the whole duration (125 bytes per second). Below that nothing fits and
//! the plan degrades to 1 kbps video with no audio.
//!
//! ## Resolution ladder
//!
//! Candidates are the source resolution followed by every ladder tier whose
//! short side is strictly smaller than the source's. The first candidate
//! whose bits per pixel per frame clears the watchability floor wins; if
//! none does, the last (smallest) candidate is used. Tiers never upscale.

use shared_utils::{FileSize, QualityFactor};
use tracing::{debug, warn};

use crate::budget::SizeBudget;
use crate::media::MediaDescriptor;
use crate::plan::{predicted_bytes, EncodingPlan, PresetLevel};

/// Every tunable threshold the planner uses.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerTuning {
    /// Below this the video is considered unwatchable at the current size.
    pub min_video_kbps: u32,
    pub max_video_kbps: u32,
    /// Bits per pixel per frame needed to keep a resolution.
    pub bpp_floor: f64,
    /// Short-side tiers, largest first. The last entry is the floor tier.
    pub ladder: Vec<u32>,
    /// Share of the original size targeted when the source already fits.
    pub under_budget_fraction: f64,
    pub default_audio_kbps: u32,
    /// Source audio up to this rate is kept as is.
    pub max_reused_audio_kbps: u32,
    /// Audio step-down when the budget cannot carry the preferred rate.
    pub audio_fallback_kbps: Vec<u32>,
    pub quality_factor_min: u8,
    pub quality_factor_max: u8,
    /// Quality factor at `quality_anchor_bpp`.
    pub quality_anchor: f64,
    pub quality_anchor_bpp: f64,
    /// Quality factor change per doubling of bits per pixel.
    pub quality_slope: f64,
    /// `(max duration seconds, preset)` pairs, ascending.
    pub preset_thresholds: Vec<(f64, PresetLevel)>,
    pub long_source_preset: PresetLevel,
}

impl Default for PlannerTuning {
    fn default() -> Self {
        Self {
            min_video_kbps: 100,
            max_video_kbps: 8000,
            bpp_floor: 0.045,
            ladder: vec![1080, 720, 480],
            under_budget_fraction: 0.70,
            default_audio_kbps: 128,
            max_reused_audio_kbps: 160,
            audio_fallback_kbps: vec![96, 64, 32],
            quality_factor_min: 18,
            quality_factor_max: 30,
            quality_anchor: 23.0,
            quality_anchor_bpp: 0.1,
            quality_slope: 6.0,
            preset_thresholds: vec![
                (60.0, PresetLevel::Slow),
                (600.0, PresetLevel::Medium),
                (1800.0, PresetLevel::Fast),
                (3600.0, PresetLevel::Faster),
            ],
            long_source_preset: PresetLevel::Veryfast,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Entry points
// ═══════════════════════════════════════════════════════════════

pub fn plan(descriptor: &MediaDescriptor, budget: &SizeBudget) -> EncodingPlan {
    plan_with(descriptor, budget.effective_bytes(), &PlannerTuning::default())
}

/// Plans against an explicit effective budget. The retry loop calls this
/// with a tightened figure.
pub fn plan_with(
    descriptor: &MediaDescriptor,
    effective_bytes: u64,
    tuning: &PlannerTuning,
) -> EncodingPlan {
    let duration = sanitize_duration(descriptor.duration_seconds);
    let fps = if descriptor.frame_rate.is_finite() && descriptor.frame_rate > 0.0 {
        descriptor.frame_rate
    } else {
        shared_utils::ffprobe::FALLBACK_FRAME_RATE
    };

    let under_budget = descriptor.original_bytes <= effective_bytes;
    let target_bytes = target_bytes_for(descriptor, effective_bytes, tuning);

    let total_kbps = max_total_kbps(target_bytes, duration);
    let audio_kbps = select_audio_kbps(descriptor, total_kbps, tuning);

    let mut video_kbps = total_kbps
        .saturating_sub(audio_kbps as u64)
        .min(tuning.max_video_kbps as u64) as u32;
    if video_kbps == 0 {
        warn!(
            effective_bytes,
            duration_secs = duration,
            "Budget cannot carry 1 kbps, planning the minimum"
        );
        video_kbps = 1;
    }

    let candidates = ladder_candidates(descriptor.width, descriptor.height, &tuning.ladder);
    let mut chosen = candidates[0];
    let mut steps = 0usize;
    for (i, &(w, h)) in candidates.iter().enumerate() {
        chosen = (w, h);
        steps = i;
        if bits_per_pixel(video_kbps, w, h, fps) >= tuning.bpp_floor {
            break;
        }
    }
    let (output_width, output_height) = chosen;
    let bpp = bits_per_pixel(video_kbps, output_width, output_height, fps);
    let quality_factor = quality_factor_for_bpp(bpp, tuning);
    let preset_level = preset_for_duration(duration, tuning);

    let predicted = predicted_bytes(video_kbps as u64 + audio_kbps as u64, duration);
    let mut explanation = format!(
        "{} kbps video + {} kbps audio at {}x{} ({:.3} bits/pixel), CRF {}, preset {}; predicted {} of {} budget",
        video_kbps,
        audio_kbps,
        output_width,
        output_height,
        bpp,
        quality_factor,
        preset_level,
        FileSize::new(predicted as u64),
        FileSize::new(effective_bytes),
    );
    if under_budget {
        explanation.push_str(&format!(
            "; source already fits, targeting {:.0}% of original",
            tuning.under_budget_fraction * 100.0
        ));
    }
    if steps > 0 {
        explanation.push_str(&format!(
            "; stepped down from {}x{}",
            candidates[0].0, candidates[0].1
        ));
    }
    if (video_kbps as u64) < tuning.min_video_kbps as u64 {
        explanation.push_str("; below minimum viable bitrate");
    }

    debug!(
        video_kbps,
        audio_kbps,
        width = output_width,
        height = output_height,
        bpp,
        qf = quality_factor.value(),
        preset = %preset_level,
        predicted_bytes = predicted,
        effective_bytes,
        "Planned encode"
    );

    EncodingPlan {
        video_bitrate_kbps: video_kbps,
        audio_bitrate_kbps: audio_kbps,
        output_width,
        output_height,
        quality_factor,
        preset_level,
        explanation,
    }
}

// ═══════════════════════════════════════════════════════════════
// Building blocks
// ═══════════════════════════════════════════════════════════════

/// Size a plan aims for: the whole budget, or a reduced share of the
/// original when the source already fits. Never above `effective_bytes`.
pub fn target_bytes_for(descriptor: &MediaDescriptor, effective_bytes: u64, tuning: &PlannerTuning) -> u64 {
    if descriptor.original_bytes <= effective_bytes {
        ((descriptor.original_bytes as f64 * tuning.under_budget_fraction).floor() as u64)
            .min(effective_bytes)
    } else {
        effective_bytes
    }
}

fn sanitize_duration(duration: f64) -> f64 {
    if duration.is_finite() {
        duration.max(0.001)
    } else {
        1.0
    }
}

/// Largest whole kbps whose predicted size over `duration` stays within `target_bytes`.
pub fn max_total_kbps(target_bytes: u64, duration_seconds: f64) -> u64 {
    let exact = target_bytes as f64 * 8.0 / (duration_seconds * 1000.0);
    let mut total = exact.floor() as u64;
    // Float rounding can land one step high.
    while total > 0 && predicted_bytes(total, duration_seconds) > target_bytes as f64 {
        total -= 1;
    }
    total
}

/// Preferred audio rate, stepped down until the minimum video rate fits.
pub fn select_audio_kbps(
    descriptor: &MediaDescriptor,
    total_kbps: u64,
    tuning: &PlannerTuning,
) -> u32 {
    if !descriptor.has_audio {
        return 0;
    }

    let source = descriptor.audio_bitrate_kbps;
    let preferred = if source > 0 && source <= tuning.max_reused_audio_kbps {
        source
    } else {
        tuning.default_audio_kbps
    };

    std::iter::once(preferred)
        .chain(
            tuning
                .audio_fallback_kbps
                .iter()
                .copied()
                .filter(|&kbps| kbps < preferred),
        )
        .find(|&kbps| total_kbps >= kbps as u64 + tuning.min_video_kbps as u64)
        .unwrap_or(0)
}

/// Source resolution (made even) followed by every smaller ladder tier.
pub fn ladder_candidates(width: u32, height: u32, ladder: &[u32]) -> Vec<(u32, u32)> {
    let source = (make_even(width), make_even(height));
    let source_short = width.min(height);

    let mut candidates = vec![source];
    for &tier in ladder {
        if tier < source_short {
            let scaled = scale_to_short_side(width, height, tier);
            if candidates.last() != Some(&scaled) {
                candidates.push(scaled);
            }
        }
    }
    candidates
}

/// Scales so the short side equals `short`, keeping aspect and orientation.
pub fn scale_to_short_side(width: u32, height: u32, short: u32) -> (u32, u32) {
    let (src_short, src_long) = if width <= height {
        (width, height)
    } else {
        (height, width)
    };
    let exact_long = src_long as f64 * short as f64 / src_short.max(1) as f64;
    let long = ((exact_long / 2.0).round() as u32 * 2).max(2);
    let (s, l) = (make_even(short), long);
    if width <= height {
        (s, l)
    } else {
        (l, s)
    }
}

fn make_even(v: u32) -> u32 {
    (v - v % 2).max(2)
}

pub fn bits_per_pixel(video_kbps: u32, width: u32, height: u32, fps: f64) -> f64 {
    let pixels_per_second = width as f64 * height as f64 * fps;
    if pixels_per_second <= 0.0 {
        return 0.0;
    }
    video_kbps as f64 * 1000.0 / pixels_per_second
}

/// `clamp(round(anchor − slope × log2(bpp / anchor_bpp)), min, max)`; decreasing in bpp.
pub fn quality_factor_for_bpp(bpp: f64, tuning: &PlannerTuning) -> QualityFactor {
    let raw = if bpp > 0.0 {
        tuning.quality_anchor - tuning.quality_slope * (bpp / tuning.quality_anchor_bpp).log2()
    } else {
        f64::INFINITY
    };
    let bounded = raw
        .round()
        .clamp(tuning.quality_factor_min as f64, tuning.quality_factor_max as f64);
    QualityFactor::clamped(bounded)
}

/// Longer sources get faster presets to bound wall-clock time.
pub fn preset_for_duration(duration_seconds: f64, tuning: &PlannerTuning) -> PresetLevel {
    tuning
        .preset_thresholds
        .iter()
        .find(|(max_secs, _)| duration_seconds <= *max_secs)
        .map(|(_, preset)| *preset)
        .unwrap_or(tuning.long_source_preset)
}
