//! Result Verifier and retry loop
//!
//! One job is a strictly sequential pipeline:
//!
//! ```text
//! Idle → Probing → Planning → Encoding → Verifying → Succeeded
//!                     ↑                      │
//!                     └────── Retrying ←─────┤
//!                                            └→ Failed
//! ```
//!
//! Every stage may also end in `Cancelled`. Each overshoot tightens the
//! planning budget by the overshoot ratio, starting from what the failed plan
//! predicted, so every retry asks for a lower total bitrate. The verifier
//! always compares against the original effective budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_utils::{handle_error, ErrorCategory};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::advice::{refine_plan, AdviceRefiner};
use crate::budget::SizeBudget;
use crate::config::CompressionConfig;
use crate::errors::{ExecError, JobError};
use crate::executor::{execute, Artifact, CancelToken, Encoder};
use crate::media::{MediaDescriptor, Prober};
use crate::plan::{EncodingPlan, PlanSource};
use crate::planner::{plan_with, target_bytes_for};

/// Extra squeeze applied on top of the overshoot ratio.
pub const RETRY_TIGHTENING: f64 = 0.97;

// ═══════════════════════════════════════════════════════════════
// State machine
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Probing,
    Planning,
    Encoding,
    Verifying,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Idle, Probing) => true,
            (Probing, Planning) | (Probing, Failed) => true,
            (Planning, Encoding) => true,
            (Encoding, Verifying) | (Encoding, Failed) => true,
            (Verifying, Succeeded) | (Verifying, Retrying) | (Verifying, Failed) => true,
            (Retrying, Planning) => true,
            (s, Cancelled) => !s.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Probing => "probing",
            JobStatus::Planning => "planning",
            JobStatus::Encoding => "encoding",
            JobStatus::Verifying => "verifying",
            JobStatus::Retrying => "retrying",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One encode of one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionAttempt {
    #[serde(rename = "index")]
    pub attempt_index: usize,
    pub plan: EncodingPlan,
    pub source: PlanSource,
    /// Budget the plan was built against. Shrinks on every retry.
    pub planning_budget_bytes: u64,
    /// Measured size; `None` until the encode succeeds.
    #[serde(rename = "bytes")]
    pub artifact_bytes: Option<u64>,
}

#[derive(Debug)]
pub struct CompressionJob {
    pub id: String,
    pub input: PathBuf,
    pub budget: SizeBudget,
    pub descriptor: Option<MediaDescriptor>,
    pub attempts: Vec<CompressionAttempt>,
    pub status: JobStatus,
    pub final_artifact: Option<Artifact>,
}

impl CompressionJob {
    pub fn new(input: impl Into<PathBuf>, budget: SizeBudget) -> Self {
        let input = input.into();
        let id = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.display().to_string());
        Self {
            id,
            input,
            budget,
            descriptor: None,
            attempts: Vec::new(),
            status: JobStatus::Idle,
            final_artifact: None,
        }
    }

    fn transition(&mut self, next: JobStatus) {
        if !self.status.can_transition_to(next) {
            warn!(job = %self.id, from = %self.status, to = %next, "Unexpected job transition");
        }
        debug!(job = %self.id, from = %self.status, to = %next, "Job transition");
        self.status = next;
    }

    /// Source of the plan behind the accepted artifact, or of the last attempt.
    pub fn plan_source(&self) -> PlanSource {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.artifact_bytes.is_some())
            .or_else(|| self.attempts.last())
            .map(|a| a.source)
            .unwrap_or_default()
    }
}

/// Non-error endings of [`JobRunner::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Cancelled,
}

/// `current × effective / actual × 0.97`, always strictly below `current`.
pub fn tightened_budget(current: u64, effective: u64, actual_bytes: u64) -> u64 {
    if actual_bytes == 0 {
        return current;
    }
    let next = (current as f64 * effective as f64 / actual_bytes as f64 * RETRY_TIGHTENING).floor();
    (next as u64).min(current.saturating_sub(1)).max(1)
}

// ═══════════════════════════════════════════════════════════════
// JobRunner
// ═══════════════════════════════════════════════════════════════

/// Owns the collaborators a job needs. Shareable across threads; each
/// `run` call works only on the job it is handed.
pub struct JobRunner {
    prober: Arc<dyn Prober>,
    encoder: Arc<dyn Encoder>,
    advisor: Option<Arc<dyn AdviceRefiner>>,
    config: CompressionConfig,
}

impl JobRunner {
    pub fn new(prober: Arc<dyn Prober>, encoder: Arc<dyn Encoder>, config: CompressionConfig) -> Self {
        Self {
            prober,
            encoder,
            advisor: None,
            config,
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn AdviceRefiner>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Drives `job` to a terminal state.
    ///
    /// `progress` receives `(attempt_index, percent)`. On success the accepted
    /// artifact is left in `job.final_artifact`.
    pub fn run(
        &self,
        job: &mut CompressionJob,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(usize, f64),
    ) -> Result<JobOutcome, JobError> {
        if cancel.is_cancelled() {
            job.transition(JobStatus::Cancelled);
            return Ok(JobOutcome::Cancelled);
        }

        job.transition(JobStatus::Probing);
        let descriptor = match self.prober.probe(&job.input) {
            Ok(d) => d,
            Err(e) => {
                job.transition(JobStatus::Failed);
                return Err(e.into());
            }
        };
        job.descriptor = Some(descriptor.clone());

        let effective = job.budget.effective_bytes();
        let work_dir = self.config.work_dir_for(&job.input);
        let mut planning_budget = effective;
        let mut best: Option<Artifact> = None;

        info!(
            job = %job.id,
            target_bytes = job.budget.target_bytes(),
            effective_bytes = effective,
            original_bytes = descriptor.original_bytes,
            "Starting job"
        );

        for attempt_index in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                job.transition(JobStatus::Cancelled);
                return Ok(JobOutcome::Cancelled);
            }

            job.transition(JobStatus::Planning);
            let base = plan_with(&descriptor, planning_budget, &self.config.tuning);
            let (plan, source) = if attempt_index == 0 {
                refine_plan(
                    self.advisor.as_ref(),
                    &descriptor,
                    job.budget.target_bytes(),
                    target_bytes_for(&descriptor, effective, &self.config.tuning),
                    base,
                    self.config.advice_timeout,
                )
            } else {
                (base, PlanSource::Planner)
            };

            info!(
                job = %job.id,
                attempt = attempt_index,
                video_kbps = plan.video_bitrate_kbps,
                audio_kbps = plan.audio_bitrate_kbps,
                resolution = %plan.resolution(),
                qf = %plan.quality_factor,
                preset = %plan.preset_level,
                source = ?source,
                planning_budget_bytes = planning_budget,
                "Planned attempt"
            );
            job.attempts.push(CompressionAttempt {
                attempt_index,
                plan: plan.clone(),
                source,
                planning_budget_bytes: planning_budget,
                artifact_bytes: None,
            });

            job.transition(JobStatus::Encoding);
            let artifact = match self.encode_with_rerun(
                &job.id,
                &job.input,
                &descriptor,
                &plan,
                &work_dir,
                cancel,
                &mut |p| progress(attempt_index, p),
            ) {
                Ok(a) => a,
                Err(ExecError::Cancelled) => {
                    job.transition(JobStatus::Cancelled);
                    return Ok(JobOutcome::Cancelled);
                }
                Err(e) => {
                    job.transition(JobStatus::Failed);
                    return Err(e.into());
                }
            };

            job.transition(JobStatus::Verifying);
            let bytes = artifact.bytes();
            if let Some(attempt) = job.attempts.last_mut() {
                attempt.artifact_bytes = Some(bytes);
            }

            if bytes <= effective {
                info!(job = %job.id, attempt = attempt_index, bytes, effective_bytes = effective, "Artifact within budget");
                job.transition(JobStatus::Succeeded);
                job.final_artifact = Some(artifact);
                return Ok(JobOutcome::Succeeded);
            }

            warn!(
                job = %job.id,
                attempt = attempt_index,
                bytes,
                effective_bytes = effective,
                overshoot = bytes as f64 / effective as f64,
                "Artifact over budget"
            );
            // Base on the failed plan's prediction: it sits below
            // `planning_budget` when the source already fit.
            let predicted = plan.predicted_bytes(descriptor.duration_seconds).floor() as u64;
            planning_budget =
                tightened_budget(planning_budget.min(predicted.max(1)), effective, bytes);
            // Dropping the loser deletes its temp file.
            best = match best {
                Some(prev) if prev.bytes() <= bytes => Some(prev),
                _ => Some(artifact),
            };

            if attempt_index < self.config.max_retries {
                job.transition(JobStatus::Retrying);
            }
        }

        job.transition(JobStatus::Failed);
        let attempts = job.attempts.len();
        let best = best.ok_or_else(|| {
            JobError::Exec(ExecError::EncodeFailed("no attempt produced an artifact".to_string()))
        })?;
        Err(JobError::BudgetUnreachable {
            best: Box::new(best),
            attempts,
            effective_budget_bytes: effective,
        })
    }

    /// A failed encode is re-run once with the same plan. Progress reported
    /// to the caller never moves backwards across the re-run.
    #[allow(clippy::too_many_arguments)]
    fn encode_with_rerun(
        &self,
        job_id: &str,
        input: &Path,
        descriptor: &MediaDescriptor,
        plan: &EncodingPlan,
        work_dir: &Path,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<Artifact, ExecError> {
        let mut high = 0.0_f64;
        let mut forward = |p: f64| {
            if p > high {
                high = p;
                progress(p);
            }
        };
        match execute(self.encoder.as_ref(), input, descriptor, plan, work_dir, cancel, &mut forward) {
            Err(ExecError::EncodeFailed(msg)) => {
                handle_error(
                    ErrorCategory::Recoverable,
                    &format!("encode of {} (re-running once)", job_id),
                    &msg,
                );
                execute(self.encoder.as_ref(), input, descriptor, plan, work_dir, cancel, &mut forward)
            }
            other => other,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// File-level entry point
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub status: JobStatus,
    pub attempts: Vec<CompressionAttempt>,
    pub final_bytes: Option<u64>,
    pub saved_bytes: u64,
    pub original_bytes: u64,
    pub target_bytes: u64,
    pub effective_budget_bytes: u64,
    pub actual_bitrate_kbps: Option<f64>,
    pub plan_source: PlanSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    fn new(job: &CompressionJob) -> Self {
        Self {
            input: job.input.clone(),
            output: None,
            status: job.status,
            attempts: job.attempts.clone(),
            final_bytes: None,
            saved_bytes: 0,
            original_bytes: job.descriptor.as_ref().map_or(0, |d| d.original_bytes),
            target_bytes: job.budget.target_bytes(),
            effective_budget_bytes: job.budget.effective_bytes(),
            actual_bitrate_kbps: None,
            plan_source: job.plan_source(),
            error: None,
            finished_at: Utc::now(),
        }
    }

    fn with_artifact(mut self, output: PathBuf, bytes: u64, actual_kbps: f64) -> Self {
        self.output = Some(output);
        self.final_bytes = Some(bytes);
        self.saved_bytes = self.original_bytes.saturating_sub(bytes);
        self.actual_bitrate_kbps = Some(actual_kbps);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// Compresses `input` to `optimized_<stem>.mp4`.
///
/// An over-budget best effort is still written out; the report then carries
/// `Failed` and the reason. Probe and encoder failures come back as errors.
pub fn compress_file(
    runner: &JobRunner,
    input: &Path,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(usize, f64),
) -> Result<JobReport, JobError> {
    let config = runner.config();
    let budget = config.budget()?;
    let output = config.output_path_for(input);
    if output.exists() && !config.force {
        return Err(JobError::OutputExists(output));
    }
    std::fs::create_dir_all(config.work_dir_for(input))?;

    let mut job = CompressionJob::new(input, budget);
    match runner.run(&mut job, cancel, progress) {
        Ok(JobOutcome::Succeeded) => {
            let report = JobReport::new(&job);
            let artifact = job.final_artifact.take().ok_or_else(|| {
                JobError::Exec(ExecError::EncodeFailed("accepted artifact missing".to_string()))
            })?;
            let (bytes, kbps) = (artifact.bytes(), artifact.actual_bitrate_kbps());
            let saved = artifact.persist(&output, config.force)?;
            copy_mtime(config, input, &saved);
            info!(job = %job.id, output = %saved.display(), bytes, "Job succeeded");
            Ok(report.with_artifact(saved, bytes, kbps))
        }
        Ok(JobOutcome::Cancelled) => {
            info!(job = %job.id, "Job cancelled");
            Ok(JobReport::new(&job))
        }
        Err(JobError::BudgetUnreachable {
            best,
            attempts,
            effective_budget_bytes,
        }) => {
            let mut report = JobReport::new(&job);
            report.error = Some(format!(
                "budget unreachable after {} attempts: best {} bytes > {} bytes",
                attempts,
                best.bytes(),
                effective_budget_bytes
            ));
            let (bytes, kbps) = (best.bytes(), best.actual_bitrate_kbps());
            let saved = best.persist(&output, config.force)?;
            copy_mtime(config, input, &saved);
            warn!(job = %job.id, output = %saved.display(), bytes, effective_budget_bytes, "Kept best-effort artifact over budget");
            Ok(report.with_artifact(saved, bytes, kbps))
        }
        Err(e) => Err(e),
    }
}

fn copy_mtime(config: &CompressionConfig, input: &Path, output: &Path) {
    if !config.keep_mtime {
        return;
    }
    let result = std::fs::metadata(input).and_then(|meta| {
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        filetime::set_file_mtime(output, mtime)
    });
    if let Err(e) = result {
        handle_error(
            ErrorCategory::Optional,
            &format!("copy mtime to {}", output.display()),
            &e,
        );
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::executor::EncodeRequest;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Every encode comes out at a fixed multiple of the planned size.
    struct RatioEncoder {
        ratio: f64,
        duration: f64,
        calls: AtomicUsize,
    }

    impl Encoder for RatioEncoder {
        fn encode(
            &self,
            request: &EncodeRequest<'_>,
            _cancel: &CancelToken,
            _progress: &mut dyn FnMut(f64),
        ) -> Result<(), ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let size = (request.plan.predicted_bytes(self.duration) * self.ratio).max(1.0) as u64;
            let file = std::fs::File::create(request.output).unwrap();
            file.set_len(size).unwrap();
            Ok(())
        }
    }

    struct FixedProber(MediaDescriptor);

    impl Prober for FixedProber {
        fn probe(&self, _path: &Path) -> Result<MediaDescriptor, crate::errors::ProbeError> {
            Ok(self.0.clone())
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_retry_loop_terminates(
            ratio in 0.5f64..3.0,
            max_retries in 0usize..4,
            duration in 1.0f64..600.0,
            target in 200_000u64..50_000_000,
            original in 100_000u64..800_000_000,
        ) {
            let dir = tempfile::TempDir::new().unwrap();
            let descriptor = MediaDescriptor::new(duration, 1920, 1080, original).with_audio(128);
            let encoder = Arc::new(RatioEncoder { ratio, duration, calls: AtomicUsize::new(0) });
            let config = CompressionConfig {
                target_bytes: target,
                max_retries,
                output_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            };
            let runner = JobRunner::new(Arc::new(FixedProber(descriptor)), encoder.clone(), config);
            let mut job = CompressionJob::new("in.mp4", runner.config().budget().unwrap());

            let result = runner.run(&mut job, &CancelToken::new(), &mut |_, _| {});

            prop_assert!(job.attempts.len() <= max_retries + 1);
            prop_assert_eq!(encoder.calls.load(Ordering::SeqCst), job.attempts.len());
            prop_assert!(job.status.is_terminal());
            for w in job.attempts.windows(2) {
                let (prev, next) = (w[0].plan.total_bitrate_kbps(), w[1].plan.total_bitrate_kbps());
                prop_assert!(next < prev || prev <= 1, "{} kbps after {} kbps", next, prev);
            }
            match result {
                Ok(JobOutcome::Succeeded) => {
                    let bytes = job.final_artifact.as_ref().unwrap().bytes();
                    prop_assert!(bytes <= job.budget.effective_bytes());
                }
                Err(JobError::BudgetUnreachable { attempts, .. }) => {
                    prop_assert_eq!(attempts, max_retries + 1);
                }
                other => prop_assert!(false, "unexpected result {:?}", other.map_err(|e| e.to_string())),
            }
        }
    }
}
