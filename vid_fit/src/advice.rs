//! Advice Refiner
//!
//! Optional, untrusted collaborator that may propose a different plan than
//! the closed-form planner. Whatever it returns is schema-checked and
//! bound-checked before use; every failure (error, timeout, rejection)
//! falls back to the planner's plan.
//!
//! The wire shape matches the hosted advice service the tool grew out of:
//!
//! ```json
//! { "targetBitrateKbps": 1500, "resolution": "1280x720",
//!   "preset": "medium", "crf": 24, "explanation": "..." }
//! ```

use serde::{Deserialize, Serialize};
use shared_utils::{handle_error, log_external_tool, QualityFactor};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::errors::AdviceError;
use crate::media::MediaDescriptor;
use crate::plan::{EncodingPlan, PlanSource, PresetLevel};

pub const DEFAULT_ADVICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Highest bitrate an advisor may ask for.
pub const MAX_ADVISED_KBPS: f64 = 100_000.0;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdviceRequest {
    pub descriptor: MediaDescriptor,
    pub target_bytes: u64,
}

/// Raw advisor answer. Nothing here is trusted until [`validate_advice`] passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdviceResponse {
    pub target_bitrate_kbps: f64,
    /// `"source"` or `"<W>x<H>"`.
    pub resolution: String,
    pub preset: String,
    pub crf: f64,
    #[serde(default)]
    pub explanation: String,
}

pub trait AdviceRefiner: Send + Sync {
    fn name(&self) -> &str;

    fn advise(&self, request: &AdviceRequest) -> Result<AdviceResponse, AdviceError>;
}

// ═══════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════

/// Turns an advisor answer into a plan, or says why it cannot be used.
///
/// Audio is not the advisor's call; `audio_kbps` comes from the planner.
pub fn validate_advice(
    response: &AdviceResponse,
    descriptor: &MediaDescriptor,
    effective_bytes: u64,
    audio_kbps: u32,
) -> Result<EncodingPlan, AdviceError> {
    let kbps = response.target_bitrate_kbps;
    if !kbps.is_finite() || kbps < 1.0 || kbps > MAX_ADVISED_KBPS {
        return Err(AdviceError::SchemaInvalid(format!(
            "bitrate {} kbps outside [1, {}]",
            kbps, MAX_ADVISED_KBPS
        )));
    }
    let video_bitrate_kbps = kbps.floor() as u32;

    let quality_factor = QualityFactor::from_f64(response.crf)
        .map_err(|e| AdviceError::SchemaInvalid(e.to_string()))?;

    let preset_level: PresetLevel = response
        .preset
        .parse()
        .map_err(|e: crate::plan::UnknownPreset| AdviceError::SchemaInvalid(e.to_string()))?;

    let (output_width, output_height) = parse_resolution(&response.resolution, descriptor)?;

    let plan = EncodingPlan {
        video_bitrate_kbps,
        audio_bitrate_kbps: audio_kbps,
        output_width,
        output_height,
        quality_factor,
        preset_level,
        explanation: if response.explanation.trim().is_empty() {
            format!(
                "advisor: {} kbps at {}x{}",
                video_bitrate_kbps, output_width, output_height
            )
        } else {
            response.explanation.trim().to_string()
        },
    };

    if !plan.fits(descriptor.duration_seconds, effective_bytes) {
        return Err(AdviceError::ExceedsBudget {
            predicted_bytes: plan.predicted_bytes(descriptor.duration_seconds).ceil() as u64,
            budget_bytes: effective_bytes,
        });
    }

    Ok(plan)
}

/// `"source"` keeps the source size (made even); `"WxH"` must be even, non-zero
/// and no larger than the source in either dimension.
fn parse_resolution(value: &str, descriptor: &MediaDescriptor) -> Result<(u32, u32), AdviceError> {
    let source = (
        (descriptor.width - descriptor.width % 2).max(2),
        (descriptor.height - descriptor.height % 2).max(2),
    );
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("source") || trimmed.eq_ignore_ascii_case("original") {
        return Ok(source);
    }

    let (w, h) = trimmed
        .split_once(['x', 'X'])
        .and_then(|(w, h)| Some((w.trim().parse::<u32>().ok()?, h.trim().parse::<u32>().ok()?)))
        .ok_or_else(|| AdviceError::SchemaInvalid(format!("malformed resolution '{}'", value)))?;

    if w == 0 || h == 0 || w % 2 != 0 || h % 2 != 0 {
        return Err(AdviceError::SchemaInvalid(format!(
            "resolution {}x{} must be even and non-zero",
            w, h
        )));
    }
    if w > source.0 || h > source.1 {
        return Err(AdviceError::SchemaInvalid(format!(
            "resolution {}x{} upscales {}x{}",
            w, h, descriptor.width, descriptor.height
        )));
    }
    Ok((w, h))
}

// ═══════════════════════════════════════════════════════════════
// Timeout and fallback
// ═══════════════════════════════════════════════════════════════

/// Runs `refiner` on a helper thread and gives up after `timeout`.
///
/// A refiner that never answers leaves its helper thread parked; it holds
/// only its own clone of the request.
pub fn with_timeout(
    refiner: Arc<dyn AdviceRefiner>,
    request: &AdviceRequest,
    timeout: Duration,
) -> Result<AdviceResponse, AdviceError> {
    let (tx, rx) = mpsc::channel();
    let request = request.clone();
    let worker = Arc::clone(&refiner);

    thread::Builder::new()
        .name(format!("advice-{}", refiner.name()))
        .spawn(move || {
            let _ = tx.send(worker.advise(&request));
        })
        .map_err(|e| AdviceError::Unavailable(format!("cannot spawn advice thread: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(AdviceError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(AdviceError::Unavailable(
            "advice thread exited without answering".to_string(),
        )),
    }
}

/// Asks the advisor, validates, and falls back to `fallback` on any failure.
///
/// Advice predicted above `budget_bytes` is rejected. Pass the size the
/// planner aimed for, so advice for a source that already fits cannot grow it.
pub fn refine_plan(
    refiner: Option<&Arc<dyn AdviceRefiner>>,
    descriptor: &MediaDescriptor,
    target_bytes: u64,
    budget_bytes: u64,
    fallback: EncodingPlan,
    timeout: Duration,
) -> (EncodingPlan, PlanSource) {
    let Some(refiner) = refiner else {
        return (fallback, PlanSource::Planner);
    };

    let request = AdviceRequest {
        descriptor: descriptor.clone(),
        target_bytes,
    };

    let outcome = with_timeout(Arc::clone(refiner), &request, timeout).and_then(|response| {
        validate_advice(
            &response,
            descriptor,
            budget_bytes,
            fallback.audio_bitrate_kbps,
        )
    });

    match outcome {
        Ok(plan) => {
            info!(
                advisor = refiner.name(),
                video_kbps = plan.video_bitrate_kbps,
                width = plan.output_width,
                height = plan.output_height,
                "Using advised plan"
            );
            (plan, PlanSource::Advisor)
        }
        Err(e) => {
            handle_error(
                e.category(),
                &format!("advice from {}", refiner.name()),
                &e,
            );
            (fallback, PlanSource::Planner)
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// CommandAdvisor
// ═══════════════════════════════════════════════════════════════

/// External program speaking JSON: request on stdin, response on stdout.
///
/// The child is killed if it outlives `timeout`.
#[derive(Debug, Clone)]
pub struct CommandAdvisor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAdvisor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Splits a command line on whitespace: `"python3 advise.py --fast"`.
    pub fn from_command_line(command: &str, timeout: Duration) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), timeout))
    }
}

impl AdviceRefiner for CommandAdvisor {
    fn name(&self) -> &str {
        &self.program
    }

    fn advise(&self, request: &AdviceRequest) -> Result<AdviceResponse, AdviceError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| AdviceError::Unavailable(format!("cannot encode request: {}", e)))?;

        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AdviceError::Unavailable(format!("{}: {}", self.program, e)))?;

        let stdout_reader = child.stdout.take().map(|mut out| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = out.read_to_string(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut err| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores stdin may close it early; that is not an error here.
            if let Err(e) = stdin.write_all(&payload) {
                debug!(error = %e, "Advisor closed stdin early");
            }
        }

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    log_external_tool(
                        &self.program,
                        &self.arg_refs(),
                        "killed after timeout",
                        None,
                        started.elapsed(),
                    );
                    return Err(AdviceError::Timeout(self.timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(AdviceError::Unavailable(e.to_string()));
                }
            }
        };

        let stdout = stdout_reader
            .map(|t| t.join().unwrap_or_default())
            .unwrap_or_default();
        let stderr = stderr_reader
            .map(|t| t.join().unwrap_or_default())
            .unwrap_or_default();

        log_external_tool(
            &self.program,
            &self.arg_refs(),
            if status.success() { &stdout } else { &stderr },
            status.code(),
            started.elapsed(),
        );

        if !status.success() {
            return Err(AdviceError::Unavailable(format!(
                "{} exited with {:?}: {}",
                self.program,
                status.code(),
                stderr.trim()
            )));
        }

        serde_json::from_str(stdout.trim())
            .map_err(|e| AdviceError::SchemaInvalid(format!("bad advisor JSON: {}", e)))
    }
}

impl CommandAdvisor {
    fn arg_refs(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::SizeBudget;
    use crate::planner;

    struct FixedAdvisor(Result<AdviceResponse, AdviceError>);

    impl AdviceRefiner for FixedAdvisor {
        fn name(&self) -> &str {
            "fixed"
        }
        fn advise(&self, _request: &AdviceRequest) -> Result<AdviceResponse, AdviceError> {
            self.0.clone()
        }
    }

    struct SleepyAdvisor(Duration);

    impl AdviceRefiner for SleepyAdvisor {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn advise(&self, _request: &AdviceRequest) -> Result<AdviceResponse, AdviceError> {
            thread::sleep(self.0);
            Ok(response(1000.0, "source"))
        }
    }

    fn response(kbps: f64, resolution: &str) -> AdviceResponse {
        AdviceResponse {
            target_bitrate_kbps: kbps,
            resolution: resolution.to_string(),
            preset: "medium".to_string(),
            crf: 23.0,
            explanation: "Balanced for 720p".to_string(),
        }
    }

    fn descriptor() -> MediaDescriptor {
        MediaDescriptor::new(120.0, 1920, 1080, 500_000_000).with_audio(0)
    }

    #[test]
    fn test_validate_accepts_sane_advice() {
        let plan = validate_advice(&response(1200.0, "1280x720"), &descriptor(), 24_500_000, 128)
            .unwrap();
        assert_eq!(plan.video_bitrate_kbps, 1200);
        assert_eq!(plan.audio_bitrate_kbps, 128);
        assert_eq!((plan.output_width, plan.output_height), (1280, 720));
        assert_eq!(plan.preset_level, PresetLevel::Medium);
        assert_eq!(plan.explanation, "Balanced for 720p");
    }

    #[test]
    fn test_validate_source_resolution() {
        let plan = validate_advice(&response(1200.0, "source"), &descriptor(), 24_500_000, 0)
            .unwrap();
        assert_eq!((plan.output_width, plan.output_height), (1920, 1080));
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let d = descriptor();
        let cases = [
            response(0.0, "1280x720"),
            response(-5.0, "1280x720"),
            response(f64::NAN, "1280x720"),
            response(250_000.0, "1280x720"),
            response(1000.0, "3840x2160"),
            response(1000.0, "1281x720"),
            response(1000.0, "0x720"),
            response(1000.0, "big"),
            AdviceResponse {
                crf: 70.0,
                ..response(1000.0, "1280x720")
            },
            AdviceResponse {
                preset: "ludicrous".to_string(),
                ..response(1000.0, "1280x720")
            },
        ];
        for case in cases {
            assert!(
                matches!(
                    validate_advice(&case, &d, 24_500_000, 128),
                    Err(AdviceError::SchemaInvalid(_))
                ),
                "accepted {:?}",
                case
            );
        }
    }

    #[test]
    fn test_over_budget_advice_discarded_for_planner_plan() {
        let d = descriptor();
        let budget = SizeBudget::new(25_000_000, 0.02).unwrap();
        let fallback = planner::plan(&d, &budget);

        // 5000 kbps for 120 s is 75 MB, far past the 24.5 MB budget.
        let greedy: Arc<dyn AdviceRefiner> =
            Arc::new(FixedAdvisor(Ok(response(5000.0, "1920x1080"))));
        assert!(matches!(
            validate_advice(&response(5000.0, "1920x1080"), &d, 24_500_000, 128),
            Err(AdviceError::ExceedsBudget { .. })
        ));

        let (plan, source) = refine_plan(
            Some(&greedy),
            &d,
            budget.target_bytes(),
            budget.effective_bytes(),
            fallback.clone(),
            Duration::from_secs(1),
        );
        assert_eq!(source, PlanSource::Planner);
        assert_eq!(plan, fallback);
    }

    #[test]
    fn test_refine_uses_valid_advice() {
        let d = descriptor();
        let fallback = planner::plan(&d, &SizeBudget::new(25_000_000, 0.02).unwrap());
        let good: Arc<dyn AdviceRefiner> =
            Arc::new(FixedAdvisor(Ok(response(1400.0, "1280x720"))));

        let (plan, source) = refine_plan(
            Some(&good),
            &d,
            25_000_000,
            24_500_000,
            fallback,
            Duration::from_secs(1),
        );
        assert_eq!(source, PlanSource::Advisor);
        assert_eq!(plan.video_bitrate_kbps, 1400);
    }

    #[test]
    fn test_refine_absorbs_errors() {
        let d = descriptor();
        let fallback = planner::plan(&d, &SizeBudget::new(25_000_000, 0.02).unwrap());
        let broken: Arc<dyn AdviceRefiner> = Arc::new(FixedAdvisor(Err(
            AdviceError::Unavailable("offline".to_string()),
        )));

        let (plan, source) = refine_plan(
            Some(&broken),
            &d,
            25_000_000,
            24_500_000,
            fallback.clone(),
            Duration::from_secs(1),
        );
        assert_eq!(source, PlanSource::Planner);
        assert_eq!(plan, fallback);

        let (plan, source) =
            refine_plan(None, &d, 25_000_000, 24_500_000, fallback.clone(), Duration::from_secs(1));
        assert_eq!(source, PlanSource::Planner);
        assert_eq!(plan, fallback);
    }

    #[test]
    fn test_with_timeout_expires() {
        let slow: Arc<dyn AdviceRefiner> = Arc::new(SleepyAdvisor(Duration::from_secs(2)));
        let request = AdviceRequest {
            descriptor: descriptor(),
            target_bytes: 25_000_000,
        };
        let started = Instant::now();
        let result = with_timeout(slow, &request, Duration::from_millis(100));
        assert_eq!(result, Err(AdviceError::Timeout(Duration::from_millis(100))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_with_timeout_passes_answer_through() {
        let quick: Arc<dyn AdviceRefiner> = Arc::new(SleepyAdvisor(Duration::from_millis(1)));
        let request = AdviceRequest {
            descriptor: descriptor(),
            target_bytes: 25_000_000,
        };
        let result = with_timeout(quick, &request, Duration::from_secs(2)).unwrap();
        assert_eq!(result.resolution, "source");
    }

    #[test]
    fn test_request_wire_format() {
        let request = AdviceRequest {
            descriptor: descriptor(),
            target_bytes: 25_000_000,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["targetBytes"], 25_000_000);
        assert_eq!(json["descriptor"]["width"], 1920);

        let parsed: AdviceResponse = serde_json::from_str(
            r#"{"targetBitrateKbps": 1500, "resolution": "1280x720", "preset": "fast", "crf": 24}"#,
        )
        .unwrap();
        assert_eq!(parsed.target_bitrate_kbps, 1500.0);
        assert!(parsed.explanation.is_empty());
    }

    #[test]
    fn test_from_command_line() {
        let advisor =
            CommandAdvisor::from_command_line("python3 advise.py --fast", DEFAULT_ADVICE_TIMEOUT)
                .unwrap();
        assert_eq!(advisor.name(), "python3");
        assert_eq!(advisor.args, vec!["advise.py", "--fast"]);
        assert!(CommandAdvisor::from_command_line("   ", DEFAULT_ADVICE_TIMEOUT).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_advisor_round_trip() {
        let script = r#"cat > /dev/null; echo '{"targetBitrateKbps": 900, "resolution": "854x480", "preset": "slow", "crf": 26, "explanation": "script"}'"#;
        let advisor = CommandAdvisor::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        );
        let request = AdviceRequest {
            descriptor: descriptor(),
            target_bytes: 25_000_000,
        };
        let response = advisor.advise(&request).unwrap();
        assert_eq!(response.target_bitrate_kbps, 900.0);
        assert_eq!(response.resolution, "854x480");
        assert_eq!(response.explanation, "script");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_advisor_failures() {
        let request = AdviceRequest {
            descriptor: descriptor(),
            target_bytes: 25_000_000,
        };

        let failing = CommandAdvisor::new(
            "sh",
            vec!["-c".to_string(), "exit 3".to_string()],
            Duration::from_secs(5),
        );
        assert!(matches!(
            failing.advise(&request),
            Err(AdviceError::Unavailable(_))
        ));

        let garbage = CommandAdvisor::new(
            "sh",
            vec!["-c".to_string(), "echo not-json".to_string()],
            Duration::from_secs(5),
        );
        assert!(matches!(
            garbage.advise(&request),
            Err(AdviceError::SchemaInvalid(_))
        ));

        let missing = CommandAdvisor::new("vid-fit-no-such-advisor", vec![], Duration::from_secs(5));
        assert!(matches!(
            missing.advise(&request),
            Err(AdviceError::Unavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_advisor_killed_on_timeout() {
        let request = AdviceRequest {
            descriptor: descriptor(),
            target_bytes: 25_000_000,
        };
        let hanging = CommandAdvisor::new(
            "sh",
            vec!["-c".to_string(), "exec sleep 30".to_string()],
            Duration::from_millis(200),
        );
        let started = Instant::now();
        assert_eq!(
            hanging.advise(&request),
            Err(AdviceError::Timeout(Duration::from_millis(200)))
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
