use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use shared_utils::{
    expand_inputs, handle_error, init_logging, is_ffprobe_available, print_summary_report,
    BatchResult, ErrorCategory, FileSize, LogConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, Level};

use vid_fit::budget::DEFAULT_SAFETY_MARGIN;
use vid_fit::config::DEFAULT_MAX_RETRIES;
use vid_fit::{
    compress_file, plan_with, probe_media, CancelToken, CommandAdvisor, CompressionConfig,
    FfmpegEncoder, FfprobeProber, JobError, JobReport, JobRunner, JobStatus, RateControl,
    TargetPreset,
};

#[derive(Parser)]
#[command(name = "vid-fit")]
#[command(version, about = "Fit videos under a target file size", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Target size in MB (1 MB = 1024 × 1024 bytes)
    #[arg(long, conflicts_with_all = ["target_bytes", "preset"])]
    target_mb: Option<f64>,

    /// Target size in bytes
    #[arg(long, conflicts_with = "preset")]
    target_bytes: Option<u64>,

    /// Named upload limit [default: max]
    #[arg(long, value_enum)]
    preset: Option<TargetPreset>,

    /// Share of the target held back for container overhead (0 to 0.2)
    #[arg(long, default_value_t = DEFAULT_SAFETY_MARGIN)]
    safety_margin: f64,
}

impl TargetArgs {
    fn resolve_bytes(&self) -> anyhow::Result<u64> {
        if let Some(bytes) = self.target_bytes {
            return Ok(bytes);
        }
        if let Some(mb) = self.target_mb {
            if !mb.is_finite() || mb <= 0.0 {
                bail!("--target-mb must be a positive number, got {}", mb);
            }
            return Ok(FileSize::from_mb_f64(mb).bytes());
        }
        Ok(self.preset.unwrap_or_default().bytes())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compress files or directories to fit the target size
    #[command(name = "run")]
    Run {
        #[arg(value_name = "INPUT", required = true)]
        inputs: Vec<PathBuf>,
        #[command(flatten)]
        target: TargetArgs,
        #[arg(short, long)]
        recursive: bool,
        /// Re-encodes allowed after the first attempt overshoots
        #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
        max_retries: usize,
        /// Output directory [default: next to each input]
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// External advice command (JSON request on stdin, JSON plan on stdout)
        #[arg(long, value_name = "CMD")]
        advisor: Option<String>,
        #[arg(long, default_value_t = 5)]
        advice_timeout_secs: u64,
        #[arg(long, value_enum, default_value_t = RateControl::CappedCrf)]
        rate_control: RateControl,
        /// Independent jobs run concurrently
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
        /// Print job reports as JSON instead of the summary
        #[arg(long)]
        json: bool,
        #[arg(short, long)]
        force: bool,
        /// Copy the input's modification time onto the output
        #[arg(long)]
        keep_mtime: bool,
    },

    /// Probe and print the plan without encoding
    Plan {
        #[arg(value_name = "INPUT")]
        input: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        json: bool,
    },

    /// Print the media descriptor as JSON
    Probe {
        #[arg(value_name = "INPUT")]
        input: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    if let Err(e) = init_logging("vid_fit", LogConfig::default().with_level(level)) {
        eprintln!("⚠️  Logging disabled: {:#}", e);
    }

    match cli.command {
        Commands::Run {
            inputs,
            target,
            recursive,
            max_retries,
            output,
            advisor,
            advice_timeout_secs,
            rate_control,
            jobs,
            json,
            force,
            keep_mtime,
        } => {
            let jobs = jobs.max(1);
            let config = CompressionConfig {
                target_bytes: target.resolve_bytes()?,
                safety_margin: target.safety_margin,
                max_retries,
                output_dir: output,
                advice_timeout: Duration::from_secs(advice_timeout_secs),
                rate_control,
                threads: (num_cpus::get() / jobs).max(1),
                force,
                keep_mtime,
                ..Default::default()
            };
            let failed = run_batch(&inputs, recursive, jobs, json, advisor.as_deref(), config)?;
            if failed {
                std::process::exit(1);
            }
        }

        Commands::Plan {
            input,
            target,
            json,
        } => {
            let config = CompressionConfig {
                target_bytes: target.resolve_bytes()?,
                safety_margin: target.safety_margin,
                ..Default::default()
            };
            let budget = config.budget().context("invalid size budget")?;
            let descriptor = probe_media(&input)
                .with_context(|| format!("failed to probe {}", input.display()))?;
            let plan = plan_with(&descriptor, budget.effective_bytes(), &config.tuning);
            let predicted = plan.predicted_bytes(descriptor.duration_seconds) as u64;

            if json {
                let out = serde_json::json!({
                    "descriptor": descriptor,
                    "budget": budget,
                    "effectiveBudgetBytes": budget.effective_bytes(),
                    "predictedBytes": predicted,
                    "plan": plan,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("\n🎯 {}", style("Encoding Plan").cyan().bold());
                println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
                println!("📁 File: {}", input.display());
                println!(
                    "🎬 Source: {}x{} @ {:.2} fps, {:.1}s, {}",
                    descriptor.width,
                    descriptor.height,
                    descriptor.frame_rate,
                    descriptor.duration_seconds,
                    FileSize::new(descriptor.original_bytes)
                );
                println!("💾 Budget: {}", budget);
                println!();
                println!("📐 Output: {}", plan.resolution());
                println!(
                    "📊 Bitrate: {} kbps video + {} kbps audio",
                    plan.video_bitrate_kbps, plan.audio_bitrate_kbps
                );
                println!("🎚️  Quality factor: {}, preset {}", plan.quality_factor, plan.preset_level);
                println!("📦 Predicted: {}", FileSize::new(predicted));
                println!("📝 {}", plan.explanation);
                println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            }
        }

        Commands::Probe { input } => {
            let descriptor = probe_media(&input)
                .with_context(|| format!("failed to probe {}", input.display()))?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
    }

    Ok(())
}

/// Runs every input through its own job. Returns whether any job failed.
fn run_batch(
    inputs: &[PathBuf],
    recursive: bool,
    jobs: usize,
    json: bool,
    advisor: Option<&str>,
    config: CompressionConfig,
) -> anyhow::Result<bool> {
    config.budget().context("invalid size budget")?;

    let files = expand_inputs(inputs, recursive);
    if files.is_empty() {
        bail!("no video files found in {:?}", inputs);
    }
    if !is_ffprobe_available() {
        bail!("ffprobe not found in PATH (install ffmpeg)");
    }
    let encoder = FfmpegEncoder::detect(config.rate_control, config.threads)?;

    let advice_timeout = config.advice_timeout;
    let mut runner = JobRunner::new(Arc::new(FfprobeProber), Arc::new(encoder), config);
    if let Some(command) = advisor {
        let Some(advisor) = CommandAdvisor::from_command_line(command, advice_timeout) else {
            bail!("--advisor needs a command");
        };
        runner = runner.with_advisor(Arc::new(advisor));
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            if cancel.is_cancelled() {
                std::process::exit(130);
            }
            eprintln!("\n{}", style("Cancelling, cleaning up temp files...").yellow().bold());
            cancel.cancel();
        })
        .context("failed to install Ctrl-C handler")?;
    }

    info!(
        files = files.len(),
        jobs,
        threads_per_job = runner.config().threads,
        target_bytes = runner.config().target_bytes,
        "Starting batch"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("failed to build job pool")?;
    let multi = MultiProgress::new();
    let started = Instant::now();

    let outcomes: Vec<(PathBuf, Result<JobReport, JobError>)> = pool.install(|| {
        files
            .par_iter()
            .map(|file| {
                let bar = job_bar(&multi, file);
                let result = compress_file(&runner, file, &cancel, &mut |attempt, percent| {
                    if attempt > 0 {
                        bar.set_message(format!("retry {}", attempt));
                    }
                    bar.set_position(percent.round() as u64);
                });
                match &result {
                    Ok(report) => bar.finish_with_message(report.status.to_string()),
                    Err(_) => bar.abandon_with_message("error"),
                }
                (file.clone(), result)
            })
            .collect()
    });

    let mut batch = BatchResult::new();
    let mut input_bytes = 0u64;
    let mut output_bytes = 0u64;
    let mut reports = Vec::new();

    for (file, result) in outcomes {
        match result {
            Ok(report) => {
                match report.status {
                    JobStatus::Succeeded => {
                        batch.success();
                        input_bytes += report.original_bytes;
                        output_bytes += report.final_bytes.unwrap_or(0);
                    }
                    JobStatus::Cancelled => batch.cancel(),
                    _ => batch.fail(file, report.error.clone().unwrap_or_default()),
                }
                reports.push(report);
            }
            Err(JobError::OutputExists(path)) => {
                handle_error(
                    ErrorCategory::Optional,
                    &format!("skip {}", file.display()),
                    &format!("{} exists (use --force)", path.display()),
                );
                batch.skip();
            }
            Err(e) => {
                handle_error(e.category(), &file.display().to_string(), &e);
                batch.fail(file, e.to_string());
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_summary_report(&batch, started.elapsed(), input_bytes, output_bytes, "vid-fit");
        for (path, error) in &batch.errors {
            eprintln!("{} {}: {}", style("✗").red(), path.display(), error);
        }
    }

    Ok(batch.failed > 0)
}

fn job_bar(multi: &MultiProgress, file: &Path) -> ProgressBar {
    let bar = multi.add(ProgressBar::new(100));
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{prefix:.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
    {
        bar.set_style(bar_style.progress_chars("█▓░"));
    }
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());
    bar.set_prefix(name);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}
