//! Logging Module
//!
//! tracing-based logging shared by every vid-fit binary:
//! - human-readable output on stderr
//! - a daily-rolling log file (system temp dir by default)
//! - pruning of old log files
//! - structured records for external tool invocations
//!
//! # Examples
//!
//! ```no_run
//! use shared_utils::logging::{LogConfig, init_logging};
//! use tracing::{info, error};
//!
//! init_logging("vid_fit", LogConfig::default()).expect("Failed to initialize logging");
//!
//! info!("Program started");
//! error!(error = "something went wrong", "Operation failed");
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Crates whose events are enabled by the default filter.
const LOGGED_CRATES: &[&str] = &["vid_fit", "shared_utils"];

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for the rolling log file (defaults to the system temp dir)
    pub log_dir: PathBuf,
    /// How many log files to keep, newest first
    pub max_files: usize,
    pub level: Level,
    /// Write a log file in addition to stderr
    pub file_output: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir(),
            max_files: 5,
            level: Level::INFO,
            file_output: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.log_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_max_files(mut self, count: usize) -> Self {
        self.max_files = count;
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn without_file_output(mut self) -> Self {
        self.file_output = false;
        self
    }

    /// Filter directive used when `RUST_LOG` is not set.
    pub fn default_directive(&self, program_name: &str) -> String {
        let mut targets: Vec<&str> = vec![program_name];
        for krate in LOGGED_CRATES {
            if !targets.contains(krate) {
                targets.push(krate);
            }
        }
        targets
            .iter()
            .map(|t| format!("{}={}", t, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Installs the global subscriber.
///
/// Log file name: `{program_name}.log` (plus the date suffix added by the
/// daily rotation). `RUST_LOG` overrides the configured level.
///
/// # Errors
/// Fails if the log directory cannot be created or a global subscriber is
/// already installed.
pub fn init_logging(program_name: &str, config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive(program_name)));

    let log_file_name = format!("{}.log", program_name);

    let file_layer = if config.file_output {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log directory: {:?}", config.log_dir))?;

        // Rotation is time based; size is bounded by pruning old files below.
        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, &log_file_name);

        Some(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(
        program = program_name,
        log_dir = ?config.log_dir,
        log_file = log_file_name,
        max_files = config.max_files,
        level = ?config.level,
        "Logging system initialized"
    );

    if config.file_output {
        cleanup_old_logs(&config.log_dir, program_name, config.max_files)?;
    }

    Ok(())
}

/// Deletes all but the newest `max_files` log files of `program_name`.
fn cleanup_old_logs(log_dir: &Path, program_name: &str, max_files: usize) -> Result<()> {
    use std::fs;

    let entries = fs::read_dir(log_dir)
        .with_context(|| format!("Failed to read log directory: {:?}", log_dir))?;

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

    for entry in entries {
        let entry = entry?;
        let path = entry.path();

        if !path.is_file() {
            continue;
        }

        if let Some(file_name) = path.file_name() {
            let file_name_str = file_name.to_string_lossy();
            if file_name_str.starts_with(program_name) && file_name_str.contains(".log") {
                if let Ok(modified) = fs::metadata(&path).and_then(|m| m.modified()) {
                    log_files.push((path, modified));
                }
            }
        }
    }

    if log_files.len() > max_files {
        log_files.sort_by(|a, b| b.1.cmp(&a.1));

        for (path, _) in log_files.iter().skip(max_files) {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(
                    path = ?path,
                    error = %e,
                    "Failed to remove old log file"
                );
            } else {
                tracing::debug!(
                    path = ?path,
                    "Removed old log file"
                );
            }
        }
    }

    Ok(())
}

/// Records one external tool invocation (ffmpeg, an advice command, ...).
///
/// Success is logged at info with the output at debug; failure at error
/// with the output attached.
pub fn log_external_tool(
    tool_name: &str,
    args: &[&str],
    output: &str,
    exit_code: Option<i32>,
    duration: std::time::Duration,
) {
    let command = format!("{} {}", tool_name, args.join(" "));

    match exit_code {
        Some(0) => {
            tracing::info!(
                tool = tool_name,
                command = %command,
                duration_secs = duration.as_secs_f64(),
                exit_code = 0,
                "External tool completed successfully"
            );
            tracing::debug!(
                tool = tool_name,
                output = %output,
                "External tool output"
            );
        }
        Some(code) => {
            tracing::error!(
                tool = tool_name,
                command = %command,
                duration_secs = duration.as_secs_f64(),
                exit_code = code,
                output = %output,
                "External tool failed"
            );
        }
        None => {
            tracing::error!(
                tool = tool_name,
                command = %command,
                duration_secs = duration.as_secs_f64(),
                output = %output,
                "External tool terminated without exit code"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.max_files, 5);
        assert_eq!(config.level, Level::INFO);
        assert!(config.file_output);
    }

    #[test]
    fn test_log_config_builder() {
        let temp_dir = TempDir::new().unwrap();
        let config = LogConfig::new()
            .with_log_dir(temp_dir.path())
            .with_max_files(3)
            .with_level(Level::DEBUG)
            .without_file_output();

        assert_eq!(config.log_dir, temp_dir.path());
        assert_eq!(config.max_files, 3);
        assert_eq!(config.level, Level::DEBUG);
        assert!(!config.file_output);
    }

    #[test]
    fn test_default_directive() {
        let config = LogConfig::new().with_level(Level::DEBUG);
        assert_eq!(
            config.default_directive("vid_fit"),
            "vid_fit=DEBUG,shared_utils=DEBUG"
        );
        assert_eq!(
            config.default_directive("other"),
            "other=DEBUG,vid_fit=DEBUG,shared_utils=DEBUG"
        );
    }

    // The only test in this crate that installs the global subscriber.
    #[test]
    fn test_init_logging_with_file_layer() {
        let temp_dir = TempDir::new().unwrap();
        let log_dir = temp_dir.path().join("logs");
        let config = LogConfig::new().with_log_dir(&log_dir).with_max_files(2);

        init_logging("vid_fit_test", config.clone()).unwrap();
        assert!(log_dir.is_dir());
        tracing::info!(case = "file layer", "written to file and stderr");

        let again = init_logging("vid_fit_test", config.without_file_output());
        assert!(again.is_err());
    }

    #[test]
    fn test_cleanup_old_logs() {
        let temp_dir = TempDir::new().unwrap();
        let program_name = "test_program";

        for i in 0..10 {
            let file_path = temp_dir.path().join(format!("{}.log.{}", program_name, i));
            fs::write(&file_path, format!("log content {}", i)).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        fs::write(temp_dir.path().join("unrelated.txt"), "keep").unwrap();

        cleanup_old_logs(temp_dir.path(), program_name, 3).unwrap();

        let remaining_files: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(program_name))
            .collect();

        assert_eq!(remaining_files.len(), 3);
        assert!(temp_dir.path().join("unrelated.txt").exists());
    }
}
