//! FFmpeg process management
//!
//! ## Pipe deadlock
//!
//! When both stdout and stderr are piped but only stdout is read, an ffmpeg
//! run that logs more than the OS pipe buffer (typically 64KB) to stderr
//! blocks forever on its next write, and so does the reader waiting on
//! stdout. [`FfmpegProcess`] drains stderr on a dedicated thread.
//!
//! stdout lines (the `-progress pipe:1` stream) are forwarded over a channel
//! so the caller can poll with a timeout and stay responsive to cancellation
//! even while ffmpeg is silent.
//!
//! ## Usage
//!
//! ```ignore
//! use shared_utils::ffmpeg_process::{FfmpegProcess, FfmpegProgressParser};
//! use std::process::Command;
//!
//! let mut cmd = Command::new("ffmpeg");
//! cmd.args(["-progress", "pipe:1", "-nostats", "-i", "in.mp4", "out.mp4"]);
//!
//! let mut process = FfmpegProcess::spawn(&mut cmd)?;
//! let lines = process.progress_lines().unwrap();
//! let mut parser = FfmpegProgressParser::with_duration(120.0);
//! while let Ok(line) = lines.recv() {
//!     if let Some(p) = parser.parse_line(&line) {
//!         println!("{:.1}%", p * 100.0);
//!     }
//! }
//! let (status, stderr) = process.wait_with_output()?;
//! ```

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

// ═══════════════════════════════════════════════════════════════
// FfmpegProcess
// ═══════════════════════════════════════════════════════════════

/// Wrapper around a running ffmpeg child.
///
/// The child is killed and reaped on drop if it is still running, so an
/// early return or a panic in the caller never leaks the process.
pub struct FfmpegProcess {
    child: Child,
    stderr_thread: Option<JoinHandle<String>>,
    stdout_thread: Option<JoinHandle<()>>,
}

impl FfmpegProcess {
    /// Spawns `cmd` with stdout/stderr piped and stdin closed.
    ///
    /// # Errors
    /// - the process could not be started
    /// - stderr could not be captured
    pub fn spawn(cmd: &mut Command) -> Result<Self> {
        let command_str = format!("{:?}", cmd);
        info!(
            command = %command_str,
            "Executing FFmpeg command"
        );

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().context("Failed to spawn FFmpeg process")?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture FFmpeg stderr"))?;

        let stderr_thread = thread::spawn(move || {
            let mut buf = String::new();
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(std::result::Result::ok) {
                buf.push_str(&line);
                buf.push('\n');
            }
            buf
        });

        Ok(Self {
            child,
            stderr_thread: Some(stderr_thread),
            stdout_thread: None,
        })
    }

    /// Starts forwarding stdout lines over a channel.
    ///
    /// The channel disconnects once ffmpeg closes stdout. Returns `None` if
    /// stdout was already taken.
    pub fn progress_lines(&mut self) -> Option<Receiver<String>> {
        let stdout = self.child.stdout.take()?;
        let (tx, rx) = mpsc::channel();
        self.stdout_thread = Some(thread::spawn(move || {
            let reader = BufReader::new(stdout);
            let mut receiver_alive = true;
            // Keep draining after the receiver is gone so ffmpeg never blocks on stdout.
            for line in reader.lines().map_while(std::result::Result::ok) {
                if receiver_alive && tx.send(line).is_err() {
                    receiver_alive = false;
                }
            }
        }));
        Some(rx)
    }

    /// Waits for the process and returns its exit status and collected stderr.
    pub fn wait_with_output(mut self) -> Result<(ExitStatus, String)> {
        let status = self.child.wait().context("Failed to wait for FFmpeg")?;
        let stderr = self.join_readers();

        if status.success() {
            info!(
                exit_code = status.code(),
                "FFmpeg process completed successfully"
            );
            debug!(
                stderr_output = %stderr,
                "FFmpeg stderr output"
            );
        } else {
            error!(
                exit_code = status.code(),
                stderr_output = %stderr,
                "FFmpeg process failed"
            );
        }

        Ok((status, stderr))
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_wait()
            .context("Failed to check FFmpeg status")
    }

    /// Kills the process and reaps it.
    pub fn kill(&mut self) -> Result<()> {
        if self.try_wait()?.is_none() {
            self.child.kill().context("Failed to kill FFmpeg process")?;
        }
        self.child.wait().context("Failed to reap FFmpeg process")?;
        self.join_readers();
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    fn join_readers(&mut self) -> String {
        if let Some(t) = self.stdout_thread.take() {
            let _ = t.join();
        }
        self.stderr_thread
            .take()
            .map(|t| t.join().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            debug!(pid = self.child.id(), "Killing orphaned FFmpeg process");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// FfmpegProgressParser
// ═══════════════════════════════════════════════════════════════

/// Parses ffmpeg progress output into a completion fraction.
///
/// Understands both the `-progress` key=value stream (`out_time_us=`,
/// `out_time=`, `frame=`, `progress=end`) and classic stats lines
/// (`frame=  123 fps=24 ... time=00:01:23.45 ... speed=1.5x`).
#[derive(Debug, Clone)]
pub struct FfmpegProgressParser {
    total_frames: Option<u64>,
    total_duration: Option<f64>,
    current_frame: u64,
    current_time: f64,
    current_fps: f64,
    current_speed: f64,
    finished: bool,
}

impl FfmpegProgressParser {
    pub fn new(total_frames: Option<u64>) -> Self {
        Self {
            total_frames,
            total_duration: None,
            current_frame: 0,
            current_time: 0.0,
            current_fps: 0.0,
            current_speed: 0.0,
            finished: false,
        }
    }

    pub fn with_duration(total_duration: f64) -> Self {
        Self {
            total_duration: Some(total_duration),
            ..Self::new(None)
        }
    }

    /// Feeds one output line.
    ///
    /// Returns the progress fraction (0.0 - 1.0) when it can be computed.
    pub fn parse_line(&mut self, line: &str) -> Option<f64> {
        for token in split_pairs(line) {
            let (key, value) = token;
            match key {
                "frame" => {
                    if let Ok(frame) = value.parse::<u64>() {
                        self.current_frame = frame;
                    }
                }
                "fps" => {
                    if let Ok(fps) = value.parse::<f64>() {
                        self.current_fps = fps;
                    }
                }
                // `out_time_ms` is in microseconds too (long-standing ffmpeg quirk).
                "out_time_us" | "out_time_ms" => {
                    if let Ok(us) = value.parse::<i64>() {
                        if us >= 0 {
                            self.current_time = us as f64 / 1_000_000.0;
                        }
                    }
                }
                "time" | "out_time" => {
                    if let Some(time) = Self::parse_time(value) {
                        self.current_time = time;
                    }
                }
                "speed" => {
                    if let Ok(speed) = value.trim_end_matches('x').parse::<f64>() {
                        self.current_speed = speed;
                    }
                }
                "progress" => {
                    if value == "end" {
                        self.finished = true;
                    }
                }
                _ => {}
            }
        }

        self.calculate_progress()
    }

    /// Parses `HH:MM:SS.micro`.
    fn parse_time(time_str: &str) -> Option<f64> {
        let parts: Vec<&str> = time_str.split(':').collect();
        if parts.len() != 3 {
            return None;
        }

        let hours: f64 = parts[0].parse().ok()?;
        let minutes: f64 = parts[1].parse().ok()?;
        let seconds: f64 = parts[2].parse().ok()?;

        Some(hours * 3600.0 + minutes * 60.0 + seconds)
    }

    fn calculate_progress(&self) -> Option<f64> {
        if self.finished {
            return Some(1.0);
        }

        if let Some(total) = self.total_frames {
            if total > 0 && self.current_frame > 0 {
                return Some((self.current_frame as f64 / total as f64).min(1.0));
            }
        }

        if let Some(total) = self.total_duration {
            if total > 0.0 && self.current_time > 0.0 {
                return Some((self.current_time / total).min(1.0));
            }
        }

        None
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn current_fps(&self) -> f64 {
        self.current_fps
    }

    pub fn current_speed(&self) -> f64 {
        self.current_speed
    }
}

/// Splits `frame=  12 fps=3.0 time=00:00:01.00` and `out_time_us=1000` into key/value pairs.
fn split_pairs(line: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    let mut rest = line.trim();
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let end = after.find(char::is_whitespace).unwrap_or(after.len());
        pairs.push((key, &after[..end]));
        rest = after[end..].trim_start();
    }
    pairs
}

// ═══════════════════════════════════════════════════════════════
// Error formatting
// ═══════════════════════════════════════════════════════════════

/// Extracts the most meaningful line from ffmpeg stderr.
///
/// Prefers the last line mentioning "Error"/"error", then the last non-empty
/// line that is not a progress line, then `"Unknown FFmpeg error"`.
pub fn format_ffmpeg_error(stderr: &str) -> String {
    if let Some(error_line) = stderr
        .lines()
        .rev()
        .find(|line| line.contains("Error") || line.contains("error"))
    {
        return error_line.trim().to_string();
    }

    stderr
        .lines()
        .rev()
        .find(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty()
                && !trimmed.starts_with("frame=")
                && !trimmed.starts_with("fps=")
                && !trimmed.starts_with("size=")
        })
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "Unknown FFmpeg error".to_string())
}

/// True when ffmpeg itself runs but the requested encoder is not compiled in.
pub fn is_encoder_missing(stderr: &str) -> bool {
    stderr.contains("Unknown encoder")
        || stderr.contains("Encoder not found")
        || (stderr.contains("Requested encoder") && stderr.contains("not found"))
}

pub fn get_error_suggestion(stderr: &str) -> Option<String> {
    let patterns = [
        ("No such file or directory", "Check that the input path is correct"),
        ("Invalid data found", "The input file may be corrupted"),
        ("Unknown encoder", "Install an ffmpeg build with libx264 enabled"),
        ("Permission denied", "Check read/write permissions on input and output"),
        ("Output file is empty", "Encoding produced nothing; try a larger budget"),
        (
            "moov atom not found",
            "The MP4 is incomplete (interrupted recording or download)",
        ),
        (
            "Too many packets buffered",
            "Increase -max_muxing_queue_size",
        ),
    ];

    for (pattern, suggestion) in patterns {
        if stderr.contains(pattern) {
            return Some(suggestion.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ffmpeg_error_with_error_line() {
        let stderr = r#"
frame=  100 fps=25.0 q=28.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s
[libx264 @ 0x7f8b8c000000] Error: invalid parameter
"#;
        let error = format_ffmpeg_error(stderr);
        assert!(error.contains("Error"));
        assert!(error.contains("invalid parameter"));
    }

    #[test]
    fn test_format_ffmpeg_error_no_error_line() {
        let stderr = r#"
frame=  100 fps=25.0 q=28.0 size=    1024kB time=00:00:04.00
Conversion failed!
"#;
        let error = format_ffmpeg_error(stderr);
        assert_eq!(error, "Conversion failed!");
    }

    #[test]
    fn test_format_ffmpeg_error_empty() {
        let error = format_ffmpeg_error("");
        assert_eq!(error, "Unknown FFmpeg error");
    }

    #[test]
    fn test_progress_parser_frame() {
        let mut parser = FfmpegProgressParser::new(Some(1000));
        let progress = parser.parse_line("frame=  500");
        assert_eq!(progress, Some(0.5));
        assert_eq!(parser.current_frame(), 500);
    }

    #[test]
    fn test_progress_parser_time() {
        let mut parser = FfmpegProgressParser::with_duration(120.0);
        let progress = parser.parse_line("time=00:01:00.00");
        assert_eq!(progress, Some(0.5));
        assert!((parser.current_time() - 60.0).abs() < 0.01);
    }

    #[test]
    fn test_progress_parser_progress_stream() {
        let mut parser = FfmpegProgressParser::with_duration(10.0);
        assert_eq!(parser.parse_line("frame=12"), None);
        assert_eq!(parser.parse_line("out_time_us=2500000"), Some(0.25));
        assert_eq!(parser.parse_line("out_time=00:00:05.000000"), Some(0.5));
        assert_eq!(parser.parse_line("speed=2.5x"), Some(0.5));
        assert!((parser.current_speed() - 2.5).abs() < 1e-9);
        assert_eq!(parser.parse_line("progress=continue"), Some(0.5));
        assert!(!parser.is_finished());
        assert_eq!(parser.parse_line("progress=end"), Some(1.0));
        assert!(parser.is_finished());
    }

    #[test]
    fn test_progress_parser_negative_out_time_ignored() {
        let mut parser = FfmpegProgressParser::with_duration(10.0);
        assert_eq!(parser.parse_line("out_time_us=-9223372036854775807"), None);
    }

    #[test]
    fn test_progress_parser_stats_line() {
        let mut parser = FfmpegProgressParser::with_duration(100.0);
        let progress =
            parser.parse_line("frame=  240 fps= 48 q=28.0 size=  512kB time=00:00:10.00 speed=2.0x");
        assert_eq!(progress, Some(0.1));
        assert_eq!(parser.current_frame(), 240);
        assert!((parser.current_fps() - 48.0).abs() < 1e-9);
    }

    #[test]
    fn test_progress_parser_fps() {
        let mut parser = FfmpegProgressParser::new(None);
        parser.parse_line("fps=29.97");
        assert!((parser.current_fps() - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_is_encoder_missing() {
        assert!(is_encoder_missing("Unknown encoder 'libx264'"));
        assert!(is_encoder_missing("Requested encoder 'libx264' not found"));
        assert!(!is_encoder_missing("Invalid data found when processing input"));
    }

    #[test]
    fn test_get_error_suggestion() {
        assert!(get_error_suggestion("moov atom not found").is_some());
        assert!(get_error_suggestion("all good").is_none());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_progress_parser_frame_accuracy(
            current in 0u64..10000,
            total in 1u64..10000
        ) {
            let mut parser = FfmpegProgressParser::new(Some(total));
            let line = format!("frame={}", current);
            let progress = parser.parse_line(&line);

            if current > 0 {
                let expected = (current as f64 / total as f64).min(1.0);
                let actual = progress.unwrap_or(-1.0);
                prop_assert!((actual - expected).abs() < 0.001,
                    "Expected {}, got {} for frame {}/{}", expected, actual, current, total);
            }
        }

        #[test]
        fn prop_progress_parser_time_accuracy(
            hours in 0u32..24,
            minutes in 0u32..60,
            seconds in 0u32..60,
            total_duration in 1.0f64..86400.0
        ) {
            let mut parser = FfmpegProgressParser::with_duration(total_duration);
            let line = format!("out_time={:02}:{:02}:{:02}.000000", hours, minutes, seconds);
            let progress = parser.parse_line(&line);

            let current_seconds = hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds as f64;
            if current_seconds > 0.0 {
                let expected = (current_seconds / total_duration).min(1.0);
                let actual = progress.unwrap_or(-1.0);
                prop_assert!((actual - expected).abs() < 0.01,
                    "Expected {}, got {} for time {}:{}:{}", expected, actual, hours, minutes, seconds);
            }
        }

        #[test]
        fn prop_progress_never_exceeds_one(us in 0i64..i64::MAX / 2, total in 0.1f64..1000.0) {
            let mut parser = FfmpegProgressParser::with_duration(total);
            if let Some(p) = parser.parse_line(&format!("out_time_us={}", us)) {
                prop_assert!((0.0..=1.0).contains(&p));
            }
        }

        #[test]
        fn prop_format_error_non_empty(
            content in "[a-zA-Z0-9 ]{1,100}"
        ) {
            let error = format_ffmpeg_error(&content);
            prop_assert!(!error.is_empty(), "Error message should not be empty");
        }
    }
}
