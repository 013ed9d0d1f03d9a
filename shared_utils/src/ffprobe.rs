//! FFprobe wrapper module
//!
//! Header-only inspection of media containers. Runs `ffprobe -show_format
//! -show_streams` and lifts the JSON it prints into an [`FFprobeResult`].
//! No frame data is decoded.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FFprobeError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("FFprobe failed: {0}")]
    ExecutionFailed(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("No video stream found")]
    NoVideoStream,

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FFprobeResult {
    pub format_name: String,
    pub duration: f64,
    pub size: u64,
    pub bit_rate: u64,
    pub video_codec: String,
    /// Display width, after applying any 90/270 degree rotation.
    pub width: u32,
    /// Display height, after applying any 90/270 degree rotation.
    pub height: u32,
    pub frame_rate: f64,
    pub rotation: i32,
    pub has_audio: bool,
    pub audio_codec: Option<String>,
    pub audio_bit_rate: Option<u64>,
    pub audio_channels: Option<u32>,
}

pub fn is_ffprobe_available() -> bool {
    which::which("ffprobe").is_ok()
}

pub fn probe_video(path: &Path) -> Result<FFprobeResult, FFprobeError> {
    if !is_ffprobe_available() {
        return Err(FFprobeError::ToolNotFound(
            "ffprobe not found in PATH (install ffmpeg)".to_string(),
        ));
    }

    if !path.is_file() {
        return Err(FFprobeError::ExecutionFailed(format!(
            "Not a readable file: {}",
            path.display()
        )));
    }

    // `output()` waits for the child, so the probe handle is released on every path.
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg("--")
        .arg(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let error_msg = if stderr.trim().is_empty() {
            format!(
                "ffprobe failed to analyze file: {} (exit code: {:?})",
                path.display(),
                output.status.code()
            )
        } else {
            format!("ffprobe error for '{}': {}", path.display(), stderr.trim())
        };
        return Err(FFprobeError::ExecutionFailed(error_msg));
    }

    let json_str = String::from_utf8_lossy(&output.stdout);
    let mut result = parse_probe_json(&json_str)?;

    // Some containers (raw streams, fragmented mp4) omit format.size.
    if result.size == 0 {
        result.size = std::fs::metadata(path)?.len();
    }

    debug!(
        path = %path.display(),
        duration = result.duration,
        width = result.width,
        height = result.height,
        fps = result.frame_rate,
        has_audio = result.has_audio,
        "ffprobe result"
    );

    Ok(result)
}

/// Parses the JSON document printed by `ffprobe -print_format json -show_format -show_streams`.
pub fn parse_probe_json(json_str: &str) -> Result<FFprobeResult, FFprobeError> {
    let json: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| FFprobeError::ParseError(e.to_string()))?;

    let format = &json["format"];
    let format_name = format["format_name"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    let duration = format["duration"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    let size = format["size"]
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let bit_rate = format["bit_rate"]
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let streams = json["streams"]
        .as_array()
        .ok_or_else(|| FFprobeError::ParseError("No streams found".to_string()))?;

    let video_stream = streams
        .iter()
        .find(|s| {
            s["codec_type"].as_str() == Some("video")
                && s["disposition"]["attached_pic"].as_u64() != Some(1)
        })
        .ok_or(FFprobeError::NoVideoStream)?;

    let video_codec = video_stream["codec_name"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    let coded_width = video_stream["width"].as_u64().unwrap_or(0) as u32;
    let coded_height = video_stream["height"].as_u64().unwrap_or(0) as u32;

    let rotation = stream_rotation(video_stream);
    let (width, height) = if rotation.rem_euclid(180) == 90 {
        (coded_height, coded_width)
    } else {
        (coded_width, coded_height)
    };

    let frame_rate = parse_frame_rate(video_stream["avg_frame_rate"].as_str().unwrap_or(""))
        .or_else(|| parse_frame_rate(video_stream["r_frame_rate"].as_str().unwrap_or("")))
        .unwrap_or_else(|| {
            warn!(
                fallback = FALLBACK_FRAME_RATE,
                "[ffprobe] No usable frame rate, using fallback"
            );
            FALLBACK_FRAME_RATE
        });

    // Stream duration is a better fallback than nothing for containers without format.duration.
    let duration = if duration > 0.0 {
        duration
    } else {
        video_stream["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    let audio_stream = streams
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("audio"));
    let has_audio = audio_stream.is_some();
    let audio_codec = audio_stream
        .and_then(|s| s["codec_name"].as_str())
        .map(|s| s.to_string());
    let audio_bit_rate = audio_stream
        .and_then(|s| s["bit_rate"].as_str())
        .and_then(|s| s.parse::<u64>().ok());
    let audio_channels = audio_stream
        .and_then(|s| s["channels"].as_u64())
        .map(|c| c as u32);

    Ok(FFprobeResult {
        format_name,
        duration,
        size,
        bit_rate,
        video_codec,
        width,
        height,
        frame_rate,
        rotation,
        has_audio,
        audio_codec,
        audio_bit_rate,
        audio_channels,
    })
}

fn stream_rotation(stream: &serde_json::Value) -> i32 {
    let from_side_data = stream["side_data_list"].as_array().and_then(|list| {
        list.iter()
            .find_map(|entry| entry["rotation"].as_i64())
    });
    let from_tags = stream["tags"]["rotate"]
        .as_str()
        .and_then(|s| s.parse::<i64>().ok());

    from_side_data.or(from_tags).unwrap_or(0) as i32
}

pub const FALLBACK_FRAME_RATE: f64 = 30.0;

/// Parses `30000/1001` or `29.97` style rates. Returns `None` for `0/0` and garbage.
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num = num.parse::<f64>().ok()?;
        let den = den.parse::<f64>().ok()?;
        if den > 0.0 {
            let rate = num / den;
            if rate > 0.0 && rate.is_finite() {
                return Some(rate);
            }
        }
        return None;
    }
    match s.parse::<f64>() {
        Ok(v) if v > 0.0 && v.is_finite() => Some(v),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 1920,
                "height": 1080,
                "r_frame_rate": "30/1",
                "avg_frame_rate": "30000/1001"
            },
            {
                "index": 1,
                "codec_name": "aac",
                "codec_type": "audio",
                "channels": 2,
                "bit_rate": "128000"
            }
        ],
        "format": {
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "120.000000",
            "size": "524288000",
            "bit_rate": "34952533"
        }
    }"#;

    #[test]
    fn test_parse_probe_json() {
        let result = parse_probe_json(SAMPLE).unwrap();
        assert_eq!(result.width, 1920);
        assert_eq!(result.height, 1080);
        assert!((result.duration - 120.0).abs() < 1e-9);
        assert_eq!(result.size, 524_288_000);
        assert!((result.frame_rate - 29.97).abs() < 0.01);
        assert!(result.has_audio);
        assert_eq!(result.audio_bit_rate, Some(128_000));
        assert_eq!(result.audio_codec.as_deref(), Some("aac"));
        assert_eq!(result.rotation, 0);
    }

    #[test]
    fn test_parse_probe_json_rotated() {
        let json = r#"{
            "streams": [{
                "codec_type": "video", "codec_name": "hevc",
                "width": 1920, "height": 1080, "r_frame_rate": "30/1",
                "side_data_list": [{ "side_data_type": "Display Matrix", "rotation": -90 }]
            }],
            "format": { "duration": "5.0", "size": "1000" }
        }"#;
        let result = parse_probe_json(json).unwrap();
        assert_eq!((result.width, result.height), (1080, 1920));
        assert!(!result.has_audio);
    }

    #[test]
    fn test_parse_probe_json_audio_only() {
        let json = r#"{
            "streams": [{ "codec_type": "audio", "codec_name": "mp3" }],
            "format": { "duration": "5.0" }
        }"#;
        assert!(matches!(
            parse_probe_json(json),
            Err(FFprobeError::NoVideoStream)
        ));
    }

    #[test]
    fn test_parse_probe_json_skips_cover_art() {
        let json = r#"{
            "streams": [
                { "codec_type": "video", "codec_name": "mjpeg", "width": 300, "height": 300,
                  "disposition": { "attached_pic": 1 } },
                { "codec_type": "audio", "codec_name": "aac" }
            ],
            "format": { "duration": "200.0" }
        }"#;
        assert!(matches!(
            parse_probe_json(json),
            Err(FFprobeError::NoVideoStream)
        ));
    }

    #[test]
    fn test_parse_probe_json_garbage() {
        assert!(matches!(
            parse_probe_json("not json"),
            Err(FFprobeError::ParseError(_))
        ));
        assert!(matches!(
            parse_probe_json("{}"),
            Err(FFprobeError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_frame_rate() {
        let cases: &[(&str, f64, f64)] = &[
            ("30/1", 30.0, 0.001),
            ("24/1", 24.0, 0.001),
            ("30000/1001", 30000.0 / 1001.0, 0.0001),
            ("24000/1001", 24000.0 / 1001.0, 0.0001),
            ("24", 24.0, 0.001),
            ("29.97", 29.97, 0.01),
            ("120/1", 120.0, 0.001),
        ];

        for (input, expected, tolerance) in cases {
            let result = parse_frame_rate(input).unwrap();
            assert!(
                (result - expected).abs() < *tolerance,
                "parse_frame_rate({:?}): expected {}, got {}",
                input, expected, result
            );
        }
    }

    #[test]
    fn test_parse_frame_rate_edge_cases() {
        assert_eq!(parse_frame_rate("30/0"), None);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("invalid"), None);
        assert_eq!(parse_frame_rate(""), None);
        assert_eq!(parse_frame_rate("30/1/extra"), None);
    }
}
