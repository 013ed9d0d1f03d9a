//! Batch Processing Module
//!
//! Input expansion and per-file outcome counting for batch runs.
//! Files are processed smallest first so quick wins land early.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SUPPORTED_VIDEO_EXTENSIONS: &[&str] =
    &["mp4", "mov", "avi", "mkv", "webm", "m4v", "wmv", "flv"];

pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| extensions.contains(&e.as_str()))
}

pub fn collect_files(dir: &Path, extensions: &[&str], recursive: bool) -> Vec<PathBuf> {
    let walker = if recursive {
        WalkDir::new(dir).follow_links(true)
    } else {
        WalkDir::new(dir).max_depth(1)
    };

    walker
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| has_extension(e.path(), extensions))
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Sorts by file size, ascending. Unreadable files are dropped.
pub fn sort_by_size_ascending(files: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut sized: Vec<(u64, PathBuf)> = files
        .into_iter()
        .filter_map(|p| std::fs::metadata(&p).ok().map(|m| (m.len(), p)))
        .collect();
    sized.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    sized.into_iter().map(|(_, p)| p).collect()
}

/// Expands a mix of files and directories into the list of inputs to process.
///
/// Explicit files are kept whatever their extension; directories contribute
/// only files with a supported video extension. The result is deduplicated
/// and ordered smallest first.
pub fn expand_inputs(inputs: &[PathBuf], recursive: bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            files.extend(collect_files(input, SUPPORTED_VIDEO_EXTENSIONS, recursive));
        } else {
            files.push(input.clone());
        }
    }
    files.sort();
    files.dedup();
    sort_by_size_ascending(files)
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub errors: Vec<(PathBuf, String)>,
}

impl BatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&mut self) {
        self.total += 1;
        self.succeeded += 1;
    }

    pub fn fail(&mut self, path: PathBuf, error: String) {
        self.total += 1;
        self.failed += 1;
        self.errors.push((path, error));
    }

    pub fn skip(&mut self) {
        self.total += 1;
        self.skipped += 1;
    }

    pub fn cancel(&mut self) {
        self.total += 1;
        self.cancelled += 1;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.succeeded as f64 / self.total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn test_has_extension_case_insensitive() {
        assert!(has_extension(Path::new("a/b.MP4"), SUPPORTED_VIDEO_EXTENSIONS));
        assert!(has_extension(Path::new("clip.webm"), SUPPORTED_VIDEO_EXTENSIONS));
        assert!(!has_extension(Path::new("notes.txt"), SUPPORTED_VIDEO_EXTENSIONS));
        assert!(!has_extension(Path::new("noext"), SUPPORTED_VIDEO_EXTENSIONS));
    }

    #[test]
    fn test_expand_directory_small_first() {
        let dir = TempDir::new().unwrap();
        create_test_file(dir.path(), "big.mp4", 300);
        create_test_file(dir.path(), "small.mov", 10);
        create_test_file(dir.path(), "mid.mkv", 100);
        create_test_file(dir.path(), "readme.txt", 1);

        let files = expand_inputs(&[dir.path().to_path_buf()], false);
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["small.mov", "mid.mkv", "big.mp4"]);
    }

    #[test]
    fn test_collect_files_recursive() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        create_test_file(dir.path(), "top.mp4", 10);
        create_test_file(&nested, "deep.mp4", 10);

        assert_eq!(collect_files(dir.path(), SUPPORTED_VIDEO_EXTENSIONS, false).len(), 1);
        assert_eq!(collect_files(dir.path(), SUPPORTED_VIDEO_EXTENSIONS, true).len(), 2);
    }

    #[test]
    fn test_expand_inputs_mixed() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let explicit = create_test_file(dir.path(), "explicit.bin", 50);
        create_test_file(&sub, "a.mp4", 5);

        let files = expand_inputs(&[explicit.clone(), sub.clone(), explicit.clone()], false);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], sub.join("a.mp4"));
        assert_eq!(files[1], explicit);
    }

    #[test]
    fn test_batch_result_mixed() {
        let mut result = BatchResult::new();
        result.success();
        result.success();
        result.fail(PathBuf::from("test.mp4"), "Error".to_string());
        result.skip();
        result.cancel();

        assert_eq!(result.total, 5);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.cancelled, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            result.total,
            result.succeeded + result.failed + result.skipped + result.cancelled
        );
    }

    #[test]
    fn test_success_rate() {
        let empty = BatchResult::new();
        assert!((empty.success_rate() - 100.0).abs() < 0.01);

        let mut half = BatchResult::new();
        half.success();
        half.fail(PathBuf::from("x.mp4"), "E".to_string());
        assert!((half.success_rate() - 50.0).abs() < 0.01);
    }
}
