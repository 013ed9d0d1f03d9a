//! FileSize Type-Safe Wrapper
//!
//! Byte counts with megabyte conversion and human-readable display.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// FileSize Newtype
// ============================================================================

/// File size in bytes.
///
/// # Examples
/// ```
/// use shared_utils::types::file_size::FileSize;
///
/// let size = FileSize::new(1024 * 1024);
/// assert_eq!(size.bytes(), 1048576);
/// assert_eq!(size.display(), "1.00 MB");
/// assert_eq!(FileSize::from_mb_f64(0.5).bytes(), 524288);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSize(u64);

impl FileSize {
    pub const ZERO: FileSize = FileSize(0);

    pub const KB: u64 = 1024;
    pub const MB: u64 = 1024 * 1024;
    pub const GB: u64 = 1024 * 1024 * 1024;

    #[inline]
    pub const fn new(bytes: u64) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn from_mb(mb: u64) -> Self {
        Self(mb * Self::MB)
    }

    /// Fractional megabytes, as typed on a command line. Negative and NaN give zero.
    pub fn from_mb_f64(mb: f64) -> Self {
        if mb.is_nan() || mb <= 0.0 {
            return Self::ZERO;
        }
        Self((mb * Self::MB as f64).floor().min(u64::MAX as f64) as u64)
    }

    #[inline]
    pub const fn bytes(&self) -> u64 {
        self.0
    }

    pub fn display(&self) -> String {
        if self.0 >= Self::GB {
            format!("{:.2} GB", self.0 as f64 / Self::GB as f64)
        } else if self.0 >= Self::MB {
            format!("{:.2} MB", self.0 as f64 / Self::MB as f64)
        } else if self.0 >= Self::KB {
            format!("{:.2} KB", self.0 as f64 / Self::KB as f64)
        } else {
            format!("{} B", self.0)
        }
    }
}

// ============================================================================
// Trait Implementations
// ============================================================================

impl fmt::Debug for FileSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileSize({} = {})", self.0, self.display())
    }
}

impl fmt::Display for FileSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

impl Default for FileSize {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<u64> for FileSize {
    fn from(bytes: u64) -> Self {
        Self::new(bytes)
    }
}

impl From<FileSize> for u64 {
    fn from(size: FileSize) -> Self {
        size.0
    }
}
