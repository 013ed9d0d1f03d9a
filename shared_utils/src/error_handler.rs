//! Error Handler Module
//!
//! ## Error categories
//! - Recoverable: log a warning and fall back
//! - Fatal: propagate and abort the operation
//! - Optional: a non-essential step failed, note it and continue
//!
//! Every library error type maps itself onto one of these so callers can
//! apply a single policy regardless of which stage failed.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Recoverable,
    Fatal,
    Optional,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Recoverable => write!(f, "RECOVERABLE"),
            ErrorCategory::Fatal => write!(f, "FATAL"),
            ErrorCategory::Optional => write!(f, "OPTIONAL"),
        }
    }
}

/// Logs `error` at the level its category calls for. Deciding whether to go
/// on is left to the caller.
pub fn handle_error<E: fmt::Display + ?Sized>(category: ErrorCategory, context: &str, error: &E) {
    match category {
        ErrorCategory::Recoverable => {
            tracing::warn!(
                category = %category,
                context = context,
                error = %error,
                "Recoverable error, continuing with fallback"
            );
        }
        ErrorCategory::Fatal => {
            tracing::error!(
                category = %category,
                context = context,
                error = %error,
                "Fatal error, operation aborted"
            );
        }
        ErrorCategory::Optional => {
            tracing::info!(
                category = %category,
                context = context,
                error = %error,
                "Non-critical failure, continuing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Recoverable.to_string(), "RECOVERABLE");
        assert_eq!(ErrorCategory::Fatal.to_string(), "FATAL");
        assert_eq!(ErrorCategory::Optional.to_string(), "OPTIONAL");
    }

    #[test]
    fn test_handle_error_accepts_any_display() {
        let err = std::io::Error::other("boom");
        handle_error(ErrorCategory::Recoverable, "advice", &err);
        handle_error(ErrorCategory::Fatal, "encode", "encoder not found");
        handle_error(ErrorCategory::Optional, "mtime", &format!("{} exists", "out.mp4"));
    }
}
