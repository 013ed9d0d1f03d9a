use shared_utils::ErrorCategory;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::executor::Artifact;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Unreadable container: {0}")]
    UnreadableContainer(String),

    #[error("No video stream found")]
    NoVideoStream,

    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    #[error("Probe tool not found: {0}")]
    ToolNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Fatal
    }
}

impl From<shared_utils::FFprobeError> for ProbeError {
    fn from(e: shared_utils::FFprobeError) -> Self {
        use shared_utils::FFprobeError as F;
        match e {
            F::ToolNotFound(msg) => ProbeError::ToolNotFound(msg),
            F::ExecutionFailed(msg) => ProbeError::UnreadableContainer(msg),
            F::ParseError(msg) => ProbeError::CorruptHeader(msg),
            F::NoVideoStream => ProbeError::NoVideoStream,
            F::IoError(io) => ProbeError::Io(io),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdviceError {
    #[error("Advice timed out after {0:?}")]
    Timeout(Duration),

    #[error("Advice rejected: {0}")]
    SchemaInvalid(String),

    #[error("Advice plan predicts {predicted_bytes} bytes, budget is {budget_bytes}")]
    ExceedsBudget {
        predicted_bytes: u64,
        budget_bytes: u64,
    },

    #[error("Advice unavailable: {0}")]
    Unavailable(String),
}

impl AdviceError {
    /// Advice is optional; every failure falls back to the deterministic planner.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Recoverable
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    #[error("Encode cancelled")]
    Cancelled,
}

impl ExecError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExecError::EncoderUnavailable(_) => ErrorCategory::Fatal,
            ExecError::EncodeFailed(_) => ErrorCategory::Recoverable,
            ExecError::Cancelled => ErrorCategory::Optional,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    #[error("Target size must be greater than zero")]
    ZeroTarget,

    #[error("Safety margin {0} outside [0, 0.2]")]
    MarginOutOfRange(f64),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    /// Every attempt overshot. Carries the smallest artifact produced.
    #[error("Budget unreachable after {attempts} attempts: best {} bytes > {effective_budget_bytes} bytes", .best.bytes())]
    BudgetUnreachable {
        best: Box<Artifact>,
        attempts: usize,
        effective_budget_bytes: u64,
    },

    #[error("Output exists: {0} (use --force to overwrite)")]
    OutputExists(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            JobError::Probe(e) => e.category(),
            JobError::Exec(e) => e.category(),
            JobError::Budget(_) | JobError::Io(_) => ErrorCategory::Fatal,
            JobError::BudgetUnreachable { .. } => ErrorCategory::Recoverable,
            JobError::OutputExists(_) => ErrorCategory::Optional,
        }
    }
}
