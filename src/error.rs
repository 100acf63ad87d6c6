//! Control-operation error taxonomy.
//!
//! Every variant is local and recoverable: it results in a well-defined
//! job/drive state plus a caller-visible description, and never brings the
//! daemon down. Fatal conditions (corrupted persisted state) are reported
//! through `anyhow` at startup instead.

use thiserror::Error;

use crate::core::job::JobStatus;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Reservation failed: occupied, blacklisted, or capability mismatch.
    #[error("drive unavailable: {0}")]
    DriveUnavailable(String),

    #[error("drive not found: {0}")]
    DriveNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The operation is not legal from the job's current status.
    #[error("invalid transition: {op} not permitted while {status}")]
    InvalidTransition { op: &'static str, status: JobStatus },

    /// Retry requested before the disc was fully extracted.
    #[error("retry not allowed: extraction incomplete (step {step_index})")]
    RetryNotAllowed { step_index: u32 },

    #[error("output path is locked")]
    OutputLocked,

    #[error("invalid output path: {0}")]
    InvalidOutputPath(String),

    /// External tool failed. Recorded on the job; the daemon stays up.
    #[error("step '{step}' failed: {detail}")]
    StepExecution { step: String, detail: String },

    /// The drive vanished mid-job (media or hardware gone).
    #[error("hardware fault on {drive}: {detail}")]
    HardwareFault { drive: String, detail: String },

    #[error("metadata lookup failed: {0}")]
    Metadata(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;
