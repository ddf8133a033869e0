//! Error types for the transfer engine.

use crate::upload::UploadPlan;

/// Errors produced by a single remote call or chunk attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP status {status}")]
    Http { status: u16 },

    #[error("rate limited by remote")]
    RateLimited,

    #[error("credential expired")]
    CredentialExpired,

    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("remote error {errno}: {message}")]
    Remote { errno: i64, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("chunk {key} failed after {attempts} attempt(s), last status {status}: {source}")]
    Chunk {
        key: String,
        attempts: u32,
        status: String,
        #[source]
        source: Box<TransferError>,
    },
}

impl TransferError {
    /// Returns `true` for failures worth repeating unchanged: dropped
    /// connections, timeouts, 5xx/429 and vendor throttling.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited => true,
            Self::Http { status } => *status >= 500 || *status == 429,
            Self::Chunk { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Returns `true` when the remote answered with data that does not
    /// match what was asked for or what was sent.
    pub fn is_integrity(&self) -> bool {
        match self {
            Self::IntegrityMismatch(_) => true,
            Self::Chunk { source, .. } => source.is_integrity(),
            _ => false,
        }
    }
}

/// Session-level failure surfaced to the caller of a download or upload.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Rejected before any network call.
    #[error("invalid transfer configuration: {0}")]
    Config(String),

    /// Stopped mid-transfer; the side-car metadata is kept for a resume.
    #[error("transfer interrupted, progress kept for resume: {0}")]
    Resumable(#[source] TransferError),

    /// Every chunk reported success but the result is unusable.
    #[error("transfer failed: {0}")]
    Terminal(#[source] TransferError),

    /// All blocks were accepted but the commit call failed. Retrying the
    /// commit with `plan` does not re-send any block.
    #[error("commit failed for upload session {}: {source}", plan.upload_id)]
    CommitFailed {
        plan: Box<UploadPlan>,
        #[source]
        source: TransferError,
    },
}

impl SessionError {
    /// Returns `true` if calling again with the same arguments can finish
    /// the transfer without starting over.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Resumable(_) | Self::CommitFailed { .. })
    }

    pub(crate) fn from_setup(err: TransferError) -> Self {
        match err {
            TransferError::Config(msg) => Self::Config(msg),
            other => Self::Resumable(other),
        }
    }
}
