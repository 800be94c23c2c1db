use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Every way a job can fail. Each variant aborts the rest of the plan.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("failed to acquire asset '{asset_id}': {reason}")]
    AcquisitionFailed { asset_id: String, reason: String },

    #[error("could not determine duration of {}: {reason}", path.display())]
    InvalidDuration { path: PathBuf, reason: String },

    #[error("invalid resolution '{input}': {reason}")]
    InvalidResolution { input: String, reason: String },

    #[error("encoder exited with {}", exit_code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")))]
    EncodeFailed {
        exit_code: Option<i32>,
        diagnostics: String,
    },

    #[error("encoder exceeded the {}s time limit", limit.as_secs())]
    Timeout { limit: Duration },

    #[error("failed to publish {}: {reason}", path.display())]
    PublicationFailed { path: PathBuf, reason: String },

    #[error("workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    pub fn invalid_duration(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidDuration {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_resolution(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResolution {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn acquisition(asset_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AcquisitionFailed {
            asset_id: asset_id.into(),
            reason: reason.into(),
        }
    }

    /// Stable label used in responses, logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::AcquisitionFailed { .. } => "acquisition_failed",
            Self::InvalidDuration { .. } => "invalid_duration",
            Self::InvalidResolution { .. } => "invalid_resolution",
            Self::EncodeFailed { .. } => "encode_failed",
            Self::Timeout { .. } => "timeout",
            Self::PublicationFailed { .. } => "publication_failed",
            Self::Workspace { .. } => "workspace_error",
        }
    }

    /// HTTP-equivalent status for callers that front the pipeline with a web shell.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::AcquisitionFailed { .. } => 502,
            Self::InvalidDuration { .. } | Self::InvalidResolution { .. } => 422,
            Self::Timeout { .. } => 504,
            Self::EncodeFailed { .. } | Self::PublicationFailed { .. } | Self::Workspace { .. } => {
                500
            }
        }
    }

    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::EncodeFailed { diagnostics, .. } if !diagnostics.is_empty() => {
                Some(diagnostics.as_str())
            }
            _ => None,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// A transient file that could not be removed. Logged, never fatal.
#[derive(Debug, Clone)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub reason: String,
}
