//! Error types shared by script rendering, submission and status polling

use thiserror::Error;

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// A scheduler command exited non-zero for a reason we can't resolve locally
    #[error("command `{command}` failed with return code {code}\nerror message: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to render template: {0}")]
    Template(#[from] tinytemplate::error::Error),

    #[error("Invalid resources: {0}")]
    InvalidResources(String),

    #[error("Invalid job description: {0}")]
    InvalidJob(String),

    /// sbatch exited cleanly but didn't print a job id
    #[error("Can't read job id from sbatch output: {0:?}")]
    Submission(String),
}

impl DispatchError {
    pub fn command_failed(command: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            code,
            stderr: stderr.into(),
        }
    }
}
