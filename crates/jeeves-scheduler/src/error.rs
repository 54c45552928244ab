use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
