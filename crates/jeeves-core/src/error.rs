use thiserror::Error;

#[derive(Debug, Error)]
pub enum JeevesError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The agent lock could not be acquired within the acquisition timeout.
    /// Distinguished from execution failures so callers can report "busy"
    /// instead of a generic error.
    #[error("Agent busy: lock not acquired within {waited_ms}ms")]
    AgentBusy { waited_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, JeevesError>;
