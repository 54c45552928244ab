use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM client error: {0}")]
    Client(#[from] crate::client::ClientError),

    #[error("Session store error: {0}")]
    Session(#[from] jeeves_sessions::SessionError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
