use rexec_protocol::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("service not hosted by this agent: {0}")]
    UnknownService(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt workspace state: {0}")]
    State(#[from] serde_json::Error),
}

impl AgentError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            AgentError::UnknownService(_) => (ErrorCode::UnknownService, self.to_string()),
            AgentError::InvalidRequest(_) => (ErrorCode::InvalidRequest, self.to_string()),
            AgentError::FileNotFound(_) => (ErrorCode::NotFound, self.to_string()),
            AgentError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
            AgentError::State(_) => (ErrorCode::ServerError, self.to_string()),
        }
    }
}
