use rexec_protocol::{ErrorCode, ProcessOutput, ScriptTicket};
use std::time::Duration;
use thiserror::Error;

use crate::stage::CallStage;

pub type RpcResult<T> = std::result::Result<T, RpcError>;
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Outcome of a single failed attempt.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("transport failure while {stage}: {message}")]
    Transport { stage: CallStage, message: String },
    #[error("agent rejected the call ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("cancelled while {stage}")]
    Cancelled { stage: CallStage },
    #[error("abandoned after waiting {after:?} for the call to unwind")]
    Abandoned { after: Duration },
    #[error("ran past the retry budget while {stage}")]
    TimedOut { stage: CallStage },
}

impl RpcError {
    /// Stage the attempt had reached when it failed. Any reply from the agent
    /// means the request got there.
    pub fn stage(&self) -> CallStage {
        match self {
            Self::Transport { stage, .. } | Self::Cancelled { stage } | Self::TimedOut { stage } => {
                *stage
            }
            Self::Rejected { .. } | Self::Protocol { .. } | Self::Abandoned { .. } => {
                CallStage::InFlight
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Errors surfaced to callers of the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(
        "{operation}: retry budget exhausted after {attempts} attempt(s) in {elapsed:?}{}",
        last_error_suffix(.last_error)
    )]
    RetryBudgetExhausted {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        last_error: Option<String>,
    },
    #[error("{operation}: connection faulted after {attempts} attempt(s): {message}")]
    ConnectionFaulted {
        operation: String,
        attempts: u32,
        message: String,
    },
    #[error("{operation}: rejected by agent ({code}): {message}")]
    Rejected {
        operation: String,
        code: ErrorCode,
        message: String,
    },
    #[error("{operation}: protocol error: {message}")]
    Protocol { operation: String, message: String },
    #[error("{operation}: cancelled while {stage} after {attempts} attempt(s)")]
    OperationCancelled {
        operation: String,
        stage: CallStage,
        attempts: u32,
    },
    #[error("{operation}: abandoned after {after:?}; the agent may still be executing it")]
    OperationAbandoned {
        operation: String,
        after: Duration,
        attempts: u32,
    },
    /// The legacy contract assigns tickets itself, so a start that may have
    /// been issued before cannot be told apart from a new script.
    #[error("{operation}: refusing to start a script that may already have been started")]
    UnsafeStartAttempt { operation: String },
    #[error("script {ticket} was cancelled after it may have started ({} log lines collected)", .logs.len())]
    ScriptExecutionCancelled {
        ticket: ScriptTicket,
        logs: Vec<ProcessOutput>,
    },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(": {err}"),
        None => String::new(),
    }
}

impl ClientError {
    /// Transport failures that outlasted their retries.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Self::RetryBudgetExhausted { .. } | Self::ConnectionFaulted { .. }
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::OperationCancelled { .. }
                | Self::OperationAbandoned { .. }
                | Self::ScriptExecutionCancelled { .. }
        )
    }

    /// True when a cancelled call provably never reached the agent on its
    /// only attempt.
    pub fn cancelled_before_reaching_agent(&self) -> bool {
        matches!(
            self,
            Self::OperationCancelled {
                stage: CallStage::Connecting,
                attempts: 1,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        let transport = RpcError::Transport {
            stage: CallStage::Connecting,
            message: "refused".into(),
        };
        let rejected = RpcError::Rejected {
            code: ErrorCode::UnsupportedCommand,
            message: "nope".into(),
        };
        assert!(transport.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(!RpcError::Cancelled {
            stage: CallStage::Connecting
        }
        .is_retryable());
    }

    #[test]
    fn replies_from_the_agent_count_as_in_flight() {
        let rejected = RpcError::Rejected {
            code: ErrorCode::NotFound,
            message: "missing".into(),
        };
        assert_eq!(rejected.stage(), CallStage::InFlight);
        assert_eq!(
            RpcError::TimedOut {
                stage: CallStage::Connecting
            }
            .stage(),
            CallStage::Connecting
        );
    }

    #[test]
    fn budget_exhausted_message_includes_last_error() {
        let err = ClientError::RetryBudgetExhausted {
            operation: "ScriptServiceV2.GetStatus".into(),
            attempts: 3,
            elapsed: Duration::from_secs(2),
            last_error: Some("connection refused".into()),
        };
        let message = err.to_string();
        assert!(message.starts_with("ScriptServiceV2.GetStatus: retry budget exhausted"));
        assert!(message.ends_with(": connection refused"));
        assert!(err.is_connection_fault());
    }

    #[test]
    fn cancelled_before_reaching_agent_requires_single_connecting_attempt() {
        let first = ClientError::OperationCancelled {
            operation: "op".into(),
            stage: CallStage::Connecting,
            attempts: 1,
        };
        let retried = ClientError::OperationCancelled {
            operation: "op".into(),
            stage: CallStage::Connecting,
            attempts: 2,
        };
        let in_flight = ClientError::OperationCancelled {
            operation: "op".into(),
            stage: CallStage::InFlight,
            attempts: 1,
        };
        assert!(first.cancelled_before_reaching_agent());
        assert!(!retried.cancelled_before_reaching_agent());
        assert!(!in_flight.cancelled_before_reaching_agent());
        assert!(first.is_cancellation());
    }
}
