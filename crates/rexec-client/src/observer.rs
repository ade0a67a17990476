use rexec_protocol::{RpcCall, ScriptTicket};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::orchestrator::ScriptExecutionState;
use crate::stage::CallStage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed { retryable: bool, message: String },
    Cancelled,
    Abandoned,
    TimedOut,
}

impl AttemptOutcome {
    pub fn from_error(err: &RpcError) -> Self {
        match err {
            RpcError::Cancelled { .. } => Self::Cancelled,
            RpcError::Abandoned { .. } => Self::Abandoned,
            RpcError::TimedOut { .. } => Self::TimedOut,
            other => Self::Failed {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}

/// One invocation of one remote operation. Immutable once recorded.
#[derive(Debug, Clone)]
pub struct RpcAttempt {
    pub call: RpcCall,
    pub index: u32,
    pub stage: CallStage,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub outcome: AttemptOutcome,
}

/// Every attempt made for one logical call through the retry engine.
#[derive(Debug, Clone)]
pub struct RpcCallMetrics {
    pub call: RpcCall,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub attempts: Vec<RpcAttempt>,
    pub succeeded: bool,
}

impl RpcCallMetrics {
    pub fn new(call: RpcCall) -> Self {
        Self {
            call,
            started_at: SystemTime::now(),
            duration: Duration::ZERO,
            attempts: Vec::new(),
            succeeded: false,
        }
    }
}

/// Calls made while executing one script, in order.
#[derive(Debug, Clone, Default)]
pub struct OperationMetrics {
    pub rpc_calls: Vec<RpcCallMetrics>,
    pub duration: Duration,
}

impl OperationMetrics {
    /// Number of logical calls made to `operation` (e.g. "CancelScript").
    pub fn calls_to(&self, operation: &str) -> usize {
        self.rpc_calls
            .iter()
            .filter(|c| c.call.operation == operation)
            .count()
    }

    /// Total attempts across all calls to `operation`.
    pub fn attempts_of(&self, operation: &str) -> usize {
        self.rpc_calls
            .iter()
            .filter(|c| c.call.operation == operation)
            .map(|c| c.attempts.len())
            .sum()
    }
}

/// Hook for metrics collectors. Every method defaults to doing nothing.
pub trait ClientObserver: Send + Sync {
    fn rpc_attempt_finished(&self, _attempt: &RpcAttempt) {}

    fn rpc_call_completed(&self, _call: &RpcCallMetrics) {}

    fn script_state_changed(
        &self,
        _ticket: Option<&ScriptTicket>,
        _from: ScriptExecutionState,
        _to: ScriptExecutionState,
    ) {
    }

    fn execute_script_completed(&self, _ticket: Option<&ScriptTicket>, _metrics: &OperationMetrics) {}
}

/// Logs every observation through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ClientObserver for TracingObserver {
    fn rpc_attempt_finished(&self, attempt: &RpcAttempt) {
        match &attempt.outcome {
            AttemptOutcome::Succeeded => debug!(
                call = %attempt.call,
                attempt = attempt.index,
                duration_ms = attempt.duration.as_millis() as u64,
                "rpc attempt succeeded"
            ),
            AttemptOutcome::Failed { retryable, message } => warn!(
                call = %attempt.call,
                attempt = attempt.index,
                stage = %attempt.stage,
                retryable,
                "rpc attempt failed: {message}"
            ),
            other => info!(
                call = %attempt.call,
                attempt = attempt.index,
                stage = %attempt.stage,
                outcome = ?other,
                "rpc attempt interrupted"
            ),
        }
    }

    fn rpc_call_completed(&self, call: &RpcCallMetrics) {
        debug!(
            call = %call.call,
            attempts = call.attempts.len(),
            succeeded = call.succeeded,
            duration_ms = call.duration.as_millis() as u64,
            "rpc call completed"
        );
    }

    fn script_state_changed(
        &self,
        ticket: Option<&ScriptTicket>,
        from: ScriptExecutionState,
        to: ScriptExecutionState,
    ) {
        debug!(ticket = ?ticket.map(|t| t.to_string()), ?from, ?to, "script state changed");
    }

    fn execute_script_completed(&self, ticket: Option<&ScriptTicket>, metrics: &OperationMetrics) {
        info!(
            ticket = ?ticket.map(|t| t.to_string()),
            rpc_calls = metrics.rpc_calls.len(),
            duration_ms = metrics.duration.as_millis() as u64,
            "script execution finished"
        );
    }
}
