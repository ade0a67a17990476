use rexec_client::observer::RpcCallMetrics;
use rexec_client::{ClientObserver, OperationMetrics, RpcAttempt, ScriptExecutionState};
use rexec_protocol::ScriptTicket;
use std::sync::Mutex;

/// Keeps every observation for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    pub attempts: Mutex<Vec<RpcAttempt>>,
    pub calls: Mutex<Vec<RpcCallMetrics>>,
    pub transitions: Mutex<Vec<(ScriptExecutionState, ScriptExecutionState)>>,
    pub completed: Mutex<Vec<OperationMetrics>>,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<ScriptExecutionState> {
        self.transitions.lock().unwrap().iter().map(|(_, to)| *to).collect()
    }
}

impl ClientObserver for RecordingObserver {
    fn rpc_attempt_finished(&self, attempt: &RpcAttempt) {
        self.attempts.lock().unwrap().push(attempt.clone());
    }

    fn rpc_call_completed(&self, call: &RpcCallMetrics) {
        self.calls.lock().unwrap().push(call.clone());
    }

    fn script_state_changed(
        &self,
        _ticket: Option<&ScriptTicket>,
        from: ScriptExecutionState,
        to: ScriptExecutionState,
    ) {
        self.transitions.lock().unwrap().push((from, to));
    }

    fn execute_script_completed(&self, _ticket: Option<&ScriptTicket>, metrics: &OperationMetrics) {
        self.completed.lock().unwrap().push(metrics.clone());
    }
}
