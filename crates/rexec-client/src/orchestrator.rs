use rexec_protocol::{ProcessOutput, ScriptStatus, ScriptTicket, exit_codes};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::PollBackoffStrategy;
use crate::capabilities::ScriptServiceVersion;
use crate::command::ScriptCommand;
use crate::error::{ClientError, ClientResult};
use crate::executor::{CommandContext, ScriptExecutor, StartAttempt, abandon_after_cancellation};
use crate::observer::{ClientObserver, OperationMetrics};
use crate::retry::RetryEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptExecutionState {
    NotStarted,
    Starting,
    Polling,
    CancelRequested,
    Cancelling,
    Completing,
    Complete,
}

impl ScriptExecutionState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use ScriptExecutionState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Polling)
                | (Starting, CancelRequested)
                | (Starting, Complete)
                | (Polling, CancelRequested)
                | (Polling, Completing)
                | (CancelRequested, Cancelling)
                | (Cancelling, Completing)
                | (Completing, Complete)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    Exited(i32),
    /// The agent could not say how the script ended.
    UnknownResult,
}

impl ScriptOutcome {
    fn of(status: &ScriptStatus) -> Self {
        if exit_codes::is_unknown(status.exit_code) {
            Self::UnknownResult
        } else {
            Self::Exited(status.exit_code)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptExecutionResult {
    pub ticket: ScriptTicket,
    pub outcome: ScriptOutcome,
    pub logs: Vec<ProcessOutput>,
    pub metrics: OperationMetrics,
}

impl ScriptExecutionResult {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            ScriptOutcome::Exited(code) => code,
            ScriptOutcome::UnknownResult => exit_codes::UNKNOWN_RESULT,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == ScriptOutcome::Exited(0)
    }

    pub fn log_text(&self) -> Vec<&str> {
        self.logs.iter().map(|l| l.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// Grace given to an in-flight step after cancellation before abandoning it.
    pub abandon_grace: Duration,
    /// Once the caller has cancelled, stop waiting for Complete after this long.
    pub complete_abandon_after: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            abandon_grace: Duration::from_secs(5),
            complete_abandon_after: Duration::from_secs(5),
        }
    }
}

/// Drives one script through start, poll, cancel and complete.
pub(crate) struct ScriptOrchestrator<'a> {
    executor: ScriptExecutor<'a>,
    version: ScriptServiceVersion,
    settings: OrchestratorSettings,
    poll_backoff: &'a dyn PollBackoffStrategy,
    observer: &'a dyn ClientObserver,
    callbacks: Callbacks<'a>,
    state: ScriptExecutionState,
    ticket: Option<ScriptTicket>,
    logs: Vec<ProcessOutput>,
    metrics: OperationMetrics,
}

/// Caller hooks invoked while a script runs.
pub(crate) struct Callbacks<'a> {
    pub(crate) on_status: &'a mut (dyn FnMut(&ScriptStatus) + Send),
    /// Runs once the script has finished, cancelled or not, before its
    /// workspace is released.
    pub(crate) on_completed: &'a mut (dyn FnMut(&ScriptStatus) + Send),
}

impl<'a> ScriptOrchestrator<'a> {
    pub(crate) fn new(
        engine: &'a RetryEngine,
        version: ScriptServiceVersion,
        settings: OrchestratorSettings,
        poll_backoff: &'a dyn PollBackoffStrategy,
        observer: &'a dyn ClientObserver,
        callbacks: Callbacks<'a>,
        metrics: OperationMetrics,
    ) -> Self {
        Self {
            executor: ScriptExecutor::new(engine, settings),
            version,
            settings,
            poll_backoff,
            observer,
            callbacks,
            state: ScriptExecutionState::NotStarted,
            ticket: None,
            logs: Vec::new(),
            metrics,
        }
    }

    pub(crate) async fn run(
        mut self,
        command: ScriptCommand,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult> {
        let clock = Instant::now();
        let result = self.drive(command, cancel).await;
        self.metrics.duration += clock.elapsed();
        self.observer
            .execute_script_completed(self.ticket.as_ref(), &self.metrics);

        let (ticket, outcome) = result?;
        Ok(ScriptExecutionResult {
            ticket,
            outcome,
            logs: self.logs,
            metrics: self.metrics,
        })
    }

    async fn drive(
        &mut self,
        command: ScriptCommand,
        cancel: &CancellationToken,
    ) -> ClientResult<(ScriptTicket, ScriptOutcome)> {
        self.transition(ScriptExecutionState::Starting);
        self.ticket = ScriptExecutor::proposed_ticket(&command, self.version);

        let started = self
            .executor
            .start(&command, self.version, StartAttempt::First, cancel, &mut self.metrics)
            .await;
        let status = match started {
            Ok(operation) => {
                self.ticket = Some(operation.status.ticket.clone());
                self.absorb(&operation.status);
                operation.status
            }
            Err(err) if err.cancelled_before_reaching_agent() => {
                info!(task_id = %command.task_id, "cancelled before the script reached the agent");
                self.transition(ScriptExecutionState::Complete);
                return Err(err);
            }
            Err(err) if err.is_cancellation() => match self.ticket.clone() {
                Some(ticket) => {
                    warn!(%ticket, "start was interrupted after it may have reached the agent: {err}");
                    return self
                        .cancel_and_complete(ScriptStatus::pending(ticket), cancel)
                        .await;
                }
                None => {
                    self.transition(ScriptExecutionState::Complete);
                    return Err(err);
                }
            },
            Err(err) => {
                self.transition(ScriptExecutionState::Complete);
                return Err(err);
            }
        };

        self.transition(ScriptExecutionState::Polling);
        self.observe(status, cancel).await
    }

    async fn observe(
        &mut self,
        mut status: ScriptStatus,
        cancel: &CancellationToken,
    ) -> ClientResult<(ScriptTicket, ScriptOutcome)> {
        let mut iteration = 0u32;
        while !status.is_complete() {
            if cancel.is_cancelled() {
                return self.cancel_and_complete(status, cancel).await;
            }

            let delay = self.poll_backoff.backoff(iteration);
            iteration = iteration.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => continue,
            }

            let context = self.context(&status);
            match self.executor.get_status(&context, cancel, &mut self.metrics).await {
                Ok(next) => {
                    self.absorb(&next.status);
                    status = next.status;
                }
                Err(err) if cancel.is_cancelled() => {
                    debug!(ticket = %status.ticket, "status poll interrupted by cancellation: {err}");
                }
                Err(err) => {
                    warn!(ticket = %status.ticket, "status poll failed; cancelling the script before giving up: {err}");
                    self.transition(ScriptExecutionState::CancelRequested);
                    self.transition(ScriptExecutionState::Cancelling);
                    let uncancellable = CancellationToken::new();
                    match self
                        .executor
                        .cancel(&context, &uncancellable, &mut self.metrics)
                        .await
                    {
                        Ok(next) => self.absorb(&next.status),
                        Err(cancel_err) => {
                            warn!(ticket = %status.ticket, "cancel after failed status poll also failed: {cancel_err}")
                        }
                    }
                    self.complete(status, cancel).await;
                    return Err(err);
                }
            }
        }

        (self.callbacks.on_completed)(&status);
        self.transition(ScriptExecutionState::Completing);
        let status = self.complete(status, cancel).await;
        let outcome = ScriptOutcome::of(&status);
        if outcome == ScriptOutcome::UnknownResult {
            warn!(ticket = %status.ticket, exit_code = status.exit_code, "agent could not report the script's outcome");
        }
        Ok((status.ticket, outcome))
    }

    /// Keep asking the agent to cancel until it reports the script finished
    /// or a cancel call fails, then complete.
    async fn cancel_and_complete(
        &mut self,
        mut status: ScriptStatus,
        cancel: &CancellationToken,
    ) -> ClientResult<(ScriptTicket, ScriptOutcome)> {
        self.transition(ScriptExecutionState::CancelRequested);
        self.transition(ScriptExecutionState::Cancelling);

        // Cancelling must run to completion regardless of the caller's token.
        let uncancellable = CancellationToken::new();
        let mut iteration = 0u32;
        loop {
            let context = self.context(&status);
            match self
                .executor
                .cancel(&context, &uncancellable, &mut self.metrics)
                .await
            {
                Ok(next) => {
                    self.absorb(&next.status);
                    status = next.status;
                    if status.is_complete() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(ticket = %status.ticket, "cancel failed; completing anyway: {err}");
                    break;
                }
            }
            tokio::time::sleep(self.poll_backoff.backoff(iteration)).await;
            iteration = iteration.saturating_add(1);
        }

        (self.callbacks.on_completed)(&status);
        self.transition(ScriptExecutionState::Completing);
        let status = self.complete(status, cancel).await;
        Err(ClientError::ScriptExecutionCancelled {
            ticket: status.ticket,
            logs: std::mem::take(&mut self.logs),
        })
    }

    /// Release the agent's workspace. Best effort: the outcome is already
    /// known, so a failure here is only logged. Returns the final status.
    async fn complete(&mut self, status: ScriptStatus, cancel: &CancellationToken) -> ScriptStatus {
        if self.state != ScriptExecutionState::Completing {
            self.transition(ScriptExecutionState::Completing);
        }
        let token = abandon_after_cancellation(cancel, self.settings.complete_abandon_after);
        let context = self.context(&status);
        let result = self
            .executor
            .complete(&context, &token, &mut self.metrics)
            .await;
        token.cancel();

        let status = match result {
            Ok(Some(last)) => {
                self.absorb(&last);
                last
            }
            Ok(None) => status,
            Err(err) => {
                warn!(
                    ticket = %status.ticket,
                    "failed to complete script; the agent will reclaim its workspace later: {err}"
                );
                status
            }
        };
        self.transition(ScriptExecutionState::Complete);
        status
    }

    fn context(&self, status: &ScriptStatus) -> CommandContext {
        CommandContext::after(status, self.version)
    }

    fn absorb(&mut self, status: &ScriptStatus) {
        self.logs.extend(status.logs.iter().cloned());
        (self.callbacks.on_status)(status);
    }

    fn transition(&mut self, to: ScriptExecutionState) {
        let from = self.state;
        debug_assert!(
            from.can_transition_to(to),
            "invalid script state transition {from:?} -> {to:?}"
        );
        self.state = to;
        self.observer
            .script_state_changed(self.ticket.as_ref(), from, to);
    }
}
