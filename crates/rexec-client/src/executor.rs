//! One remote call per script step.
//!
//! Each step returns the [`CommandContext`] the next step needs, so a caller
//! can drive an execution a step at a time and pick it up again later, for
//! example after its own process restarted.

use rexec_protocol::{Request, ScriptStatus, ScriptTicket, StartScriptCommand};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::capabilities::ScriptServiceVersion;
use crate::command::ScriptCommand;
use crate::error::{ClientError, ClientResult};
use crate::observer::OperationMetrics;
use crate::orchestrator::OrchestratorSettings;
use crate::retry::{CallOptions, RetryEngine};

/// What the next step of an execution needs to know.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub ticket: ScriptTicket,
    pub next_log_sequence: u64,
    pub version: ScriptServiceVersion,
}

impl CommandContext {
    pub fn after(status: &ScriptStatus, version: ScriptServiceVersion) -> Self {
        Self {
            ticket: status.ticket.clone(),
            next_log_sequence: status.next_log_sequence,
            version,
        }
    }
}

/// Whether a start may be repeating one issued earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAttempt {
    First,
    /// The caller cannot rule out an earlier start for this command having
    /// reached the agent. Only contracts with client-proposed tickets accept it.
    PossiblyRepeated,
}

/// Status returned by one step plus the context for the next.
#[derive(Debug, Clone)]
pub struct ScriptOperation {
    pub status: ScriptStatus,
    pub context: CommandContext,
}

impl ScriptOperation {
    fn new(status: ScriptStatus, version: ScriptServiceVersion) -> Self {
        let context = CommandContext::after(&status, version);
        Self { status, context }
    }
}

pub(crate) struct ScriptExecutor<'a> {
    engine: &'a RetryEngine,
    settings: OrchestratorSettings,
}

impl<'a> ScriptExecutor<'a> {
    pub(crate) fn new(engine: &'a RetryEngine, settings: OrchestratorSettings) -> Self {
        Self { engine, settings }
    }

    /// Ticket a start will use, when it is known before the agent answers.
    pub(crate) fn proposed_ticket(
        command: &ScriptCommand,
        version: ScriptServiceVersion,
    ) -> Option<ScriptTicket> {
        match version {
            ScriptServiceVersion::V2 => Some(command.ticket()),
            ScriptServiceVersion::Legacy => None,
        }
    }

    pub(crate) async fn start(
        &self,
        command: &ScriptCommand,
        version: ScriptServiceVersion,
        attempt: StartAttempt,
        cancel: &CancellationToken,
        metrics: &mut OperationMetrics,
    ) -> ClientResult<ScriptOperation> {
        match version {
            ScriptServiceVersion::V2 => {
                let request = Request::StartScript {
                    command: StartScriptCommand {
                        ticket: command.ticket(),
                        script: command.spec(),
                        wait_for_completion_ms: command
                            .wait_for_completion
                            .map(|d| d.as_millis() as u64),
                    },
                };
                let status: ScriptStatus = self
                    .engine
                    .execute(request, cancel, self.with_retries(), metrics)
                    .await?;
                Ok(ScriptOperation::new(status, version))
            }
            ScriptServiceVersion::Legacy => {
                let request = Request::StartScriptLegacy {
                    task_id: command.task_id.clone(),
                    script: command.spec(),
                };
                if attempt == StartAttempt::PossiblyRepeated {
                    return Err(ClientError::UnsafeStartAttempt {
                        operation: request.rpc_call().to_string(),
                    });
                }
                // The legacy start cannot be interrupted once issued.
                let uncancellable = CancellationToken::new();
                let ticket: ScriptTicket = self
                    .engine
                    .execute_once(request, &uncancellable, self.settings.abandon_grace, metrics)
                    .await?;
                Ok(ScriptOperation::new(ScriptStatus::pending(ticket), version))
            }
        }
    }

    pub(crate) async fn get_status(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
        metrics: &mut OperationMetrics,
    ) -> ClientResult<ScriptOperation> {
        let ticket = context.ticket.clone();
        let last_log_sequence = context.next_log_sequence;
        let status: ScriptStatus = match context.version {
            ScriptServiceVersion::V2 => {
                let request = Request::GetStatus {
                    ticket,
                    last_log_sequence,
                };
                self.engine
                    .execute(request, cancel, self.with_retries(), metrics)
                    .await?
            }
            ScriptServiceVersion::Legacy => {
                let request = Request::GetStatusLegacy {
                    ticket,
                    last_log_sequence,
                };
                self.engine
                    .execute_once(request, cancel, self.settings.abandon_grace, metrics)
                    .await?
            }
        };
        Ok(ScriptOperation::new(status, context.version))
    }

    pub(crate) async fn cancel(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
        metrics: &mut OperationMetrics,
    ) -> ClientResult<ScriptOperation> {
        let ticket = context.ticket.clone();
        let last_log_sequence = context.next_log_sequence;
        let status: ScriptStatus = match context.version {
            ScriptServiceVersion::V2 => {
                let request = Request::CancelScript {
                    ticket,
                    last_log_sequence,
                };
                self.engine
                    .execute(request, cancel, self.with_retries(), metrics)
                    .await?
            }
            ScriptServiceVersion::Legacy => {
                let request = Request::CancelScriptLegacy {
                    ticket,
                    last_log_sequence,
                };
                self.engine
                    .execute_once(request, cancel, self.settings.abandon_grace, metrics)
                    .await?
            }
        };
        Ok(ScriptOperation::new(status, context.version))
    }

    /// Release the agent's workspace. A single attempt, abandoned as soon as
    /// `cancel` fires. Only the legacy contract answers with a final status.
    pub(crate) async fn complete(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
        metrics: &mut OperationMetrics,
    ) -> ClientResult<Option<ScriptStatus>> {
        let ticket = context.ticket.clone();
        match context.version {
            ScriptServiceVersion::V2 => {
                self.engine
                    .execute_once::<()>(
                        Request::CompleteScript { ticket },
                        cancel,
                        Duration::ZERO,
                        metrics,
                    )
                    .await?;
                Ok(None)
            }
            ScriptServiceVersion::Legacy => {
                let status = self
                    .engine
                    .execute_once::<ScriptStatus>(
                        Request::CompleteScriptLegacy {
                            ticket,
                            last_log_sequence: context.next_log_sequence,
                        },
                        cancel,
                        Duration::ZERO,
                        metrics,
                    )
                    .await?;
                Ok(Some(status))
            }
        }
    }

    fn with_retries(&self) -> CallOptions {
        CallOptions::with_retries(self.settings.abandon_grace)
    }
}

/// A token that fires `after` once `cancel` has fired.
pub(crate) fn abandon_after_cancellation(
    cancel: &CancellationToken,
    after: Duration,
) -> CancellationToken {
    let token = CancellationToken::new();
    let parent = cancel.clone();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = child.cancelled() => {}
            _ = async {
                parent.cancelled().await;
                tokio::time::sleep(after).await;
            } => child.cancel(),
        }
    });
    token
}
