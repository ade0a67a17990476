use rexec_protocol::{Request, RpcCall};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult, RpcError};
use crate::invoker::{AttemptLimits, RpcInvoker};
use crate::observer::{ClientObserver, OperationMetrics, RpcCallMetrics};
use crate::stage::CallStage;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Total time one logical call may spend across all of its attempts.
    pub total_duration: Duration,
    /// Do not start a retry unless at least this much budget would remain
    /// after the backoff.
    pub retry_if_remaining_at_least: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retry in-flight failures at least this many attempts in total, even
    /// when little budget remains. Connecting failures never qualify.
    pub minimum_attempts_for_interrupted_calls: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            total_duration: Duration::from_secs(150),
            retry_if_remaining_at_least: Duration::from_secs(1),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            minimum_attempts_for_interrupted_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    NotRetryable,
    RetriesDisabled,
    BudgetExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay` then try again. `forced` marks a retry granted only
    /// by the minimum-attempts rule.
    RetryAfter { delay: Duration, forced: bool },
    GiveUp(GiveUpReason),
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Exponential backoff, never zero and never above `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let capped = attempt.clamp(1, 31);
        let mult = 1u64 << (capped - 1);
        let millis = self.base_delay.as_millis() as u64;
        let raw = millis.saturating_mul(mult);
        let max = (self.max_delay.as_millis() as u64).max(1);
        Duration::from_millis(raw.clamp(1, max))
    }

    /// Decide what to do after `attempts` attempts have failed, the last one
    /// with `error`, `elapsed` into the budget.
    pub fn decide(&self, error: &RpcError, attempts: u32, elapsed: Duration) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp(GiveUpReason::NotRetryable);
        }
        if !self.enabled {
            return RetryDecision::GiveUp(GiveUpReason::RetriesDisabled);
        }

        let delay = self.backoff_delay(attempts);
        let resume_at = elapsed.saturating_add(delay);
        let remaining = self.total_duration.saturating_sub(resume_at);
        if remaining > self.retry_if_remaining_at_least {
            return RetryDecision::RetryAfter {
                delay,
                forced: false,
            };
        }

        let within_budget = resume_at < self.total_duration;
        if within_budget
            && error.stage() == CallStage::InFlight
            && attempts < self.minimum_attempts_for_interrupted_calls
        {
            return RetryDecision::RetryAfter {
                delay,
                forced: true,
            };
        }

        RetryDecision::GiveUp(GiveUpReason::BudgetExhausted)
    }
}

/// Time accounting for one logical call.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    pub total: Duration,
    started: Instant,
    pub backoff_schedule: Vec<Duration>,
}

impl RetryBudget {
    pub fn start(total: Duration) -> Self {
        Self {
            total,
            started: Instant::now(),
            backoff_schedule: Vec::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn has_time_left(&self) -> bool {
        self.elapsed() < self.total
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.total
    }

    pub fn record_backoff(&mut self, delay: Duration) {
        self.backoff_schedule.push(delay);
    }
}

/// Per-call knobs that differ between steps of a script execution.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub retries: bool,
    pub abandon_after: Duration,
}

impl CallOptions {
    pub fn with_retries(abandon_after: Duration) -> Self {
        Self {
            retries: true,
            abandon_after,
        }
    }

    pub fn once(abandon_after: Duration) -> Self {
        Self {
            retries: false,
            abandon_after,
        }
    }
}

/// Wraps the invoker with a retry policy and a per-call time budget.
#[derive(Clone)]
pub struct RetryEngine {
    invoker: RpcInvoker,
    policy: RetryPolicy,
    observer: Arc<dyn ClientObserver>,
}

impl RetryEngine {
    pub fn new(invoker: RpcInvoker, policy: RetryPolicy, observer: Arc<dyn ClientObserver>) -> Self {
        Self {
            invoker,
            policy,
            observer,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.invoker.endpoint()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `request` to a decoded reply, retrying transient failures while
    /// the budget allows. Every attempt is reported to the observer and
    /// recorded in `metrics`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: Request,
        cancel: &CancellationToken,
        options: CallOptions,
        metrics: &mut OperationMetrics,
    ) -> ClientResult<T> {
        let call = request.rpc_call();
        let mut call_metrics = RpcCallMetrics::new(call);
        let clock = Instant::now();

        let result = self
            .run_attempts(request, cancel, options, &mut call_metrics)
            .await
            .and_then(|data| decode(call, data));

        call_metrics.duration = clock.elapsed();
        call_metrics.succeeded = result.is_ok();
        self.observer.rpc_call_completed(&call_metrics);
        metrics.rpc_calls.push(call_metrics);
        result
    }

    /// A single attempt with no retries.
    pub async fn execute_once<T: DeserializeOwned>(
        &self,
        request: Request,
        cancel: &CancellationToken,
        abandon_after: Duration,
        metrics: &mut OperationMetrics,
    ) -> ClientResult<T> {
        self.execute(request, cancel, CallOptions::once(abandon_after), metrics)
            .await
    }

    async fn run_attempts(
        &self,
        request: Request,
        cancel: &CancellationToken,
        options: CallOptions,
        call_metrics: &mut RpcCallMetrics,
    ) -> ClientResult<Option<serde_json::Value>> {
        let call = call_metrics.call;
        let operation = call.to_string();
        let mut budget = RetryBudget::start(self.policy.total_duration);
        let mut attempts = 0u32;
        let mut furthest = CallStage::Connecting;
        let mut last_error: Option<RpcError> = None;
        let mut unbounded = true;

        loop {
            if !budget.has_time_left() {
                return Err(ClientError::RetryBudgetExhausted {
                    operation,
                    attempts,
                    elapsed: budget.elapsed(),
                    last_error: last_error.map(|e| e.to_string()),
                });
            }

            attempts += 1;
            let limits = AttemptLimits {
                abandon_after: options.abandon_after,
                deadline: (!unbounded).then(|| budget.deadline()),
            };
            let (attempt, result) = self
                .invoker
                .attempt(request.clone(), attempts, cancel, limits)
                .await;
            self.observer.rpc_attempt_finished(&attempt);
            call_metrics.attempts.push(attempt);

            let err = match result {
                Ok(data) => return Ok(data),
                Err(err) => err,
            };
            furthest = furthest.max(err.stage());

            match err {
                RpcError::Cancelled { .. } => {
                    return Err(ClientError::OperationCancelled {
                        operation,
                        stage: furthest,
                        attempts,
                    });
                }
                RpcError::Abandoned { after } => {
                    return Err(ClientError::OperationAbandoned {
                        operation,
                        after,
                        attempts,
                    });
                }
                RpcError::TimedOut { .. } => {
                    warn!(%call, attempts, "retry attempt ran out of budget");
                    return Err(ClientError::RetryBudgetExhausted {
                        operation,
                        attempts,
                        elapsed: budget.elapsed(),
                        last_error: Some(last_error.unwrap_or(err).to_string()),
                    });
                }
                _ => {}
            }

            let policy_decision = if options.retries {
                self.policy.decide(&err, attempts, budget.elapsed())
            } else if err.is_retryable() {
                RetryDecision::GiveUp(GiveUpReason::RetriesDisabled)
            } else {
                RetryDecision::GiveUp(GiveUpReason::NotRetryable)
            };

            match policy_decision {
                RetryDecision::RetryAfter { delay, forced } => {
                    warn!(
                        %call,
                        attempt = attempts,
                        stage = %err.stage(),
                        delay_ms = delay.as_millis() as u64,
                        forced,
                        "retrying after transient failure: {err}"
                    );
                    budget.record_backoff(delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            debug!(%call, "cancelled during retry backoff");
                            return Err(ClientError::OperationCancelled {
                                operation,
                                stage: furthest,
                                attempts,
                            });
                        }
                    }
                    unbounded = forced;
                    last_error = Some(err);
                }
                RetryDecision::GiveUp(reason) => {
                    return Err(give_up(operation, err, reason, attempts, &budget));
                }
            }
        }
    }
}

fn give_up(
    operation: String,
    err: RpcError,
    reason: GiveUpReason,
    attempts: u32,
    budget: &RetryBudget,
) -> ClientError {
    match (reason, err) {
        (_, RpcError::Rejected { code, message }) => ClientError::Rejected {
            operation,
            code,
            message,
        },
        (_, RpcError::Protocol { message }) => ClientError::Protocol { operation, message },
        (GiveUpReason::BudgetExhausted, err) => ClientError::RetryBudgetExhausted {
            operation,
            attempts,
            elapsed: budget.elapsed(),
            last_error: Some(err.to_string()),
        },
        (_, err) => ClientError::ConnectionFaulted {
            operation,
            attempts,
            message: err.to_string(),
        },
    }
}

fn decode<T: DeserializeOwned>(call: RpcCall, data: Option<serde_json::Value>) -> ClientResult<T> {
    serde_json::from_value(data.unwrap_or(serde_json::Value::Null)).map_err(|err| {
        ClientError::Protocol {
            operation: call.to_string(),
            message: format!("failed to decode reply: {err}"),
        }
    })
}
