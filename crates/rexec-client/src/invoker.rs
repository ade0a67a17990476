use async_trait::async_trait;
use rexec_protocol::{Request, RpcCall};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{RpcError, RpcResult};
use crate::observer::{AttemptOutcome, RpcAttempt};
use crate::stage::{CallStage, StageTracker};
use crate::transport::AgentTransport;

/// Per-attempt state visible to interceptors and the transport.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub call: RpcCall,
    pub attempt: u32,
    pub stage: StageTracker,
    pub cancel: CancellationToken,
}

/// Middleware around every attempt. Call `next.run(..)` to continue the
/// chain, or return without calling it to short-circuit.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept(
        &self,
        request: Request,
        ctx: &CallContext,
        next: Next,
    ) -> RpcResult<Option<Value>>;
}

/// The remainder of an interceptor chain, ending at the transport.
pub struct Next {
    chain: Arc<Vec<Arc<dyn Interceptor>>>,
    position: usize,
    transport: Arc<dyn AgentTransport>,
}

impl Next {
    pub async fn run(self, request: Request, ctx: &CallContext) -> RpcResult<Option<Value>> {
        match self.chain.get(self.position).cloned() {
            Some(interceptor) => {
                let next = Next {
                    chain: self.chain,
                    position: self.position + 1,
                    transport: self.transport,
                };
                interceptor.intercept(request, ctx, next).await
            }
            None => self.transport.send(request, ctx).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttemptLimits {
    /// How long to wait for an in-flight call to unwind after cancellation.
    pub abandon_after: Duration,
    /// Abort the attempt if it is still running at this instant.
    pub deadline: Option<Instant>,
}

/// Runs single attempts of remote operations and classifies how they ended.
#[derive(Clone)]
pub struct RpcInvoker {
    transport: Arc<dyn AgentTransport>,
    interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
}

impl RpcInvoker {
    pub fn new(transport: Arc<dyn AgentTransport>, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            transport,
            interceptors: Arc::new(interceptors),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Make one attempt.
    ///
    /// Cancellation before the request reaches the agent ends the attempt at
    /// once. After that point the call is given `abandon_after` to unwind and
    /// is then left running in the background.
    pub async fn attempt(
        &self,
        request: Request,
        index: u32,
        cancel: &CancellationToken,
        limits: AttemptLimits,
    ) -> (RpcAttempt, RpcResult<Option<Value>>) {
        let call = request.rpc_call();
        let started_at = SystemTime::now();
        let clock = Instant::now();
        let stage = StageTracker::new();

        let result = if cancel.is_cancelled() {
            Err(RpcError::Cancelled {
                stage: CallStage::Connecting,
            })
        } else {
            self.run(call, request, index, cancel, &stage, limits).await
        };

        let attempt = RpcAttempt {
            call,
            index,
            stage: match &result {
                Ok(_) => CallStage::InFlight,
                Err(err) => err.stage(),
            },
            started_at,
            duration: clock.elapsed(),
            outcome: match &result {
                Ok(_) => AttemptOutcome::Succeeded,
                Err(err) => AttemptOutcome::from_error(err),
            },
        };
        (attempt, result)
    }

    async fn run(
        &self,
        call: RpcCall,
        request: Request,
        index: u32,
        cancel: &CancellationToken,
        stage: &StageTracker,
        limits: AttemptLimits,
    ) -> RpcResult<Option<Value>> {
        let attempt_cancel = cancel.child_token();
        let ctx = CallContext {
            call,
            attempt: index,
            stage: stage.clone(),
            cancel: attempt_cancel.clone(),
        };
        let next = Next {
            chain: Arc::clone(&self.interceptors),
            position: 0,
            transport: Arc::clone(&self.transport),
        };
        let mut task = tokio::spawn(async move { next.run(request, &ctx).await });

        let deadline = async {
            match limits.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            joined = &mut task => flatten(joined, stage),
            _ = cancel.cancelled() => {
                unwind_after_cancel(&mut task, stage, limits.abandon_after, call).await
            }
            _ = deadline => {
                let stage_at_deadline = if stage.withdraw() {
                    CallStage::Connecting
                } else {
                    CallStage::InFlight
                };
                attempt_cancel.cancel();
                task.abort();
                Err(RpcError::TimedOut { stage: stage_at_deadline })
            }
        }
    }
}

fn flatten(
    joined: Result<RpcResult<Option<Value>>, tokio::task::JoinError>,
    stage: &StageTracker,
) -> RpcResult<Option<Value>> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(RpcError::Transport {
            stage: stage.current(),
            message: format!("attempt task failed: {err}"),
        }),
    }
}

async fn unwind_after_cancel(
    task: &mut JoinHandle<RpcResult<Option<Value>>>,
    stage: &StageTracker,
    abandon_after: Duration,
    call: RpcCall,
) -> RpcResult<Option<Value>> {
    if stage.withdraw() {
        task.abort();
        return Err(RpcError::Cancelled {
            stage: CallStage::Connecting,
        });
    }

    match tokio::time::timeout(abandon_after, &mut *task).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(_) => Err(RpcError::Cancelled {
            stage: CallStage::InFlight,
        }),
        Err(_) => {
            warn!(
                %call,
                abandon_after_ms = abandon_after.as_millis() as u64,
                "in-flight call did not unwind after cancellation; abandoning it"
            );
            Err(RpcError::Abandoned {
                after: abandon_after,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_protocol::{ErrorCode, services};
    use std::sync::Mutex;

    /// Sleeps for `delay` after handing off, ignoring cancellation if `stubborn`.
    struct SlowTransport {
        hand_off: bool,
        delay: Duration,
        stubborn: bool,
    }

    #[async_trait]
    impl AgentTransport for SlowTransport {
        fn endpoint(&self) -> &str {
            "slow"
        }

        async fn send(&self, _request: Request, ctx: &CallContext) -> RpcResult<Option<Value>> {
            if self.hand_off && !ctx.stage.hand_off() {
                return Err(RpcError::Cancelled {
                    stage: CallStage::Connecting,
                });
            }
            if self.stubborn {
                tokio::time::sleep(self.delay).await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = ctx.cancel.cancelled() => {
                        return Err(RpcError::Cancelled { stage: ctx.stage.current() });
                    }
                }
            }
            Ok(Some(Value::from(7)))
        }
    }

    fn invoker(transport: SlowTransport) -> RpcInvoker {
        RpcInvoker::new(Arc::new(transport), Vec::new())
    }

    fn limits(abandon_after: Duration) -> AttemptLimits {
        AttemptLimits {
            abandon_after,
            deadline: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_recorded_in_flight() {
        let invoker = invoker(SlowTransport {
            hand_off: true,
            delay: Duration::from_millis(10),
            stubborn: false,
        });
        let cancel = CancellationToken::new();
        let (attempt, result) = invoker
            .attempt(Request::GetCapabilities, 1, &cancel, limits(Duration::from_secs(1)))
            .await;
        assert_eq!(result.unwrap(), Some(Value::from(7)));
        assert_eq!(attempt.stage, CallStage::InFlight);
        assert_eq!(attempt.outcome, AttemptOutcome::Succeeded);
        assert_eq!(attempt.call.service, services::CAPABILITIES);
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_never_reaches_transport() {
        let invoker = invoker(SlowTransport {
            hand_off: true,
            delay: Duration::ZERO,
            stubborn: false,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (attempt, result) = invoker
            .attempt(Request::GetCapabilities, 1, &cancel, limits(Duration::from_secs(1)))
            .await;
        assert!(matches!(
            result,
            Err(RpcError::Cancelled {
                stage: CallStage::Connecting
            })
        ));
        assert_eq!(attempt.outcome, AttemptOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_connecting_returns_immediately() {
        let invoker = invoker(SlowTransport {
            hand_off: false,
            delay: Duration::from_secs(60),
            stubborn: true,
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let (_, result) = invoker
            .attempt(Request::GetCapabilities, 1, &cancel, limits(Duration::from_secs(5)))
            .await;
        assert!(matches!(
            result,
            Err(RpcError::Cancelled {
                stage: CallStage::Connecting
            })
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_in_flight_waits_for_cooperative_unwind() {
        let invoker = invoker(SlowTransport {
            hand_off: true,
            delay: Duration::from_secs(60),
            stubborn: false,
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let (attempt, result) = invoker
            .attempt(Request::GetCapabilities, 1, &cancel, limits(Duration::from_secs(5)))
            .await;
        assert!(matches!(
            result,
            Err(RpcError::Cancelled {
                stage: CallStage::InFlight
            })
        ));
        assert_eq!(attempt.stage, CallStage::InFlight);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_in_flight_call_is_abandoned_after_grace() {
        let invoker = invoker(SlowTransport {
            hand_off: true,
            delay: Duration::from_secs(600),
            stubborn: true,
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let (attempt, result) = invoker
            .attempt(Request::GetCapabilities, 1, &cancel, limits(Duration::from_secs(2)))
            .await;
        assert!(matches!(result, Err(RpcError::Abandoned { .. })));
        assert_eq!(attempt.outcome, AttemptOutcome::Abandoned);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out_the_attempt() {
        let invoker = invoker(SlowTransport {
            hand_off: true,
            delay: Duration::from_secs(60),
            stubborn: true,
        });
        let cancel = CancellationToken::new();
        let (_, result) = invoker
            .attempt(
                Request::GetCapabilities,
                2,
                &cancel,
                AttemptLimits {
                    abandon_after: Duration::from_secs(1),
                    deadline: Some(Instant::now() + Duration::from_secs(3)),
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(RpcError::TimedOut {
                stage: CallStage::InFlight
            })
        ));
    }

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        async fn intercept(
            &self,
            request: Request,
            ctx: &CallContext,
            next: Next,
        ) -> RpcResult<Option<Value>> {
            self.seen.lock().unwrap().push(self.name);
            next.run(request, ctx).await
        }
    }

    struct Reject;

    #[async_trait]
    impl Interceptor for Reject {
        async fn intercept(
            &self,
            _request: Request,
            _ctx: &CallContext,
            _next: Next,
        ) -> RpcResult<Option<Value>> {
            Err(RpcError::Rejected {
                code: ErrorCode::UnsupportedCommand,
                message: "blocked".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interceptors_run_in_order_and_can_short_circuit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Recorder {
                name: "outer",
                seen: Arc::clone(&seen),
            }),
            Arc::new(Recorder {
                name: "inner",
                seen: Arc::clone(&seen),
            }),
            Arc::new(Reject),
        ];
        let invoker = RpcInvoker::new(
            Arc::new(SlowTransport {
                hand_off: true,
                delay: Duration::ZERO,
                stubborn: false,
            }),
            interceptors,
        );
        let (_, result) = invoker
            .attempt(
                Request::GetCapabilities,
                1,
                &CancellationToken::new(),
                limits(Duration::from_secs(1)),
            )
            .await;
        assert!(matches!(result, Err(RpcError::Rejected { .. })));
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "inner"]);
    }
}
