use async_trait::async_trait;
use rexec_client::{CallContext, CallStage, Interceptor, Next, RpcError, RpcResult};
use rexec_protocol::Request;
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Records the operation of every attempt that passes through it.
#[derive(Default)]
pub struct CallRecorder {
    calls: Mutex<Vec<&'static str>>,
}

impl CallRecorder {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|c| **c == operation).count()
    }
}

#[async_trait]
impl Interceptor for CallRecorder {
    async fn intercept(&self, request: Request, ctx: &CallContext, next: Next) -> RpcResult<Option<Value>> {
        self.calls.lock().unwrap().push(ctx.call.operation);
        next.run(request, ctx).await
    }
}

/// Fails the first `times` attempts at `operation` with a transport error.
///
/// A `Connecting` failure never reaches the agent. An `InFlight` failure
/// delivers the request and then drops the reply, like a connection lost
/// while waiting for the answer.
pub struct FailFirst {
    operation: &'static str,
    stage: CallStage,
    remaining: AtomicU32,
}

impl FailFirst {
    pub fn new(operation: &'static str, stage: CallStage, times: u32) -> Self {
        Self {
            operation,
            stage,
            remaining: AtomicU32::new(times),
        }
    }

    /// Fail every attempt.
    pub fn always(operation: &'static str, stage: CallStage) -> Self {
        Self::new(operation, stage, u32::MAX)
    }

    fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Interceptor for FailFirst {
    async fn intercept(&self, request: Request, ctx: &CallContext, next: Next) -> RpcResult<Option<Value>> {
        if ctx.call.operation != self.operation || !self.take() {
            return next.run(request, ctx).await;
        }
        match self.stage {
            CallStage::Connecting => Err(RpcError::Transport {
                stage: CallStage::Connecting,
                message: "injected: agent unreachable".to_string(),
            }),
            CallStage::InFlight => {
                let _ = next.run(request, ctx).await;
                Err(RpcError::Transport {
                    stage: CallStage::InFlight,
                    message: "injected: connection lost awaiting reply".to_string(),
                })
            }
        }
    }
}

/// Never lets `operation` reach the agent: the attempt waits forever
/// before sending.
pub struct StallBeforeSend {
    pub operation: &'static str,
}

#[async_trait]
impl Interceptor for StallBeforeSend {
    async fn intercept(&self, request: Request, ctx: &CallContext, next: Next) -> RpcResult<Option<Value>> {
        if ctx.call.operation == self.operation {
            std::future::pending::<()>().await;
        }
        next.run(request, ctx).await
    }
}

/// Marks `operation` as delivered, then never answers and ignores cancellation.
pub struct HangAfterSend {
    pub operation: &'static str,
}

#[async_trait]
impl Interceptor for HangAfterSend {
    async fn intercept(&self, request: Request, ctx: &CallContext, next: Next) -> RpcResult<Option<Value>> {
        if ctx.call.operation == self.operation && ctx.stage.hand_off() {
            std::future::pending::<()>().await;
        }
        next.run(request, ctx).await
    }
}
