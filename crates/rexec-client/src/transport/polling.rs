use async_trait::async_trait;
use rexec_protocol::{Request, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use super::{AgentTransport, into_result};
use crate::error::{RpcError, RpcResult};
use crate::invoker::CallContext;
use crate::stage::{CallStage, StageTracker};

/// A request waiting for a polling agent to pick it up.
pub struct PendingRequest {
    pub request: Request,
    stage: StageTracker,
    reply: oneshot::Sender<Response>,
}

impl PendingRequest {
    pub fn respond(self, response: Response) {
        if self.reply.send(response).is_err() {
            debug!("caller went away before the reply arrived");
        }
    }
}

/// Agent side of a polling endpoint.
#[derive(Clone)]
pub struct PollingQueue {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<PendingRequest>>>,
}

impl PollingQueue {
    /// Wait for the next request that has not been withdrawn by its caller.
    /// Returns `None` once the client side is gone.
    pub async fn collect(&self) -> Option<PendingRequest> {
        let mut rx = self.rx.lock().await;
        while let Some(pending) = rx.recv().await {
            if pending.stage.hand_off() {
                return Some(pending);
            }
            debug!(call = %pending.request.rpc_call(), "skipping withdrawn request");
        }
        None
    }
}

/// Client side of a polling endpoint: requests wait in a queue until the
/// agent collects them.
pub struct PollingTransport {
    endpoint: String,
    tx: mpsc::UnboundedSender<PendingRequest>,
    pickup_timeout: Duration,
}

/// Create a connected transport/queue pair. A request not collected within
/// `pickup_timeout` fails as a connecting-stage transport error.
pub fn polling_endpoint(
    endpoint: impl Into<String>,
    pickup_timeout: Duration,
) -> (PollingTransport, PollingQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        PollingTransport {
            endpoint: endpoint.into(),
            tx,
            pickup_timeout,
        },
        PollingQueue {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

#[async_trait]
impl AgentTransport for PollingTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, request: Request, ctx: &CallContext) -> RpcResult<Option<Value>> {
        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                request,
                stage: ctx.stage.clone(),
                reply: reply_tx,
            })
            .map_err(|_| RpcError::Transport {
                stage: CallStage::Connecting,
                message: format!("polling queue for {} is closed", self.endpoint),
            })?;

        let pickup = tokio::time::sleep(self.pickup_timeout);
        tokio::pin!(pickup);
        let mut pickup_pending = true;

        loop {
            tokio::select! {
                reply = &mut reply_rx => {
                    return match reply {
                        Ok(response) => into_result(response),
                        Err(_) => Err(RpcError::Transport {
                            stage: ctx.stage.current(),
                            message: "agent dropped the request without replying".to_string(),
                        }),
                    };
                }
                _ = ctx.cancel.cancelled() => {
                    let stage = if ctx.stage.withdraw() {
                        CallStage::Connecting
                    } else {
                        CallStage::InFlight
                    };
                    return Err(RpcError::Cancelled { stage });
                }
                _ = &mut pickup, if pickup_pending => {
                    if ctx.stage.withdraw() {
                        warn!(
                            endpoint = %self.endpoint,
                            timeout_ms = self.pickup_timeout.as_millis() as u64,
                            "agent did not collect request"
                        );
                        return Err(RpcError::Transport {
                            stage: CallStage::Connecting,
                            message: format!(
                                "request was not collected within {:?}",
                                self.pickup_timeout
                            ),
                        });
                    }
                    pickup_pending = false;
                }
            }
        }
    }
}
