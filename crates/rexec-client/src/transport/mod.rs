//! Ways of reaching an agent.
//!
//! A listening agent accepts connections itself; a polling agent has no
//! reachable address and instead collects queued requests.

pub mod listening;
pub mod polling;

use async_trait::async_trait;
use rexec_protocol::{Request, Response};
use serde_json::Value;

use crate::error::{RpcError, RpcResult};
use crate::invoker::CallContext;

pub use listening::ListeningTransport;
pub use polling::{PendingRequest, PollingQueue, PollingTransport, polling_endpoint};

#[async_trait]
pub trait AgentTransport: Send + Sync + 'static {
    /// Stable name of the agent endpoint, used to key per-endpoint caches.
    fn endpoint(&self) -> &str;

    /// Deliver one request and wait for its reply.
    ///
    /// Implementations must call `ctx.stage.hand_off()` immediately before
    /// the request leaves the client and must not send it if that returns
    /// false. Cancellation of `ctx.cancel` should end the call promptly.
    async fn send(&self, request: Request, ctx: &CallContext) -> RpcResult<Option<Value>>;
}

pub(crate) fn into_result(response: Response) -> RpcResult<Option<Value>> {
    match response {
        Response::Ok { data } => Ok(data),
        Response::Error { message, code } => Err(RpcError::Rejected { code, message }),
        Response::Hello { .. } => Err(RpcError::Protocol {
            message: "unexpected hello in place of a reply".to_string(),
        }),
    }
}
