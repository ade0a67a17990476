use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rexec_protocol::{MAX_JSON_LINE_BYTES, PROTOCOL_VERSION, Request, Response};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::debug;

use super::{AgentTransport, into_result};
use crate::error::{RpcError, RpcResult};
use crate::invoker::CallContext;
use crate::stage::CallStage;

type Reader = FramedRead<OwnedReadHalf, LinesCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Connects to an agent that listens on a TCP address, one connection per call.
pub struct ListeningTransport {
    addr: String,
    connect_timeout: Duration,
}

impl ListeningTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect(&self) -> RpcResult<(Reader, Writer)> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| connecting(format!("timed out connecting to {}", self.addr)))?
            .map_err(|err| connecting(format!("failed to connect to {}: {err}", self.addr)))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
        );
        let writer = FramedWrite::new(
            write_half,
            LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
        );

        let hello_line = match reader.next().await {
            Some(Ok(line)) => line,
            Some(Err(err)) => return Err(connecting(format!("socket read failed: {err}"))),
            None => return Err(connecting("agent closed the connection during hello")),
        };
        match serde_json::from_str::<Response>(&hello_line) {
            Ok(Response::Hello { protocol_version }) if protocol_version == PROTOCOL_VERSION => {
                Ok((reader, writer))
            }
            Ok(Response::Hello { protocol_version }) => Err(RpcError::Protocol {
                message: format!(
                    "agent speaks protocol {protocol_version}, expected {PROTOCOL_VERSION}"
                ),
            }),
            Ok(other) => Err(connecting(format!("expected agent hello, got {other:?}"))),
            Err(err) => Err(connecting(format!("invalid hello json: {err}"))),
        }
    }
}

fn connecting(message: impl Into<String>) -> RpcError {
    RpcError::Transport {
        stage: CallStage::Connecting,
        message: message.into(),
    }
}

fn in_flight(message: impl Into<String>) -> RpcError {
    RpcError::Transport {
        stage: CallStage::InFlight,
        message: message.into(),
    }
}

#[async_trait]
impl AgentTransport for ListeningTransport {
    fn endpoint(&self) -> &str {
        &self.addr
    }

    async fn send(&self, request: Request, ctx: &CallContext) -> RpcResult<Option<Value>> {
        let line = serde_json::to_string(&request).map_err(|err| RpcError::Protocol {
            message: format!("failed to encode request: {err}"),
        })?;

        let (mut reader, mut writer) = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(RpcError::Cancelled { stage: CallStage::Connecting });
            }
            connected = self.connect() => connected?,
        };

        if !ctx.stage.hand_off() {
            return Err(RpcError::Cancelled {
                stage: CallStage::Connecting,
            });
        }
        debug!(call = %ctx.call, attempt = ctx.attempt, addr = %self.addr, "request handed to agent");

        writer
            .send(line)
            .await
            .map_err(|err| in_flight(format!("socket write failed: {err}")))?;

        let reply = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(RpcError::Cancelled { stage: CallStage::InFlight });
            }
            reply = reader.next() => reply,
        };

        match reply {
            Some(Ok(line)) => {
                let response: Response =
                    serde_json::from_str(&line).map_err(|err| RpcError::Protocol {
                        message: format!("invalid response json: {err}"),
                    })?;
                into_result(response)
            }
            Some(Err(err)) => Err(in_flight(format!("socket read failed: {err}"))),
            None => Err(in_flight("agent disconnected before replying")),
        }
    }
}
