use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use rexec_protocol::{ErrorCode, MAX_JSON_LINE_BYTES, Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::service::ScriptService;

/// Bind the configured address and serve until ctrl-c.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let service = Arc::new(ScriptService::new(config.clone()).context("failed to prepare agent state")?);
    info!(
        addr = %listener.local_addr()?,
        workspaces = %config.workspace_root.display(),
        services = ?config.services,
        "rexec agent listening"
    );

    let cleaner = spawn_workspace_cleaner(Arc::clone(&service), config.cleaner_interval());
    serve(listener, service, async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
    })
    .await;
    cleaner.abort();
    Ok(())
}

/// Start an agent on `config.listen_addr` (use port 0 for an ephemeral one).
/// Returns the bound address, the service, and a shutdown trigger.
pub async fn spawn_agent(
    config: AgentConfig,
) -> anyhow::Result<(SocketAddr, Arc<ScriptService>, oneshot::Sender<()>)> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let addr = listener.local_addr()?;
    let service = Arc::new(ScriptService::new(config)?);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let served = Arc::clone(&service);
    tokio::spawn(async move {
        serve(listener, served, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });
    Ok((addr, service, shutdown_tx))
}

/// Accept connections until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    service: Arc<ScriptService>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        handle_client(stream, peer, service).await;
                    });
                }
                Err(e) => error!("accept error: {e}"),
            },
        }
    }
}

/// Greet, then answer requests line by line until the client hangs up.
async fn handle_client(stream: TcpStream, peer: SocketAddr, service: Arc<ScriptService>) {
    let (reader, writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES));
    let mut writer = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES));

    if let Err(e) = write_response(&mut writer, &Response::hello()).await {
        debug!(%peer, "failed to greet client: {e}");
        return;
    }

    loop {
        let line = match lines.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(%peer, "read error: {e}");
                break;
            }
            None => {
                debug!(%peer, "client disconnected");
                break;
            }
        };

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => service.handle(request).await,
            Err(e) => Response::error(ErrorCode::InvalidRequest, format!("invalid request: {e}")),
        };

        if let Err(e) = write_response(&mut writer, &response).await {
            debug!(%peer, "write error: {e}");
            break;
        }
    }
}

async fn write_response(
    writer: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, LinesCodec>,
    response: &Response,
) -> anyhow::Result<()> {
    let line = serde_json::to_string(response)?;
    writer.send(line).await?;
    Ok(())
}

/// Periodically sweep orphaned workspaces.
pub fn spawn_workspace_cleaner(service: Arc<ScriptService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = service.clean_workspaces() {
                warn!("workspace sweep failed: {e}");
            }
        }
    })
}
