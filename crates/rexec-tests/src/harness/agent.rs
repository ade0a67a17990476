use anyhow::Result;
use rexec_agent::{AgentConfig, ScriptService, spawn_agent};
use rexec_client::transport::{PollingQueue, polling_endpoint};
use rexec_client::{ListeningTransport, RexecClient, RexecClientBuilder};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::fast_options;

fn config(root: &Path, configure: impl FnOnce(&mut AgentConfig)) -> AgentConfig {
    let mut config = AgentConfig::rooted_at(root);
    config.listen_addr = "127.0.0.1:0".to_string();
    configure(&mut config);
    config
}

/// An agent listening on a random port with a temp state directory.
pub struct TestAgent {
    pub addr: SocketAddr,
    pub service: Arc<ScriptService>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _root: TempDir,
}

impl TestAgent {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with config adjustments (e.g. fewer services to mimic an older agent).
    pub async fn spawn_with(configure: impl FnOnce(&mut AgentConfig)) -> Result<Self> {
        let root = TempDir::new()?;
        let (addr, service, shutdown_tx) = spawn_agent(config(root.path(), configure)).await?;
        Ok(Self {
            addr,
            service,
            shutdown_tx: Some(shutdown_tx),
            _root: root,
        })
    }

    /// Client builder pointed at this agent with test-speed options.
    pub fn client(&self) -> RexecClientBuilder {
        RexecClient::builder(Arc::new(ListeningTransport::new(self.addr.to_string())))
            .options(fast_options())
    }

    pub fn workspace_count(&self) -> usize {
        std::fs::read_dir(&self.service.config().workspace_root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_dir())
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// An agent that collects requests from a polling queue instead of
/// listening. It can be restarted over the same state directory.
pub struct PolledAgent {
    pub service: Arc<ScriptService>,
    queue: PollingQueue,
    pump: JoinHandle<()>,
    transport: Option<rexec_client::PollingTransport>,
    root: TempDir,
}

impl PolledAgent {
    pub fn spawn(pickup_timeout: Duration) -> Result<Self> {
        let root = TempDir::new()?;
        let service = Arc::new(ScriptService::new(config(root.path(), |_| {}))?);
        let (transport, queue) = polling_endpoint("poll://test-agent", pickup_timeout);
        let pump = tokio::spawn(pump(queue.clone(), Arc::clone(&service)));
        Ok(Self {
            service,
            queue,
            pump,
            transport: Some(transport),
            root,
        })
    }

    /// The client half. Can be taken once.
    pub fn client(&mut self) -> Option<RexecClientBuilder> {
        let transport = self.transport.take()?;
        Some(RexecClient::builder(Arc::new(transport)).options(fast_options()))
    }

    /// Kill the agent without letting its scripts record an outcome, then
    /// start a fresh one over the same workspaces.
    pub fn restart(&mut self) -> Result<()> {
        self.pump.abort();
        self.service.abort_all();
        self.service = Arc::new(ScriptService::new(config(self.root.path(), |_| {}))?);
        self.pump = tokio::spawn(pump(self.queue.clone(), Arc::clone(&self.service)));
        Ok(())
    }
}

impl Drop for PolledAgent {
    fn drop(&mut self) {
        self.pump.abort();
        self.service.abort_all();
    }
}

async fn pump(queue: PollingQueue, service: Arc<ScriptService>) {
    while let Some(pending) = queue.collect().await {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let response = service.handle(pending.request.clone()).await;
            pending.respond(response);
        });
    }
}
