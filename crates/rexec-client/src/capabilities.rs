use dashmap::DashMap;
use rexec_protocol::{Capabilities, ErrorCode, Request, services};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ClientError, ClientResult};
use crate::observer::OperationMetrics;
use crate::retry::{CallOptions, RetryEngine};

/// Script service contracts this client can drive.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScriptServiceVersion {
    /// Single call per step, agent-assigned tickets, no retries.
    Legacy,
    V2,
}

impl ScriptServiceVersion {
    /// Newest first.
    pub const SUPPORTED: [ScriptServiceVersion; 2] = [Self::V2, Self::Legacy];

    pub fn service_name(self) -> &'static str {
        match self {
            Self::Legacy => services::SCRIPT_LEGACY,
            Self::V2 => services::SCRIPT_V2,
        }
    }
}

/// Discovered capabilities per endpoint. Cheap to clone and share between
/// clients talking to the same agents.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCache {
    entries: Arc<DashMap<String, Arc<OnceCell<Capabilities>>>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint: &str) -> Option<Capabilities> {
        self.entries
            .get(endpoint)
            .and_then(|cell| cell.get().cloned())
    }

    /// Forget an endpoint, e.g. after the agent was upgraded.
    pub fn invalidate(&self, endpoint: &str) {
        self.entries.remove(endpoint);
    }

    fn cell(&self, endpoint: &str) -> Arc<OnceCell<Capabilities>> {
        Arc::clone(self.entries.entry(endpoint.to_string()).or_default().value())
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    pub enabled: bool,
    /// Services never selected even when the agent offers them.
    pub disabled_services: HashSet<String>,
    pub abandon_after: Duration,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_services: HashSet::new(),
            abandon_after: Duration::from_secs(5),
        }
    }
}

/// Picks the script service version to use against an endpoint, asking the
/// agent at most once per endpoint.
#[derive(Debug, Clone)]
pub struct CapabilityNegotiator {
    cache: CapabilityCache,
    settings: NegotiationSettings,
}

impl CapabilityNegotiator {
    pub fn new(cache: CapabilityCache, settings: NegotiationSettings) -> Self {
        Self { cache, settings }
    }

    pub async fn negotiate(
        &self,
        engine: &RetryEngine,
        cancel: &CancellationToken,
        metrics: &mut OperationMetrics,
    ) -> ClientResult<ScriptServiceVersion> {
        if !self.settings.enabled {
            return Ok(self.select(&Capabilities::legacy()));
        }

        let endpoint = engine.endpoint().to_string();
        let cell = self.cache.cell(&endpoint);
        let capabilities = cell
            .get_or_try_init(|| discover(engine, &endpoint, cancel, self.settings.abandon_after, metrics))
            .await?;

        let version = self.select(capabilities);
        debug!(%endpoint, ?version, "selected script service version");
        Ok(version)
    }

    /// Newest supported version the agent also offers and is not disabled.
    pub fn select(&self, capabilities: &Capabilities) -> ScriptServiceVersion {
        ScriptServiceVersion::SUPPORTED
            .into_iter()
            .filter(|v| !self.settings.disabled_services.contains(v.service_name()))
            .find(|v| capabilities.supports(v.service_name()))
            .unwrap_or(ScriptServiceVersion::Legacy)
    }
}

async fn discover(
    engine: &RetryEngine,
    endpoint: &str,
    cancel: &CancellationToken,
    abandon_after: Duration,
    metrics: &mut OperationMetrics,
) -> ClientResult<Capabilities> {
    let result = engine
        .execute::<Capabilities>(
            Request::GetCapabilities,
            cancel,
            CallOptions::with_retries(abandon_after),
            metrics,
        )
        .await;

    match result {
        Ok(capabilities) => {
            info!(%endpoint, services = ?capabilities.supported_services, "discovered agent capabilities");
            Ok(capabilities)
        }
        Err(ClientError::Rejected {
            code: ErrorCode::UnknownService,
            ..
        }) => {
            info!(%endpoint, "agent has no capabilities service; assuming legacy contract");
            Ok(Capabilities::legacy())
        }
        Err(err) if err.is_cancellation() => Err(err),
        Err(err) => Err(discovery_failed(err)),
    }
}

fn discovery_failed(err: ClientError) -> ClientError {
    let attempts = match &err {
        ClientError::RetryBudgetExhausted { attempts, .. }
        | ClientError::ConnectionFaulted { attempts, .. } => *attempts,
        _ => 1,
    };
    ClientError::ConnectionFaulted {
        operation: Request::GetCapabilities.rpc_call().to_string(),
        attempts,
        message: err.to_string(),
    }
}
