//! Client for running scripts on remote agents.
//!
//! Every remote call goes through a retry engine that knows whether an
//! interrupted call could have reached the agent. On top of it the script
//! orchestrator starts a script, polls it, cancels it on request and always
//! releases the agent's workspace at the end.

pub mod backoff;
pub mod capabilities;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod invoker;
pub mod observer;
pub mod orchestrator;
pub mod retry;
pub mod stage;
pub mod transport;

use rexec_protocol::{FileContents, FileTransferReceipt, Request, ScriptStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use backoff::{ExponentialPollBackoff, PollBackoffStrategy};
pub use capabilities::{CapabilityCache, ScriptServiceVersion};
pub use command::ScriptCommand;
pub use config::ClientOptions;
pub use error::{ClientError, ClientResult, RpcError, RpcResult};
pub use executor::{CommandContext, ScriptOperation, StartAttempt};
pub use invoker::{CallContext, Interceptor, Next};
pub use observer::{ClientObserver, OperationMetrics, RpcAttempt, TracingObserver};
pub use orchestrator::{ScriptExecutionResult, ScriptExecutionState, ScriptOutcome};
pub use stage::CallStage;
pub use transport::{AgentTransport, ListeningTransport, PollingTransport};

use capabilities::CapabilityNegotiator;
use invoker::RpcInvoker;
use executor::{ScriptExecutor, abandon_after_cancellation};
use orchestrator::{Callbacks, OrchestratorSettings, ScriptOrchestrator};
use retry::{CallOptions, RetryEngine};

pub struct RexecClient {
    engine: RetryEngine,
    negotiator: CapabilityNegotiator,
    settings: OrchestratorSettings,
    poll_backoff: Arc<dyn PollBackoffStrategy>,
    observer: Arc<dyn ClientObserver>,
}

pub struct RexecClientBuilder {
    transport: Arc<dyn AgentTransport>,
    options: ClientOptions,
    observer: Arc<dyn ClientObserver>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    cache: CapabilityCache,
    poll_backoff: Option<Arc<dyn PollBackoffStrategy>>,
}

impl RexecClientBuilder {
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ClientObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Append an interceptor. The first one added runs outermost.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Share discovered capabilities with other clients.
    pub fn capability_cache(mut self, cache: CapabilityCache) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the configured exponential poll backoff.
    pub fn poll_backoff(mut self, strategy: Arc<dyn PollBackoffStrategy>) -> Self {
        self.poll_backoff = Some(strategy);
        self
    }

    pub fn build(self) -> RexecClient {
        let invoker = RpcInvoker::new(self.transport, self.interceptors);
        let engine = RetryEngine::new(
            invoker,
            self.options.retry_policy(),
            Arc::clone(&self.observer),
        );
        let poll_backoff = self
            .poll_backoff
            .unwrap_or_else(|| Arc::new(self.options.poll_backoff()));
        RexecClient {
            engine,
            negotiator: CapabilityNegotiator::new(self.cache, self.options.negotiation_settings()),
            settings: self.options.orchestrator_settings(),
            poll_backoff,
            observer: self.observer,
        }
    }
}

impl RexecClient {
    pub fn builder(transport: Arc<dyn AgentTransport>) -> RexecClientBuilder {
        RexecClientBuilder {
            transport,
            options: ClientOptions::default(),
            observer: Arc::new(TracingObserver),
            interceptors: Vec::new(),
            cache: CapabilityCache::new(),
            poll_backoff: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.engine.endpoint()
    }

    /// Run a script to completion and return its exit code and logs.
    pub async fn execute_script(
        &self,
        command: ScriptCommand,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult> {
        self.execute_script_with_status(command, cancel, |_| {}).await
    }

    /// Like [`execute_script`](Self::execute_script), calling `on_status`
    /// with every status the agent reports.
    pub async fn execute_script_with_status<F>(
        &self,
        command: ScriptCommand,
        cancel: &CancellationToken,
        on_status: F,
    ) -> ClientResult<ScriptExecutionResult>
    where
        F: FnMut(&ScriptStatus) + Send,
    {
        self.execute_script_with_callbacks(command, cancel, on_status, |_| {})
            .await
    }

    /// Like [`execute_script_with_status`](Self::execute_script_with_status),
    /// also calling `on_completed` with the last status once the script has
    /// finished and before its workspace is released. It runs for cancelled
    /// scripts too, but not when the agent could no longer be reached.
    pub async fn execute_script_with_callbacks<F, C>(
        &self,
        command: ScriptCommand,
        cancel: &CancellationToken,
        mut on_status: F,
        on_completed: C,
    ) -> ClientResult<ScriptExecutionResult>
    where
        F: FnMut(&ScriptStatus) + Send,
        C: FnOnce(&ScriptStatus) + Send,
    {
        let mut metrics = OperationMetrics::default();
        let version = self
            .negotiator
            .negotiate(&self.engine, cancel, &mut metrics)
            .await?;

        let mut on_completed = Some(on_completed);
        let mut on_completed = |status: &ScriptStatus| {
            if let Some(callback) = on_completed.take() {
                callback(status);
            }
        };
        ScriptOrchestrator::new(
            &self.engine,
            version,
            self.settings,
            self.poll_backoff.as_ref(),
            self.observer.as_ref(),
            Callbacks {
                on_status: &mut on_status,
                on_completed: &mut on_completed,
            },
            metrics,
        )
        .run(command, cancel)
        .await
    }

    /// Start a script without observing it. Pass the returned context to
    /// [`get_status`](Self::get_status), [`cancel_script`](Self::cancel_script)
    /// and finally [`complete_script`](Self::complete_script).
    ///
    /// Use [`StartAttempt::PossiblyRepeated`] when resuming a command whose
    /// earlier start may have reached the agent; the same command always
    /// proposes the same ticket, so the agent runs it at most once.
    pub async fn start_script(
        &self,
        command: &ScriptCommand,
        attempt: StartAttempt,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperation> {
        let mut metrics = OperationMetrics::default();
        let version = self
            .negotiator
            .negotiate(&self.engine, cancel, &mut metrics)
            .await?;
        self.executor()
            .start(command, version, attempt, cancel, &mut metrics)
            .await
    }

    pub async fn get_status(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperation> {
        self.executor()
            .get_status(context, cancel, &mut OperationMetrics::default())
            .await
    }

    pub async fn cancel_script(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperation> {
        self.executor()
            .cancel(context, cancel, &mut OperationMetrics::default())
            .await
    }

    /// Release the script's workspace. The legacy contract answers with the
    /// final status and any remaining logs.
    pub async fn complete_script(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
    ) -> ClientResult<Option<ScriptStatus>> {
        let token = abandon_after_cancellation(cancel, self.settings.complete_abandon_after);
        let result = self
            .executor()
            .complete(context, &token, &mut OperationMetrics::default())
            .await;
        token.cancel();
        result
    }

    fn executor(&self) -> ScriptExecutor<'_> {
        ScriptExecutor::new(&self.engine, self.settings)
    }

    /// Script service version this client will use against its endpoint.
    pub async fn script_service_version(
        &self,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptServiceVersion> {
        let mut metrics = OperationMetrics::default();
        self.negotiator
            .negotiate(&self.engine, cancel, &mut metrics)
            .await
    }

    pub async fn upload_file(
        &self,
        path: impl Into<String>,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> ClientResult<FileTransferReceipt> {
        let request = Request::UploadFile {
            path: path.into(),
            data,
        };
        self.engine
            .execute(
                request,
                cancel,
                CallOptions::with_retries(self.settings.abandon_grace),
                &mut OperationMetrics::default(),
            )
            .await
    }

    pub async fn download_file(
        &self,
        path: impl Into<String>,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<u8>> {
        let request = Request::DownloadFile { path: path.into() };
        let contents: FileContents = self
            .engine
            .execute(
                request,
                cancel,
                CallOptions::with_retries(self.settings.abandon_grace),
                &mut OperationMetrics::default(),
            )
            .await?;
        Ok(contents.data)
    }
}
