use dashmap::DashMap;
use rexec_protocol::{
    Capabilities, ErrorCode, FileContents, FileTransferReceipt, OutputSource, ProcessState,
    Request, Response, ScriptSpec, ScriptStatus, ScriptTicket, StartScriptCommand, exit_codes,
};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleaner::{CleanReport, WorkspaceCleaner};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::log::{ScriptLog, tail};
use crate::mutex::{AcquireError, IsolationMutex};
use crate::runner::{ScriptRunner, SharedLog, append};
use crate::workspace::{Workspace, WorkspaceFactory, WorkspaceState};

/// How long Complete waits for a cancelled script to exit before its
/// workspace is deleted.
const COMPLETE_KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    state: ProcessState,
    exit_code: i32,
}

/// A script this agent process started and has not yet been told to complete.
struct RunningScript {
    workspace: Workspace,
    log: SharedLog,
    progress: watch::Receiver<Progress>,
    cancel: CancellationToken,
    task: AbortHandle,
}

impl RunningScript {
    fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    async fn wait_for_exit(&self, limit: Duration) {
        let mut progress = self.progress.clone();
        let exited = async move {
            loop {
                if progress.borrow_and_update().state == ProcessState::Complete {
                    break;
                }
                if progress.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(limit, exited).await;
    }
}

/// Filled once per ticket by the first start. Holds `None` when the ticket
/// belongs to a script from an earlier agent process.
type LaunchSlot = Arc<OnceCell<Option<Arc<RunningScript>>>>;

/// Hosts the script services (current and legacy), capabilities and file
/// transfer for one agent.
pub struct ScriptService {
    config: AgentConfig,
    workspaces: WorkspaceFactory,
    cleaner: WorkspaceCleaner,
    mutex: IsolationMutex,
    runner: ScriptRunner,
    scripts: DashMap<ScriptTicket, LaunchSlot>,
}

impl ScriptService {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let workspaces = WorkspaceFactory::new(&config.workspace_root)?;
        std::fs::create_dir_all(&config.files_root)?;
        Ok(Self {
            cleaner: WorkspaceCleaner::new(workspaces.clone(), config.workspace_retention()),
            runner: ScriptRunner::new(config.shell.clone()),
            mutex: IsolationMutex::new(),
            scripts: DashMap::new(),
            workspaces,
            config,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Dispatch one request. Services left out of the config answer
    /// `unknown_service`, like an agent that predates them.
    pub async fn handle(&self, request: Request) -> Response {
        let call = request.rpc_call();
        if !self.config.hosts(call.service) {
            debug!(%call, "request for a service this agent does not host");
            return Response::error(
                ErrorCode::UnknownService,
                format!("service not hosted by this agent: {}", call.service),
            );
        }

        self.dispatch(request).await.unwrap_or_else(|err| {
            let (code, message) = err.to_error_code();
            warn!(%call, code = %code, "request failed: {err}");
            Response::error(code, message)
        })
    }

    async fn dispatch(&self, request: Request) -> Result<Response, AgentError> {
        if let Some(ticket) = request.ticket() {
            ticket.validate().map_err(|reason| {
                AgentError::InvalidRequest(format!("invalid ticket {ticket}: {reason}"))
            })?;
        }

        match request {
            Request::GetCapabilities => Ok(Response::ok(&self.capabilities())),
            Request::StartScript { command } => {
                self.start(command).await.map(|status| Response::ok(&status))
            }
            Request::GetStatus {
                ticket,
                last_log_sequence,
            }
            | Request::GetStatusLegacy {
                ticket,
                last_log_sequence,
            } => Ok(Response::ok(&self.status(&ticket, last_log_sequence))),
            Request::CancelScript {
                ticket,
                last_log_sequence,
            }
            | Request::CancelScriptLegacy {
                ticket,
                last_log_sequence,
            } => Ok(Response::ok(&self.cancel(&ticket, last_log_sequence))),
            Request::CompleteScript { ticket } => {
                self.complete(&ticket).await.map(|_| Response::empty())
            }
            Request::StartScriptLegacy { task_id, script } => self
                .start_legacy(task_id, script)
                .await
                .map(|ticket| Response::ok(&ticket)),
            Request::CompleteScriptLegacy {
                ticket,
                last_log_sequence,
            } => self
                .complete_legacy(&ticket, last_log_sequence)
                .await
                .map(|status| Response::ok(&status)),
            Request::UploadFile { path, data } => {
                self.upload(&path, &data).await.map(|receipt| Response::ok(&receipt))
            }
            Request::DownloadFile { path } => {
                self.download(&path).await.map(|contents| Response::ok(&contents))
            }
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            supported_services: self.config.services.clone(),
        }
    }

    /// Start a script under the ticket the client proposed. Repeating a
    /// start for a known ticket never runs the script twice.
    pub async fn start(&self, command: StartScriptCommand) -> Result<ScriptStatus, AgentError> {
        let StartScriptCommand {
            ticket,
            script,
            wait_for_completion_ms,
        } = command;

        if let Some(running) = self.launch(&ticket, &script).await? {
            if let Some(wait) = wait_for_completion_ms {
                running.wait_for_exit(Duration::from_millis(wait)).await;
            }
        }
        Ok(self.status(&ticket, 0))
    }

    /// Start with an agent-assigned ticket.
    pub async fn start_legacy(
        &self,
        task_id: String,
        script: ScriptSpec,
    ) -> Result<ScriptTicket, AgentError> {
        let ticket = ScriptTicket::new(task_id);
        ticket.validate().map_err(AgentError::InvalidRequest)?;
        self.launch(&ticket, &script).await?;
        Ok(ticket)
    }

    /// Returns `None` when the ticket is only known from a previous agent
    /// process; such a script is never run again.
    ///
    /// Concurrent starts of one ticket share a slot, so only the first one
    /// prepares the workspace. The map shard is not locked while it does.
    async fn launch(
        &self,
        ticket: &ScriptTicket,
        script: &ScriptSpec,
    ) -> Result<Option<Arc<RunningScript>>, AgentError> {
        let slot = Arc::clone(self.scripts.entry(ticket.clone()).or_default().value());
        if let Some(running) = slot.get() {
            debug!(ticket = %ticket, "start repeated for a known script");
            return Ok(running.clone());
        }

        let launched = slot
            .get_or_try_init(|| async { self.spawn_script(ticket, script) })
            .await
            .map(Option::clone);
        if !matches!(launched, Ok(Some(_))) {
            self.scripts.remove_if(ticket, |_, current| Arc::ptr_eq(current, &slot));
        }
        launched
    }

    fn spawn_script(
        &self,
        ticket: &ScriptTicket,
        script: &ScriptSpec,
    ) -> Result<Option<Arc<RunningScript>>, AgentError> {
        if self.workspaces.get(ticket).is_some() {
            debug!(ticket = %ticket, "start repeated for a script from an earlier agent run");
            return Ok(None);
        }

        let workspace = self.workspaces.prepare(ticket, script)?;
        let log: SharedLog = Arc::new(Mutex::new(ScriptLog::open(&workspace.log_path())?));
        let (progress_tx, progress_rx) = watch::channel(Progress {
            state: ProcessState::Pending,
            exit_code: exit_codes::RUNNING,
        });
        let cancel = CancellationToken::new();

        let job = ScriptJob {
            workspace: workspace.clone(),
            script: script.clone(),
            log: Arc::clone(&log),
            progress: progress_tx,
            cancel: cancel.clone(),
            mutex: self.mutex.clone(),
            runner: self.runner.clone(),
        };
        let task = tokio::spawn(job.run());
        info!(ticket = %ticket, isolation = ?script.isolation.level, "script started");

        Ok(Some(Arc::new(RunningScript {
            workspace,
            log,
            progress: progress_rx,
            cancel,
            task: task.abort_handle(),
        })))
    }

    fn running(&self, ticket: &ScriptTicket) -> Option<Arc<RunningScript>> {
        self.scripts
            .get(ticket)
            .and_then(|slot| slot.value().get().cloned().flatten())
    }

    /// Current state plus log lines from `since` on.
    ///
    /// Tickets this process never started are answered from disk: a script
    /// whose outcome was recorded reports it, one that was still running when
    /// the previous agent process died reports `UNKNOWN_RESULT`, and a ticket
    /// with no workspace at all reports `UNKNOWN_SCRIPT`.
    pub fn status(&self, ticket: &ScriptTicket, since: u64) -> ScriptStatus {
        if let Some(running) = self.running(ticket) {
            // Progress first: output is fully logged before completion is published.
            let progress = running.progress();
            let (logs, next_log_sequence) = match running.log.lock() {
                Ok(log) => log.since(since),
                Err(poisoned) => poisoned.into_inner().since(since),
            };
            return ScriptStatus {
                ticket: ticket.clone(),
                state: progress.state,
                exit_code: progress.exit_code,
                logs,
                next_log_sequence,
            };
        }

        let Some(workspace) = self.workspaces.get(ticket) else {
            return ScriptStatus {
                ticket: ticket.clone(),
                state: ProcessState::Complete,
                exit_code: exit_codes::UNKNOWN_SCRIPT,
                logs: Vec::new(),
                next_log_sequence: since,
            };
        };

        let exit_code = match workspace.read_state() {
            Ok(Some(state)) if state.state == ProcessState::Complete => state.exit_code,
            Ok(_) => exit_codes::UNKNOWN_RESULT,
            Err(err) => {
                warn!(ticket = %ticket, "unreadable workspace state: {err}");
                exit_codes::UNKNOWN_RESULT
            }
        };
        let entries = ScriptLog::read(&workspace.log_path()).unwrap_or_else(|err| {
            warn!(ticket = %ticket, "unreadable script log: {err}");
            Vec::new()
        });
        let (logs, next_log_sequence) = tail(&entries, since);
        ScriptStatus {
            ticket: ticket.clone(),
            state: ProcessState::Complete,
            exit_code,
            logs,
            next_log_sequence,
        }
    }

    /// Ask the script to stop. The returned status shows it complete once
    /// the process has actually exited.
    pub fn cancel(&self, ticket: &ScriptTicket, since: u64) -> ScriptStatus {
        if let Some(running) = self.running(ticket) {
            if !running.cancel.is_cancelled() {
                info!(ticket = %ticket, "cancelling script");
                running.cancel.cancel();
            }
        }
        self.status(ticket, since)
    }

    /// Release the script's workspace. Completing an unknown or already
    /// completed ticket succeeds without effect. A script still running is
    /// cancelled and given a moment to exit first.
    pub async fn complete(&self, ticket: &ScriptTicket) -> Result<(), AgentError> {
        let running = self
            .scripts
            .remove(ticket)
            .and_then(|(_, slot)| slot.get().cloned().flatten());
        if let Some(running) = running {
            if running.progress().state != ProcessState::Complete {
                warn!(ticket = %ticket, "completing a script that is still running; cancelling it");
                running.cancel.cancel();
                running.wait_for_exit(COMPLETE_KILL_WAIT).await;
            }
        }
        if self.workspaces.delete(ticket)? {
            info!(ticket = %ticket, "workspace released");
        }
        Ok(())
    }

    /// Final status and remaining logs, then release.
    pub async fn complete_legacy(
        &self,
        ticket: &ScriptTicket,
        since: u64,
    ) -> Result<ScriptStatus, AgentError> {
        let status = self.status(ticket, since);
        self.complete(ticket).await?;
        Ok(status)
    }

    /// Whether this process is still executing the script.
    pub fn is_running(&self, ticket: &ScriptTicket) -> bool {
        self.running(ticket)
            .is_some_and(|running| running.progress().state != ProcessState::Complete)
    }

    /// Sweep workspaces nobody completed within the retention period.
    pub fn clean_workspaces(&self) -> Result<CleanReport, AgentError> {
        let report = self.cleaner.clean(|ticket| self.is_running(ticket))?;
        self.scripts.retain(|_, slot| match slot.get() {
            Some(Some(running)) => running.workspace.exists(),
            Some(None) => false,
            None => true,
        });
        Ok(report)
    }

    /// Stop every script without recording an outcome, as if the agent
    /// process had died.
    pub fn abort_all(&self) {
        for slot in self.scripts.iter() {
            if let Some(Some(running)) = slot.value().get() {
                running.task.abort();
            }
        }
        self.scripts.clear();
    }

    pub async fn upload(&self, path: &str, data: &[u8]) -> Result<FileTransferReceipt, AgentError> {
        let target = self.resolve_file(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;
        debug!(path, bytes = data.len(), "file uploaded");
        Ok(FileTransferReceipt {
            path: path.to_string(),
            length: data.len() as u64,
        })
    }

    pub async fn download(&self, path: &str) -> Result<FileContents, AgentError> {
        let target = self.resolve_file(path)?;
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(FileContents {
                path: path.to_string(),
                data,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(AgentError::FileNotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Transfer paths are relative and stay under the files root.
    fn resolve_file(&self, path: &str) -> Result<PathBuf, AgentError> {
        let relative = Path::new(path);
        let confined = !path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !confined {
            return Err(AgentError::InvalidRequest(format!("invalid transfer path: {path:?}")));
        }
        Ok(self.config.files_root.join(relative))
    }
}

/// Background half of a started script: wait for isolation, run, record.
struct ScriptJob {
    workspace: Workspace,
    script: ScriptSpec,
    log: SharedLog,
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
    mutex: IsolationMutex,
    runner: ScriptRunner,
}

impl ScriptJob {
    async fn run(self) {
        let ticket = &self.workspace.ticket;
        let mut state = match self.workspace.read_state() {
            Ok(Some(state)) => state,
            _ => WorkspaceState::pending(ticket.clone()),
        };

        let guard = match self.mutex.acquire(&self.script.isolation, &self.cancel).await {
            Ok(guard) => guard,
            Err(AcquireError::TimedOut) => {
                append(
                    &self.log,
                    OutputSource::Agent,
                    format!(
                        "timed out waiting for isolation mutex {:?}",
                        self.script.isolation.mutex_name
                    ),
                );
                return self.finish(&mut state, exit_codes::TIMEOUT);
            }
            Err(AcquireError::Cancelled) => {
                append(
                    &self.log,
                    OutputSource::Agent,
                    "cancelled while waiting for isolation mutex",
                );
                return self.finish(&mut state, exit_codes::CANCELED);
            }
        };

        state.state = ProcessState::Running;
        self.persist(&state);
        self.progress.send_replace(Progress {
            state: ProcessState::Running,
            exit_code: exit_codes::RUNNING,
        });

        let exit_code = self
            .runner
            .run(&self.workspace, &self.script.arguments, &self.log, &self.cancel)
            .await;
        drop(guard);
        self.finish(&mut state, exit_code);
    }

    fn finish(&self, state: &mut WorkspaceState, exit_code: i32) {
        state.finish(exit_code);
        self.persist(state);
        info!(ticket = %self.workspace.ticket, exit_code, "script finished");
        self.progress.send_replace(Progress {
            state: ProcessState::Complete,
            exit_code,
        });
    }

    fn persist(&self, state: &WorkspaceState) {
        // Completed early: the workspace is gone and nobody will ask again.
        if !self.workspace.exists() {
            return;
        }
        if let Err(err) = self.workspace.write_state(state) {
            debug!(ticket = %self.workspace.ticket, "failed to persist script state: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_protocol::{Isolation, ScriptFile, services};

    fn service(root: &Path) -> ScriptService {
        ScriptService::new(AgentConfig::rooted_at(root)).unwrap()
    }

    fn command(body: &str) -> StartScriptCommand {
        StartScriptCommand {
            ticket: ScriptTicket::new("task"),
            script: ScriptSpec {
                script_body: body.to_string(),
                ..ScriptSpec::default()
            },
            wait_for_completion_ms: Some(10_000),
        }
    }

    fn texts(status: &ScriptStatus) -> Vec<&str> {
        status.logs.iter().map(|l| l.text.as_str()).collect()
    }

    #[tokio::test]
    async fn start_waits_and_reports_output() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());

        let status = service.start(command("echo one\necho two\nexit 4\n")).await.unwrap();
        assert!(status.is_complete());
        assert_eq!(status.exit_code, 4);
        assert_eq!(texts(&status), ["one", "two"]);

        let tail = service.status(&status.ticket, 1);
        assert_eq!(texts(&tail), ["two"]);
        assert_eq!(tail.next_log_sequence, 2);
    }

    #[tokio::test]
    async fn repeated_start_runs_once() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let command = command("echo ran >> ../../ran.txt\n");
        let ticket = command.ticket.clone();

        service.start(command.clone()).await.unwrap();
        service.start(command).await.unwrap();

        let workspace = service.workspaces.get(&ticket).unwrap();
        let ran = std::fs::read_to_string(workspace.dir.parent().unwrap().join("ran.txt")).unwrap();
        assert_eq!(ran.lines().count(), 1);
    }

    #[tokio::test]
    async fn input_files_are_visible_to_the_script() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let mut command = command("cat input.txt\n");
        command.script.files.push(ScriptFile {
            name: "input.txt".to_string(),
            contents: b"from client".to_vec(),
        });

        let status = service.start(command).await.unwrap();
        assert_eq!(texts(&status), ["from client"]);
    }

    #[tokio::test]
    async fn cancel_stops_a_running_script() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let mut command = command("echo begin\nexec sleep 30\n");
        command.wait_for_completion_ms = None;
        let ticket = command.ticket.clone();
        service.start(command).await.unwrap();

        let mut status = service.cancel(&ticket, 0);
        for _ in 0..100 {
            if status.is_complete() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = service.cancel(&ticket, 0);
        }
        assert!(status.is_complete());
        assert_eq!(status.exit_code, exit_codes::CANCELED);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let status = service.start(command("echo hi\n")).await.unwrap();
        let ticket = status.ticket;

        service.complete(&ticket).await.unwrap();
        assert!(service.workspaces.get(&ticket).is_none());
        service.complete(&ticket).await.unwrap();

        let after = service.status(&ticket, 0);
        assert_eq!(after.exit_code, exit_codes::UNKNOWN_SCRIPT);
    }

    #[tokio::test]
    async fn restarted_agent_reports_unknown_result_for_lost_scripts() {
        let root = tempfile::tempdir().unwrap();
        let first = service(root.path());
        let mut running = command("exec sleep 30\n");
        running.wait_for_completion_ms = None;
        let lost = running.ticket.clone();
        first.start(running).await.unwrap();
        let finished = first.start(command("echo done\n")).await.unwrap();
        for _ in 0..100 {
            if first.is_running(&lost) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        first.abort_all();

        let second = service(root.path());
        let status = second.status(&lost, 0);
        assert!(status.is_complete());
        assert_eq!(status.exit_code, exit_codes::UNKNOWN_RESULT);

        let status = second.status(&finished.ticket, 0);
        assert_eq!(status.exit_code, 0);
        assert_eq!(texts(&status), ["done"]);
    }

    #[tokio::test]
    async fn mutex_timeout_reports_timeout_exit_code() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let mut holder = command("exec sleep 30\n");
        holder.script.isolation = Isolation::full("deploy");
        holder.wait_for_completion_ms = None;
        let holder_ticket = holder.ticket.clone();
        service.start(holder).await.unwrap();
        for _ in 0..100 {
            if service.status(&holder_ticket, 0).state == ProcessState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut waiter = command("echo never\n");
        waiter.script.isolation = Isolation::full("deploy");
        waiter.script.isolation.mutex_timeout_ms = Some(100);
        let status = service.start(waiter).await.unwrap();

        assert!(status.is_complete());
        assert_eq!(status.exit_code, exit_codes::TIMEOUT);
        service.cancel(&holder_ticket, 0);
    }

    #[tokio::test]
    async fn legacy_start_assigns_ticket_and_complete_returns_final_status() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let ticket = service
            .start_legacy(
                "task".to_string(),
                ScriptSpec {
                    script_body: "echo legacy\n".to_string(),
                    ..ScriptSpec::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ticket.task_id, "task");

        let mut status = service.status(&ticket, 0);
        for _ in 0..100 {
            if status.is_complete() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = service.status(&ticket, 0);
        }
        let last = service.complete_legacy(&ticket, 0).await.unwrap();
        assert_eq!(last.exit_code, 0);
        assert_eq!(texts(&last), ["legacy"]);
        assert!(service.workspaces.get(&ticket).is_none());
    }

    #[tokio::test]
    async fn complete_waits_for_a_running_script_to_exit() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let mut command = command("exec sleep 30\n");
        command.wait_for_completion_ms = None;
        let ticket = command.ticket.clone();
        service.start(command).await.unwrap();
        let running = service.running(&ticket).unwrap();

        service.complete(&ticket).await.unwrap();
        assert_eq!(running.progress().state, ProcessState::Complete);
        assert_eq!(running.progress().exit_code, exit_codes::CANCELED);
        assert!(service.workspaces.get(&ticket).is_none());
        assert!(!service.is_running(&ticket));
    }

    #[tokio::test]
    async fn concurrent_starts_of_one_ticket_run_it_once() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let command = command("echo ran >> ../../ran.txt\n");
        let ticket = command.ticket.clone();

        let (first, second) = tokio::join!(service.start(command.clone()), service.start(command));
        assert_eq!(first.unwrap().exit_code, 0);
        assert_eq!(second.unwrap().exit_code, 0);

        let workspace = service.workspaces.get(&ticket).unwrap();
        let ran = std::fs::read_to_string(workspace.dir.parent().unwrap().join("ran.txt")).unwrap();
        assert_eq!(ran.lines().count(), 1);
    }

    #[tokio::test]
    async fn tickets_sharing_an_id_across_tasks_run_separately() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let mut first = command("echo first\n");
        first.ticket = ScriptTicket {
            task_id: "task-a".to_string(),
            id: "x".to_string(),
        };
        let mut second = command("echo second\n");
        second.ticket = ScriptTicket {
            task_id: "task-b".to_string(),
            id: "x".to_string(),
        };

        let first = service.start(first).await.unwrap();
        let second = service.start(second).await.unwrap();
        assert_eq!(texts(&first), ["first"]);
        assert_eq!(texts(&second), ["second"]);

        service.complete(&first.ticket).await.unwrap();
        assert_eq!(texts(&service.status(&second.ticket, 0)), ["second"]);
    }

    #[tokio::test]
    async fn ids_differing_only_in_punctuation_run_separately() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let mut dotted = command("echo dotted\n");
        dotted.ticket.id = "a.b".to_string();
        let mut underscored = command("echo underscored\n");
        underscored.ticket.id = "a_b".to_string();

        let dotted = service.start(dotted).await.unwrap();
        let underscored = service.start(underscored).await.unwrap();
        assert_eq!(texts(&dotted), ["dotted"]);
        assert_eq!(texts(&underscored), ["underscored"]);
    }

    #[tokio::test]
    async fn empty_ticket_ids_are_rejected_before_touching_disk() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());
        let kept = service.start(command("echo kept\n")).await.unwrap();
        let empty = ScriptTicket {
            task_id: "evil".to_string(),
            id: String::new(),
        };

        match service.handle(Request::CompleteScript { ticket: empty.clone() }).await {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
            other => panic!("expected invalid request, got {other:?}"),
        }
        assert!(service.config().workspace_root.is_dir());
        assert!(service.workspaces.get(&kept.ticket).is_some());

        let status = service
            .handle(Request::GetStatus {
                ticket: empty.clone(),
                last_log_sequence: 0,
            })
            .await;
        match status {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
            other => panic!("expected invalid request, got {other:?}"),
        }
        assert_eq!(service.status(&empty, 0).exit_code, exit_codes::UNKNOWN_SCRIPT);

        let mut start = command("echo never\n");
        start.ticket = empty;
        assert!(matches!(service.start(start).await, Err(AgentError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn unhosted_services_are_unknown() {
        let root = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::rooted_at(root.path());
        config.services = vec![services::SCRIPT_LEGACY.to_string()];
        let service = ScriptService::new(config).unwrap();

        match service.handle(Request::GetCapabilities).await {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownService),
            other => panic!("expected unknown service, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_transfer_round_trips_and_stays_confined() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path());

        let receipt = service.upload("nested/a.bin", &[1, 2, 3]).await.unwrap();
        assert_eq!(receipt.length, 3);
        assert_eq!(service.download("nested/a.bin").await.unwrap().data, vec![1, 2, 3]);

        assert!(matches!(
            service.download("missing").await,
            Err(AgentError::FileNotFound(_))
        ));
        assert!(matches!(
            service.upload("../escape", b"x").await,
            Err(AgentError::InvalidRequest(_))
        ));
        assert!(matches!(
            service.upload("/etc/passwd", b"x").await,
            Err(AgentError::InvalidRequest(_))
        ));
    }
}
