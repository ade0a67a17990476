use rexec_protocol::{OutputSource, ProcessOutput, exit_codes};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::log::ScriptLog;
use crate::workspace::Workspace;

pub type SharedLog = Arc<Mutex<ScriptLog>>;

/// How long to keep collecting output after a cancelled script was killed.
/// Orphaned grandchildren may hold the pipes open indefinitely.
const KILLED_OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// Runs a workspace's script with the configured shell.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    shell: String,
}

impl ScriptRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Run to completion, streaming output lines into `log`. Returns the
    /// exit code, or [`exit_codes::CANCELED`] if `cancel` fired first.
    pub async fn run(
        &self,
        workspace: &Workspace,
        arguments: &[String],
        log: &SharedLog,
        cancel: &CancellationToken,
    ) -> i32 {
        let spawned = Command::new(&self.shell)
            .arg(workspace.script_path())
            .args(arguments)
            .current_dir(workspace.files_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                warn!(ticket = %workspace.ticket, "failed to spawn script: {err}");
                append(log, OutputSource::Agent, format!("failed to start script: {err}"));
                return exit_codes::FATAL;
            }
        };

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward(stdout, OutputSource::Stdout, Arc::clone(log)));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward(stderr, OutputSource::Stderr, Arc::clone(log)));
        }

        let (exit_code, killed) = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => (status.code().unwrap_or(exit_codes::FATAL), false),
                Err(err) => {
                    append(log, OutputSource::Agent, format!("failed to wait for script: {err}"));
                    (exit_codes::FATAL, false)
                }
            },
            _ = cancel.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(ticket = %workspace.ticket, "failed to kill script: {err}");
                }
                append(log, OutputSource::Agent, "script cancelled");
                (exit_codes::CANCELED, true)
            }
        };

        for forwarder in forwarders {
            if killed {
                let abort = forwarder.abort_handle();
                if tokio::time::timeout(KILLED_OUTPUT_DRAIN, forwarder).await.is_err() {
                    abort.abort();
                }
            } else {
                let _ = forwarder.await;
            }
        }
        debug!(ticket = %workspace.ticket, exit_code, "script exited");
        exit_code
    }
}

fn forward<R>(stream: R, source: OutputSource, log: SharedLog) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => append(&log, source, line),
                Ok(None) => break,
                Err(err) => {
                    debug!("script output stream failed: {err}");
                    break;
                }
            }
        }
    })
}

pub(crate) fn append(log: &SharedLog, source: OutputSource, text: impl Into<String>) {
    let entry = ProcessOutput::new(source, text);
    match log.lock() {
        Ok(mut log) => log.append(entry),
        Err(poisoned) => poisoned.into_inner().append(entry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceFactory;
    use rexec_protocol::{ScriptSpec, ScriptTicket};

    fn workspace(root: &std::path::Path, body: &str) -> Workspace {
        let factory = WorkspaceFactory::new(root).unwrap();
        let spec = ScriptSpec {
            script_body: body.to_string(),
            ..ScriptSpec::default()
        };
        factory.prepare(&ScriptTicket::new("t"), &spec).unwrap()
    }

    fn texts(log: &SharedLog) -> Vec<String> {
        let (entries, _) = log.lock().unwrap().since(0);
        entries.into_iter().map(|e| e.text).collect()
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let root = tempfile::tempdir().unwrap();
        let workspace = workspace(root.path(), "echo out\necho \"arg=$1\"\necho err >&2\nexit 3\n");
        let log = SharedLog::default();

        let code = ScriptRunner::new("sh")
            .run(&workspace, &["x".to_string()], &log, &CancellationToken::new())
            .await;

        assert_eq!(code, 3);
        let lines = texts(&log);
        assert!(lines.contains(&"out".to_string()));
        assert!(lines.contains(&"arg=x".to_string()));
        assert!(lines.contains(&"err".to_string()));
    }

    #[tokio::test]
    async fn cancel_kills_the_script() {
        let root = tempfile::tempdir().unwrap();
        let workspace = workspace(root.path(), "echo started\nexec sleep 30\n");
        let log = SharedLog::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let code = ScriptRunner::new("sh")
            .run(&workspace, &[], &log, &cancel)
            .await;

        assert_eq!(code, exit_codes::CANCELED);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(texts(&log).last().map(String::as_str), Some("script cancelled"));
    }

    #[tokio::test]
    async fn missing_shell_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let workspace = workspace(root.path(), "echo hi\n");
        let log = SharedLog::default();

        let code = ScriptRunner::new("/definitely/not/a/shell")
            .run(&workspace, &[], &log, &CancellationToken::new())
            .await;

        assert_eq!(code, exit_codes::FATAL);
        assert!(texts(&log)[0].starts_with("failed to start script"));
    }
}
