use serde::{Deserialize, Serialize};
use std::fmt;

use crate::base64_bytes;

/// Longest ticket id an agent accepts. Together with [`MAX_TASK_ID_BYTES`]
/// this keeps a hex-encoded workspace key within one path component.
pub const MAX_TICKET_ID_BYTES: usize = 63;
pub const MAX_TASK_ID_BYTES: usize = 63;

/// Names one remote execution: the task it belongs to plus a per-execution id.
///
/// For the current script service the client proposes the id so that a
/// retried start lands on the same execution. The legacy service assigns it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptTicket {
    pub task_id: String,
    pub id: String,
}

impl ScriptTicket {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Checks an agent applies before accepting a ticket.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("ticket id is empty".to_string());
        }
        if self.id.len() > MAX_TICKET_ID_BYTES {
            return Err(format!("ticket id longer than {MAX_TICKET_ID_BYTES} bytes"));
        }
        if self.task_id.len() > MAX_TASK_ID_BYTES {
            return Err(format!("task id longer than {MAX_TASK_ID_BYTES} bytes"));
        }
        Ok(())
    }

    /// Directory name for the ticket's workspace: both parts hex encoded and
    /// joined by `-`, so distinct tickets never share a name.
    pub fn workspace_key(&self) -> String {
        format!("{}-{}", hex::encode(&self.task_id), hex::encode(&self.id))
    }
}

impl fmt::Display for ScriptTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_id, self.id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Pending,
    Running,
    Complete,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    Stdout,
    Stderr,
    Agent,
}

/// One line of script output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub source: OutputSource,
    pub text: String,
    pub occurred_at_ms: u64,
}

impl ProcessOutput {
    pub fn new(source: OutputSource, text: impl Into<String>) -> Self {
        let occurred_at_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            source,
            text: text.into(),
            occurred_at_ms,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    NoIsolation,
    FullIsolation,
}

/// Which scripts may run alongside this one on the agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Isolation {
    #[serde(default)]
    pub level: IsolationLevel,
    #[serde(default)]
    pub mutex_name: String,
    /// How long to wait for the mutex before giving up. `None` waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutex_timeout_ms: Option<u64>,
}

impl Isolation {
    pub fn full(mutex_name: impl Into<String>) -> Self {
        Self {
            level: IsolationLevel::FullIsolation,
            mutex_name: mutex_name.into(),
            mutex_timeout_ms: None,
        }
    }

    pub fn none(mutex_name: impl Into<String>) -> Self {
        Self {
            level: IsolationLevel::NoIsolation,
            mutex_name: mutex_name.into(),
            mutex_timeout_ms: None,
        }
    }
}

/// An input file written into the workspace next to the script.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
}

/// What to run. Shared by the current and legacy start requests.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScriptSpec {
    pub script_body: String,
    #[serde(default)]
    pub isolation: Isolation,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub files: Vec<ScriptFile>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartScriptCommand {
    pub ticket: ScriptTicket,
    pub script: ScriptSpec,
    /// Let the agent hold the start call open until the script finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_completion_ms: Option<u64>,
}

/// Snapshot of a remote script plus the log lines produced since the
/// requested sequence number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptStatus {
    pub ticket: ScriptTicket,
    pub state: ProcessState,
    pub exit_code: i32,
    #[serde(default)]
    pub logs: Vec<ProcessOutput>,
    pub next_log_sequence: u64,
}

impl ScriptStatus {
    /// Status assumed for a script whose start may or may not have reached the agent.
    pub fn pending(ticket: ScriptTicket) -> Self {
        Self {
            ticket,
            state: ProcessState::Pending,
            exit_code: 0,
            logs: Vec::new(),
            next_log_sequence: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ProcessState::Complete
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub supported_services: Vec<String>,
}

impl Capabilities {
    /// What an agent without a capabilities service is known to host.
    pub fn legacy() -> Self {
        Self {
            supported_services: vec![crate::services::SCRIPT_LEGACY.to_string()],
        }
    }

    pub fn supports(&self, service: &str) -> bool {
        self.supported_services.iter().any(|s| s == service)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileTransferReceipt {
    pub path: String,
    pub length: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileContents {
    pub path: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}
