use rexec_protocol::{Isolation, IsolationLevel, ScriptFile, ScriptSpec, ScriptTicket};
use std::time::Duration;

/// A script to run on an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    pub task_id: String,
    /// Id proposed to agents that accept client-chosen tickets. Fixed per
    /// command, so starting the same command again reaches the same execution.
    pub ticket_id: String,
    pub script_body: String,
    pub isolation: Isolation,
    pub arguments: Vec<String>,
    pub files: Vec<ScriptFile>,
    /// Let the agent hold the start call open for up to this long so short
    /// scripts finish without a separate status poll.
    pub wait_for_completion: Option<Duration>,
}

impl ScriptCommand {
    pub fn new(script_body: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            ticket_id: uuid::Uuid::new_v4().to_string(),
            script_body: script_body.into(),
            isolation: Isolation::default(),
            arguments: Vec::new(),
            files: Vec::new(),
            wait_for_completion: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_ticket_id(mut self, ticket_id: impl Into<String>) -> Self {
        self.ticket_id = ticket_id.into();
        self
    }

    pub fn with_isolation(mut self, level: IsolationLevel, mutex_name: impl Into<String>) -> Self {
        self.isolation.level = level;
        self.isolation.mutex_name = mutex_name.into();
        self
    }

    pub fn with_mutex_timeout(mut self, timeout: Duration) -> Self {
        self.isolation.mutex_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push(ScriptFile {
            name: name.into(),
            contents: contents.into(),
        });
        self
    }

    pub fn wait_for_completion(mut self, wait: Duration) -> Self {
        self.wait_for_completion = Some(wait);
        self
    }

    /// Ticket this command runs under when the client proposes it.
    pub fn ticket(&self) -> ScriptTicket {
        ScriptTicket {
            task_id: self.task_id.clone(),
            id: self.ticket_id.clone(),
        }
    }

    pub(crate) fn spec(&self) -> ScriptSpec {
        ScriptSpec {
            script_body: self.script_body.clone(),
            isolation: self.isolation.clone(),
            arguments: self.arguments.clone(),
            files: self.files.clone(),
        }
    }
}
