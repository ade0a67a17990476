use rexec_protocol::{ProcessState, ScriptSpec, ScriptTicket};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::AgentError;

const SCRIPT_FILE: &str = "script.sh";
const STATE_FILE: &str = "state.json";
const LOG_FILE: &str = "output.log";
const FILES_DIR: &str = "files";

/// What the agent last knew about a script, persisted next to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceState {
    pub ticket: ScriptTicket,
    pub state: ProcessState,
    pub exit_code: i32,
    pub created_at_ms: u64,
    #[serde(default)]
    pub completed_at_ms: Option<u64>,
}

impl WorkspaceState {
    pub fn pending(ticket: ScriptTicket) -> Self {
        Self {
            ticket,
            state: ProcessState::Pending,
            exit_code: 0,
            created_at_ms: now_ms(),
            completed_at_ms: None,
        }
    }

    pub fn finish(&mut self, exit_code: i32) {
        self.state = ProcessState::Complete;
        self.exit_code = exit_code;
        self.completed_at_ms = Some(now_ms());
    }
}

/// Directory holding one script execution's body, input files and output.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub ticket: ScriptTicket,
    pub dir: PathBuf,
}

impl Workspace {
    pub fn script_path(&self) -> PathBuf {
        self.dir.join(SCRIPT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Working directory for the script; input files land here.
    pub fn files_dir(&self) -> PathBuf {
        self.dir.join(FILES_DIR)
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Replace the persisted state. Written to a temp file first so a crash
    /// never leaves half a document behind.
    pub fn write_state(&self, state: &WorkspaceState) -> Result<(), AgentError> {
        let tmp = self.dir.join(format!("{STATE_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, self.dir.join(STATE_FILE))?;
        Ok(())
    }

    pub fn read_state(&self) -> Result<Option<WorkspaceState>, AgentError> {
        match std::fs::read(self.dir.join(STATE_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Creates, finds and deletes workspaces under one root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceFactory {
    root: PathBuf,
}

impl WorkspaceFactory {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workspace(&self, ticket: &ScriptTicket) -> Result<Workspace, AgentError> {
        ticket.validate().map_err(AgentError::InvalidRequest)?;
        Ok(Workspace {
            ticket: ticket.clone(),
            dir: self.root.join(ticket.workspace_key()),
        })
    }

    /// Create the workspace for `ticket` and write the script and its input
    /// files into it.
    pub fn prepare(&self, ticket: &ScriptTicket, spec: &ScriptSpec) -> Result<Workspace, AgentError> {
        for file in &spec.files {
            validate_file_name(&file.name)?;
        }

        let workspace = self.workspace(ticket)?;
        std::fs::create_dir_all(workspace.files_dir())?;
        std::fs::write(workspace.script_path(), &spec.script_body)?;
        for file in &spec.files {
            std::fs::write(workspace.files_dir().join(&file.name), &file.contents)?;
        }
        workspace.write_state(&WorkspaceState::pending(ticket.clone()))?;
        debug!(ticket = %ticket, dir = %workspace.dir.display(), "prepared workspace");
        Ok(workspace)
    }

    /// `None` for tickets without a workspace, malformed ones included.
    pub fn get(&self, ticket: &ScriptTicket) -> Option<Workspace> {
        self.workspace(ticket).ok().filter(Workspace::exists)
    }

    /// Remove the workspace. Returns false if it was already gone.
    pub fn delete(&self, ticket: &ScriptTicket) -> Result<bool, AgentError> {
        let workspace = self.workspace(ticket)?;
        match std::fs::remove_dir_all(&workspace.dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Every workspace with readable state. Unreadable directories are skipped.
    pub fn list(&self) -> Result<Vec<(Workspace, WorkspaceState)>, AgentError> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let unnamed = Workspace {
                ticket: ScriptTicket {
                    task_id: String::new(),
                    id: String::new(),
                },
                dir: dir.clone(),
            };
            match unnamed.read_state() {
                Ok(Some(state)) => found.push((
                    Workspace {
                        ticket: state.ticket.clone(),
                        dir,
                    },
                    state,
                )),
                Ok(None) => debug!(dir = %dir.display(), "workspace has no state yet"),
                Err(err) => debug!(dir = %dir.display(), "unreadable workspace state: {err}"),
            }
        }
        Ok(found)
    }
}

fn validate_file_name(name: &str) -> Result<(), AgentError> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\');
    if plain {
        Ok(())
    } else {
        Err(AgentError::InvalidRequest(format!("invalid input file name: {name:?}")))
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_protocol::ScriptFile;

    fn spec() -> ScriptSpec {
        ScriptSpec {
            script_body: "echo hi".to_string(),
            files: vec![ScriptFile {
                name: "input.txt".to_string(),
                contents: b"payload".to_vec(),
            }],
            ..ScriptSpec::default()
        }
    }

    #[test]
    fn prepare_writes_script_files_and_state() {
        let root = tempfile::tempdir().unwrap();
        let factory = WorkspaceFactory::new(root.path()).unwrap();
        let ticket = ScriptTicket::new("task-1");

        let workspace = factory.prepare(&ticket, &spec()).unwrap();
        assert_eq!(std::fs::read_to_string(workspace.script_path()).unwrap(), "echo hi");
        assert_eq!(
            std::fs::read(workspace.files_dir().join("input.txt")).unwrap(),
            b"payload"
        );
        let state = workspace.read_state().unwrap().unwrap();
        assert_eq!(state.ticket, ticket);
        assert_eq!(state.state, ProcessState::Pending);
        assert!(factory.get(&ticket).is_some());
    }

    #[test]
    fn input_files_cannot_escape_workspace() {
        let root = tempfile::tempdir().unwrap();
        let factory = WorkspaceFactory::new(root.path()).unwrap();
        let mut spec = spec();
        spec.files[0].name = "../escape".to_string();

        let err = factory.prepare(&ScriptTicket::new("t"), &spec).unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(_)));
        assert!(factory.list().unwrap().is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let factory = WorkspaceFactory::new(root.path()).unwrap();
        let ticket = ScriptTicket::new("t");
        factory.prepare(&ticket, &spec()).unwrap();

        assert!(factory.delete(&ticket).unwrap());
        assert!(!factory.delete(&ticket).unwrap());
        assert!(factory.get(&ticket).is_none());
    }

    #[test]
    fn malformed_tickets_never_reach_the_root() {
        let root = tempfile::tempdir().unwrap();
        let factory = WorkspaceFactory::new(root.path()).unwrap();
        factory.prepare(&ScriptTicket::new("t"), &spec()).unwrap();
        let empty = ScriptTicket {
            task_id: "evil".to_string(),
            id: String::new(),
        };

        assert!(matches!(factory.delete(&empty), Err(AgentError::InvalidRequest(_))));
        assert!(matches!(
            factory.prepare(&empty, &spec()),
            Err(AgentError::InvalidRequest(_))
        ));
        assert!(factory.get(&empty).is_none());
        assert!(root.path().is_dir());
        assert_eq!(factory.list().unwrap().len(), 1);
    }

    #[test]
    fn tickets_sharing_an_id_get_separate_directories() {
        let root = tempfile::tempdir().unwrap();
        let factory = WorkspaceFactory::new(root.path()).unwrap();
        let ticket = |task_id: &str, id: &str| ScriptTicket {
            task_id: task_id.to_string(),
            id: id.to_string(),
        };

        let a = factory.prepare(&ticket("task-a", "x"), &spec()).unwrap();
        let b = factory.prepare(&ticket("task-b", "x"), &spec()).unwrap();
        let dotted = factory.prepare(&ticket("t", "a.b"), &spec()).unwrap();
        let underscored = factory.prepare(&ticket("t", "a_b"), &spec()).unwrap();
        assert_ne!(a.dir, b.dir);
        assert_ne!(dotted.dir, underscored.dir);
        assert_eq!(factory.list().unwrap().len(), 4);
    }

    #[test]
    fn list_reports_persisted_state() {
        let root = tempfile::tempdir().unwrap();
        let factory = WorkspaceFactory::new(root.path()).unwrap();
        let ticket = ScriptTicket::new("t");
        let workspace = factory.prepare(&ticket, &spec()).unwrap();
        let mut state = workspace.read_state().unwrap().unwrap();
        state.finish(3);
        workspace.write_state(&state).unwrap();
        std::fs::create_dir(root.path().join("stray")).unwrap();

        let listed = factory.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0.ticket, ticket);
        assert_eq!(listed[0].1.exit_code, 3);
        assert!(listed[0].1.completed_at_ms.is_some());
    }
}
