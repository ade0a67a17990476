use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rexec_protocol::services;

#[derive(Deserialize, Debug, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Root for file transfer paths.
    #[serde(default = "default_files_root")]
    pub files_root: PathBuf,
    /// Finished workspaces nobody completed are swept after this long.
    #[serde(default = "default_workspace_retention_secs")]
    pub workspace_retention_secs: u64,
    #[serde(default = "default_cleaner_interval_secs")]
    pub cleaner_interval_secs: u64,
    /// Services to host. Leave some out to behave like an older agent.
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl AgentConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Defaults with all state kept under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            workspace_root: root.join("workspaces"),
            files_root: root.join("files"),
            ..Self::default()
        }
    }

    pub fn hosts(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }

    pub fn workspace_retention(&self) -> Duration {
        Duration::from_secs(self.workspace_retention_secs)
    }

    pub fn cleaner_interval(&self) -> Duration {
        Duration::from_secs(self.cleaner_interval_secs.max(1))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            workspace_root: default_workspace_root(),
            files_root: default_files_root(),
            workspace_retention_secs: default_workspace_retention_secs(),
            cleaner_interval_secs: default_cleaner_interval_secs(),
            services: default_services(),
            shell: default_shell(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:10933".to_string()
}

fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
        PathBuf::from(dir).join("rexec")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("state").join("rexec")
    } else {
        std::env::temp_dir().join("rexec")
    }
}

fn default_workspace_root() -> PathBuf {
    state_dir().join("workspaces")
}

fn default_files_root() -> PathBuf {
    state_dir().join("files")
}

fn default_workspace_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_cleaner_interval_secs() -> u64 {
    10 * 60
}

fn default_services() -> Vec<String> {
    services::ALL.iter().map(|s| s.to_string()).collect()
}

fn default_shell() -> String {
    "sh".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_host_every_service() {
        let config = AgentConfig::default();
        for service in services::ALL {
            assert!(config.hosts(service));
        }
        assert_eq!(config.shell, "sh");
    }

    #[test]
    fn file_overrides_selected_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "listen_addr = \"127.0.0.1:0\"\nservices = [\"ScriptService\"]\nworkspace_retention_secs = 5\n",
        )
        .unwrap();

        let config = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:0");
        assert!(config.hosts(services::SCRIPT_LEGACY));
        assert!(!config.hosts(services::CAPABILITIES));
        assert_eq!(config.workspace_retention(), Duration::from_secs(5));
        assert_eq!(config.cleaner_interval_secs, 600);
    }

    #[test]
    fn rooted_at_keeps_state_under_root() {
        let config = AgentConfig::rooted_at(Path::new("/tmp/agent-x"));
        assert!(config.workspace_root.starts_with("/tmp/agent-x"));
        assert!(config.files_root.starts_with("/tmp/agent-x"));
    }
}
