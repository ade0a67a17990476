//! Reference agent: hosts the script, capabilities and file transfer
//! services over JSON-lines TCP.

pub mod cleaner;
pub mod config;
pub mod error;
pub mod log;
pub mod mutex;
pub mod runner;
pub mod server;
pub mod service;
pub mod workspace;

pub use config::AgentConfig;
pub use error::AgentError;
pub use server::spawn_agent;
pub use service::ScriptService;
