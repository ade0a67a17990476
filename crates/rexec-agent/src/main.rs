use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use rexec_agent::AgentConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "rexec remote script agent")]
struct Args {
    /// TOML config file. Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    workspace_root: Option<PathBuf>,
    #[arg(long)]
    files_root: Option<PathBuf>,
    /// Seconds a finished workspace may wait for Complete before it is swept.
    #[arg(long)]
    workspace_retention_secs: Option<u64>,
    /// Host only these services (repeatable).
    #[arg(long = "service")]
    services: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rexec_agent=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = AgentConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(root) = args.workspace_root {
        config.workspace_root = root;
    }
    if let Some(root) = args.files_root {
        config.files_root = root;
    }
    if let Some(secs) = args.workspace_retention_secs {
        config.workspace_retention_secs = secs;
    }
    if !args.services.is_empty() {
        config.services = args.services;
    }

    rexec_agent::server::run(config).await
}
