//! Run code on a Jupyter server through the notebook bridge.
//!
//! Run with: cargo run -p exec-cell -- --url http://localhost:8888 --token T "print(1 + 1)"
//!
//! With `--notebook`, the code is appended to the notebook as a new cell
//! and its outputs are saved there.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::Parser;
use notebook_bridge_core::{CellKind, summarize};
use notebook_bridge_kernel::{ExecuteOptions, TerminalState};
use notebook_bridge_session::{
    BridgeConfig, ExecutionSupervisor, FileSessionStore, SessionManager,
};
use notebook_bridge_transport::JupyterConnector;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "exec-cell")]
#[command(about = "Execute code in a notebook kernel")]
#[command(version)]
struct Cli {
    /// Code to run
    code: String,

    /// Configuration file (TOML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Server address
    #[arg(long, env = "NOTEBOOK_BRIDGE_URL")]
    url: Option<String>,

    /// Server token
    #[arg(long, env = "NOTEBOOK_BRIDGE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Notebook to record the cell in
    #[arg(long, short = 'n')]
    notebook: Option<String>,

    /// Kernel spec name
    #[arg(long, short = 'k')]
    kernel: Option<String>,

    /// Timeout in seconds
    #[arg(long, short = 't')]
    timeout: Option<u64>,

    /// Reuse the last saved session instead of connecting fresh
    #[arg(long)]
    reconnect: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = BridgeConfig::load(cli.config.as_deref())?;
    if cli.url.is_some() {
        config.server.address = cli.url;
    }
    if cli.token.is_some() {
        config.server.token = cli.token;
    }
    if let Some(kernel) = cli.kernel {
        config.kernel.name = kernel;
    }

    let session_file = config
        .session_file()
        .context("cannot determine a location for the session file")?;
    let manager = SessionManager::from_config(
        JupyterConnector::new(),
        FileSessionStore::new(session_file),
        &config,
    );

    let session = if cli.reconnect {
        manager.reconnect_saved().await?
    } else {
        let (address, credential) = config.credentials()?;
        manager
            .connect(address, credential, cli.notebook.as_deref())
            .await?
    };
    let kernel = manager.attach_kernel(None).await?;
    tracing::info!(kernel = %kernel.short(), "Ready");

    let supervisor = ExecutionSupervisor::new(config.retry_policy());
    let options = ExecuteOptions {
        timeout: cli.timeout.map(Duration::from_secs),
        exclusive: false,
    };

    let result = if session.notebook_path().is_some() {
        let applied = session.append_cell(CellKind::Code, cli.code).await?;
        if !applied.is_clean() {
            eprintln!(
                "warning: notebook was edited elsewhere: {}",
                summarize(applied.conflicts())
            );
        }
        supervisor
            .execute_cell(&session, applied.value(), None, options)
            .await?
    } else {
        supervisor.execute_code(&session, &cli.code, options).await?
    };

    for output in &result.outputs {
        let text = output.plain_text();
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }

    manager.disconnect().await;
    match result.terminal {
        TerminalState::Finalized => Ok(()),
        TerminalState::Cancelled => bail!("execution {} was cancelled", result.token),
        TerminalState::Failed { failure } => bail!("execution {} failed: {failure}", result.token),
    }
}
