//! hived - workflow orchestration daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use hive_core::Config;
use hived::Daemon;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "hived", about = "Workflow orchestration daemon", version)]
struct Cli {
    /// Config file (default: ~/.config/hive/hive.conf)
    #[arg(short, long, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory holding workflow definitions
    #[arg(long)]
    workflows_dir: Option<PathBuf>,
}

impl Cli {
    /// Defaults, then the config file, then flags.
    fn load_config(&self) -> eyre::Result<Config> {
        let mut config = Config::default();
        match &self.config {
            Some(path) => config
                .load_file(path)
                .wrap_err_with(|| format!("failed to load {}", path.display()))?,
            None => {
                if let Some(path) = Config::default_path().filter(|p| p.exists()) {
                    config
                        .load_file(&path)
                        .wrap_err_with(|| format!("failed to load {}", path.display()))?;
                }
            }
        }

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(db) = &self.db {
            config.db_path.clone_from(db);
        }
        if let Some(dir) = &self.workflows_dir {
            config.workflows_dir.clone_from(dir);
        }
        Ok(config)
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hived=info")),
        )
        .init();

    let config = cli.load_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = match Daemon::new(config).await {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {:#}", e);
                return Err(e);
            }
        };

        let run = daemon.run();
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => {
                if let Err(e) = &result {
                    error!("daemon error: {:#}", e);
                }
                return result;
            }
            () = shutdown_signal() => daemon.shutdown(),
        }
        // Let in-flight requests finish.
        run.await
    })
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        error!("failed to register signal handlers, falling back to ctrl-c");
        tokio::signal::ctrl_c().await.ok();
        return;
    };

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("received ctrl-c, initiating graceful shutdown");
}
