//! Session gateway binary.
//!
//! Restores persisted sessions, then serves the HTTP control API until
//! SIGINT or SIGTERM.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use wagate_client::memory::MemoryConnector;
use wagate_session::{ControlService, ManagerConfig, SessionManager, SessionRegistry, StartupLoader};
use wagate_storage::open_store;

mod config;
mod http;
mod logging;

use config::GatewayConfig;
use logging::GatewayLogFormatter;

/// Messaging network session gateway
#[derive(Parser, Debug)]
#[command(name = "wagate", version, about = "Messaging network session gateway")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "wagate.yaml")]
    config: PathBuf,

    /// Listen address for the control API, e.g. 0.0.0.0:3000
    #[arg(long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    // Storage configuration
    /// Storage mode: memory, file
    #[arg(long)]
    storage: Option<String>,

    /// Data directory for file storage
    #[arg(long)]
    data_dir: Option<PathBuf>,

    // Reconnect configuration
    /// Delay before the first reconnect, e.g. 1s
    #[arg(long)]
    backoff_base: Option<humantime::Duration>,

    /// Upper bound for reconnect delays, e.g. 30s
    #[arg(long)]
    backoff_max: Option<humantime::Duration>,

    /// Do not print pairing QR codes to the terminal
    #[arg(long)]
    no_terminal_qr: bool,

    /// Step between scripted pairing events of the development client
    #[arg(long)]
    pair_after: Option<humantime::Duration>,
}

impl Args {
    /// Command line flags win over file and environment
    fn apply_to(&self, config: &mut GatewayConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(storage) = &self.storage {
            config.storage.mode = storage.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.storage.data_dir = data_dir.clone();
        }
        if let Some(base) = &self.backoff_base {
            config.reconnect.base_delay = base.to_string();
        }
        if let Some(max) = &self.backoff_max {
            config.reconnect.max_delay = max.to_string();
        }
        if self.no_terminal_qr {
            config.challenge.print_terminal = false;
        }
        if let Some(step) = &self.pair_after {
            config.client.pair_after = step.to_string();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("wagate={}", args.log_level).parse()?)
        .add_directive(format!("wagate_session={}", args.log_level).parse()?)
        .add_directive(format!("wagate_storage={}", args.log_level).parse()?)
        .add_directive(format!("wagate_client={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(GatewayLogFormatter::new("wagate"))
        .init();

    component_info!("main", "Starting session gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = GatewayConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    let store = open_store(config.storage_mode()?)
        .await
        .context("failed to open credential store")?;

    component_warn!(
        "main",
        "Using the in-process loopback client; sessions pair automatically every {}",
        config.client.pair_after
    );
    let connector = Arc::new(MemoryConnector::with_auto_pair(config.pair_after()?));

    let manager = SessionManager::new(
        Arc::new(SessionRegistry::new()),
        store,
        connector,
        ManagerConfig {
            reconnect: config.reconnect_policy()?,
            print_terminal_qr: config.challenge.print_terminal,
        },
    );

    let report = StartupLoader::new(manager.clone())
        .run()
        .await
        .context("failed to enumerate persisted sessions")?;
    component_info!(
        "main",
        "Restored {} sessions ({} failed)",
        report.started,
        report.failed
    );

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    component_info!("http", "Control API listening on {}", config.server.bind);

    axum::serve(listener, http::router(ControlService::new(manager.clone())))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control API server failed")?;

    manager.shutdown().await;
    component_info!("main", "Session gateway stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            component_warn!("main", "Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                component_warn!("main", "Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    component_info!("main", "Shutdown signal received");
}
