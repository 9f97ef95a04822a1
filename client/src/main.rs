use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use homeport::config::{ClientConfig, ConfigFile, LogLevel, Overrides};
use homeport::ha_config::{ConfigPatcher, PatchOutcome};
use homeport::validator::SupervisorValidator;
use homeport::{exit_status, RequestRelay, TunnelConnection, TunnelSession, WsConnector};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "homeport")]
#[command(version)]
#[command(about = "Expose a local home automation backend through a public relay", long_about = None)]
struct Cli {
    /// Path to homeport.yml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay auth token
    #[arg(long, env = "HOMEPORT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Relay WebSocket URL
    #[arg(long, env = "HOMEPORT_RELAY_URL")]
    relay_url: Option<String>,

    /// Local backend base URL
    #[arg(long, env = "HOMEPORT_BACKEND_URL")]
    backend_url: Option<String>,

    #[arg(long, value_enum, env = "HOMEPORT_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    verbose: bool,

    /// Backend configuration.yaml to patch
    #[arg(long)]
    backend_config: Option<PathBuf>,

    /// Leave the backend configuration alone
    #[arg(long)]
    skip_config_patch: bool,

    /// Do not write a backup before patching
    #[arg(long)]
    no_config_backup: bool,

    /// Token for the supervisor check_config API
    #[arg(long, env = "SUPERVISOR_TOKEN", hide_env_values = true)]
    supervisor_token: Option<String>,
}

impl Cli {
    fn load(&self) -> Result<ClientConfig> {
        let file = match self.config.clone().or_else(ConfigFile::find_config) {
            Some(path) => ConfigFile::load(&path)?,
            None => ConfigFile::default(),
        };

        let overrides = Overrides {
            token: self.token.clone(),
            relay_url: self.relay_url.clone(),
            backend_url: self.backend_url.clone(),
            log_level: if self.verbose { Some(LogLevel::Debug) } else { self.log_level },
            backend_config: self.backend_config.clone(),
            skip_patch: self.skip_config_patch,
            supervisor_token: self.supervisor_token.clone(),
        };

        let mut config = ClientConfig::resolve(file, overrides)?;
        if self.no_config_backup {
            config.patch.keep_backup = false;
        }
        Ok(config)
    }
}

fn init_logging(level: LogLevel) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("homeport={0},homeport_shared={0},warn", level.as_str())));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("homeport: {:#}", e);
            return ExitCode::from(1);
        }
    };
    init_logging(config.log_level);

    match run(config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("homeport: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(config: ClientConfig) -> Result<u8> {
    info!("Homeport {} starting", env!("CARGO_PKG_VERSION"));
    info!("Relay: {}", config.relay_url);
    info!("Backend: {}", config.backend_url);

    if config.patch.enabled {
        patch_backend_config(&config).await;
    } else {
        info!("Backend configuration patch disabled");
    }

    let relay = RequestRelay::new(&config.backend_url, config.tunnel.relay_settings())
        .context("Failed to build backend HTTP client")?;
    let connector = WsConnector::new(config.tunnel.connect_timeout(), config.tunnel.max_message_bytes);
    let session = TunnelSession::new(config.token.clone(), config.relay_url.clone(), config.tunnel.backoff_policy());
    let tunnel = TunnelConnection::new(connector, session, config.tunnel.tunnel_settings(), relay);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let result = tunnel.run(shutdown_rx).await;
    if let Err(e) = &result {
        eprintln!("homeport: {}", e);
    }
    Ok(exit_status(&result))
}

/// Never fatal: a failed patch only means the backend may reject proxied requests.
async fn patch_backend_config(config: &ClientConfig) {
    let patch = &config.patch;
    let validator = match SupervisorValidator::new(
        patch.validation_url.clone(),
        patch.supervisor_token.clone(),
        patch.validation_timeout(),
    ) {
        Ok(v) => v,
        Err(e) => {
            warn!("Skipping backend configuration patch: {}", e);
            return;
        }
    };

    let patcher = ConfigPatcher::new(validator, patch.validation_timeout()).keep_backup(patch.keep_backup);
    match patcher.ensure_trusted_proxy(&patch.config_path, &patch.trusted_proxies).await {
        Ok(PatchOutcome::Applied) => info!("Backend configuration patched"),
        Ok(PatchOutcome::AlreadyPresent) => info!("Backend already trusts the tunnel"),
        Ok(PatchOutcome::Reverted(reason)) => {
            warn!("Backend configuration patch rolled back: {}", reason)
        }
        Err(e) => warn!("Could not patch backend configuration: {}", e),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
