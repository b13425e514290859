//! # bizpulse
//!
//! Relay binary: runs the server, watches a relay as a dashboard client, or
//! mints bearer tokens.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bizpulse_client::{lifecycle, ClientAgent, ClientOptions, ConnectionState};
use bizpulse_core::{BusinessId, EventKind};
use bizpulse_server::{
    build_authenticator, DrainOutcome, EventBus, JwtAuthenticator, RelayServer, DRAIN_TIMEOUT,
};
use bizpulse_settings::BizpulseSettings;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

/// Business-scoped real-time event relay.
#[derive(Parser, Debug)]
#[command(name = "bizpulse", about = "Business-scoped real-time event relay")]
struct Cli {
    /// Settings file (defaults to `~/.bizpulse/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
    /// Connect as a dashboard and log every message received.
    Watch(WatchArgs),
    /// Mint a JWT bound to a business.
    Token(TokenArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Relay endpoint, e.g. `ws://127.0.0.1:9850/ws`.
    #[arg(long)]
    url: String,

    /// Bearer token.
    #[arg(long)]
    token: Option<String>,

    /// Message kinds to log; every server kind when omitted.
    #[arg(long = "kind")]
    kinds: Vec<String>,
}

#[derive(Args, Debug)]
struct TokenArgs {
    #[arg(long)]
    business_id: String,

    /// Token lifetime (defaults to `auth.tokenTtlSecs`).
    #[arg(long)]
    ttl_secs: Option<u64>,
}

fn load_settings(path: Option<&Path>) -> Result<BizpulseSettings> {
    let settings = match path {
        Some(path) => bizpulse_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => bizpulse_settings::load_settings().context("Failed to load settings")?,
    };
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Command::Serve(args) => serve(settings, args).await,
        Command::Watch(args) => watch(settings, args).await,
        Command::Token(args) => token(&settings, args),
    }
}

async fn serve(mut settings: BizpulseSettings, args: ServeArgs) -> Result<()> {
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    bizpulse_telemetry::init_telemetry(&settings.logging)?;
    let metrics =
        bizpulse_telemetry::install_recorder().context("Failed to install metrics recorder")?;

    let bus = Arc::new(EventBus::new());
    let authenticator = build_authenticator(&settings.auth)?;
    let server =
        RelayServer::new(settings.server.clone(), bus, authenticator).with_metrics(metrics);

    let (addr, handle) = server.listen().await?;
    info!(%addr, auth_mode = ?settings.auth.mode, "bizpulse relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    if server.shutdown_and_drain(handle, DRAIN_TIMEOUT).await == DrainOutcome::TimedOut {
        warn!("relay did not stop within {DRAIN_TIMEOUT:?}");
    }
    Ok(())
}

async fn watch(settings: BizpulseSettings, args: WatchArgs) -> Result<()> {
    bizpulse_telemetry::init_telemetry(&settings.logging)?;

    let mut options = ClientOptions::from_settings(&settings.client);
    if let Some(token) = args.token {
        options = options.with_token(token);
    }
    let agent = ClientAgent::websocket(options);

    let kinds = if args.kinds.is_empty() {
        EventKind::ALL
            .iter()
            .map(|k| k.as_str().to_string())
            .chain(std::iter::once("error".to_string()))
            .collect()
    } else {
        args.kinds
    };
    for kind in kinds {
        let label = kind.clone();
        let _ = agent.on(kind, move |payload| {
            info!(kind = %label, %payload, "message received");
            Ok(())
        });
    }
    for kind in [lifecycle::CONNECTION_ERROR, lifecycle::AUTH_FAILED] {
        let _ = agent.on(kind, move |payload| {
            warn!(kind, %payload, "connection problem");
            Ok(())
        });
    }

    agent.connect(args.url)?;
    let mut state = agent.watch_state();
    let gave_up = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            false
        }
        failed = async { state.wait_for(|s| *s == ConnectionState::Failed).await.is_ok() } => failed,
    };

    agent.disconnect().await;
    if gave_up {
        bail!("relay unreachable, reconnect attempts exhausted");
    }
    Ok(())
}

fn token(settings: &BizpulseSettings, args: TokenArgs) -> Result<()> {
    let auth = JwtAuthenticator::from_settings(&settings.auth)?;
    let ttl = Duration::from_secs(args.ttl_secs.unwrap_or(settings.auth.token_ttl_secs));
    let token = auth
        .mint_token(&BusinessId::from(args.business_id), ttl)
        .context("Failed to mint token")?;
    println!("{token}");
    Ok(())
}
