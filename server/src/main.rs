#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # devtools-proxy
//!
//! Exposes the DevTools endpoints of Android webviews and browsers over HTTP
//! and WebSocket, through `adb` port forwards to the device's abstract
//! `*_devtools_remote` sockets.
//!
//! ## Subcommands
//!
//! - `devtools-proxy serve` (default) - run the HTTP/WS server
//! - `devtools-proxy targets` - run discovery once and print the result as JSON
//!
//! ## API surface
//!
//! | Method | Path                                   | Auth  | Description                     |
//! |--------|----------------------------------------|-------|---------------------------------|
//! | GET    | `/api/health`                          | No    | Liveness probe                  |
//! | GET    | `/api/targets`                         | Yes*  | Discover debuggable targets     |
//! | POST   | `/api/targets/proxy`                   | Yes*  | Start proxying a target         |
//! | POST   | `/api/targets/unproxy`                 | Yes*  | Stop proxying a target          |
//! | GET    | `/cdp/{instance}/{alias}/json/...`     | No    | Rewritten DevTools metadata     |
//! | GET    | `/cdp/{instance}/{alias}/devtools/...` | No    | Browser and page WebSocket relay|
//!
//! *Only when an API key is configured. DevTools front-ends cannot send
//! headers, so the CDP surface stays open.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          - entry point, clap subcommands, graceful shutdown
//! engine.rs        - ProxyEngine: list/start/stop, bind/unbind to a DeviceHost
//! discovery.rs     - /proc/net/unix scan and per-socket metadata collection
//! adb/             - DeviceBridge trait, adb child-process runner
//! ports.rs         - process-wide local port reservations
//! forward.rs       - device port forward lifecycle
//! cdp.rs           - DevTools HTTP metadata client
//! rewrite.rs       - URL rewriting of metadata responses
//! sessions/        - proxied sessions, aliases, session registry
//! ws/              - runtime WebSocket routes, relay
//! routes/          - health, command layer, per-session CDP endpoints
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use devtools_proxy::{
    routes, AdbBridge, AppState, Config, DeviceHost, EngineSettings, ProxyEngine, ServerInfo,
    WsRoutes,
};

/// Android DevTools proxy over adb.
#[derive(Parser)]
#[command(name = "devtools-proxy", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Discover debuggable targets on the device and print them as JSON.
    Targets {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

impl Cli {
    /// Config path and whether to serve (`true`) or list targets once.
    fn mode(self) -> (Option<String>, bool) {
        match self.command {
            Some(Commands::Serve { config }) => (config, true),
            Some(Commands::Targets { config }) => (config, false),
            None => (None, true),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config_path, serve) = cli.mode();

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let result = if serve {
        run_server(config).await
    } else {
        print_targets(config).await
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn device_host(config: &Config, info: ServerInfo) -> Arc<DeviceHost> {
    let bridge = Arc::new(AdbBridge::new(&config.adb));
    DeviceHost::new(bridge, info, WsRoutes::new())
}

async fn print_targets(config: Config) -> Result<(), String> {
    let bound: SocketAddr = config
        .server
        .listen
        .parse()
        .map_err(|e| format!("Invalid listen address {}: {e}", config.server.listen))?;
    let host = device_host(&config, ServerInfo::from_bound(&config.server, bound));
    let engine = ProxyEngine::new(EngineSettings::from_config(&config));
    engine.bind(&host);

    let targets = engine.list_targets().await.map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&targets).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

async fn run_server(config: Config) -> Result<(), String> {
    info!("devtools-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    match config.adb.serial.as_deref() {
        Some(serial) => info!("Device serial: {serial}"),
        None => info!("Device serial: <adb default>"),
    }

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .map_err(|e| format!("Failed to bind {}: {e}", config.server.listen))?;
    let bound = listener
        .local_addr()
        .map_err(|e| format!("Failed to read bound address: {e}"))?;
    info!("Listening on {bound}");

    let server_info = ServerInfo::from_bound(&config.server, bound);
    info!(
        "Advertising {}://{}{}",
        server_info.http_scheme(),
        server_info.authority(),
        server_info.base_path
    );
    if config.auth.api_key.is_none() {
        info!("No API key configured, command endpoints are open");
    }

    let host = device_host(&config, server_info);
    let engine = ProxyEngine::new(EngineSettings::from_config(&config));
    engine.bind(&host);
    info!(instance = %engine.id(), "Proxy engine ready");

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        engine: engine.clone(),
        host: host.clone(),
    };
    let app = routes::router(state);

    info!("Server ready");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Also reached when serving failed.
    info!("Shutting down...");
    engine.unbind().await;
    drop(host);
    info!("Goodbye");

    served.map_err(|e| format!("Server error: {e}"))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
