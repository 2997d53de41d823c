//! decent-bridge daemon entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use decent_bridge::api;
use decent_bridge::bridge::BridgeHandle;
use decent_bridge::discovery;
use decent_bridge::settings::Settings;
use decent_bridge::transport::BleScanner;

/// BLE-to-HTTP bridge for DE1 espresso machines.
#[derive(Parser, Debug)]
#[command(name = "decent-bridge", version, about)]
struct Args {
    /// HTTP server port (default: 8080)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// WebSocket server port (default: 8081)
    #[arg(short = 'w', long = "ws-port")]
    ws_port: Option<u16>,

    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "decent_bridge=debug,info"
    } else {
        "decent_bridge=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut settings = match &args.config {
        Some(path) => match Settings::load_from_file(path) {
            Ok(settings) => settings,
            Err(error) => {
                warn!(%error, path = %path.display(), "config not loaded, using defaults");
                Settings::default()
            }
        },
        None => Settings::default(),
    };
    if let Some(port) = args.port {
        settings.http_port = port;
    }
    if let Some(port) = args.ws_port {
        settings.web_socket_port = port;
    }

    // Every listener binds before anything starts talking to hardware so a
    // port clash fails fast with exit code 1.
    let http_listener =
        match tokio::net::TcpListener::bind(("0.0.0.0", settings.http_port)).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(port = settings.http_port, %source, "failed to bind HTTP port");
                return ExitCode::FAILURE;
            }
        };
    let ws_listener =
        match tokio::net::TcpListener::bind(("0.0.0.0", settings.web_socket_port)).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(port = settings.web_socket_port, %source, "failed to bind WebSocket port");
                return ExitCode::FAILURE;
            }
        };
    let discovery_socket = match discovery::bind_discovery_socket(discovery::DISCOVERY_PORT) {
        Ok(socket) => socket,
        Err(source) => {
            error!(%source, "failed to bind discovery port");
            return ExitCode::FAILURE;
        }
    };

    let scanner = match BleScanner::new().await {
        Ok(scanner) => Some(scanner),
        Err(error) => {
            warn!(%error, "Bluetooth unavailable; serving API without devices");
            None
        }
    };

    let bridge = BridgeHandle::new(settings.clone(), args.config.clone(), scanner);
    if let Err(error) = bridge.start().await {
        error!(%error, "failed to start bridge");
        return ExitCode::FAILURE;
    }

    let _mdns = discovery::advertise_mdns(
        &settings.bridge_name,
        settings.http_port,
        settings.web_socket_port,
        decent_bridge::VERSION,
    );
    tokio::spawn(discovery::run_udp_responder(
        discovery_socket,
        bridge.clone(),
        decent_bridge::VERSION.to_string(),
    ));

    info!(version = decent_bridge::VERSION, "decent-bridge started");
    info!(port = settings.http_port, "HTTP server listening");
    info!(port = settings.web_socket_port, "WebSocket server listening");
    info!("scanning for DE1, scales, and sensors");

    let http_router = api::http::router(bridge.clone());
    let ws_router = api::ws::router(bridge.clone());
    let mut http_task =
        tokio::spawn(async move { axum::serve(http_listener, http_router).await });
    let mut ws_task = tokio::spawn(async move { axum::serve(ws_listener, ws_router).await });

    tokio::select! {
        result = &mut http_task => {
            error!(?result, "HTTP server exited");
            bridge.shutdown().await;
            ExitCode::FAILURE
        }
        result = &mut ws_task => {
            error!(?result, "WebSocket server exited");
            bridge.shutdown().await;
            ExitCode::FAILURE
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            bridge.shutdown().await;
            http_task.abort();
            ws_task.abort();
            ExitCode::SUCCESS
        }
    }
}
