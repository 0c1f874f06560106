//! Entry point for the driveboard network front door: loads the INI
//! config, opens the serial link, and serves HTTP/WebSocket/TCP
//! alongside it (spec.md §6). Exits non-zero on configuration error or
//! if the serial port cannot be opened at startup; otherwise runs until
//! a signal (spec.md §6 "Exit codes").

use clap::Parser;
use driveboard_backend::{AppState, BackendConfig};
use driveboard_engine::DriveboardHandle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(version, about = "Host-side driveboard protocol engine and network front door")]
struct Args {
    /// Path to the INI config file (`[driveboard]`/`[backend]` sections).
    #[arg(long, default_value = "driveboard.ini")]
    config: String,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let config = match BackendConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {e}", args.config);
            return std::process::ExitCode::FAILURE;
        }
    };

    // `[backend] debug` (spec.md §6) forces at least debug-level tracing,
    // mirroring the original's `Application(debug=...)` tornado flag;
    // `-v`/`-q` can still raise it further.
    let level = if config.debug {
        args.verbosity.tracing_level_filter().max(tracing::level_filters::LevelFilter::DEBUG)
    } else {
        args.verbosity.tracing_level_filter()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("driveboard={level}").parse().expect("valid directive")),
        )
        .init();

    let driveboard = match DriveboardHandle::connect(config.driveboard.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "could not open the driveboard serial port");
            return std::process::ExitCode::FAILURE;
        }
    };

    let state = AppState { driveboard: driveboard.clone(), config: config.clone(), job_lock: Arc::new(Mutex::new(())) };

    let bind_host = config.bind_host();
    let http_listener = match TcpListener::bind((bind_host, config.http_port)).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, port = config.http_port, "failed to bind http port");
            return std::process::ExitCode::FAILURE;
        }
    };
    let gcode_listener = match TcpListener::bind((bind_host, config.gcode_tcp_port)).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, port = config.gcode_tcp_port, "failed to bind gcode tcp port");
            return std::process::ExitCode::FAILURE;
        }
    };

    tracing::info!(
        bind_host,
        http_port = config.http_port,
        gcode_tcp_port = config.gcode_tcp_port,
        "driveboard-backend listening"
    );

    let http_router = driveboard_backend::http::router(state)
        .route("/ws/status", axum::routing::get(driveboard_backend::ws::upgrade))
        .layer(tower::ServiceBuilder::new().layer(tower_http::trace::TraceLayer::new_for_http()));

    tokio::select! {
        result = axum::serve(http_listener, http_router) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "http server exited");
            }
        }
        result = driveboard_backend::tcp::serve(gcode_listener, driveboard) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "gcode tcp server exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    std::process::ExitCode::SUCCESS
}
