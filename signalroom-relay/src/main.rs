//! `signalroom` relay server: WebRTC signaling over WebSocket.
//!
//! An axum WebSocket server that lets clients join named rooms and forwards
//! offers, answers and ICE candidates between room members. The relay never
//! interprets the negotiation payloads.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:3001
//! cargo run --bin signalroom-relay
//!
//! # Run on a custom port
//! cargo run --bin signalroom-relay -- --port 8080
//!
//! # Or via environment variable
//! SIGNALROOM_BIND=127.0.0.1:8080 cargo run --bin signalroom-relay
//! ```

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use signalroom_relay::config::{RelayCliArgs, RelayConfig};
use signalroom_relay::relay::{self, RelayState};
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Held until exit so buffered file logs are flushed.
    let _guard = init_logging(&config.log_level, config.log_file.as_deref());

    tracing::info!(addr = %config.bind_addr, "starting signalroom relay");

    let state = Arc::new(RelayState::with_config(config.max_message_size));
    let shutdown = relay::shutdown_signal(Arc::clone(&state));
    let addr = config.bind_addr.to_string();

    match relay::start_server_with_shutdown(&addr, state, shutdown).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, url = %format!("ws://{bound_addr}"), "relay listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
            tracing::info!("relay stopped");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}

/// Initialize tracing with the resolved log level.
///
/// `RUST_LOG` takes precedence over `level`. Logs go to stderr unless a file
/// is configured, in which case a [`WorkerGuard`] is returned that must be
/// held until shutdown.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some((log_dir, file_name)) = file_path.and_then(|p| Some((p.parent()?, p.file_name()?)))
    else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
