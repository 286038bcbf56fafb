//! Bracket Engine Binary
//!
//! Runs the engine against the in-process paper gateway and reads trade
//! intents as newline-delimited JSON from stdin. Acknowledgements and
//! outcomes are written to stdout, one JSON object per line.
//!
//! # Usage
//!
//! ```bash
//! echo '{"ticker":"AAPL","action":"BUY","entry_price":"100","stop_loss":"98","account_balance":"10000"}' \
//!     | cargo run --bin bracket-engine
//! ```
//!
//! # Environment Variables
//!
//! - `BRACKET_ENGINE_CONFIG`: config file path (default: config.yaml)
//! - `RUST_LOG`: log filter, overrides `observability.log_level`

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bracket_engine::broker::SessionState;
use bracket_engine::config::{Config, config_path_from_env, load_config, load_config_from_string};
use bracket_engine::domain::TradeIntent;
use bracket_engine::execution::IntentOutcome;
use bracket_engine::observability::{init_metrics, init_tracing};
use bracket_engine::paper::PaperGateway;
use bracket_engine::persistence::InMemoryStore;
use bracket_engine::Engine;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    let (config, source) = read_config()?;
    init_tracing(&config.observability).context("failed to initialize logging")?;
    tracing::info!(config = %source, "Starting bracket engine");

    if let Some(addr) = &config.observability.metrics_addr {
        init_metrics(addr).context("failed to start metrics exporter")?;
    }

    let timeout = config.shutdown.timeout();
    let engine = Arc::new(Engine::new(
        config,
        Arc::new(PaperGateway::new()),
        Arc::new(InMemoryStore::new()),
    ));
    engine.start().await.context("engine failed to start")?;

    let printer = tokio::spawn(print_outcomes(engine.outcomes()));
    let reader = tokio::spawn(read_intents(Arc::clone(&engine)));
    let mut state = engine.session_state();

    tokio::select! {
        () = shutdown_signal() => {}
        () = wait_exhausted(&mut state) => {
            tracing::error!("Broker connection exhausted, shutting down");
        }
    }

    reader.abort();
    tracing::info!(timeout_secs = timeout.as_secs(), "Graceful shutdown started");
    if tokio::time::timeout(timeout, engine.shutdown()).await.is_err() {
        tracing::error!("Shutdown timed out, forcing exit");
        std::process::exit(1);
    }
    printer.abort();
    tracing::info!("Bracket engine stopped");
    Ok(())
}

/// Load .env from the current directory or the nearest ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Config from file, or defaults when the file is absent.
fn read_config() -> Result<(Config, String)> {
    let path = config_path_from_env();
    if Path::new(&path).exists() {
        let config = load_config(Some(&path)).with_context(|| format!("loading {path}"))?;
        return Ok((config, path));
    }
    let config = load_config_from_string("")?;
    Ok((config, "defaults".to_string()))
}

async fn read_intents(engine: Arc<Engine>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let intent: TradeIntent = match serde_json::from_str(&line) {
            Ok(intent) => intent,
            Err(err) => {
                tracing::warn!(error = %err, "Malformed intent line");
                continue;
            }
        };
        let ack = engine.submit(intent).await;
        emit(&ack);
    }
    tracing::info!("Intent input closed");
}

async fn print_outcomes(mut outcomes: broadcast::Receiver<IntentOutcome>) {
    loop {
        match outcomes.recv().await {
            Ok(outcome) => emit(&outcome),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Outcome printer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[allow(clippy::print_stdout)]
fn emit<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{json}"),
        Err(err) => tracing::warn!(error = %err, "Failed to serialize output"),
    }
}

async fn wait_exhausted(state: &mut tokio::sync::watch::Receiver<SessionState>) {
    if state.wait_for(|s| *s == SessionState::Exhausted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
