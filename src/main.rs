//! # Probe Agent Core
//!
//! This is the entry point of the probe agent core: the long-running
//! process that registers with an upstream control plane, consumes ad-hoc
//! and scheduled check requests over two independent streaming RPCs, and
//! dispatches each one to the appropriate prober.
//!
//! ## What this file does
//!
//! 1. Parses CLI arguments with `clap`
//! 2. Loads `Config` from the environment
//! 3. Initializes telemetry (OpenTelemetry)
//! 4. Spawns the two control loops (ad-hoc, changes) as independent tasks
//! 5. Awaits both, shutting telemetry down on exit or Ctrl-C
//!
//! ## Example
//!
//! ```bash
//! probe-agent-core serve
//! probe-agent-core serve --otel --otel-endpoint http://collector:4317
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           main.rs                                │
//! │  (CLI, config, telemetry, task spawn/await)                     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!          ┌──────────────────────┼──────────────────────┐
//!          ▼                      ▼                      ▼
//!    ┌──────────┐          ┌──────────┐           ┌──────────┐
//!    │ control/ │          │ prober/  │           │ runner/  │
//!    │ (G, H)   │          │ (F)      │           │ (C, D)   │
//!    └──────────┘          └──────────┘           └──────────┘
//! ```

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Error taxonomy and classification rules (§4.A, §7).
mod errors;

/// Output-size caps and per-tenant limit validation (§6, §1 Non-goal).
mod limits;

/// OpenTelemetry tracing/logging setup.
mod telemetry;

/// Core data model: Check, AdHocRequest, Script, SecretStore, RunResponse.
mod model;

/// Sample fan-out over a run's metrics/logs output.
mod extractor;

/// Script runners: HTTP-delegated and local-subprocess.
mod runner;

/// Orchestrates one runner invocation and decides success.
mod processor;

/// Prober trait, network stand-ins, and per-request dispatch.
mod prober;

/// Generated gRPC types for the control-plane service.
mod pb;

/// Control-stream loop (ad-hoc) and changes loop, with reconnect backoff.
mod control;

/// Env-driven process configuration.
mod config;

// ============================================================================
// IMPORTS
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use config::Config;
use control::adhoc::ProbeIdentity;
use control::backoff::ExponentialBackoff;
use control::changes::CheckTable;
use model::SecretStore;
use prober::factory::{Dispatcher, ProberFactory};
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "probe-agent-core")]
#[command(about = "Synthetic-monitoring probe agent core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the agent: registers with the control plane and serves both
    /// control loops until interrupted.
    Serve {
        /// Comma-separated feature flags, appended to whatever
        /// `PROBE_AGENT_FEATURE_FLAGS` already sets.
        #[arg(long)]
        feature_flags: Option<String>,

        /// Enables OTLP trace export.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// OTLP collector endpoint; falls back to
        /// `OTEL_EXPORTER_OTLP_ENDPOINT` or `http://localhost:4317`.
        #[arg(long)]
        otel_endpoint: Option<String>,

        /// Suppresses informational logs; only warnings/errors.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Enables debug-level logs.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve {
            feature_flags,
            otel,
            otel_endpoint,
            silent,
            verbose,
        } => {
            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_level = if *silent {
                Level::ERROR
            } else if *verbose {
                Level::DEBUG
            } else {
                Level::INFO
            };

            if *otel {
                if let Some(endpoint) = otel_endpoint {
                    telemetry_config.otlp_endpoint = Some(endpoint.clone());
                } else if telemetry_config.otlp_endpoint.is_none() {
                    telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
                }
            }

            if let Err(e) = init_telemetry(telemetry_config) {
                if !*silent {
                    eprintln!("Warning: failed to initialize telemetry: {e}");
                }
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                    .try_init();
            }

            let mut config = Config::from_env();
            if let Some(extra) = feature_flags {
                config
                    .feature_flags
                    .extend(extra.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string));
            }

            serve(config).await;

            shutdown_telemetry();
        }
    }
}

/// Wires config into the two control loops (§4.G ad-hoc, §4.H changes) as
/// independent long-lived tasks, and awaits both, interruptible by Ctrl-C
/// (§5 "Cancellation: a single parent context threads through the control
/// loop").
async fn serve(config: Config) {
    info!(endpoint = %config.control_plane_endpoint, "probe agent starting");

    let http_client = reqwest::Client::new();
    let script_runner: Arc<dyn runner::Runner> = match &config.http_runner_url {
        Some(url) => Arc::new(runner::http::HttpRunner::new(
            http_client.clone(),
            url.clone(),
            config.base_backoff,
            config.grace_time,
        )),
        None => Arc::new(runner::local::LocalRunner::new(
            config.local_runner_binary_path.clone(),
            config.output_caps,
        )),
    };

    let factory = Arc::new(ProberFactory::new(script_runner, config.grace_time));
    let (payload_tx, mut payload_rx) = tokio::sync::mpsc::channel(256);
    let (tenant_tx, mut tenant_rx) = tokio::sync::mpsc::channel(64);

    let cancel = CancellationToken::new();

    tokio::spawn(async move {
        while let Some(payload) = payload_rx.recv().await {
            tracing::debug!(log = %payload.log_line, "publishing run payload");
        }
    });
    tokio::spawn(async move {
        while let Some(tenant) = tenant_rx.recv().await {
            tracing::debug!(tenant_id = tenant.id.local_id, "tenant refresh received");
        }
    });

    let identity = ProbeIdentity {
        version: config.build_version.clone(),
        commit: config.build_commit.clone(),
        buildstamp: config.build_timestamp.clone(),
        supports_protocol_secrets: config.supports_protocol_secrets(),
    };
    let identity2 = ProbeIdentity {
        version: config.build_version.clone(),
        commit: config.build_commit.clone(),
        buildstamp: config.build_timestamp.clone(),
        supports_protocol_secrets: config.supports_protocol_secrets(),
    };

    let adhoc_dispatcher = Dispatcher::new(
        Arc::clone(&factory),
        SecretStore::default(),
        payload_tx.clone(),
        tenant_tx.clone(),
    );
    let changes_dispatcher = Dispatcher::new(Arc::clone(&factory), SecretStore::default(), payload_tx, tenant_tx);

    let adhoc_backoff = ExponentialBackoff::new(
        config.reconnect_backoff_initial,
        config.reconnect_backoff_max,
        config.reconnect_backoff_factor,
    );
    let changes_backoff = ExponentialBackoff::new(
        config.reconnect_backoff_initial,
        config.reconnect_backoff_max,
        config.reconnect_backoff_factor,
    );

    let endpoint = config.control_plane_endpoint.clone();
    let endpoint2 = endpoint.clone();
    let cancel_adhoc = cancel.clone();
    let cancel_changes = cancel.clone();

    let adhoc_task = tokio::spawn(control::adhoc::run(endpoint, identity, adhoc_dispatcher, adhoc_backoff, cancel_adhoc));
    let changes_task = tokio::spawn(control::changes::run(
        endpoint2,
        identity2,
        changes_dispatcher,
        Arc::new(CheckTable::default()),
        changes_backoff,
        cancel_changes,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            cancel.cancel();
        }
        _ = adhoc_task => {
            info!("ad-hoc control loop exited");
        }
        _ = changes_task => {
            info!("changes control loop exited");
        }
    }

    // Give in-flight dispatches a moment to publish before exit.
    tokio::time::sleep(Duration::from_millis(50)).await;
}
