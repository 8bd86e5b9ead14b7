//! Tunlink client
//!
//! Runs the configured client modes over one shared tunnel until a signal
//! arrives or a mode fails.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use tunlink_client::lifecycle::{ClientError, TunnelController};
use tunlink_client::modes::BuiltinModes;
use tunlink_client::shutdown::ShutdownReason;
use tunlink_client::tunnel::DirectTransport;
use tunlink_client::update::{DEFAULT_UPDATE_URL, UpdateChecker};

#[derive(Parser, Debug)]
#[command(name = "tunlink")]
#[command(version, about = "Tunlink client - local proxies over one shared tunnel")]
struct Args {
    /// Path to the JSON client config
    #[arg(short, long, env = "TUNLINK_CONFIG")]
    config: PathBuf,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "TUNLINK_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TUNLINK_LOG_JSON")]
    log_json: bool,

    /// Skip the update check after the first connection.
    #[arg(long)]
    disable_update_check: bool,

    /// Base URL of the update API.
    #[arg(long, default_value = DEFAULT_UPDATE_URL, env = "TUNLINK_UPDATE_URL")]
    update_url: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_filter = tunlink_core::tracing_init::default_filter(&args.log_level);
    tunlink_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "Starting tunlink"
    );

    let mut config = match tunlink_core::config::load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load client configuration");
            return ExitCode::FAILURE;
        }
    };
    if args.disable_update_check {
        config.disable_update_check = true;
    }

    let mut controller = TunnelController::new(Arc::new(DirectTransport), Arc::new(BuiltinModes));
    match UpdateChecker::new(args.update_url) {
        Ok(checker) => controller = controller.with_post_connect(Arc::new(checker)),
        Err(e) => warn!(error = %e, "Update check unavailable"),
    }

    // Failures were already logged where they happened.
    if run_succeeded(&controller.run(config).await) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_succeeded(result: &Result<ShutdownReason, ClientError>) -> bool {
    match result {
        Ok(reason) if reason.is_graceful() => {
            info!(reason = %reason, "Tunlink stopped");
            true
        }
        Ok(_) | Err(_) => false,
    }
}
