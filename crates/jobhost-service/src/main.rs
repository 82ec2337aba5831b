//! # Jobhost Service
//!
//! Binary entry point for the demo job host.
//!
//! This executable:
//! - Loads configuration from files and environment
//! - Initializes logging
//! - Builds a singleton-gated queue listener over in-memory storage
//! - Runs until Ctrl-C or an unhandled background error, then stops
//!   gracefully

mod demo;
mod host;
mod settings;

use host::JobHost;
use jobhost_storage::InMemoryStorageAccount;
use settings::{load_settings, CONFIG_FILE_ENV, DEFAULT_CONFIG_FILE};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting jobhost service");

    // -------------------------------------------------------------------------
    // Load configuration
    //
    // Sources (later sources override earlier ones):
    //  1. ./config/jobhost.yaml          - deployment-local defaults
    //  2. Path given by JOBHOST_CONFIG_FILE
    //  3. Environment variables prefixed JOBHOST__ (double-underscore separator)
    //     e.g. JOBHOST__HOST__QUEUES__BATCH_SIZE=8
    // -------------------------------------------------------------------------
    let explicit_file = std::env::var(CONFIG_FILE_ENV)
        .ok()
        .filter(|path| !path.is_empty());

    let settings = match load_settings(DEFAULT_CONFIG_FILE, explicit_file.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Failed to load configuration; aborting");
            std::process::exit(3);
        }
    };

    if let Err(e) = settings.validate() {
        error!(error = %format!("{:#}", e), "Configuration is invalid; aborting");
        std::process::exit(3);
    }

    let shutdown = CancellationToken::new();
    let account = InMemoryStorageAccount::new(settings.host.storage_account.as_str());
    let host = JobHost::build(&settings, account, shutdown.clone()).await?;

    host.seed(&settings.demo.seed_messages).await?;
    host.start(&shutdown).await?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Unable to listen for Ctrl-C; shutting down");
            } else {
                info!("Ctrl-C received; shutting down");
            }
        }
        _ = shutdown.cancelled() => {
            warn!("Unhandled background error; shutting down");
        }
    }

    host.stop().await;
    info!(
        processed = host.function().processed().len(),
        "Processed messages this run"
    );

    let errors = host.errors();
    if !errors.is_empty() {
        error!(count = errors.len(), "Job host stopped after background errors");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "jobhost_service=info,jobhost_core=info,jobhost_storage=info".into()
    });

    let json = std::env::var("JOBHOST_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
