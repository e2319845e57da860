use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::clock::SystemClock;
use turnstile::config::{LoggingConfig, StorageBackend, TurnstileConfig};
use turnstile::ratelimit::{RateLimitEngine, Rule};
use turnstile::store;

/// Administer fixed-window rate limit counters.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count one request and print the admission decision
    Acquire {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        resource: String,
        /// Use this permit limit instead of the configured rules
        #[arg(long, requires = "window_secs")]
        limit: Option<u64>,
        /// Window length for --limit, in seconds
        #[arg(long, requires = "limit")]
        window_secs: Option<u64>,
    },
    /// Print the current state without counting a request
    Inspect {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        resource: String,
    },
    /// Clear the counter for one identity and resource
    Reset {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        resource: String,
    },
    /// Clear every counter for an identity
    ResetClient {
        #[arg(long)]
        identity: String,
    },
    /// Clear every counter for a resource
    ResetResource {
        #[arg(long)]
        resource: String,
    },
    /// Validate the configuration and print the effective result
    CheckConfig,
    /// Check that the counter store is reachable
    Health,
}

#[derive(Debug, Serialize)]
struct ResetOutput {
    removed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Turnstile {}", env!("CARGO_PKG_VERSION"));

    if let Command::CheckConfig = cli.command {
        print_json(&config)?;
        return Ok(());
    }

    if config.storage.backend == StorageBackend::Local {
        warn!("Local counter store selected; counters do not outlive this process");
    }

    let clock = Arc::new(SystemClock);
    let store = store::from_config(&config.storage, clock.clone()).await?;
    let engine = RateLimitEngine::with_clock(
        store,
        config.key_builder(),
        config.rate_limiting.engine_config(),
        clock,
    )?;

    match cli.command {
        Command::Acquire {
            identity,
            resource,
            limit: Some(limit),
            window_secs: Some(window_secs),
        } => {
            let rule = Rule::new(limit, Duration::from_secs(window_secs));
            print_json(&engine.acquire_with_rule(&identity, &resource, &rule).await?)?;
        }
        Command::Acquire { identity, resource, .. } => {
            print_json(&engine.acquire(&identity, &resource).await?)?;
        }
        Command::Inspect { identity, resource } => {
            print_json(&engine.inspect(&identity, &resource).await?)?;
        }
        Command::Reset { identity, resource } => {
            let removed = u64::from(engine.reset(&identity, &resource).await?);
            print_json(&ResetOutput { removed })?;
        }
        Command::ResetClient { identity } => {
            let removed = engine.reset_client(&identity).await?;
            print_json(&ResetOutput { removed })?;
        }
        Command::ResetResource { resource } => {
            let removed = engine.reset_resource(&resource).await?;
            print_json(&ResetOutput { removed })?;
        }
        Command::Health => {
            engine.store().health_check().await?;
            info!(backend = engine.store().name(), "Counter store is healthy");
        }
        Command::CheckConfig => {}
    }

    let stats = engine.stats();
    if stats.storage_failure_admits > 0 {
        warn!(
            storage_failure_admits = stats.storage_failure_admits,
            "Decisions were made without the counter store"
        );
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
