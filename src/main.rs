use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbpool::cli::commands::{self, SimulateOptions};
use dbpool::config;

#[derive(Parser)]
#[command(name = "dbpool")]
#[command(version, about = "Resilient database access layer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (falls back to DBPOOL_* environment variables)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and check a configuration
    Validate,

    /// Run a synthetic workload against in-memory stores
    Simulate {
        /// Total requests to issue
        #[arg(long, default_value = "1000")]
        requests: usize,

        /// Concurrent workers
        #[arg(long, default_value = "16")]
        concurrency: usize,

        /// Distinct caller identities, for rate limiting
        #[arg(long, default_value = "8")]
        identities: usize,

        /// Take the primary down after this many requests
        #[arg(long)]
        fail_primary_after: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // validate is a single pass over the config; simulate needs real
    // parallelism for its workers.
    let runtime = match cli.command {
        Commands::Simulate { .. } => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?,
        Commands::Validate => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate => {
            commands::cmd_validate(&config)?;
        }
        Commands::Simulate {
            requests,
            concurrency,
            identities,
            fail_primary_after,
        } => {
            let options = SimulateOptions {
                requests,
                concurrency,
                identities,
                fail_primary_after,
            };
            commands::cmd_simulate(config, options).await?;
        }
    }

    Ok(())
}
