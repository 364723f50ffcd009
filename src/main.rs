use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::app::Tollgate;
use tollgate::clock::SystemClock;
use tollgate::config::AppConfig;

/// Admission control from the command line.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission checks and print each decision as a JSON line
    Check {
        /// Configuration file (YAML)
        #[arg(short, long)]
        config: String,

        #[arg(long)]
        principal: String,

        #[arg(long)]
        endpoint: String,

        #[arg(long, default_value = "free")]
        tier: String,

        #[arg(long, default_value = "default")]
        region: String,

        /// Cost multiplier of each request
        #[arg(long, default_value_t = 1)]
        cost: u64,

        /// Number of consecutive checks
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },

    /// Validate a configuration file as written, without environment overrides
    Validate {
        /// Configuration file (YAML)
        #[arg(short, long)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Check {
            config,
            principal,
            endpoint,
            tier,
            region,
            cost,
            repeat,
        } => {
            let config = AppConfig::load(&config)?;
            let tollgate = Tollgate::build(&config, Arc::new(SystemClock)).await;
            let engine = tollgate.engine().clone();

            for _ in 0..repeat {
                let decision = engine
                    .check_rate_limit(&principal, &endpoint, &tier, &region, cost)
                    .await;
                println!("{}", serde_json::to_string(&decision)?);
            }

            let stats = engine.stats(Some(&endpoint), None, None);
            println!("{}", serde_json::to_string(&stats)?);
            tollgate.shutdown();
        }
        Command::Validate { config } => {
            let config = AppConfig::from_file(&config)?;
            println!(
                "ok: {} endpoints, {} tiers, {} regions",
                config.quotas.endpoints.len(),
                config.quotas.tiers.len(),
                config.quotas.regions.len()
            );
        }
    }

    Ok(())
}

/// Initialize tracing; `RUST_LOG` overrides the default `info` level.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
