use std::path::PathBuf;

use clap::Parser;

use research_jobs::config::loader::load_with_env;
use research_jobs::lifecycle::startup::{self, Services};
use research_jobs::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "research-jobs", version, about = "Resilient job processing for research workloads")]
struct Args {
    /// Path to the TOML configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = load_with_env(args.config.as_deref())?;

    if args.check {
        println!("Configuration OK");
        return Ok(());
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "research-jobs starting");

    tracing::info!(
        backend = config.queue.backend.as_str(),
        default_concurrency = config.queue.default_concurrency,
        providers = config.rate_limits.providers.len(),
        admin_enabled = config.admin.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr = startup::parse_addr(&config.observability.metrics_address)?;
        metrics::init_metrics(addr);
    }

    let services = Services::build(config).await?;
    startup::run(services, args.config).await?;

    Ok(())
}
