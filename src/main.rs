use anyhow::Context;
use colored::Colorize;
use ctrbench::{
    clap_args::{self, Commands},
    config::Benchmark,
    report,
    runner::{self, RunOptions},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = clap_args::parse();
    init_tracing(&args.log_level);

    match args.command {
        Commands::Version => {
            println!(
                "{} {}",
                env!("CARGO_PKG_NAME").green(),
                env!("CARGO_PKG_VERSION")
            );
        }

        Commands::Run {
            benchmark,
            trace,
            skip_limit,
            overhead,
        } => {
            let benchmark = Benchmark::try_from_path(&benchmark)?;

            // cancel in-flight engine calls on ctrl-c, the final clean still runs
            let token = CancellationToken::new();
            let ctrlc_token = token.clone();
            ctrlc::set_handler(move || {
                warn!("Interrupted, cancelling benchmark");
                ctrlc_token.cancel();
            })
            .context("Unable to install Ctrl-C handler")?;

            let opts = RunOptions {
                trace,
                skip_limit,
                overhead,
            };
            let results = runner::run_sweep(&benchmark, opts, &token).await?;

            report::print_report(&results, overhead);
            info!("Benchmark runs complete");
        }
    }

    Ok(())
}
