use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Log level used when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(short, long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the benchmark against the selected container engine components.
    ///
    /// The benchmark file determines which lifecycle commands to run against which engines,
    /// with how many iterations and concurrent threads. Results are displayed afterwards.
    Run {
        /// Benchmark definition (YAML, or TOML when the file ends in .toml)
        #[arg(short, long = "benchmark")]
        benchmark: PathBuf,

        /// Ask runtimes which support it to write a trace per container
        #[arg(long)]
        trace: bool,

        /// Skip the driverless process spawn baseline
        #[arg(long)]
        skip_limit: bool,

        /// Sample daemon memory and CPU while each benchmark runs
        #[arg(long)]
        overhead: bool,
    },

    /// Print version information
    Version,
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() -> anyhow::Result<()> {
        let args = Args::try_parse_from([
            "ctrbench",
            "run",
            "-b",
            "bench.yaml",
            "--skip-limit",
            "--overhead",
        ])?;
        match args.command {
            Commands::Run {
                benchmark,
                trace,
                skip_limit,
                overhead,
            } => {
                assert_eq!(benchmark, PathBuf::from("bench.yaml"));
                assert!(!trace);
                assert!(skip_limit);
                assert!(overhead);
            }
            Commands::Version => panic!("expected run"),
        }
        assert_eq!(args.log_level, "warn");
        Ok(())
    }

    #[test]
    fn run_requires_a_benchmark() {
        assert!(Args::try_parse_from(["ctrbench", "run"]).is_err());
    }
}
