pub mod bench;
pub mod clap_args;
pub mod config;
pub mod driver;
pub mod exec;
pub mod metrics_logger;
pub mod report;
pub mod runner;
pub mod sampler;
pub mod stats;
