//! LDAP two-factor authentication proxy.
use std::{process::ExitCode, str::FromStr};

use anyhow::Context;
use clap::Parser;
use ldap_tfa_proxy::{cli::Args, run, Config};
use tracing::level_filters::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
	match read_the_config_and_run().await {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			tracing::error!("{}", err);
			ExitCode::FAILURE
		}
	}
}

/// Parse the CLI, load and validate configuration, install tracing,
/// and hand off to the proxy's accept loop.
async fn read_the_config_and_run() -> anyhow::Result<()> {
	let args = Args::parse();
	let config = Config::from_file(&args.config)?;

	let subscriber = tracing_subscriber::FmtSubscriber::builder()
		.with_max_level(
			config.log_level.as_ref().map_or(Ok(LevelFilter::INFO), |s| LevelFilter::from_str(s))?,
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)
		.context("setting default tracing subscriber failed")?;

	run(config).await
}
