//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// An LDAP proxy that delegates bind authentication to an external
/// two-factor verifier.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
	/// Path to the YAML configuration file.
	#[arg(long)]
	pub config: PathBuf,
}
