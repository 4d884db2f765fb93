//! An LDAP proxy that stands in front of a real directory and
//! delegates bind authentication to an external two-factor verifier:
//! it resolves a `(user, realm)` pair from the bind DN, asks the
//! verifier whether the supplied password is correct, and only then
//! lets the bind through.
use anyhow::Result;

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod ldap;
pub mod listener;
pub mod mapping;
pub mod preamble;
pub mod state;
pub mod verifier;

pub use config::Config;
use listener::ProxyListener;

/// Bind the configured listener and serve client connections until the
/// process is terminated.
pub async fn run(config: Config) -> Result<()> {
	let listener = ProxyListener::bind(&config).await?;
	listener.serve().await
}
