//! Error taxonomy for the proxy's request-scoped failures.
//!
//! Startup-time plumbing (config loading, socket binding) uses
//! [`anyhow`] the way the rest of the crate does; everything that has
//! to be mapped onto an LDAP result code at the end of a bind gets its
//! own small `thiserror` type instead, so [`crate::state::ConnectionState`]
//! can match on it.

use thiserror::Error;

/// Failure to resolve a verifier username from a bind DN.
#[derive(Debug, Error)]
pub enum UserMappingError {
	/// The configured pattern did not match the DN.
	#[error("dn `{0}` did not match the configured user-mapping pattern")]
	PatternMismatch(String),
	/// The lookup bind/search against the backend failed.
	#[error("lookup for dn `{0}` failed: {1}")]
	LookupFailed(String, #[source] anyhow::Error),
	/// The lookup search did not return exactly one entry.
	#[error("lookup for dn `{dn}` returned {found} entries, expected exactly 1")]
	NotExactlyOneEntry {
		/// The DN that was searched for.
		dn: String,
		/// How many entries were actually found.
		found: usize,
	},
	/// The configured attribute was missing or had no values.
	#[error("dn `{dn}` has no value for attribute `{attribute}`")]
	MissingAttribute {
		/// The DN that was searched for.
		dn: String,
		/// The attribute that was expected.
		attribute: String,
	},
}

/// Failure to resolve an (app-marker, realm) pair from a bind DN.
#[derive(Debug, Error)]
pub enum RealmMappingError {
	/// No app marker has been recorded for this DN in the app cache.
	#[error("no preamble recorded for dn `{0}`")]
	NoPreamble(String),
	/// The app marker has no configured realm mapping.
	#[error("no realm mapping configured for marker `{0}`")]
	UnmappedMarker(String),
}

/// The verdict returned by the verifier for a single authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierOutcome {
	/// The password was correct.
	Success,
	/// The verifier understood the request but the password was wrong.
	WrongCredentials,
	/// The verifier itself reported an internal failure (`status: false`).
	VerifierError,
}

/// Failure talking to the verifier over HTTP, as opposed to the verifier
/// rejecting the credentials it was asked to check.
#[derive(Debug, Error)]
pub enum VerifierTransportError {
	/// The HTTP request did not complete (DNS, TCP, TLS, timeout, ...).
	#[error("verifier request failed: {0}")]
	Request(#[from] reqwest::Error),
	/// The verifier replied with a non-200 status code.
	#[error("verifier returned HTTP {0}")]
	HttpStatus(reqwest::StatusCode),
	/// The response body was not the expected JSON shape.
	#[error("could not decode verifier response: {0}")]
	Decode(#[from] serde_json::Error),
}

/// Failure talking to the upstream (real) LDAP backend.
#[derive(Debug, Error)]
pub enum UpstreamError {
	/// Opening the upstream connection failed.
	#[error("could not connect to ldap backend: {0}")]
	Connect(#[source] anyhow::Error),
	/// A bind against the upstream backend failed.
	#[error("upstream bind failed: {0}")]
	Bind(#[source] anyhow::Error),
	/// A search against the upstream backend failed.
	#[error("upstream search failed: {0}")]
	Search(#[source] anyhow::Error),
	/// Forwarding an unbind to the upstream backend failed.
	#[error("upstream unbind failed: {0}")]
	Unbind(#[source] anyhow::Error),
}

/// A fatal configuration problem, reported to the operator at startup.
#[derive(Debug, Error)]
#[error("{section}.{key}: {reason}")]
pub struct ConfigError {
	/// The config section the problem was found in.
	pub section: String,
	/// The config key the problem was found in.
	pub key: String,
	/// A human-readable description of the problem.
	pub reason: String,
}

impl ConfigError {
	/// Construct a new configuration error.
	pub fn new(section: impl Into<String>, key: impl Into<String>, reason: impl Into<String>) -> Self {
		Self { section: section.into(), key: key.into(), reason: reason.into() }
	}
}
