//! VerifierClient (C7): posts `(user, realm, pass)` to the verifier's
//! `validate/check`-style HTTP endpoint and parses its JSON verdict.

use serde::Deserialize;

use crate::error::{VerifierOutcome, VerifierTransportError};

/// The JSON envelope the verifier answers with: `{"result": {"status": ..., "value": ...}}`.
#[derive(Debug, Deserialize)]
struct VerifyResponse {
	/// The inner result object.
	result: VerifyResult,
}

/// `status` reports whether the verifier itself functioned correctly;
/// `value` reports whether the credentials were accepted.
#[derive(Debug, Deserialize)]
struct VerifyResult {
	/// Whether the verifier could evaluate the request at all.
	status: bool,
	/// Whether the credentials were accepted, when `status` is true.
	#[serde(default)]
	value: bool,
}

/// HTTP(S) client talking to the verifier.
#[derive(Debug, Clone)]
pub struct VerifierClient {
	/// The underlying HTTP client, configured with the proxy's TLS policy.
	http: reqwest::Client,
	/// The full URL of the verifier's validate endpoint, e.g.
	/// `https://verifier.example.org/validate/check`.
	validate_url: String,
}

impl VerifierClient {
	/// Construct a client posting to `validate_url` using `http`.
	///
	/// `http` carries the TLS trust policy (system trust store, a
	/// pinned root, or — with a startup warning — no verification at
	/// all); building it is the caller's responsibility so that policy
	/// stays in one place (`main`/`config`).
	#[must_use]
	pub fn new(http: reqwest::Client, validate_url: impl Into<String>) -> Self {
		Self { http, validate_url: validate_url.into() }
	}

	/// Ask the verifier whether `password` is correct for `user` in `realm`.
	pub async fn verify(
		&self,
		user: &str,
		realm: &str,
		password: &str,
	) -> Result<VerifierOutcome, VerifierTransportError> {
		let response = self
			.http
			.post(&self.validate_url)
			.header("User-Agent", "ldap-tfa-proxy")
			.form(&[("user", user), ("realm", realm), ("pass", password)])
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(VerifierTransportError::HttpStatus(response.status()));
		}

		let text = response.text().await?;
		let body: VerifyResponse = serde_json::from_str(&text).map_err(VerifierTransportError::Decode)?;

		Ok(match (body.result.status, body.result.value) {
			(false, _) => VerifierOutcome::VerifierError,
			(true, true) => VerifierOutcome::Success,
			(true, false) => VerifierOutcome::WrongCredentials,
		})
	}
}
