//! The upstream (real) LDAP backend the proxy forwards requests to.
//!
//! [`UpstreamLdap`] is a trait rather than a concrete `ldap3` handle so
//! [`crate::state::ConnectionState`] can be driven in tests against a
//! scripted fake, the same way [`crate::verifier::VerifierClient`] is.

use std::collections::HashMap;

use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry as Ldap3SearchEntry};

use crate::{error::UpstreamError, ldap::proto::SearchScope};

/// One entry returned by an upstream search, with enough detail for
/// the preamble detector (§4.4) to inspect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
	/// The entry's distinguished name.
	pub dn: String,
	/// Its attributes, as returned by the backend.
	pub attributes: HashMap<String, Vec<String>>,
}

/// A single bind/search/unbind-capable channel to the backend LDAP
/// directory. A connection's identity can change over its lifetime
/// (anonymous, passthrough user, service account) via repeated calls
/// to [`UpstreamLdap::bind`] on the same channel.
#[async_trait]
pub trait UpstreamLdap: Send + Sync + std::fmt::Debug {
	/// (Re)bind the channel as `dn`/`password`. Rebinding replaces the
	/// channel's current identity; it does not open a new connection.
	async fn bind(&mut self, dn: &str, password: &str) -> Result<(), UpstreamError>;

	/// Perform a search under the channel's current bound identity.
	async fn search(
		&mut self,
		base_dn: &str,
		scope: SearchScope,
		filter: &str,
		attributes: &[String],
	) -> Result<Vec<SearchEntry>, UpstreamError>;

	/// Close the channel.
	async fn unbind(&mut self) -> Result<(), UpstreamError>;
}

/// A real channel to the backend, implemented on top of the `ldap3` crate.
#[derive(Debug)]
pub struct RealUpstreamLdap {
	/// The backend's LDAP URL, e.g. `ldap://directory.example.org:389`.
	url: String,
	/// The lazily-established connection handle.
	handle: Option<ldap3::Ldap>,
}

impl RealUpstreamLdap {
	/// Construct a channel that will connect to `url` on first use.
	#[must_use]
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into(), handle: None }
	}

	/// Return the connection handle, opening it first if necessary.
	async fn handle(&mut self) -> Result<&mut ldap3::Ldap, UpstreamError> {
		if self.handle.is_none() {
			let (conn, ldap) = LdapConnAsync::with_settings(LdapConnSettings::new(), &self.url)
				.await
				.map_err(|err| UpstreamError::Connect(err.into()))?;
			tokio::spawn(async move {
				if let Err(err) = conn.drive().await {
					tracing::warn!(%err, "upstream ldap connection driver exited");
				}
			});
			self.handle = Some(ldap);
		}
		Ok(self.handle.as_mut().expect("just populated"))
	}
}

#[async_trait]
impl UpstreamLdap for RealUpstreamLdap {
	async fn bind(&mut self, dn: &str, password: &str) -> Result<(), UpstreamError> {
		let ldap = self.handle().await?;
		ldap.simple_bind(dn, password)
			.await
			.map_err(|err| UpstreamError::Bind(err.into()))?
			.success()
			.map_err(|err| UpstreamError::Bind(err.into()))?;
		Ok(())
	}

	async fn search(
		&mut self,
		base_dn: &str,
		scope: SearchScope,
		filter: &str,
		attributes: &[String],
	) -> Result<Vec<SearchEntry>, UpstreamError> {
		let ldap = self.handle().await?;
		let scope = match scope {
			SearchScope::BaseObject => Scope::Base,
			SearchScope::SingleLevel => Scope::OneLevel,
			SearchScope::WholeSubtree => Scope::Subtree,
		};
		let (entries, _result) = ldap
			.search(base_dn, scope, filter, attributes)
			.await
			.map_err(|err| UpstreamError::Search(err.into()))?
			.success()
			.map_err(|err| UpstreamError::Search(err.into()))?;
		Ok(entries
			.into_iter()
			.map(Ldap3SearchEntry::construct)
			.map(|entry| SearchEntry { dn: entry.dn, attributes: entry.attrs })
			.collect())
	}

	async fn unbind(&mut self) -> Result<(), UpstreamError> {
		if let Some(mut ldap) = self.handle.take() {
			ldap.unbind().await.map_err(|err| UpstreamError::Unbind(err.into()))?;
		}
		Ok(())
	}
}

/// A scripted [`UpstreamLdap`] for driving [`crate::state::ConnectionState`]
/// in tests without a real backend. Kept out of `#[cfg(test)]` so it is
/// also available to the integration tests under `tests/`.
pub mod fake {

	use std::collections::VecDeque;

	use super::{async_trait, SearchEntry, SearchScope, UpstreamError, UpstreamLdap};

	/// One scripted call the fake expects, in order.
	#[derive(Debug, Clone)]
	pub enum Expectation {
		/// Expect a `bind(dn, password)`, with the given outcome.
		Bind { dn: String, password: String, outcome: Result<(), String> },
		/// Expect a `search(base_dn, scope, filter, _)`, returning the given entries.
		Search { base_dn: String, scope: SearchScope, filter: String, result: Vec<SearchEntry> },
		/// Expect an `unbind()`.
		Unbind,
	}

	/// A fake upstream channel driven by a fixed script of expectations.
	#[derive(Debug)]
	pub struct FakeUpstreamLdap {
		/// Remaining expectations, consumed front to back.
		script: VecDeque<Expectation>,
	}

	impl FakeUpstreamLdap {
		/// Build a fake that will assert the given call sequence.
		#[must_use]
		pub fn new(script: Vec<Expectation>) -> Self {
			Self { script: script.into() }
		}
	}

	#[async_trait]
	impl UpstreamLdap for FakeUpstreamLdap {
		async fn bind(&mut self, dn: &str, password: &str) -> Result<(), UpstreamError> {
			match self.script.pop_front() {
				Some(Expectation::Bind { dn: expected_dn, password: expected_pw, outcome }) => {
					assert_eq!(dn, expected_dn, "unexpected bind dn");
					assert_eq!(password, expected_pw, "unexpected bind password");
					outcome.map_err(|reason| UpstreamError::Bind(anyhow::anyhow!(reason)))
				}
				other => panic!("unexpected upstream call bind({dn}, ...), expected {other:?}"),
			}
		}

		async fn search(
			&mut self,
			base_dn: &str,
			scope: SearchScope,
			filter: &str,
			_attributes: &[String],
		) -> Result<Vec<SearchEntry>, UpstreamError> {
			match self.script.pop_front() {
				Some(Expectation::Search { base_dn: expected_base, scope: expected_scope, filter: expected_filter, result }) => {
					assert_eq!(base_dn, expected_base, "unexpected search base");
					assert_eq!(scope, expected_scope, "unexpected search scope");
					assert_eq!(filter, expected_filter, "unexpected search filter");
					Ok(result)
				}
				other => panic!("unexpected upstream call search({base_dn}, {filter}), expected {other:?}"),
			}
		}

		async fn unbind(&mut self) -> Result<(), UpstreamError> {
			match self.script.pop_front() {
				Some(Expectation::Unbind) => Ok(()),
				other => panic!("unexpected upstream call unbind(), expected {other:?}"),
			}
		}
	}
}
