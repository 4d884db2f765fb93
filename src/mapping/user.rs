//! User mapping strategies (C5): deriving a verifier login name from a
//! bind DN.

use async_trait::async_trait;
use regex::Regex;

use crate::{
	error::UserMappingError,
	ldap::{proto::SearchScope, upstream::UpstreamLdap},
};

/// Resolves the verifier's login name for an incoming bind DN.
#[async_trait]
pub trait UserMapper: Send + Sync + std::fmt::Debug {
	/// Resolve `dn` to a login name, or fail with [`UserMappingError`].
	async fn resolve(&self, dn: &str) -> Result<String, UserMappingError>;
}

/// `match` strategy: matches `dn` against a configured regular
/// expression and takes the first capture group as the login name.
#[derive(Debug, Clone)]
pub struct MatchUserMapper {
	/// The (case-insensitive) pattern to match the DN against.
	pattern: Regex,
}

impl MatchUserMapper {
	/// Compile `pattern` case-insensitively. The pattern must contain at
	/// least one capture group; its first group becomes the login name.
	pub fn new(pattern: &str) -> Result<Self, regex::Error> {
		let pattern = Regex::new(&format!("(?i){pattern}"))?;
		Ok(Self { pattern })
	}
}

#[async_trait]
impl UserMapper for MatchUserMapper {
	async fn resolve(&self, dn: &str) -> Result<String, UserMappingError> {
		self.pattern
			.captures(dn)
			.and_then(|captures| captures.get(1))
			.map(|m| m.as_str().to_owned())
			.ok_or_else(|| UserMappingError::PatternMismatch(dn.to_owned()))
	}
}

/// `lookup` strategy: binds to the backend as the service account,
/// searches for `dn` with a base-object scope, and reads a configured
/// single-valued attribute off the one entry that must be found.
pub struct LookupUserMapper {
	/// Factory for an ephemeral, per-resolution upstream channel; the
	/// spec forbids sharing this with the per-connection upstream
	/// channel, since the two can be bound as different identities.
	connect: Box<dyn Fn() -> Box<dyn UpstreamLdap> + Send + Sync>,
	/// Service account DN to bind as before searching.
	service_account_dn: String,
	/// Service account password.
	service_account_password: String,
	/// The attribute whose single value becomes the login name.
	attribute: String,
}

impl std::fmt::Debug for LookupUserMapper {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LookupUserMapper")
			.field("service_account_dn", &self.service_account_dn)
			.field("attribute", &self.attribute)
			.finish_non_exhaustive()
	}
}

impl LookupUserMapper {
	/// Construct a lookup mapper. `connect` builds a fresh, unbound
	/// upstream channel each time it is called.
	pub fn new(
		connect: impl Fn() -> Box<dyn UpstreamLdap> + Send + Sync + 'static,
		service_account_dn: impl Into<String>,
		service_account_password: impl Into<String>,
		attribute: impl Into<String>,
	) -> Self {
		Self {
			connect: Box::new(connect),
			service_account_dn: service_account_dn.into(),
			service_account_password: service_account_password.into(),
			attribute: attribute.into(),
		}
	}
}

#[async_trait]
impl UserMapper for LookupUserMapper {
	async fn resolve(&self, dn: &str) -> Result<String, UserMappingError> {
		let mut channel = (self.connect)();
		channel
			.bind(&self.service_account_dn, &self.service_account_password)
			.await
			.map_err(|err| UserMappingError::LookupFailed(dn.to_owned(), err.into()))?;

		let entries = channel
			.search(dn, SearchScope::BaseObject, "(objectClass=*)", std::slice::from_ref(&self.attribute))
			.await
			.map_err(|err| UserMappingError::LookupFailed(dn.to_owned(), err.into()));
		let _ = channel.unbind().await;
		let entries = entries?;

		if entries.len() != 1 {
			return Err(UserMappingError::NotExactlyOneEntry { dn: dn.to_owned(), found: entries.len() });
		}
		let entry = &entries[0];
		entry
			.attributes
			.get(&self.attribute)
			.and_then(|values| values.first())
			.cloned()
			.ok_or_else(|| UserMappingError::MissingAttribute {
				dn: dn.to_owned(),
				attribute: self.attribute.clone(),
			})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ldap::upstream::{fake::{Expectation, FakeUpstreamLdap}, SearchEntry};

	#[tokio::test]
	async fn match_strategy_extracts_first_capture_group() {
		let mapper = MatchUserMapper::new(r"^uid=([^,]+),.*$").unwrap();
		assert_eq!(mapper.resolve("uid=hugo,dc=test,dc=de").await.unwrap(), "hugo");
	}

	#[tokio::test]
	async fn match_strategy_fails_on_mismatch() {
		let mapper = MatchUserMapper::new(r"^uid=([^,]+),.*$").unwrap();
		assert!(mapper.resolve("cn=hugo,dc=test,dc=de").await.is_err());
	}

	#[tokio::test]
	async fn lookup_strategy_reads_the_configured_attribute() {
		let script = vec![
			Expectation::Bind { dn: "cn=svc".into(), password: "svcpw".into(), outcome: Ok(()) },
			Expectation::Search {
				base_dn: "uid=hugo,dc=test".into(),
				scope: SearchScope::BaseObject,
				filter: "(objectClass=*)".into(),
				result: vec![SearchEntry {
					dn: "uid=hugo,dc=test".into(),
					attributes: [("sAMAccountName".to_owned(), vec!["hugo".to_owned()])].into(),
				}],
			},
			Expectation::Unbind,
		];
		let mapper = LookupUserMapper::new(
			move || Box::new(FakeUpstreamLdap::new(script.clone())),
			"cn=svc",
			"svcpw",
			"sAMAccountName",
		);
		assert_eq!(mapper.resolve("uid=hugo,dc=test").await.unwrap(), "hugo");
	}

	#[tokio::test]
	async fn lookup_strategy_fails_when_not_exactly_one_entry() {
		let script = vec![
			Expectation::Bind { dn: "cn=svc".into(), password: "svcpw".into(), outcome: Ok(()) },
			Expectation::Search {
				base_dn: "uid=ghost,dc=test".into(),
				scope: SearchScope::BaseObject,
				filter: "(objectClass=*)".into(),
				result: vec![],
			},
			Expectation::Unbind,
		];
		let mapper =
			LookupUserMapper::new(move || Box::new(FakeUpstreamLdap::new(script.clone())), "cn=svc", "svcpw", "uid");
		let err = mapper.resolve("uid=ghost,dc=test").await.unwrap_err();
		assert!(matches!(err, UserMappingError::NotExactlyOneEntry { found: 0, .. }));
	}
}
