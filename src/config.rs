//! Configuration surface (§6): everything the proxy reads from its
//! YAML config file plus the handful of derived, hardcoded defaults
//! (the DN blacklist) that the reference implementation does not
//! expose as config keys either.
use std::{collections::HashMap, path::Path};

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration tree.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	/// The verifier HTTP(S) endpoint and TLS policy.
	pub verifier: VerifierConfig,
	/// The real LDAP backend the proxy forwards to.
	pub ldap_backend: LdapBackendConfig,
	/// The proxy's own listening socket and bind-dispatch policy.
	pub ldap_proxy: LdapProxyConfig,
	/// The privileged identity used for service-account binds and
	/// LDAP-lookup user mapping. Required if either feature is used.
	pub service_account: Option<ServiceAccountConfig>,
	/// BindCache (C2) configuration.
	pub bind_cache: BindCacheConfig,
	/// AppCache (C3) configuration.
	pub app_cache: AppCacheConfig,
	/// UserMapper (C5) strategy selection.
	pub user_mapping: UserMappingConfig,
	/// RealmMapper (C6) strategy selection.
	pub realm_mapping: RealmMappingConfig,
	/// The tracing filter directive used at startup; defaults to `info`.
	pub log_level: Option<String>,
}

/// Verifier endpoint and TLS trust policy.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifierConfig {
	/// Base URL of the verifier, e.g. `https://verifier.example.org/`.
	/// A trailing `/` is enforced at load time.
	pub instance: String,
	/// A PEM file pinning a single trusted root, instead of the system
	/// trust store.
	pub certificate: Option<std::path::PathBuf>,
	/// Whether to verify the verifier's TLS certificate at all.
	/// `false` disables certificate verification entirely and is
	/// logged as a startup warning.
	#[serde(default = "default_true")]
	pub verify: bool,
}

/// The real LDAP backend.
#[derive(Debug, Clone, Deserialize)]
pub struct LdapBackendConfig {
	/// The backend's LDAP URL, e.g. `ldap://directory.example.org:389`.
	pub endpoint: String,
	/// Whether to bind-and-unbind as the service account at startup as
	/// a health check.
	#[serde(default)]
	pub test_connection: bool,
}

/// The proxy's own listening socket and bind-dispatch policy.
#[derive(Debug, Clone, Deserialize)]
pub struct LdapProxyConfig {
	/// The address to listen on, e.g. `0.0.0.0:389`.
	pub endpoint: String,
	/// DNs forwarded unchanged to the backend without verifier
	/// involvement (exact string match).
	#[serde(default)]
	pub passthrough_binds: Vec<String>,
	/// Whether a successful verifier-delegated bind should also
	/// re-bind the upstream channel as the service account.
	#[serde(default)]
	pub bind_service_account: bool,
	/// Whether `SearchRequest`s are forwarded at all.
	#[serde(default)]
	pub allow_search: bool,
	/// Whether a bound connection may send a second `BindRequest`
	/// instead of being rejected.
	#[serde(default)]
	pub allow_connection_reuse: bool,
	/// Whether `SearchResultReference` messages are dropped instead of
	/// forwarded.
	#[serde(default)]
	pub ignore_search_result_references: bool,
	/// Whether anonymous binds (`dn == ""`) are forwarded to upstream
	/// instead of rejected.
	#[serde(default)]
	pub forward_anonymous_binds: bool,
}

/// A privileged LDAP identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountConfig {
	/// The service account's bind DN.
	pub dn: String,
	/// The service account's password.
	pub password: String,
}

/// BindCache (C2) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BindCacheConfig {
	/// Whether repeated `(dn, marker, password)` binds are cached.
	pub enabled: bool,
	/// How long a cached bind stays valid.
	pub timeout_secs: u64,
}

/// AppCache (C3) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppCacheConfig {
	/// Whether the preamble detector and app cache are active at all.
	pub enabled: bool,
	/// How long a recorded app marker stays valid.
	pub timeout_secs: u64,
	/// The attribute the app marker is carried on, e.g. `objectclass`.
	#[serde(default = "default_app_marker_attribute")]
	pub attribute: String,
	/// The literal prefix an app-marker value must start with.
	#[serde(default = "default_app_marker_prefix")]
	pub value_prefix: String,
	/// Whether DNs are case-folded before use as an app-cache key.
	#[serde(default)]
	pub case_insensitive: bool,
}

/// UserMapper (C5) strategy selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum UserMappingConfig {
	/// Regex-match strategy: `dn` is matched against `pattern`.
	Match {
		/// A case-insensitive pattern with one capture group.
		pattern: String,
	},
	/// LDAP-lookup strategy: `dn` is searched for via the service
	/// account, and `attribute`'s value becomes the login name.
	Lookup {
		/// The attribute whose single value is the login name.
		attribute: String,
	},
}

/// RealmMapper (C6) strategy selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RealmMappingConfig {
	/// Static strategy: every DN resolves to `realm`.
	Static {
		/// The realm every DN resolves to.
		realm: String,
	},
	/// App-cache strategy: the marker recorded by the preamble
	/// detector is looked up in `mappings`.
	AppCache {
		/// Marker -> realm table.
		mappings: HashMap<String, String>,
	},
}

impl Config {
	/// Load and validate configuration from a YAML file at `path`.
	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let settings = config::Config::builder()
			.add_source(config::File::from(path))
			.build()
			.map_err(|err| ConfigError::new("<file>", "<load>", err.to_string()))?;
		let mut config: Self = settings
			.try_deserialize()
			.map_err(|err| ConfigError::new("<file>", "<schema>", err.to_string()))?;
		config.validate()?;
		Ok(config)
	}

	/// Normalize and cross-check the configuration in ways a `serde`
	/// derive alone cannot express.
	fn validate(&mut self) -> Result<(), ConfigError> {
		if !self.verifier.instance.ends_with('/') {
			self.verifier.instance.push('/');
		}
		if self.ldap_proxy.bind_service_account && self.service_account.is_none() {
			return Err(ConfigError::new(
				"service_account",
				"dn",
				"required because ldap_proxy.bind_service_account is enabled",
			));
		}
		if matches!(self.user_mapping, UserMappingConfig::Lookup { .. }) && self.service_account.is_none() {
			return Err(ConfigError::new(
				"service_account",
				"dn",
				"required because user_mapping.strategy is \"lookup\"",
			));
		}
		Ok(())
	}

	/// The verifier's `validate/check` endpoint, built from `verifier.instance`.
	#[must_use]
	pub fn verifier_validate_url(&self) -> String {
		format!("{}validate/check", self.verifier.instance)
	}
}

/// The default DN blacklist: rejects DNs whose first RDN attribute is
/// literally `dn=uid=…`, a common LDAP injection shape. Not
/// configurable, matching the reference implementation.
pub const DEFAULT_DN_BLACKLIST: &[&str] = &["^dn=uid="];

/// `serde(default = ...)` helper: `true`.
fn default_true() -> bool {
	true
}

/// `serde(default = ...)` helper for [`AppCacheConfig::attribute`].
fn default_app_marker_attribute() -> String {
	"objectclass".to_owned()
}

/// `serde(default = ...)` helper for [`AppCacheConfig::value_prefix`].
fn default_app_marker_prefix() -> String {
	"App-".to_owned()
}
