//! ProxyListener (C9): accepts client connections and drives one
//! [`ConnectionState`] per connection against the shared collaborators
//! assembled from configuration.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::{
	cache::{app::AppCache, bind::BindCache},
	config::{Config, RealmMappingConfig, UserMappingConfig, DEFAULT_DN_BLACKLIST},
	ldap::{
		codec::LdapCodec,
		upstream::{RealUpstreamLdap, UpstreamLdap},
	},
	mapping::{
		realm::{AppCacheRealmMapper, RealmMapper, StaticRealmMapper},
		user::{LookupUserMapper, MatchUserMapper, UserMapper},
	},
	preamble::PreambleDetector,
	state::{Action, ConnectionState, ServiceAccount, Shared},
	verifier::VerifierClient,
};

/// Accepts client connections on the configured listen address.
#[derive(Debug)]
pub struct ProxyListener {
	/// The bound listening socket.
	listener: TcpListener,
	/// Collaborators shared by every accepted connection.
	shared: Shared,
	/// The backend LDAP URL each connection's upstream channel targets.
	backend_endpoint: String,
}

impl ProxyListener {
	/// Bind the configured listen address and assemble the collaborators
	/// every accepted connection will share. Runs the optional startup
	/// health check if configured.
	pub async fn bind(config: &Config) -> Result<Self> {
		let listener = TcpListener::bind(&config.ldap_proxy.endpoint)
			.await
			.with_context(|| format!("failed to bind {}", config.ldap_proxy.endpoint))?;

		let shared = build_shared(config)?;

		if config.ldap_backend.test_connection {
			health_check(config, &shared).await;
		}

		Ok(Self { listener, shared, backend_endpoint: config.ldap_backend.endpoint.clone() })
	}

	/// Accept connections forever, handling each on its own task.
	pub async fn serve(self) -> Result<()> {
		loop {
			let (socket, peer) = self.listener.accept().await.context("accept failed")?;
			tracing::debug!(%peer, "accepted connection");
			let shared = self.shared.clone();
			let upstream: Box<dyn UpstreamLdap> = Box::new(RealUpstreamLdap::new(self.backend_endpoint.clone()));
			tokio::spawn(async move {
				if let Err(err) = handle_connection(socket, shared, upstream).await {
					tracing::warn!(%err, %peer, "connection ended with an error");
				}
			});
		}
	}
}

/// Drive a single accepted connection to completion: decode requests,
/// run them through the state machine, write replies, stop on close or
/// client disconnect. Dropping `state` (and the upstream channel it
/// owns) on return tears down any upstream connection that was opened,
/// including one still being established when the client disconnects.
async fn handle_connection(socket: TcpStream, shared: Shared, upstream: Box<dyn UpstreamLdap>) -> Result<()> {
	let mut framed = Framed::new(socket, LdapCodec);
	let mut state = ConnectionState::new(shared, upstream);

	while let Some(msg) = framed.next().await {
		let msg = msg.context("failed to decode client request")?;
		let actions = state.handle(msg).await;
		let mut should_close = false;
		for action in actions {
			match action {
				Action::Reply(response) => framed.send(response).await.context("failed to send reply")?,
				Action::Close => should_close = true,
			}
		}
		if should_close {
			break;
		}
	}
	Ok(())
}

/// Assemble the caches, mappers, and verifier client every connection
/// will share, from the validated configuration tree.
fn build_shared(config: &Config) -> Result<Shared> {
	if config.ldap_proxy.ignore_search_result_references {
		tracing::warn!(
			"ldap_proxy.ignore_search_result_references is set but has no effect: the upstream \
			 channel resolves search result references internally before returning, so there are \
			 none left for the proxy to drop or forward by the time a search call completes"
		);
	}

	let bind_cache = config
		.bind_cache
		.enabled
		.then(|| BindCache::new(Duration::from_secs(config.bind_cache.timeout_secs)));
	let app_cache = config
		.app_cache
		.enabled
		.then(|| AppCache::new(Duration::from_secs(config.app_cache.timeout_secs), config.app_cache.case_insensitive));
	let preamble = config
		.app_cache
		.enabled
		.then(|| PreambleDetector::new(config.app_cache.attribute.clone(), config.app_cache.value_prefix.clone()));

	let service_account = config
		.service_account
		.as_ref()
		.map(|sa| ServiceAccount { dn: sa.dn.clone(), password: sa.password.clone() });

	let user_mapper: Arc<dyn UserMapper> = match &config.user_mapping {
		UserMappingConfig::Match { pattern } => {
			Arc::new(MatchUserMapper::new(pattern).context("invalid user_mapping.pattern")?)
		}
		UserMappingConfig::Lookup { attribute } => {
			let service_account = service_account
				.clone()
				.context("user_mapping.strategy = \"lookup\" requires a service_account")?;
			let backend_endpoint = config.ldap_backend.endpoint.clone();
			Arc::new(LookupUserMapper::new(
				move || Box::new(RealUpstreamLdap::new(backend_endpoint.clone())) as Box<dyn UpstreamLdap>,
				service_account.dn,
				service_account.password,
				attribute.clone(),
			))
		}
	};

	let realm_mapper: Arc<dyn RealmMapper> = match &config.realm_mapping {
		RealmMappingConfig::Static { realm } => Arc::new(StaticRealmMapper::new(realm.clone())),
		RealmMappingConfig::AppCache { mappings } => {
			let cache = app_cache
				.clone()
				.context("realm_mapping.strategy = \"app_cache\" requires app_cache.enabled")?;
			Arc::new(AppCacheRealmMapper::new(cache, mappings.clone()))
		}
	};

	let http = build_http_client(config)?;
	let verifier = Arc::new(VerifierClient::new(http, config.verifier_validate_url()));

	let blacklist = DEFAULT_DN_BLACKLIST
		.iter()
		.map(|pattern| Regex::new(pattern))
		.collect::<std::result::Result<Vec<_>, _>>()
		.context("invalid built-in dn blacklist pattern")?;

	Ok(Shared {
		bind_cache,
		app_cache,
		preamble,
		user_mapper,
		realm_mapper,
		verifier,
		blacklist,
		passthrough_binds: config.ldap_proxy.passthrough_binds.clone(),
		service_account,
		bind_service_account: config.ldap_proxy.bind_service_account,
		allow_search: config.ldap_proxy.allow_search,
		allow_connection_reuse: config.ldap_proxy.allow_connection_reuse,
		forward_anonymous_binds: config.ldap_proxy.forward_anonymous_binds,
	})
}

/// Build the HTTP client used to talk to the verifier, applying the
/// configured TLS trust policy.
fn build_http_client(config: &Config) -> Result<reqwest::Client> {
	let mut builder = reqwest::Client::builder();
	if !config.verifier.verify {
		tracing::warn!("verifier.verify is disabled: neither TLS certificate nor hostname checks are performed");
		builder = builder.danger_accept_invalid_certs(true).danger_accept_invalid_hostnames(true);
	} else if let Some(path) = &config.verifier.certificate {
		let pem = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
		let cert = reqwest::Certificate::from_pem(&pem).context("invalid verifier.certificate pem")?;
		builder = builder.add_root_certificate(cert);
	}
	builder.build().context("failed to build verifier http client")
}

/// Bind as the service account and unbind, logging but not failing
/// startup on error.
async fn health_check(config: &Config, shared: &Shared) {
	let Some(service_account) = &shared.service_account else {
		tracing::warn!("ldap_backend.test_connection is enabled but no service_account is configured");
		return;
	};
	let mut probe: Box<dyn UpstreamLdap> = Box::new(RealUpstreamLdap::new(config.ldap_backend.endpoint.clone()));
	match probe.bind(&service_account.dn, &service_account.password).await {
		Ok(()) => {
			tracing::info!("backend connectivity check succeeded");
			let _ = probe.unbind().await;
		}
		Err(err) => tracing::warn!(%err, "backend connectivity check failed"),
	}
}
