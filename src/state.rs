//! ConnectionState (C8): the per-connection bind-dispatch state
//! machine that turns a stream of client LDAP requests into the
//! right mix of verifier calls, cache lookups, and upstream forwards.
//!
//! One [`ConnectionState`] is constructed per accepted TCP connection
//! by [`crate::listener::ProxyListener`] and lives for that
//! connection's lifetime; it owns the connection's upstream channel
//! exclusively and is never shared across tasks, so none of its own
//! fields need locking (§5). The objects it shares with other
//! connections — the caches, the mappers, the verifier client — are
//! bundled into [`Shared`] and handed to every connection as cheap
//! clones.

use std::sync::Arc;

use regex::Regex;

use crate::{
	cache::{app::AppCache, bind::BindCache},
	error::VerifierOutcome,
	ldap::{
		codec::{reject_unsupported, Response},
		proto::{BindRequest, Filter, Message, ProtocolOp, ResultCode, SearchRequest},
		upstream::UpstreamLdap,
	},
	mapping::{realm::RealmMapper, user::UserMapper},
	preamble::PreambleDetector,
	verifier::VerifierClient,
};

/// The named states a connection moves through (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	/// No bind has been accepted on this connection yet.
	Fresh,
	/// The most recent successful bind was forwarded unchanged
	/// (a configured passthrough DN).
	BoundViaPassthrough,
	/// The most recent successful bind went through the verifier.
	BoundViaVerifier,
	/// A bind is currently being resolved against the verifier.
	AwaitingVerifier,
	/// The connection has sent `UnbindRequest` and should be closed.
	Closed,
}

/// One thing the listener must do in response to a processed request:
/// write a reply, or tear the connection down.
#[derive(Debug, Clone)]
pub enum Action {
	/// Write this PDU back to the client.
	Reply(Response),
	/// Close the connection; no further replies follow.
	Close,
}

/// The subset of the service account identity a connection needs.
#[derive(Debug, Clone)]
pub struct ServiceAccount {
	/// The service account's bind DN.
	pub dn: String,
	/// The service account's password.
	pub password: String,
}

/// Cross-connection collaborators and static policy, wired once at
/// startup and cloned cheaply into every [`ConnectionState`].
#[derive(Debug, Clone)]
pub struct Shared {
	/// Recently-verified `(dn, realm, password)` triples, or `None` if
	/// the bind cache is disabled.
	pub bind_cache: Option<BindCache>,
	/// The last app marker seen per DN, or `None` if disabled.
	pub app_cache: Option<AppCache>,
	/// Recognizes app-identity preambles in search traffic. Only
	/// consulted when `app_cache` is also configured.
	pub preamble: Option<PreambleDetector>,
	/// Resolves a bind DN to the verifier's login name.
	pub user_mapper: Arc<dyn UserMapper>,
	/// Resolves a bind DN to a verifier realm.
	pub realm_mapper: Arc<dyn RealmMapper>,
	/// Posts verification requests.
	pub verifier: Arc<VerifierClient>,
	/// DNs rejected outright before any mapping is attempted.
	pub blacklist: Vec<Regex>,
	/// DNs forwarded to upstream unchanged, bypassing the verifier.
	pub passthrough_binds: Vec<String>,
	/// The privileged identity used for service-account rebinds; `None`
	/// if `bind_service_account` is not configured.
	pub service_account: Option<ServiceAccount>,
	/// Whether a verifier-delegated success also re-binds upstream as
	/// the service account.
	pub bind_service_account: bool,
	/// Whether `SearchRequest`s are forwarded at all.
	pub allow_search: bool,
	/// Whether a bound connection may send a second `BindRequest`.
	pub allow_connection_reuse: bool,
	/// Whether anonymous binds are forwarded instead of rejected.
	pub forward_anonymous_binds: bool,
}

/// Per-connection bind-dispatch state machine.
#[derive(Debug)]
pub struct ConnectionState {
	/// Shared, cross-connection collaborators.
	shared: Shared,
	/// The upstream channel exclusively owned by this connection.
	/// Opened lazily by the channel implementation itself on first use.
	upstream: Box<dyn UpstreamLdap>,
	/// The current named state.
	phase: Phase,
	/// Whether a `BindRequest` has already been accepted on this
	/// connection (before any `reset`).
	received_bind_request: bool,
	/// Whether the most recent successful bind was a passthrough bind.
	forwarded_passthrough_bind: bool,
}

impl ConnectionState {
	/// Construct a fresh state machine for a newly accepted connection.
	#[must_use]
	pub fn new(shared: Shared, upstream: Box<dyn UpstreamLdap>) -> Self {
		Self {
			shared,
			upstream,
			phase: Phase::Fresh,
			received_bind_request: false,
			forwarded_passthrough_bind: false,
		}
	}

	/// The connection's current named state.
	#[must_use]
	pub fn phase(&self) -> Phase {
		self.phase
	}

	/// Restore the fields tracked across binds, as if this were a
	/// freshly accepted connection (§3), without dropping the upstream
	/// channel.
	fn reset(&mut self) {
		self.phase = Phase::Fresh;
		self.received_bind_request = false;
		self.forwarded_passthrough_bind = false;
	}

	/// Process one decoded client request, returning the reply/close
	/// actions the listener must perform in order.
	pub async fn handle(&mut self, msg: Message) -> Vec<Action> {
		match msg.op {
			ProtocolOp::BindRequest(req) => self.handle_bind(msg.id, req).await,
			ProtocolOp::SearchRequest(req) => self.handle_search(msg.id, req).await,
			ProtocolOp::UnbindRequest => self.handle_unbind().await,
			ProtocolOp::Unsupported(op) => {
				tracing::debug!(?op, "rejecting unsupported request kind");
				reject_unsupported(msg.id, op).into_iter().map(Action::Reply).collect()
			}
		}
	}

	async fn handle_bind(&mut self, id: i32, req: BindRequest) -> Vec<Action> {
		if self.received_bind_request {
			if self.shared.allow_connection_reuse {
				self.reset();
			} else {
				tracing::info!("rejecting bind: connection reuse is disabled");
				return reply_bind(id, ResultCode::InvalidCredentials);
			}
		}
		self.received_bind_request = true;

		if req.dn.is_empty() {
			return if self.shared.forward_anonymous_binds {
				self.forward_bind(id, &req.dn, &req.password).await
			} else {
				tracing::info!("rejecting anonymous bind: not supported by configuration");
				reply_bind(id, ResultCode::InvalidCredentials)
			};
		}

		if self.shared.blacklist.iter().any(|pattern| pattern.is_match(&req.dn)) {
			tracing::info!(dn = %req.dn, "rejecting blacklisted dn");
			return reply_bind(id, ResultCode::InvalidCredentials);
		}

		if self.shared.passthrough_binds.iter().any(|dn| dn == &req.dn) {
			self.forwarded_passthrough_bind = true;
			return self.forward_bind(id, &req.dn, &req.password).await;
		}

		self.phase = Phase::AwaitingVerifier;
		self.verifier_delegated_bind(id, &req.dn, &req.password).await
	}

	/// Forward a bind unchanged to upstream (passthrough and anonymous
	/// binds): the upstream result is returned verbatim, collapsed onto
	/// success/failure since the upstream channel only reports whether
	/// its own bind succeeded, not the original LDAP result code.
	async fn forward_bind(&mut self, id: i32, dn: &str, password: &str) -> Vec<Action> {
		match self.upstream.bind(dn, password).await {
			Ok(()) => {
				self.phase = Phase::BoundViaPassthrough;
				reply_bind(id, ResultCode::Success)
			}
			Err(err) => {
				tracing::info!(%err, dn, "upstream rejected a forwarded bind");
				reply_bind(id, ResultCode::InvalidCredentials)
			}
		}
	}

	async fn verifier_delegated_bind(&mut self, id: i32, dn: &str, password: &str) -> Vec<Action> {
		let (marker, realm) = match self.shared.realm_mapper.resolve(dn).await {
			Ok(pair) => pair,
			Err(err) => {
				tracing::info!(%err, dn, "could not determine realm");
				return reply_bind(id, ResultCode::InvalidCredentials);
			}
		};

		let user = match self.shared.user_mapper.resolve(dn).await {
			Ok(user) => user,
			Err(err) => {
				tracing::info!(%err, dn, "could not map dn to a verifier user");
				return reply_bind(id, ResultCode::InvalidCredentials);
			}
		};

		let already_verified = match &self.shared.bind_cache {
			Some(cache) => cache.contains(dn, &marker, password).await,
			None => false,
		};

		if already_verified {
			tracing::debug!(user, marker, realm, "bind satisfied from bind cache");
		} else {
			match self.shared.verifier.verify(&user, &realm, password).await {
				Ok(VerifierOutcome::Success) => {
					tracing::info!(user, marker, realm, "verifier accepted credentials");
					if let Some(cache) = &self.shared.bind_cache {
						cache.insert(dn, &marker, password).await;
					}
				}
				Ok(VerifierOutcome::WrongCredentials) => {
					tracing::info!(user, realm, "verifier rejected credentials");
					return reply_bind(id, ResultCode::InvalidCredentials);
				}
				Ok(VerifierOutcome::VerifierError) => {
					tracing::warn!(user, realm, "verifier reported an internal error");
					return reply_bind(id, ResultCode::InvalidCredentials);
				}
				Err(err) => {
					tracing::warn!(%err, user, realm, "verifier transport error");
					return reply_bind(id, ResultCode::InvalidCredentials);
				}
			}
		}

		if self.shared.bind_service_account {
			let Some(service_account) = self.shared.service_account.clone() else {
				tracing::error!("bind_service_account enabled without a configured service account");
				return reply_bind(id, ResultCode::InvalidCredentials);
			};
			if let Err(err) = self.upstream.bind(&service_account.dn, &service_account.password).await {
				tracing::warn!(%err, "service account bind failed after successful verification");
				return reply_bind(id, ResultCode::InvalidCredentials);
			}
			self.forwarded_passthrough_bind = false;
		}

		self.phase = Phase::BoundViaVerifier;
		reply_bind(id, ResultCode::Success)
	}

	async fn handle_search(&mut self, id: i32, req: SearchRequest) -> Vec<Action> {
		if !self.shared.allow_search {
			tracing::debug!("rejecting search: disallowed by configuration");
			return vec![Action::Reply(Response::Result {
				id,
				tag: 5,
				code: ResultCode::InsufficientAccessRights,
			})];
		}

		let filter_str = render_filter(req.filter.as_ref());
		match self.upstream.search(&req.base_dn, req.scope, &filter_str, &[]).await {
			Ok(entries) => {
				let mut actions: Vec<Action> = entries
					.iter()
					.map(|entry| {
						Action::Reply(Response::SearchEntry {
							id,
							dn: entry.dn.clone(),
							attributes: entry.attributes.clone(),
						})
					})
					.collect();

				// P7: only a single-entry response from a passthrough-bound
				// connection may seed the app cache; anything else could let
				// an authenticated user forge an app identity.
				if entries.len() == 1 && self.forwarded_passthrough_bind {
					if let (Some(app_cache), Some(detector)) = (&self.shared.app_cache, &self.shared.preamble) {
						if let Some((dn, marker)) = detector.detect(req.filter.as_ref(), &entries[0]) {
							tracing::debug!(dn, marker, "recorded app preamble");
							app_cache.insert(&dn, &marker).await;
						}
					}
				}

				actions.push(Action::Reply(Response::Result { id, tag: 5, code: ResultCode::Success }));
				actions
			}
			Err(err) => {
				tracing::warn!(%err, "upstream search failed");
				vec![Action::Reply(Response::Result { id, tag: 5, code: ResultCode::InvalidCredentials })]
			}
		}
	}

	async fn handle_unbind(&mut self) -> Vec<Action> {
		if let Err(err) = self.upstream.unbind().await {
			tracing::warn!(%err, "upstream unbind failed");
		}
		self.phase = Phase::Closed;
		vec![Action::Close]
	}
}

/// Build the one-element action list a `BindResponse` reply is.
fn reply_bind(id: i32, code: ResultCode) -> Vec<Action> {
	vec![Action::Reply(Response::Bind { id, code })]
}

/// Render a decoded filter back into an RFC 4515 filter string for the
/// upstream channel. `Filter::Other` terms (substrings, presence,
/// ordering, approx, extensible, not) are rendered as a permissive
/// `(objectClass=*)`, matching the wire decoder's own documented choice
/// to keep only the detail the preamble detector needs and treat the
/// rest as opaque.
fn render_filter(filter: Option<&Filter>) -> String {
	filter.map_or_else(|| "(objectClass=*)".to_owned(), render)
}

fn render(filter: &Filter) -> String {
	match filter {
		Filter::And(terms) => format!("(&{})", terms.iter().map(render).collect::<String>()),
		Filter::Or(terms) => format!("(|{})", terms.iter().map(render).collect::<String>()),
		Filter::Equality { attribute, value } => {
			format!("({attribute}={})", String::from_utf8_lossy(value))
		}
		Filter::Other => "(objectClass=*)".to_owned(),
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use wiremock::{
		matchers::{method, path},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;
	use crate::{
		ldap::{
			proto::SearchScope,
			upstream::{
				fake::{Expectation, FakeUpstreamLdap},
				SearchEntry,
			},
		},
		mapping::{realm::StaticRealmMapper, user::MatchUserMapper},
	};

	async fn shared_for(server: &MockServer, passthrough_binds: Vec<String>) -> Shared {
		Shared {
			bind_cache: None,
			app_cache: None,
			preamble: None,
			user_mapper: Arc::new(MatchUserMapper::new(r"^uid=([^,]+),.*$").unwrap()),
			realm_mapper: Arc::new(StaticRealmMapper::new("default")),
			verifier: Arc::new(VerifierClient::new(reqwest::Client::new(), format!("{}/validate/check", server.uri()))),
			blacklist: vec![Regex::new("^dn=uid=").unwrap()],
			passthrough_binds,
			service_account: None,
			bind_service_account: false,
			allow_search: true,
			allow_connection_reuse: false,
			forward_anonymous_binds: false,
		}
	}

	fn bind_request(id: i32, dn: &str, password: &str) -> Message {
		Message {
			id,
			op: ProtocolOp::BindRequest(BindRequest { version: 3, dn: dn.to_owned(), password: password.to_owned() }),
		}
	}

	#[tokio::test]
	async fn successful_verifier_bind_replies_success() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/validate/check"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"result": {"status": true, "value": true}
			})))
			.mount(&server)
			.await;

		let shared = shared_for(&server, vec![]).await;
		let upstream = Box::new(FakeUpstreamLdap::new(vec![]));
		let mut state = ConnectionState::new(shared, upstream);

		let actions = state.handle(bind_request(1, "uid=hugo,dc=test", "secret")).await;
		assert!(matches!(
			actions.as_slice(),
			[Action::Reply(Response::Bind { code: ResultCode::Success, .. })]
		));
		assert_eq!(state.phase(), Phase::BoundViaVerifier);
	}

	#[tokio::test]
	async fn blacklisted_dn_is_rejected_before_any_mapping() {
		let server = MockServer::start().await;
		let shared = shared_for(&server, vec![]).await;
		let upstream = Box::new(FakeUpstreamLdap::new(vec![]));
		let mut state = ConnectionState::new(shared, upstream);

		let actions = state.handle(bind_request(1, "dn=uid=hugo,dc=test", "secret")).await;
		assert!(matches!(
			actions.as_slice(),
			[Action::Reply(Response::Bind { code: ResultCode::InvalidCredentials, .. })]
		));
	}

	#[tokio::test]
	async fn passthrough_bind_is_forwarded_verbatim() {
		let server = MockServer::start().await;
		let shared = shared_for(&server, vec!["uid=passthrough,dc=test".to_owned()]).await;
		let upstream = Box::new(FakeUpstreamLdap::new(vec![Expectation::Bind {
			dn: "uid=passthrough,dc=test".into(),
			password: "anything".into(),
			outcome: Ok(()),
		}]));
		let mut state = ConnectionState::new(shared, upstream);

		let actions = state.handle(bind_request(1, "uid=passthrough,dc=test", "anything")).await;
		assert!(matches!(
			actions.as_slice(),
			[Action::Reply(Response::Bind { code: ResultCode::Success, .. })]
		));
		assert_eq!(state.phase(), Phase::BoundViaPassthrough);
	}

	#[tokio::test]
	async fn second_bind_without_reuse_is_rejected() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/validate/check"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"result": {"status": true, "value": true}
			})))
			.mount(&server)
			.await;

		let shared = shared_for(&server, vec![]).await;
		let upstream = Box::new(FakeUpstreamLdap::new(vec![]));
		let mut state = ConnectionState::new(shared, upstream);

		state.handle(bind_request(1, "uid=hugo,dc=test", "secret")).await;
		let actions = state.handle(bind_request(2, "uid=hugo,dc=test", "secret")).await;
		assert!(matches!(
			actions.as_slice(),
			[Action::Reply(Response::Bind { code: ResultCode::InvalidCredentials, .. })]
		));
	}

	#[tokio::test]
	async fn search_without_allow_search_is_rejected_without_forwarding() {
		let server = MockServer::start().await;
		let mut shared = shared_for(&server, vec![]).await;
		shared.allow_search = false;
		let upstream = Box::new(FakeUpstreamLdap::new(vec![]));
		let mut state = ConnectionState::new(shared, upstream);

		let msg = Message {
			id: 2,
			op: ProtocolOp::SearchRequest(SearchRequest {
				base_dn: "dc=test".into(),
				scope: SearchScope::WholeSubtree,
				filter: None,
			}),
		};
		let actions = state.handle(msg).await;
		assert!(matches!(
			actions.as_slice(),
			[Action::Reply(Response::Result { tag: 5, code: ResultCode::InsufficientAccessRights, .. })]
		));
	}

	#[tokio::test]
	async fn single_entry_search_on_passthrough_connection_seeds_app_cache() {
		let server = MockServer::start().await;
		let mut shared = shared_for(&server, vec!["uid=passthrough,dc=test".to_owned()]).await;
		let app_cache = AppCache::new(std::time::Duration::from_secs(60), false);
		shared.app_cache = Some(app_cache.clone());
		shared.preamble = Some(PreambleDetector::new("objectclass", "App-"));

		let upstream = Box::new(FakeUpstreamLdap::new(vec![
			Expectation::Bind { dn: "uid=passthrough,dc=test".into(), password: "x".into(), outcome: Ok(()) },
			Expectation::Search {
				base_dn: "dc=test".into(),
				scope: SearchScope::WholeSubtree,
				filter: "(objectclass=App-markerSecret)".into(),
				result: vec![SearchEntry { dn: "uid=hugo,dc=test".into(), attributes: HashMap::new() }],
			},
		]));
		let mut state = ConnectionState::new(shared, upstream);

		state.handle(bind_request(1, "uid=passthrough,dc=test", "x")).await;
		let msg = Message {
			id: 2,
			op: ProtocolOp::SearchRequest(SearchRequest {
				base_dn: "dc=test".into(),
				scope: SearchScope::WholeSubtree,
				filter: Some(Filter::Equality {
					attribute: "objectclass".into(),
					value: b"App-markerSecret".to_vec(),
				}),
			}),
		};
		state.handle(msg).await;

		assert_eq!(app_cache.lookup("uid=hugo,dc=test").await.as_deref(), Some("markerSecret"));
	}

	#[tokio::test]
	async fn unbind_always_closes_the_connection() {
		let server = MockServer::start().await;
		let shared = shared_for(&server, vec![]).await;
		let upstream = Box::new(FakeUpstreamLdap::new(vec![Expectation::Unbind]));
		let mut state = ConnectionState::new(shared, upstream);

		let actions = state.handle(Message { id: 3, op: ProtocolOp::UnbindRequest }).await;
		assert!(matches!(actions.as_slice(), [Action::Close]));
		assert_eq!(state.phase(), Phase::Closed);
	}
}
