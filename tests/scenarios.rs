//! End-to-end scenarios driving the bind-dispatch state machine
//! against scripted fakes: no real LDAP backend and no real verifier
//! are involved, only `wiremock` for the verifier's HTTP contract and
//! `FakeUpstreamLdap` for the backend.

use std::{sync::Arc, time::Duration};

use ldap_tfa_proxy::{
	cache::{app::AppCache, bind::BindCache},
	ldap::{
		proto::{BindRequest, Filter, Message, ProtocolOp, ResultCode, SearchRequest, SearchScope},
		upstream::fake::{Expectation, FakeUpstreamLdap},
	},
	mapping::{realm::StaticRealmMapper, user::MatchUserMapper},
	preamble::PreambleDetector,
	state::{Action, ConnectionState, Shared},
	verifier::VerifierClient,
};
use regex::Regex;
use wiremock::{
	matchers::{body_string_contains, method, path},
	Mock, MockServer, ResponseTemplate,
};

fn bind(id: i32, dn: &str, password: &str) -> Message {
	Message { id, op: ProtocolOp::BindRequest(BindRequest { version: 3, dn: dn.to_owned(), password: password.to_owned() }) }
}

fn search(id: i32, base_dn: &str, filter: Option<Filter>) -> Message {
	Message {
		id,
		op: ProtocolOp::SearchRequest(SearchRequest {
			base_dn: base_dn.to_owned(),
			scope: SearchScope::WholeSubtree,
			filter,
		}),
	}
}

fn bare_shared(server: &MockServer, bind_cache: Option<BindCache>) -> Shared {
	Shared {
		bind_cache,
		app_cache: None,
		preamble: None,
		user_mapper: Arc::new(MatchUserMapper::new(r"^uid=([^,]+),.*$").unwrap()),
		realm_mapper: Arc::new(StaticRealmMapper::new("default")),
		verifier: Arc::new(VerifierClient::new(reqwest::Client::new(), format!("{}/validate/check", server.uri()))),
		blacklist: vec![Regex::new("^dn=uid=").unwrap()],
		passthrough_binds: vec![],
		service_account: None,
		bind_service_account: false,
		allow_search: true,
		allow_connection_reuse: false,
		forward_anonymous_binds: false,
	}
}

async fn mount_verifier(server: &MockServer, accepted_password: &str) {
	Mock::given(method("POST"))
		.and(path("/validate/check"))
		.and(body_string_contains(format!("pass={accepted_password}")))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"result": {"status": true, "value": true}
		})))
		.mount(server)
		.await;
	Mock::given(method("POST"))
		.and(path("/validate/check"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"result": {"status": true, "value": false}
		})))
		.mount(server)
		.await;
}

#[tokio::test]
async fn simple_success_calls_the_verifier_exactly_once() {
	let server = MockServer::start().await;
	mount_verifier(&server, "secret").await;

	let shared = bare_shared(&server, None);
	let mut state = ConnectionState::new(shared, Box::new(FakeUpstreamLdap::new(vec![])));

	let actions = state.handle(bind(1, "uid=hugo,cn=users,dc=test,dc=local", "secret")).await;
	assert!(matches!(actions.as_slice(), [Action::Reply(ldap_tfa_proxy::ldap::codec::Response::Bind { code: ResultCode::Success, .. })]));

	let requests = server.received_requests().await.unwrap();
	assert_eq!(requests.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_bind_within_cache_ttl_hits_the_bind_cache_not_the_verifier() {
	let server = MockServer::start().await;
	mount_verifier(&server, "secret").await;

	let bind_cache = BindCache::new(Duration::from_secs(2));
	let shared = bare_shared(&server, Some(bind_cache));
	let mut state = ConnectionState::new(shared.clone(), Box::new(FakeUpstreamLdap::new(vec![])));

	state.handle(bind(1, "uid=hugo,dc=test", "secret")).await;
	tokio::time::advance(Duration::from_millis(500)).await;

	// A fresh connection (its own state machine) performs the second bind,
	// since `allow_connection_reuse` is disabled; the bind cache is what's
	// shared across connections.
	let mut second = ConnectionState::new(shared, Box::new(FakeUpstreamLdap::new(vec![])));
	let actions = second.handle(bind(1, "uid=hugo,dc=test", "secret")).await;
	assert!(matches!(actions.as_slice(), [Action::Reply(ldap_tfa_proxy::ldap::codec::Response::Bind { code: ResultCode::Success, .. })]));

	let requests = server.received_requests().await.unwrap();
	assert_eq!(requests.len(), 1, "second bind should have been satisfied from the bind cache");
}

#[tokio::test(start_paused = true)]
async fn bind_cache_entry_expires_after_its_ttl() {
	let server = MockServer::start().await;
	mount_verifier(&server, "secret").await;

	let bind_cache = BindCache::new(Duration::from_secs(2));
	let shared = bare_shared(&server, Some(bind_cache));

	let mut first = ConnectionState::new(shared.clone(), Box::new(FakeUpstreamLdap::new(vec![])));
	first.handle(bind(1, "uid=hugo,dc=test", "secret")).await;
	tokio::time::advance(Duration::from_secs(3)).await;

	let mut second = ConnectionState::new(shared, Box::new(FakeUpstreamLdap::new(vec![])));
	second.handle(bind(1, "uid=hugo,dc=test", "secret")).await;

	let requests = server.received_requests().await.unwrap();
	assert_eq!(requests.len(), 2, "expired bind cache entry should force a second verifier call");
}

#[tokio::test]
async fn preamble_on_a_non_passthrough_connection_never_seeds_the_app_cache() {
	let server = MockServer::start().await;
	mount_verifier(&server, "secret").await;

	let app_cache = AppCache::new(Duration::from_secs(60), false);
	let mut shared = bare_shared(&server, None);
	shared.app_cache = Some(app_cache.clone());
	shared.preamble = Some(PreambleDetector::new("objectclass", "App-"));

	// This connection binds as a regular (verifier-delegated) user, not a
	// passthrough identity, so forwarded_passthrough_bind stays false.
	let upstream = Box::new(FakeUpstreamLdap::new(vec![Expectation::Search {
		base_dn: "dc=test".into(),
		scope: SearchScope::WholeSubtree,
		filter: "(objectclass=App-markerSecret)".into(),
		result: vec![ldap_tfa_proxy::ldap::upstream::SearchEntry {
			dn: "uid=hugo,dc=test".into(),
			attributes: std::collections::HashMap::new(),
		}],
	}]));
	let mut state = ConnectionState::new(shared, upstream);

	state.handle(bind(1, "uid=hugo,cn=users,dc=test,dc=local", "secret")).await;
	state
		.handle(search(
			2,
			"dc=test",
			Some(Filter::Equality { attribute: "objectclass".into(), value: b"App-markerSecret".to_vec() }),
		))
		.await;

	assert_eq!(app_cache.lookup("uid=hugo,dc=test").await, None);
}

#[tokio::test]
async fn connection_reuse_enabled_resets_passthrough_flag_for_the_second_bind() {
	let server = MockServer::start().await;

	let mut shared = bare_shared(&server, None);
	shared.allow_connection_reuse = true;
	shared.passthrough_binds = vec!["uid=passthrough,dc=test".to_owned()];

	let upstream = Box::new(FakeUpstreamLdap::new(vec![
		Expectation::Bind { dn: "uid=passthrough,dc=test".into(), password: "x".into(), outcome: Ok(()) },
		Expectation::Bind { dn: "uid=passthrough,dc=test".into(), password: "x".into(), outcome: Ok(()) },
	]));
	let mut state = ConnectionState::new(shared, upstream);

	let first = state.handle(bind(1, "uid=passthrough,dc=test", "x")).await;
	assert!(matches!(first.as_slice(), [Action::Reply(ldap_tfa_proxy::ldap::codec::Response::Bind { code: ResultCode::Success, .. })]));

	let second = state.handle(bind(2, "uid=passthrough,dc=test", "x")).await;
	assert!(matches!(second.as_slice(), [Action::Reply(ldap_tfa_proxy::ldap::codec::Response::Bind { code: ResultCode::Success, .. })]));
}
