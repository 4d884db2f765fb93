//! Owned, lifetime-free representations of the LDAPv3 values the proxy
//! actually needs (RFC 4511), converted from the borrowed values that
//! [`ldap_parser`] decodes off the wire.
//!
//! The proxy only ever *constructs* a handful of response PDUs
//! (`BindResponse`, a bare `LDAPResult`, and relayed
//! `SearchResultEntry`/`SearchResultDone` messages); everything else it
//! only needs to recognize and reject. Owned types make that
//! distinction easy to keep straight and let [`crate::state`] hold a
//! request across `.await` points without fighting borrow lifetimes.

use ldap_parser::ldap as wire;

/// One decoded LDAP message: an envelope around a single operation.
#[derive(Debug, Clone)]
pub struct Message {
	/// The message ID the client chose; echoed back on every reply.
	pub id: i32,
	/// The decoded operation.
	pub op: ProtocolOp,
}

/// The LDAP operations the proxy can receive from a client.
#[derive(Debug, Clone)]
pub enum ProtocolOp {
	/// A simple-auth bind request.
	BindRequest(BindRequest),
	/// A search request.
	SearchRequest(SearchRequest),
	/// An unbind request (no reply expected).
	UnbindRequest,
	/// Anything else the proxy does not support: modify, add, delete,
	/// moddn, compare, abandon, extended, ... Tagged with the wire op
	/// number so a response of the matching kind can be built.
	Unsupported(UnsupportedOp),
}

/// A client operation the proxy does not implement, kept only long
/// enough to reply with a matching, correctly-tagged rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedOp {
	/// `ModifyRequest` (tag 6) -> reply with `ModifyResponse` (tag 7).
	Modify,
	/// `AddRequest` (tag 8) -> reply with `AddResponse` (tag 9).
	Add,
	/// `DelRequest` (tag 10) -> reply with `DelResponse` (tag 11).
	Delete,
	/// `ModDnRequest` (tag 12) -> reply with `ModDnResponse` (tag 13).
	ModDn,
	/// `CompareRequest` (tag 14) -> reply with `CompareResponse` (tag 15).
	Compare,
	/// `ExtendedRequest` (tag 23) -> reply with `ExtendedResponse` (tag 24).
	Extended,
	/// `AbandonRequest` (tag 16); RFC 4511 defines no response for this
	/// operation, so the proxy silently drops it instead of replying.
	Abandon,
}

impl UnsupportedOp {
	/// The wire tag of the response PDU that must be sent back, or
	/// `None` if the operation has no defined response (Abandon).
	#[must_use]
	pub fn response_tag(self) -> Option<u8> {
		match self {
			Self::Modify => Some(7),
			Self::Add => Some(9),
			Self::Delete => Some(11),
			Self::ModDn => Some(13),
			Self::Compare => Some(15),
			Self::Extended => Some(24),
			Self::Abandon => None,
		}
	}
}

/// A simple-auth bind request.
#[derive(Debug, Clone)]
pub struct BindRequest {
	/// The LDAP protocol version the client announced (always 3 in practice).
	pub version: u8,
	/// The DN the client wants to bind as; empty for an anonymous bind.
	pub dn: String,
	/// The cleartext password. SASL binds are not supported and are
	/// decoded as an [`UnsupportedOp`] instead.
	pub password: String,
}

/// A search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
	/// The search base DN.
	pub base_dn: String,
	/// The scope the client requested; forwarded to the backend
	/// unchanged rather than widened to a subtree search.
	pub scope: SearchScope,
	/// The search filter, or `None` for a filter this proxy does not
	/// need to understand beyond "it is not empty".
	pub filter: Option<Filter>,
}

/// A search's scope (RFC 4511 §4.5.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
	/// The base object only.
	BaseObject,
	/// The base object's immediate subordinates.
	SingleLevel,
	/// The base object and its entire subtree.
	WholeSubtree,
}

/// A recursive LDAP search filter, pared down to the variants the
/// preamble detector (§4.4) actually has to walk, plus an opaque
/// `Other` bucket so unrelated filter shapes still round-trip through
/// decode without being lossy about *that* a term existed.
#[derive(Debug, Clone)]
pub enum Filter {
	/// `(&(...)(...))`
	And(Vec<Filter>),
	/// `(|(...)(...))`
	Or(Vec<Filter>),
	/// `(attr=value)`
	Equality {
		/// The attribute name (compared case-insensitively).
		attribute: String,
		/// The asserted value.
		value: Vec<u8>,
	},
	/// Any filter term the preamble detector does not need to inspect
	/// (substrings, present, ordering, approx, extensible, not).
	Other,
}

/// An LDAP result code (a small, non-exhaustive subset RFC 4511 defines).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
	/// 0 - the operation succeeded.
	Success,
	/// 49 - bad credentials, or the proxy's all-purpose "no" for auth.
	InvalidCredentials,
	/// 50 - the client is not permitted to perform the operation.
	InsufficientAccessRights,
}

impl ResultCode {
	/// The RFC 4511 wire value.
	#[must_use]
	pub fn code(self) -> u32 {
		match self {
			Self::Success => 0,
			Self::InvalidCredentials => 49,
			Self::InsufficientAccessRights => 50,
		}
	}
}

/// Convert a borrowed, just-decoded wire message into an owned one.
impl TryFrom<wire::LdapMessage<'_>> for Message {
	type Error = anyhow::Error;

	fn try_from(msg: wire::LdapMessage<'_>) -> Result<Self, Self::Error> {
		let id = i64::from(msg.message_id.0).try_into().unwrap_or(i32::MAX);
		let op = match msg.protocol_op {
			wire::ProtocolOp::BindRequest(req) => {
				let password = match req.authentication {
					wire::AuthenticationChoice::Simple(pw) => {
						String::from_utf8_lossy(&pw).into_owned()
					}
					wire::AuthenticationChoice::Sasl(_) => {
						anyhow::bail!("SASL bind authentication is not supported")
					}
				};
				ProtocolOp::BindRequest(BindRequest {
					version: req.version,
					dn: req.name.0.into_owned(),
					password,
				})
			}
			wire::ProtocolOp::SearchRequest(req) => ProtocolOp::SearchRequest(SearchRequest {
				base_dn: req.base_object.0.into_owned(),
				scope: convert_scope(req.scope),
				filter: Some(convert_filter(&req.filter)),
			}),
			wire::ProtocolOp::UnbindRequest => ProtocolOp::UnbindRequest,
			wire::ProtocolOp::ModifyRequest(_) => ProtocolOp::Unsupported(UnsupportedOp::Modify),
			wire::ProtocolOp::AddRequest(_) => ProtocolOp::Unsupported(UnsupportedOp::Add),
			wire::ProtocolOp::DelRequest(_) => ProtocolOp::Unsupported(UnsupportedOp::Delete),
			wire::ProtocolOp::ModDnRequest(_) => ProtocolOp::Unsupported(UnsupportedOp::ModDn),
			wire::ProtocolOp::CompareRequest(_) => ProtocolOp::Unsupported(UnsupportedOp::Compare),
			wire::ProtocolOp::AbandonRequest(_) => ProtocolOp::Unsupported(UnsupportedOp::Abandon),
			wire::ProtocolOp::ExtendedRequest(_) => ProtocolOp::Unsupported(UnsupportedOp::Extended),
			other => anyhow::bail!("unexpected response-shaped PDU from a client: {other:?}"),
		};
		Ok(Self { id, op })
	}
}

/// Convert a borrowed wire search scope into an owned one. Any value
/// outside RFC 4511's three defined scopes is treated as the widest,
/// `WholeSubtree`, rather than rejected outright.
fn convert_scope(scope: wire::SearchScope) -> SearchScope {
	match scope {
		wire::SearchScope::BaseObject => SearchScope::BaseObject,
		wire::SearchScope::SingleLevel => SearchScope::SingleLevel,
		_ => SearchScope::WholeSubtree,
	}
}

/// Recursively convert a borrowed wire filter into an owned one.
fn convert_filter(filter: &ldap_parser::filter::Filter<'_>) -> Filter {
	use ldap_parser::filter::Filter as WireFilter;
	match filter {
		WireFilter::And(terms) => Filter::And(terms.iter().map(convert_filter).collect()),
		WireFilter::Or(terms) => Filter::Or(terms.iter().map(convert_filter).collect()),
		WireFilter::EqualityMatch(ava) => Filter::Equality {
			attribute: ava.attribute_desc.0.clone().into_owned(),
			value: ava.assertion_value.clone().into_owned(),
		},
		_ => Filter::Other,
	}
}
