//! Wire codec: decoding client PDUs and encoding the proxy's replies.
//!
//! Decoding is delegated entirely to [`ldap_parser`]: a real BER/ASN.1
//! decoder for the client-originated messages this proxy has to
//! understand. No crate in the ecosystem exposes LDAP *response*
//! encoding (every LDAP crate is either a client, which only encodes
//! requests, or a parser, which only decodes), so the handful of PDUs
//! the proxy ever sends back are BER-encoded by hand against the
//! RFC 4511 tag numbers below.

use asn1_rs::FromBer;
use bytes::{Buf, BufMut, BytesMut};
use ldap_parser::ldap as wire;
use tokio_util::codec::{Decoder, Encoder};

use std::collections::HashMap;

use super::proto::{Message, ResultCode, UnsupportedOp};

/// [`Decoder`]/[`Encoder`] for one client connection.
#[derive(Debug, Default)]
pub struct LdapCodec;

impl Decoder for LdapCodec {
	type Item = Message;
	type Error = anyhow::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
		if src.is_empty() {
			return Ok(None);
		}
		match wire::LdapMessage::from_ber(&src[..]) {
			Ok((remaining, msg)) => {
				let consumed = src.len() - remaining.len();
				let message = Message::try_from(msg)?;
				src.advance(consumed);
				Ok(Some(message))
			}
			// Incomplete input: wait for more bytes from the socket.
			Err(asn1_rs::nom::Err::Incomplete(_)) => Ok(None),
			// A genuine decoding failure; RFC 4511 gives no way to
			// reply meaningfully to bytes that aren't a valid message,
			// so the connection is simply closed.
			Err(err) => Err(anyhow::anyhow!("malformed LDAP message: {err:?}")),
		}
	}
}

/// A response PDU the proxy can emit.
#[derive(Debug, Clone)]
pub enum Response {
	/// A `BindResponse`.
	Bind {
		/// The message ID being replied to.
		id: i32,
		/// The result code to report.
		code: ResultCode,
	},
	/// An `LDAPResult`-shaped response for some other operation
	/// (search-done, or a rejection of an unsupported request).
	Result {
		/// The message ID being replied to.
		id: i32,
		/// The RFC 4511 application tag of the response PDU
		/// (e.g. 5 for `SearchResultDone`, 7 for `ModifyResponse`).
		tag: u8,
		/// The result code to report.
		code: ResultCode,
	},
	/// A `SearchResultEntry`, relaying one entry the backend returned.
	SearchEntry {
		/// The message ID being replied to.
		id: i32,
		/// The entry's distinguished name.
		dn: String,
		/// Its attributes.
		attributes: HashMap<String, Vec<String>>,
	},
}

impl Encoder<Response> for LdapCodec {
	type Error = anyhow::Error;

	fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
		let (id, op) = match item {
			Response::Bind { id, code } => (id, ber::application_constructed(1, &encode_ldap_result(code))),
			Response::Result { id, tag, code } => {
				(id, ber::application_constructed(tag, &encode_ldap_result(code)))
			}
			Response::SearchEntry { id, dn, attributes } => {
				(id, ber::application_constructed(4, &encode_search_entry(&dn, &attributes)))
			}
		};
		let message_id = ber::integer(id);
		let envelope = ber::sequence(&[message_id, op].concat());
		dst.put_slice(&envelope);
		Ok(())
	}
}

/// Encode the common `LDAPResult` fields shared by every response PDU:
/// `resultCode ENUMERATED`, `matchedDN LDAPDN` (always empty), and
/// `diagnosticMessage LDAPString` (always empty). The proxy never has
/// a useful matched-DN or diagnostic string to report back to clients.
fn encode_ldap_result(code: ResultCode) -> Vec<u8> {
	let mut out = ber::enumerated(code.code());
	out.extend(ber::octet_string(b""));
	out.extend(ber::octet_string(b""));
	out
}

/// Encode a `SearchResultEntry`'s body: `objectName LDAPDN, attributes
/// PartialAttributeList`. Attribute order is whatever the caller's map
/// iteration yields; RFC 4511 does not require a particular order.
fn encode_search_entry(dn: &str, attributes: &HashMap<String, Vec<String>>) -> Vec<u8> {
	let mut partial_attribute_list = Vec::new();
	for (name, values) in attributes {
		let mut set_of_values = Vec::new();
		for value in values {
			set_of_values.extend(ber::octet_string(value.as_bytes()));
		}
		let mut partial_attribute = ber::octet_string(name.as_bytes());
		partial_attribute.extend(ber::set(&set_of_values));
		partial_attribute_list.extend(ber::sequence(&partial_attribute));
	}
	let mut out = ber::octet_string(dn.as_bytes());
	out.extend(ber::sequence(&partial_attribute_list));
	out
}

/// A minimal BER (X.690) TLV writer covering only the primitives this
/// codec needs to emit: definite-length tags on values no larger than
/// a handful of bytes, so the multi-byte length form is never required.
mod ber {
	/// Encode a length in BER definite form: short form below 128 bytes,
	/// long form (a count-of-length-bytes octet followed by the
	/// big-endian length) above it. Search entries can easily carry a DN
	/// or attribute value longer than 127 bytes, so both forms are needed
	/// here, unlike the fixed-size `LDAPResult` PDUs.
	fn length(len: usize) -> Vec<u8> {
		if len <= 0x7f {
			return vec![u8::try_from(len).unwrap_or(0x7f)];
		}
		let mut bytes = len.to_be_bytes().to_vec();
		while bytes.first() == Some(&0) && bytes.len() > 1 {
			bytes.remove(0);
		}
		let mut out = vec![0x80 | u8::try_from(bytes.len()).unwrap_or(0x7f)];
		out.extend(bytes);
		out
	}

	/// Build a single TLV with an explicit universal/application tag byte.
	fn tlv(tag: u8, value: &[u8]) -> Vec<u8> {
		let mut out = vec![tag];
		out.extend(length(value.len()));
		out.extend_from_slice(value);
		out
	}

	/// `SEQUENCE` (universal, constructed, tag 0x30): the envelope of
	/// every `LDAPMessage`.
	pub fn sequence(value: &[u8]) -> Vec<u8> {
		tlv(0x30, value)
	}

	/// `INTEGER` (universal, primitive, tag 0x02), used for `messageID`.
	pub fn integer(value: i32) -> Vec<u8> {
		tlv(0x02, &minimal_be_bytes(value))
	}

	/// `ENUMERATED` (universal, primitive, tag 0x0a), used for `resultCode`.
	pub fn enumerated(value: u32) -> Vec<u8> {
		let value = i32::try_from(value).unwrap_or(i32::MAX);
		tlv(0x0a, &minimal_be_bytes(value))
	}

	/// `OCTET STRING` (universal, primitive, tag 0x04), used for
	/// `matchedDN`/`diagnosticMessage`/attribute names and values.
	pub fn octet_string(value: &[u8]) -> Vec<u8> {
		tlv(0x04, value)
	}

	/// `SET OF` (universal, constructed, tag 0x31), used for an
	/// attribute's value list.
	pub fn set(value: &[u8]) -> Vec<u8> {
		tlv(0x31, value)
	}

	/// An `[APPLICATION n]` constructed tag, used for `protocolOp` choices.
	pub fn application_constructed(app_tag: u8, value: &[u8]) -> Vec<u8> {
		// Class APPLICATION (0b01) | constructed (0b1) | tag number.
		tlv(0b0110_0000 | app_tag, value)
	}

	/// The minimal big-endian two's-complement encoding of `value`, as
	/// BER's `INTEGER`/`ENUMERATED` require.
	pub(super) fn minimal_be_bytes(value: i32) -> Vec<u8> {
		let bytes = value.to_be_bytes();
		let mut start = 0;
		while start < bytes.len() - 1
			&& ((bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
				|| (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0))
		{
			start += 1;
		}
		bytes[start..].to_vec()
	}
}

/// Build the response PDU that corresponds to an unsupported request,
/// given the message ID it arrived with. Returns `None` for operations
/// with no defined response (abandon), matching [`super::proto::UnsupportedOp::response_tag`].
pub fn reject_unsupported(id: i32, op: UnsupportedOp) -> Option<Response> {
	op.response_tag()
		.map(|tag| Response::Result { id, tag, code: ResultCode::InsufficientAccessRights })
}
