//! LDAP wire handling: decoding client requests, encoding the proxy's
//! replies, and driving the upstream (real) LDAP backend.

pub mod codec;
pub mod proto;
pub mod upstream;
