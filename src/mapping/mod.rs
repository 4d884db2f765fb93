//! Strategy-pattern mappers (C5, C6) translating a bind DN into the
//! user/realm pair the verifier is asked about.

pub mod realm;
pub mod user;
