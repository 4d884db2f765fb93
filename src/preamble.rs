//! Preamble detector (C4): infers an application identity from the
//! search a passthrough-bound client performs just before a user's
//! bind, by looking for an equality term of the shape
//! `(objectclass=App-<marker>)`, possibly nested under `&`/`|`.

use crate::ldap::{proto::Filter, upstream::SearchEntry};

/// Attribute and value-prefix convention used to tag an app marker
/// onto a search filter (`(objectclass=App-ownCloud)` by default).
#[derive(Debug, Clone)]
pub struct PreambleDetector {
	/// The attribute name the marker is carried on (compared
	/// case-insensitively), e.g. `objectclass`.
	attribute: String,
	/// The literal prefix a matching value must start with, e.g. `App-`.
	value_prefix: String,
}

impl PreambleDetector {
	/// Construct a detector looking for `value_prefix`-tagged values of
	/// `attribute`.
	#[must_use]
	pub fn new(attribute: impl Into<String>, value_prefix: impl Into<String>) -> Self {
		Self { attribute: attribute.into(), value_prefix: value_prefix.into() }
	}

	/// Recursively search `filter` for the first `(attribute=prefix+marker)`
	/// equality term, returning the marker suffix if found.
	fn find_marker(&self, filter: &Filter) -> Option<String> {
		match filter {
			Filter::And(terms) | Filter::Or(terms) => terms.iter().find_map(|term| self.find_marker(term)),
			Filter::Equality { attribute, value } => {
				if !attribute.eq_ignore_ascii_case(&self.attribute) {
					return None;
				}
				let value = std::str::from_utf8(value).ok()?;
				value.strip_prefix(self.value_prefix.as_str()).map(ToOwned::to_owned)
			}
			Filter::Other => None,
		}
	}

	/// Given the search filter that was sent and the single entry
	/// returned for it, return `(entry DN, app marker)` if this
	/// request/response pair constitutes a login preamble.
	///
	/// Callers are responsible for only invoking this when the search
	/// response consisted of exactly one entry (P7): this function does
	/// not itself see how many entries a search returned.
	#[must_use]
	pub fn detect(&self, filter: Option<&Filter>, entry: &SearchEntry) -> Option<(String, String)> {
		let marker = self.find_marker(filter?)?;
		Some((entry.dn.clone(), marker))
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn entry(dn: &str) -> SearchEntry {
		SearchEntry { dn: dn.to_owned(), attributes: HashMap::new() }
	}

	#[test]
	fn detects_a_top_level_equality_term() {
		let detector = PreambleDetector::new("objectclass", "App-");
		let filter = Filter::Equality { attribute: "objectclass".into(), value: b"App-ownCloud".to_vec() };
		let result = detector.detect(Some(&filter), &entry("uid=hugo,dc=test"));
		assert_eq!(result, Some(("uid=hugo,dc=test".to_owned(), "ownCloud".to_owned())));
	}

	#[test]
	fn detects_a_term_nested_under_or() {
		let detector = PreambleDetector::new("objectclass", "App-");
		let filter = Filter::Or(vec![
			Filter::Equality { attribute: "objectClass".into(), value: b"*".to_vec() },
			Filter::Equality { attribute: "objectClass".into(), value: b"App-markerSecret".to_vec() },
		]);
		let result = detector.detect(Some(&filter), &entry("uid=hugo,dc=test"));
		assert_eq!(result, Some(("uid=hugo,dc=test".to_owned(), "markerSecret".to_owned())));
	}

	#[test]
	fn attribute_match_is_case_insensitive_but_value_prefix_is_not() {
		let detector = PreambleDetector::new("objectclass", "App-");
		let filter = Filter::Equality { attribute: "ObjectClass".into(), value: b"app-ownCloud".to_vec() };
		assert_eq!(detector.detect(Some(&filter), &entry("uid=hugo,dc=test")), None);
	}

	#[test]
	fn no_filter_means_no_preamble() {
		let detector = PreambleDetector::new("objectclass", "App-");
		assert_eq!(detector.detect(None, &entry("uid=hugo,dc=test")), None);
	}

	#[test]
	fn unrelated_filter_finds_nothing() {
		let detector = PreambleDetector::new("objectclass", "App-");
		let filter = Filter::Equality { attribute: "cn".into(), value: b"hugo".to_vec() };
		assert_eq!(detector.detect(Some(&filter), &entry("uid=hugo,dc=test")), None);
	}
}
