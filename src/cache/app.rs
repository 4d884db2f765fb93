//! AppCache (C3): remembers the last app marker seen for a DN, as
//! inferred by the preamble detector from a passthrough-bound
//! connection's search traffic.

use std::time::Duration;

use super::TimedCache;

/// Caches the last-seen app marker for a DN.
///
/// DN normalization (case-folding) is applied symmetrically at every
/// public entry point, per the "explicit normalizer" design note: the
/// cache does not try to fold normalization into the key type itself.
#[derive(Debug, Clone)]
pub struct AppCache {
	/// The underlying generic TTL cache, keyed by (normalized) DN.
	inner: TimedCache<String, String>,
	/// Whether DNs are case-folded before use as a cache key.
	case_insensitive: bool,
}

impl AppCache {
	/// Construct a new app cache with the given TTL and case-folding policy.
	#[must_use]
	pub fn new(timeout: Duration, case_insensitive: bool) -> Self {
		Self { inner: TimedCache::new(timeout), case_insensitive }
	}

	/// Normalize a DN the way this cache instance is configured to.
	fn normalize(&self, dn: &str) -> String {
		if self.case_insensitive {
			dn.to_lowercase()
		} else {
			dn.to_owned()
		}
	}

	/// Record that `dn` was last seen preceded by `marker`.
	pub async fn insert(&self, dn: &str, marker: &str) {
		self.inner.add(self.normalize(dn), marker.to_owned()).await;
	}

	/// Return the marker last recorded for `dn`, if still live.
	pub async fn lookup(&self, dn: &str) -> Option<String> {
		self.inner.lookup(self.normalize(dn)).await
	}

	/// Remove the `(dn, marker)` association if it is still current.
	pub async fn remove(&self, dn: &str, marker: &str) {
		self.inner.remove(self.normalize(dn), marker.to_owned()).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn case_insensitive_lookup_matches_regardless_of_case() {
		let cache = AppCache::new(Duration::from_secs(5), true);
		cache.insert("UID=Hugo,DC=test", "ownCloud").await;
		assert_eq!(cache.lookup("uid=hugo,dc=test").await.as_deref(), Some("ownCloud"));
	}

	#[tokio::test(start_paused = true)]
	async fn case_sensitive_lookup_requires_exact_match() {
		let cache = AppCache::new(Duration::from_secs(5), false);
		cache.insert("UID=Hugo,DC=test", "ownCloud").await;
		assert_eq!(cache.lookup("uid=hugo,dc=test").await, None);
		assert_eq!(cache.lookup("UID=Hugo,DC=test").await.as_deref(), Some("ownCloud"));
	}

	#[tokio::test(start_paused = true)]
	async fn entry_expires_after_ttl() {
		let cache = AppCache::new(Duration::from_secs(1), false);
		cache.insert("uid=hugo,dc=test", "ownCloud").await;
		tokio::time::advance(Duration::from_secs(2)).await;
		assert_eq!(cache.lookup("uid=hugo,dc=test").await, None);
	}
}
