//! BindCache (C2): remembers credential tuples that were recently
//! verified successfully, so a client retrying the same bind within the
//! TTL does not cause a second round-trip to the verifier.

use std::time::Duration;

use super::TimedCache;

/// The key a [`BindCache`] is indexed by: `(dn, app marker, password)`.
///
/// All three fields participate in equality, matching the bind
/// credential tuple from the data model.
pub type BindKey = (String, String, String);

/// Caches recently-verified `(dn, app marker, password)` triples.
#[derive(Debug, Clone)]
pub struct BindCache {
	/// The underlying generic TTL cache; the value is a unit marker,
	/// since only membership matters.
	inner: TimedCache<BindKey, ()>,
}

impl BindCache {
	/// Construct a new bind cache with the given TTL.
	#[must_use]
	pub fn new(timeout: Duration) -> Self {
		Self { inner: TimedCache::new(timeout) }
	}

	/// Record that `(dn, marker, password)` was just verified.
	pub async fn insert(&self, dn: &str, marker: &str, password: &str) {
		self.inner.add((dn.to_owned(), marker.to_owned(), password.to_owned()), ()).await;
	}

	/// Return whether `(dn, marker, password)` was verified within the TTL.
	pub async fn contains(&self, dn: &str, marker: &str, password: &str) -> bool {
		self.inner.lookup((dn.to_owned(), marker.to_owned(), password.to_owned())).await.is_some()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn repeated_bind_within_ttl_is_cached() {
		let cache = BindCache::new(Duration::from_secs(2));
		cache.insert("uid=hugo,dc=test", "default", "secret").await;
		tokio::time::advance(Duration::from_millis(500)).await;
		assert!(cache.contains("uid=hugo,dc=test", "default", "secret").await);
	}

	#[tokio::test(start_paused = true)]
	async fn bind_expires_after_ttl() {
		let cache = BindCache::new(Duration::from_secs(2));
		cache.insert("uid=hugo,dc=test", "default", "secret").await;
		tokio::time::advance(Duration::from_secs(3)).await;
		assert!(!cache.contains("uid=hugo,dc=test", "default", "secret").await);
	}

	#[tokio::test(start_paused = true)]
	async fn different_password_is_a_different_key() {
		let cache = BindCache::new(Duration::from_secs(2));
		cache.insert("uid=hugo,dc=test", "default", "secret").await;
		assert!(!cache.contains("uid=hugo,dc=test", "default", "wrong").await);
	}
}
