//! Realm mapping strategies (C6): deriving the verifier realm for an
//! incoming bind, using either a fixed realm or the app marker
//! recorded by the preamble detector.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{cache::app::AppCache, error::RealmMappingError};

/// Resolves the verifier realm for an incoming bind DN.
#[async_trait]
pub trait RealmMapper: Send + Sync + std::fmt::Debug {
	/// Resolve `dn` to an `(app marker, realm)` pair, or fail with
	/// [`RealmMappingError`]. The marker is the cache-discriminating
	/// identity the bind cache keys on (§3's "app-marker"); the realm is
	/// what the verifier is actually asked about. The two strategies
	/// below differ in whether those can diverge: [`StaticRealmMapper`]
	/// has no marker concept of its own, so the two coincide; a
	/// [`AppCacheRealmMapper`]'s `mappings` table can send two distinct
	/// markers to the same realm, so returning the marker separately
	/// keeps two different app identities from colliding in the bind
	/// cache even when they share a realm.
	async fn resolve(&self, dn: &str) -> Result<(String, String), RealmMappingError>;
}

/// `static` strategy: every DN maps to the same configured realm.
#[derive(Debug, Clone)]
pub struct StaticRealmMapper {
	/// The realm every DN resolves to.
	realm: String,
}

impl StaticRealmMapper {
	/// Construct a mapper that always resolves to `realm`.
	#[must_use]
	pub fn new(realm: impl Into<String>) -> Self {
		Self { realm: realm.into() }
	}
}

#[async_trait]
impl RealmMapper for StaticRealmMapper {
	async fn resolve(&self, _dn: &str) -> Result<(String, String), RealmMappingError> {
		Ok((self.realm.clone(), self.realm.clone()))
	}
}

/// `preamble` strategy: looks up the app marker the [`AppCache`] has
/// recorded for `dn` and translates it through a configured
/// marker-to-realm table.
#[derive(Debug, Clone)]
pub struct AppCacheRealmMapper {
	/// Shared app cache, populated by the preamble detector.
	app_cache: AppCache,
	/// Marker -> realm table.
	mappings: HashMap<String, String>,
}

impl AppCacheRealmMapper {
	/// Construct a mapper reading from `app_cache` through `mappings`.
	#[must_use]
	pub fn new(app_cache: AppCache, mappings: HashMap<String, String>) -> Self {
		Self { app_cache, mappings }
	}
}

#[async_trait]
impl RealmMapper for AppCacheRealmMapper {
	async fn resolve(&self, dn: &str) -> Result<(String, String), RealmMappingError> {
		let marker =
			self.app_cache.lookup(dn).await.ok_or_else(|| RealmMappingError::NoPreamble(dn.to_owned()))?;
		let realm = self
			.mappings
			.get(&marker)
			.cloned()
			.ok_or_else(|| RealmMappingError::UnmappedMarker(marker.clone()))?;
		Ok((marker, realm))
	}
}
