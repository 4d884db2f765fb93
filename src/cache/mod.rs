//! Generic timed cache (C1): a key→value map where every entry is
//! automatically evicted `timeout` after it was last written.
//!
//! The map and its eviction timers are owned exclusively by a single
//! background task (an actor), so `add`/`lookup`/`remove` never race
//! against the eviction sweep: every [`TimedCache`] handle is just a
//! cheap clone of an [`mpsc::Sender`] into that task.

use std::{collections::HashMap, fmt::Debug, hash::Hash, time::Duration};

use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::time::DelayQueue;

pub mod app;
pub mod bind;

/// Commands understood by the cache actor.
enum Command<K, V> {
	/// Insert or overwrite `key` with `value`, (re)starting its TTL.
	Add(K, V),
	/// Look up `key`, replying with the live value if any.
	Lookup(K, oneshot::Sender<Option<V>>),
	/// Remove `key` if its stored value equals `expected`.
	Remove(K, V),
}

/// A single live cache entry.
struct Entry<V> {
	/// The stored value.
	value: V,
	/// When the entry was inserted (or last overwritten).
	inserted_at: tokio::time::Instant,
	/// The handle of the pending eviction timer for this entry.
	expiry_key: tokio_util::time::delay_queue::Key,
}

/// A cheap-to-clone handle to a generic TTL-evicting cache.
///
/// Cloning a [`TimedCache`] shares the same underlying map and timer
/// queue; it does not create an independent cache.
#[derive(Debug)]
pub struct TimedCache<K, V> {
	/// Channel into the actor task that owns the map.
	commands: mpsc::Sender<Command<K, V>>,
	/// How long an entry lives after being added/overwritten.
	timeout: Duration,
}

impl<K, V> Clone for TimedCache<K, V> {
	fn clone(&self) -> Self {
		Self { commands: self.commands.clone(), timeout: self.timeout }
	}
}

impl<K, V> TimedCache<K, V>
where
	K: Eq + Hash + Clone + Debug + Send + 'static,
	V: Clone + PartialEq + Debug + Send + 'static,
{
	/// Construct a new cache with the given TTL and spawn its eviction actor.
	#[must_use]
	pub fn new(timeout: Duration) -> Self {
		let (tx, rx) = mpsc::channel(256);
		tokio::spawn(Actor { entries: HashMap::new(), expirations: DelayQueue::new(), rx, timeout }.run());
		Self { commands: tx, timeout }
	}

	/// Insert `value` for `key`, (re)starting its TTL window.
	pub async fn add(&self, key: K, value: V) {
		// A closed receiver means the actor (and thus the whole cache) is
		// gone; there is nothing useful to do but drop the write.
		let _ = self.commands.send(Command::Add(key, value)).await;
	}

	/// Return the live value for `key`, or `None` if absent or expired.
	pub async fn lookup(&self, key: K) -> Option<V> {
		let (tx, rx) = oneshot::channel();
		if self.commands.send(Command::Lookup(key, tx)).await.is_err() {
			return None;
		}
		rx.await.unwrap_or(None)
	}

	/// Remove `key` if and only if its stored value equals `expected`.
	pub async fn remove(&self, key: K, expected: V) {
		let _ = self.commands.send(Command::Remove(key, expected)).await;
	}

	/// The configured TTL, exposed for tests and diagnostics.
	#[must_use]
	pub fn timeout(&self) -> Duration {
		self.timeout
	}
}

/// The actor task: owns the map and the timer queue exclusively.
struct Actor<K, V> {
	/// Live entries.
	entries: HashMap<K, Entry<V>>,
	/// Pending eviction timers, one per live entry.
	expirations: DelayQueue<K>,
	/// Inbound commands.
	rx: mpsc::Receiver<Command<K, V>>,
	/// How long an entry lives after being added/overwritten.
	timeout: Duration,
}

impl<K, V> Actor<K, V>
where
	K: Eq + Hash + Clone + Debug,
	V: Clone + PartialEq + Debug,
{
	/// Drive the actor until every [`TimedCache`] handle has been dropped.
	async fn run(mut self) {
		loop {
			tokio::select! {
				cmd = self.rx.recv() => {
					match cmd {
						Some(cmd) => self.handle(cmd),
						None => break,
					}
				}
				Some(expired) = self.expirations.next(), if !self.expirations.is_empty() => {
					self.evict(expired.into_inner());
				}
			}
		}
	}

	/// Apply a single command to the map.
	fn handle(&mut self, cmd: Command<K, V>) {
		match cmd {
			Command::Add(key, value) => self.add(key, value),
			Command::Lookup(key, reply) => {
				let _ = reply.send(self.lookup(&key));
			}
			Command::Remove(key, expected) => self.remove(&key, &expected),
		}
	}

	/// See [`TimedCache::add`].
	fn add(&mut self, key: K, value: V) {
		if let Some(existing) = self.entries.get(&key) {
			self.expirations.remove(&existing.expiry_key);
		}
		let expiry_key = self.expirations.insert(key.clone(), self.timeout);
		self.entries.insert(key, Entry { value, inserted_at: tokio::time::Instant::now(), expiry_key });
	}

	/// See [`TimedCache::lookup`].
	fn lookup(&mut self, key: &K) -> Option<V> {
		let timeout = self.timeout;
		match self.entries.get(key) {
			Some(entry) if entry.inserted_at.elapsed() < timeout => Some(entry.value.clone()),
			Some(entry) => {
				tracing::warn!(
					?key,
					inserted_at = ?entry.inserted_at,
					"cache inconsistency: entry outlived its timeout without being evicted"
				);
				None
			}
			None => None,
		}
	}

	/// See [`TimedCache::remove`].
	fn remove(&mut self, key: &K, expected: &V) {
		match self.entries.get(key) {
			Some(entry) if &entry.value == expected => {
				self.expirations.remove(&entry.expiry_key);
				self.entries.remove(key);
			}
			Some(entry) => {
				tracing::warn!(
					?key,
					stored = ?entry.value,
					?expected,
					"refusing conditional remove: stored value does not match"
				);
			}
			None => {}
		}
	}

	/// Invoked when a timer fires; idempotent if the key has already
	/// been overwritten or removed in the meantime.
	fn evict(&mut self, key: K) {
		if let std::collections::hash_map::Entry::Occupied(occupied) = self.entries.entry(key) {
			occupied.remove();
		}
	}
}
