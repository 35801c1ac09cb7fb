//! Bounded, timestamped, in-process stale cache used as the last fallback tier.
//!
//! Expiry is lazy: an entry older than the tolerance is deleted by the read that finds it. Reads
//! never refresh timestamps. When full, the entry with the smallest timestamp is evicted through
//! an ordered index instead of a scan.

// std
use std::collections::{BTreeMap, HashMap};
// crates.io
use tokio::sync::Mutex;
// self
use crate::{
	_prelude::*,
	clock::{Clock, duration_millis},
	config::CachingConfig,
	metrics,
	secret::{ConsumerSecret, StaleEntry},
};

/// Result of a local stale lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StaleLookup {
	/// Entry owned by the requested consumer and within tolerance.
	Hit(ConsumerSecret),
	/// No entry under the key.
	Miss,
	/// Entry older than the tolerance; it has been removed.
	Expired,
	/// Entry owned by another consumer; it has been removed.
	Poisoned {
		/// Consumer id found in the discarded payload.
		owner: String,
	},
}
impl StaleLookup {
	/// The served secret, if any.
	pub fn into_secret(self) -> Option<ConsumerSecret> {
		match self {
			Self::Hit(secret) => Some(secret),
			_ => None,
		}
	}
}

/// Per-instance stale cache, independent of any [`crate::CacheBackend`].
#[derive(Debug)]
pub struct LocalStaleCache {
	capacity: usize,
	tolerance_millis: i64,
	clock: Arc<dyn Clock>,
	inner: Mutex<StaleIndex>,
}
impl LocalStaleCache {
	/// Create a cache sized and aged by `config`.
	pub fn new(config: &CachingConfig, clock: Arc<dyn Clock>) -> Self {
		Self::with_limits(config.max_memory_entries, config.stale_tolerance(), clock)
	}

	/// Create a cache with explicit limits.
	pub fn with_limits(capacity: usize, tolerance: Duration, clock: Arc<dyn Clock>) -> Self {
		Self {
			capacity: capacity.max(1),
			tolerance_millis: duration_millis(tolerance),
			clock,
			inner: Mutex::new(StaleIndex::default()),
		}
	}

	/// Maximum number of entries.
	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Insert or refresh `key`, stamping it with the current time.
	///
	/// Returns the key evicted to make room, if any. Ownership of `data` is not checked here;
	/// the coordinator only writes secrets owned by the consumer in the key, and reads re-check.
	pub async fn insert(&self, key: &str, data: ConsumerSecret) -> Option<String> {
		let timestamp = self.clock.now_millis();

		self.store(key, StaleEntry { data, timestamp }).await
	}

	/// Look up `key` on behalf of `consumer_id`, removing expired or poisoned entries.
	pub async fn lookup(&self, key: &str, consumer_id: &str) -> StaleLookup {
		let now = self.clock.now_millis();
		let mut index = self.inner.lock().await;
		let Some(entry) = index.entries.get(key).map(|slot| slot.entry.clone()) else {
			return StaleLookup::Miss;
		};

		if !entry.data.belongs_to(consumer_id) {
			index.remove(key);

			return StaleLookup::Poisoned { owner: entry.data.consumer.id };
		}
		if entry.age_millis(now) > self.tolerance_millis {
			index.remove(key);

			return StaleLookup::Expired;
		}

		StaleLookup::Hit(entry.data)
	}

	/// Remove `key`; returns whether it was present.
	pub async fn remove(&self, key: &str) -> bool {
		self.inner.lock().await.remove(key)
	}

	/// Whether `key` is currently stored, regardless of age or owner.
	pub async fn contains(&self, key: &str) -> bool {
		self.inner.lock().await.entries.contains_key(key)
	}

	/// Number of stored entries, including ones that would read as expired.
	pub async fn len(&self) -> usize {
		self.inner.lock().await.entries.len()
	}

	/// Whether the cache holds no entries.
	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	/// Drop every entry.
	pub async fn clear(&self) {
		let mut index = self.inner.lock().await;

		index.entries.clear();
		index.order.clear();
	}

	#[doc(hidden)]
	/// Store a raw entry with an explicit timestamp, bypassing the clock.
	///
	/// Capacity is enforced exactly as in [`Self::insert`].
	pub async fn insert_entry(&self, key: &str, entry: StaleEntry) -> Option<String> {
		self.store(key, entry).await
	}

	async fn store(&self, key: &str, entry: StaleEntry) -> Option<String> {
		let mut index = self.inner.lock().await;
		let mut evicted = None;

		if !index.entries.contains_key(key) && index.entries.len() >= self.capacity {
			evicted = index.evict_oldest();

			if let Some(evicted) = &evicted {
				metrics::record_local_eviction();

				tracing::debug!(key = %evicted, "local stale cache evicted oldest entry");
			}
		}

		index.insert(key, entry);

		evicted
	}
}

#[derive(Debug)]
struct Slot {
	entry: StaleEntry,
	seq: u64,
}

#[derive(Debug, Default)]
struct StaleIndex {
	entries: HashMap<String, Slot>,
	// (timestamp, seq) orders by age; seq breaks timestamp ties by insertion.
	order: BTreeMap<(i64, u64), String>,
	next_seq: u64,
}
impl StaleIndex {
	fn insert(&mut self, key: &str, entry: StaleEntry) {
		let seq = self.next_seq;
		let rank = (entry.timestamp, seq);

		self.next_seq += 1;

		if let Some(previous) = self.entries.insert(key.to_owned(), Slot { entry, seq }) {
			self.order.remove(&(previous.entry.timestamp, previous.seq));
		}

		self.order.insert(rank, key.to_owned());
	}

	fn remove(&mut self, key: &str) -> bool {
		match self.entries.remove(key) {
			Some(slot) => {
				self.order.remove(&(slot.entry.timestamp, slot.seq));

				true
			},
			None => false,
		}
	}

	fn evict_oldest(&mut self) -> Option<String> {
		let (_, key) = self.order.pop_first()?;

		self.entries.remove(&key);

		Some(key)
	}
}
