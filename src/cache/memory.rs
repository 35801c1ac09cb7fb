//! Single-instance, in-process backend with TTL and max-entries eviction; no stale tier.

// std
use std::{
	collections::{BTreeMap, HashMap},
	sync::atomic::{AtomicU64, Ordering},
};
// crates.io
use async_trait::async_trait;
use tokio::sync::Mutex;
// self
use crate::{
	_prelude::*,
	cache::{CacheBackend, CacheStats, ensure_owner},
	clock::{Clock, duration_millis},
	config::CachingConfig,
	secret::ConsumerSecret,
};

/// Bounded in-process primary tier.
#[derive(Debug)]
pub struct MemoryBackend {
	ttl: Duration,
	capacity: usize,
	clock: Arc<dyn Clock>,
	store: Mutex<MemoryStore>,
	hits: AtomicU64,
	misses: AtomicU64,
	evictions: AtomicU64,
}
impl MemoryBackend {
	/// Create an empty store sized by `config.max_memory_entries`.
	pub fn new(config: &CachingConfig, clock: Arc<dyn Clock>) -> Self {
		Self {
			ttl: config.ttl(),
			capacity: config.max_memory_entries.max(1),
			clock,
			store: Mutex::new(MemoryStore::default()),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			evictions: AtomicU64::new(0),
		}
	}
}
#[async_trait]
impl CacheBackend for MemoryBackend {
	fn name(&self) -> &'static str {
		"memory"
	}

	async fn get(&self, key: &str) -> Result<Option<ConsumerSecret>> {
		let now = self.clock.now_millis();
		let mut store = self.store.lock().await;
		let lookup =
			store.entries.get(key).map(|entry| (now < entry.expires_at).then(|| entry.value.clone()));
		let value = match lookup {
			Some(Some(value)) => Some(value),
			Some(None) => {
				store.remove(key);

				None
			},
			None => None,
		};
		let counter = if value.is_some() { &self.hits } else { &self.misses };

		counter.fetch_add(1, Ordering::Relaxed);

		Ok(value)
	}

	async fn set(&self, key: &str, value: &ConsumerSecret, ttl: Option<Duration>) -> Result<()> {
		ensure_owner(key, value)?;

		let now = self.clock.now_millis();
		let expires_at = now.saturating_add(duration_millis(ttl.unwrap_or(self.ttl)));
		let mut store = self.store.lock().await;

		if !store.entries.contains_key(key)
			&& store.entries.len() >= self.capacity
			&& let Some(evicted) = store.evict_oldest()
		{
			self.evictions.fetch_add(1, Ordering::Relaxed);

			tracing::debug!(key = %evicted, "memory cache evicted oldest entry");
		}

		store.insert(key, value.clone(), expires_at);

		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<()> {
		self.store.lock().await.remove(key);

		Ok(())
	}

	async fn clear(&self) -> Result<()> {
		let mut store = self.store.lock().await;

		store.entries.clear();
		store.order.clear();

		Ok(())
	}

	async fn stats(&self) -> Result<CacheStats> {
		Ok(CacheStats {
			backend: self.name().into(),
			size: self.store.lock().await.entries.len(),
			stale_size: None,
			hits: Some(self.hits.load(Ordering::Relaxed)),
			misses: Some(self.misses.load(Ordering::Relaxed)),
			evictions: Some(self.evictions.load(Ordering::Relaxed)),
		})
	}

	async fn is_healthy(&self) -> bool {
		true
	}

	async fn connect(&self) -> Result<()> {
		Ok(())
	}

	async fn disconnect(&self) -> Result<()> {
		self.clear().await
	}
}

#[derive(Debug)]
struct MemoryEntry {
	value: ConsumerSecret,
	expires_at: i64,
	seq: u64,
}

/// Entries plus an insertion-ordered index for O(log n) oldest eviction.
#[derive(Debug, Default)]
struct MemoryStore {
	entries: HashMap<String, MemoryEntry>,
	order: BTreeMap<u64, String>,
	next_seq: u64,
}
impl MemoryStore {
	fn insert(&mut self, key: &str, value: ConsumerSecret, expires_at: i64) {
		let seq = self.next_seq;

		self.next_seq += 1;

		if let Some(previous) =
			self.entries.insert(key.to_owned(), MemoryEntry { value, expires_at, seq })
		{
			self.order.remove(&previous.seq);
		}

		self.order.insert(seq, key.to_owned());
	}

	fn remove(&mut self, key: &str) {
		if let Some(entry) = self.entries.remove(key) {
			self.order.remove(&entry.seq);
		}
	}

	fn evict_oldest(&mut self) -> Option<String> {
		let (_, key) = self.order.pop_first()?;

		self.entries.remove(&key);

		Some(key)
	}
}
