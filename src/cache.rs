//! Cache tiers: the backend contract, its in-process and Redis implementations, and the local
//! stale cache used as the last-resort fallback.

pub mod memory;
#[cfg(feature = "redis")] pub mod redis;
pub mod stale;

pub use memory::MemoryBackend;
#[cfg(feature = "redis")] pub use redis::RedisBackend;
pub use stale::{LocalStaleCache, StaleLookup};

// crates.io
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
// self
use crate::{
	_prelude::*,
	clock::Clock,
	config::CachingConfig,
	secret::{ConsumerSecret, StaleEntry, consumer_id_from_key},
};

/// Key/value store holding consumer secrets with TTL, optionally with a stale keyspace.
///
/// Implementations report failures as errors; callers inside this crate downgrade every one of
/// them to a miss.
#[async_trait]
pub trait CacheBackend: Send + Sync + std::fmt::Debug {
	/// Short backend name for logs and stats.
	fn name(&self) -> &'static str;

	/// Fetch a fresh entry.
	async fn get(&self, key: &str) -> Result<Option<ConsumerSecret>>;

	/// Store an entry for `ttl`, or the configured TTL when `None`.
	async fn set(&self, key: &str, value: &ConsumerSecret, ttl: Option<Duration>) -> Result<()>;

	/// Remove an entry from the primary tier.
	async fn delete(&self, key: &str) -> Result<()>;

	/// Remove every primary entry owned by this service.
	async fn clear(&self) -> Result<()>;

	/// Usage counters.
	async fn stats(&self) -> Result<CacheStats>;

	/// Whether the backend can currently serve requests.
	async fn is_healthy(&self) -> bool;

	/// Establish connections; a no-op for in-process stores.
	async fn connect(&self) -> Result<()>;

	/// Release connections.
	async fn disconnect(&self) -> Result<()>;

	/// Whether this backend keeps a stale tier.
	fn supports_stale(&self) -> bool {
		false
	}

	/// Fetch a stale entry.
	async fn get_stale(&self, _key: &str) -> Result<Option<StaleEntry>> {
		Ok(None)
	}

	/// Store a stale entry retained for the stale tolerance window.
	async fn set_stale(&self, _key: &str, _value: &ConsumerSecret) -> Result<()> {
		Ok(())
	}

	/// Remove a single stale entry.
	async fn delete_stale(&self, _key: &str) -> Result<()> {
		Ok(())
	}

	/// Remove every stale entry owned by this service.
	async fn clear_stale(&self) -> Result<()> {
		Ok(())
	}
}

/// Usage counters reported by a backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
	/// Backend name.
	pub backend: String,
	/// Live primary entries.
	pub size: usize,
	/// Live stale entries, for backends with a stale tier.
	pub stale_size: Option<usize>,
	/// Primary hits observed by this instance.
	pub hits: Option<u64>,
	/// Primary misses observed by this instance.
	pub misses: Option<u64>,
	/// Capacity evictions.
	pub evictions: Option<u64>,
}
impl CacheStats {
	/// Hit ratio, when both counters are tracked.
	pub fn hit_rate(&self) -> Option<f64> {
		let (hits, misses) = (self.hits?, self.misses?);
		let total = hits + misses;

		Some(if total == 0 { 0.0 } else { hits as f64 / total as f64 })
	}
}

/// Build the backend matching `config`: Redis in high-availability mode, otherwise in-process.
pub fn build_backend(config: &CachingConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CacheBackend>> {
	config.validate()?;

	if config.high_availability {
		#[cfg(feature = "redis")]
		{
			return Ok(Arc::new(RedisBackend::new(config)?));
		}
		#[cfg(not(feature = "redis"))]
		{
			let _ = clock;

			return Err(Error::Validation {
				field: "caching.high_availability",
				reason: "Requires the `redis` feature.".into(),
			});
		}
	}

	Ok(Arc::new(MemoryBackend::new(config, clock)))
}

/// Reject writes whose payload is not owned by the consumer encoded in `key`.
pub(crate) fn ensure_owner(key: &str, value: &ConsumerSecret) -> Result<()> {
	if value.matches_key(key) {
		return Ok(());
	}

	tracing::warn!(
		key,
		expected = consumer_id_from_key(key).unwrap_or_default(),
		actual = %value.consumer.id,
		"refusing to cache secret under another consumer's key"
	);

	Err(Error::Security(format!(
		"Secret owned by consumer '{}' cannot be stored under key '{key}'.",
		value.consumer.id
	)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::ManualClock;

	#[test]
	fn ensure_owner_rejects_cross_consumer_writes() {
		let secret = ConsumerSecret::new("s1", "k1", "x", "c2", "bob");

		assert!(ensure_owner("consumer_secret:c2", &secret).is_ok());
		assert!(matches!(ensure_owner("consumer_secret:c1", &secret), Err(Error::Security(_))));
		assert!(ensure_owner("unrelated", &secret).is_err());
	}

	#[test]
	fn local_config_builds_memory_backend() {
		let backend =
			build_backend(&CachingConfig::default(), ManualClock::new(0)).expect("backend");

		assert_eq!(backend.name(), "memory");
		assert!(!backend.supports_stale());
	}

	#[cfg(not(feature = "redis"))]
	#[test]
	fn ha_without_redis_feature_is_rejected() {
		let config = CachingConfig { high_availability: true, ..Default::default() };

		assert!(matches!(
			build_backend(&config, ManualClock::new(0)),
			Err(Error::Validation { field: "caching.high_availability", .. })
		));
	}

	#[test]
	fn hit_rate_needs_both_counters() {
		let stats = CacheStats { hits: Some(3), misses: Some(1), ..Default::default() };

		assert_eq!(stats.hit_rate(), Some(0.75));
		assert_eq!(CacheStats::default().hit_rate(), None);
	}
}
