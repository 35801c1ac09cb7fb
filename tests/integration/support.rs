//! Shared doubles for integration tests.

// std
use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use async_trait::async_trait;
use kong_resilience::{
	CacheBackend, CacheStats, CachingConfig, CircuitBreakerConfig, ConsumerSecret, Error,
	ManualClock, ResilienceCoordinator, Result, StaleEntry,
};
use tokio::sync::Mutex;

pub const READ: &str = "getConsumerSecret";

pub fn secret(consumer: &str) -> ConsumerSecret {
	ConsumerSecret::new(format!("secret-{consumer}"), format!("key-{consumer}"), "hmac", consumer, consumer)
}

pub fn breaker_config() -> CircuitBreakerConfig {
	CircuitBreakerConfig {
		enabled: true,
		timeout: 200,
		error_threshold_percentage: 50.0,
		reset_timeout: 5_000,
		rolling_count_timeout: 10_000,
		rolling_count_buckets: 10,
		volume_threshold: 3,
	}
}

pub fn coordinator(
	caching: CachingConfig,
	backend: Option<Arc<FlakyBackend>>,
) -> (ResilienceCoordinator, Arc<ManualClock>) {
	let _ = tracing_subscriber::fmt::try_init();

	let clock = ManualClock::new(1_700_000_000_000);
	let mut builder = ResilienceCoordinator::builder(caching, breaker_config()).clock(clock.clone());

	if let Some(backend) = backend {
		builder = builder.backend(backend);
	}

	(builder.build().expect("coordinator"), clock)
}

pub async fn failing() -> Result<Option<ConsumerSecret>> {
	Err(Error::Upstream("authority unreachable".into()))
}

/// Distributed backend double whose stale tier can be seeded or made to fail.
#[derive(Debug, Default)]
pub struct FlakyBackend {
	pub stale: Mutex<HashMap<String, StaleEntry>>,
	pub unreachable: AtomicBool,
	pub stale_reads: AtomicUsize,
}
impl FlakyBackend {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub async fn seed(&self, key: &str, data: ConsumerSecret) {
		self.stale.lock().await.insert(key.to_owned(), StaleEntry { data, timestamp: 0 });
	}

	pub fn stale_reads(&self) -> usize {
		self.stale_reads.load(Ordering::SeqCst)
	}

	fn check(&self) -> Result<()> {
		if self.unreachable.load(Ordering::SeqCst) {
			Err(Error::Cache("connection failed".into()))
		} else {
			Ok(())
		}
	}
}
#[async_trait]
impl CacheBackend for FlakyBackend {
	fn name(&self) -> &'static str {
		"flaky"
	}

	async fn get(&self, _key: &str) -> Result<Option<ConsumerSecret>> {
		self.check()?;

		Ok(None)
	}

	async fn set(&self, _: &str, _: &ConsumerSecret, _: Option<Duration>) -> Result<()> {
		self.check()
	}

	async fn delete(&self, _key: &str) -> Result<()> {
		self.check()
	}

	async fn clear(&self) -> Result<()> {
		self.check()
	}

	async fn stats(&self) -> Result<CacheStats> {
		self.check()?;

		Ok(CacheStats { backend: "flaky".into(), ..Default::default() })
	}

	async fn is_healthy(&self) -> bool {
		self.check().is_ok()
	}

	async fn connect(&self) -> Result<()> {
		self.check()
	}

	async fn disconnect(&self) -> Result<()> {
		Ok(())
	}

	fn supports_stale(&self) -> bool {
		true
	}

	async fn get_stale(&self, key: &str) -> Result<Option<StaleEntry>> {
		self.stale_reads.fetch_add(1, Ordering::SeqCst);
		self.check()?;

		Ok(self.stale.lock().await.get(key).cloned())
	}

	async fn set_stale(&self, key: &str, value: &ConsumerSecret) -> Result<()> {
		self.check()?;
		self.seed(key, value.clone()).await;

		Ok(())
	}

	async fn delete_stale(&self, key: &str) -> Result<()> {
		self.check()?;
		self.stale.lock().await.remove(key);

		Ok(())
	}
}
