//! Consumer secret resolution: primary cache, then the authority through the coordinator.

// crates.io
use async_trait::async_trait;
use tokio::time;
// self
use crate::{
	_prelude::*,
	cache::CacheBackend,
	coordinator::ResilienceCoordinator,
	secret::{ConsumerSecret, consumer_secret_key},
};

/// Circuit name for secret reads.
pub const GET_CONSUMER_SECRET: &str = "getConsumerSecret";
/// Circuit name for secret creation.
pub const CREATE_CONSUMER_SECRET: &str = "createConsumerSecret";

/// Upstream credential authority; transport details belong to the implementor.
#[async_trait]
pub trait Authority: Send + Sync {
	/// Fetch the secret for `consumer_id`; `Ok(None)` means the consumer has none.
	async fn fetch_consumer_secret(&self, consumer_id: &str) -> Result<Option<ConsumerSecret>>;

	/// Issue a new secret for `consumer_id`.
	async fn create_consumer_secret(&self, consumer_id: &str) -> Result<Option<ConsumerSecret>>;
}

/// Resolves consumer secrets through the primary tier and the resilience coordinator.
#[derive(Debug)]
pub struct SecretService<A> {
	authority: Arc<A>,
	coordinator: Arc<ResilienceCoordinator>,
	cache: Arc<dyn CacheBackend>,
	cache_timeout: Duration,
}
impl<A> SecretService<A>
where
	A: Authority,
{
	/// Wire an authority, coordinator, and primary cache together.
	pub fn new(
		authority: Arc<A>,
		coordinator: Arc<ResilienceCoordinator>,
		cache: Arc<dyn CacheBackend>,
	) -> Self {
		Self { authority, coordinator, cache, cache_timeout: Duration::from_secs(1) }
	}

	/// Bound every primary cache call by `timeout`.
	pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
		self.cache_timeout = timeout;

		self
	}

	/// Coordinator backing this service.
	pub fn coordinator(&self) -> &Arc<ResilienceCoordinator> {
		&self.coordinator
	}

	/// Resolve the secret for `consumer_id`, or `None` when the consumer has none or nothing is
	/// available.
	#[tracing::instrument(skip(self))]
	pub async fn get_consumer_secret(&self, consumer_id: &str) -> Option<ConsumerSecret> {
		let key = consumer_secret_key(consumer_id);

		if let Some(secret) = self.cached(&key, consumer_id).await {
			return Some(secret);
		}

		let secret = self
			.coordinator
			.wrap_operation(GET_CONSUMER_SECRET, consumer_id, || {
				self.authority.fetch_consumer_secret(consumer_id)
			})
			.await?;

		self.prime(&key, &secret).await;

		Some(secret)
	}

	/// Issue a secret for `consumer_id` and prime the primary tier with it.
	#[tracing::instrument(skip(self))]
	pub async fn create_consumer_secret(&self, consumer_id: &str) -> Option<ConsumerSecret> {
		let key = consumer_secret_key(consumer_id);
		let secret = self
			.coordinator
			.wrap_operation(CREATE_CONSUMER_SECRET, consumer_id, || {
				self.authority.create_consumer_secret(consumer_id)
			})
			.await?;

		self.prime(&key, &secret).await;

		Some(secret)
	}

	/// Drop the primary entry for `consumer_id`; errors are logged only.
	pub async fn invalidate(&self, consumer_id: &str) {
		let key = consumer_secret_key(consumer_id);

		match time::timeout(self.cache_timeout, self.cache.delete(&key)).await {
			Ok(Ok(())) => {},
			Ok(Err(err)) => tracing::debug!(error = %err, key = %key, "primary cache delete failed"),
			Err(_) => tracing::debug!(key = %key, "primary cache delete timed out"),
		}
	}

	async fn cached(&self, key: &str, consumer_id: &str) -> Option<ConsumerSecret> {
		let secret = match time::timeout(self.cache_timeout, self.cache.get(key)).await {
			Ok(Ok(secret)) => secret?,
			Ok(Err(err)) => {
				tracing::debug!(error = %err, key, "primary cache read failed; treating as miss");

				return None;
			},
			Err(_) => {
				tracing::debug!(key, "primary cache read timed out; treating as miss");

				return None;
			},
		};

		if secret.belongs_to(consumer_id) {
			return Some(secret);
		}

		tracing::warn!(key, owner = %secret.consumer.id, "discarded poisoned primary cache entry");

		let _ = time::timeout(self.cache_timeout, self.cache.delete(key)).await;

		None
	}

	async fn prime(&self, key: &str, secret: &ConsumerSecret) {
		if !secret.matches_key(key) {
			return;
		}

		match time::timeout(self.cache_timeout, self.cache.set(key, secret, None)).await {
			Ok(Ok(())) => {},
			Ok(Err(err)) => tracing::debug!(error = %err, key, "primary cache write failed"),
			Err(_) => tracing::debug!(key, "primary cache write timed out"),
		}
	}
}
