//! Resilience coordinator: circuit-guarded authority calls with stale-tier fallback.
//!
//! Resolution order is fixed:
//! 1. the operation, through the circuit named after it;
//! 2. on failure, the distributed stale tier (high-availability mode only);
//! 3. then the local stale cache;
//! 4. then `None`.
//!
//! Every cached read is checked against the requested consumer id, and every cache-layer error is
//! downgraded to a miss. Only `Option<ConsumerSecret>` leaves [`ResilienceCoordinator::wrap_operation`].

// std
use std::collections::HashMap;
// crates.io
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, time};
// self
use crate::{
	_prelude::*,
	breaker::{CircuitBreaker, CircuitSnapshot},
	cache::{CacheBackend, LocalStaleCache, StaleLookup},
	clock::{Clock, SystemClock},
	config::{CachingConfig, CircuitBreakerConfig},
	metrics::{self, FallbackSource, ResilienceMetrics, ResilienceMetricsSnapshot},
	secret::{ConsumerSecret, consumer_secret_key},
};

/// Outcome of consulting the distributed stale tier.
#[derive(Debug)]
pub enum DistributedLookup {
	/// Tier not consulted: high availability is off or no backend is attached.
	Skipped,
	/// Matching stale secret.
	Hit(ConsumerSecret),
	/// Nothing stored.
	Miss,
	/// Stored secret belongs to another consumer; it was discarded.
	Poisoned {
		/// Consumer id found in the discarded payload.
		owner: String,
	},
	/// Backend call failed.
	BackendError(Error),
	/// Backend call overran its deadline.
	TimedOut,
}

/// Which tier, if any, answered a fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FallbackResolution {
	/// Served from the distributed stale tier.
	Distributed(ConsumerSecret),
	/// Served from the local stale cache.
	Local(ConsumerSecret),
	/// No usable stale data anywhere.
	Exhausted,
}
impl FallbackResolution {
	/// The served secret, if any.
	pub fn into_secret(self) -> Option<ConsumerSecret> {
		match self {
			Self::Distributed(secret) | Self::Local(secret) => Some(secret),
			Self::Exhausted => None,
		}
	}

	fn source(&self) -> FallbackSource {
		match self {
			Self::Distributed(_) => FallbackSource::Distributed,
			Self::Local(_) => FallbackSource::Local,
			Self::Exhausted => FallbackSource::Exhausted,
		}
	}
}

/// Serializable health projection for status endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
	/// Whether high-availability mode is configured.
	pub high_availability: bool,
	/// Backend health, when a backend is attached.
	pub backend_healthy: Option<bool>,
	/// Entries in the local stale cache.
	pub local_stale_entries: usize,
	/// Every circuit created so far.
	pub circuits: Vec<CircuitSnapshot>,
	/// Coordinator counters.
	pub metrics: ResilienceMetricsSnapshot,
}

/// Builder for [`ResilienceCoordinator`].
#[derive(Debug)]
pub struct ResilienceCoordinatorBuilder {
	caching: CachingConfig,
	circuit_breaker: CircuitBreakerConfig,
	clock: Arc<dyn Clock>,
	backend: Option<Arc<dyn CacheBackend>>,
}
impl ResilienceCoordinatorBuilder {
	/// Start from the given configuration with the system clock and no backend.
	pub fn new(caching: CachingConfig, circuit_breaker: CircuitBreakerConfig) -> Self {
		Self { caching, circuit_breaker, clock: SystemClock::shared(), backend: None }
	}

	/// Inject a clock.
	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;

		self
	}

	/// Attach the backend whose stale tier is consulted in high-availability mode.
	pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
		self.backend = Some(backend);

		self
	}

	/// Validate configuration and construct the coordinator.
	pub fn build(self) -> Result<ResilienceCoordinator> {
		self.caching.validate()?;
		self.circuit_breaker.validate()?;

		if self.caching.high_availability
			&& !self.backend.as_ref().is_some_and(|backend| backend.supports_stale())
		{
			tracing::warn!(
				"high availability enabled without a stale-capable backend; only the local tier will serve fallbacks"
			);
		}

		let local = LocalStaleCache::new(&self.caching, self.clock.clone());

		Ok(ResilienceCoordinator {
			caching: self.caching,
			circuit_breaker: self.circuit_breaker,
			clock: self.clock,
			backend: self.backend,
			local,
			breakers: RwLock::new(HashMap::new()),
			metrics: ResilienceMetrics::new(),
		})
	}
}

/// Single entry point combining circuit protection with cache-backed availability.
#[derive(Debug)]
pub struct ResilienceCoordinator {
	caching: CachingConfig,
	circuit_breaker: CircuitBreakerConfig,
	clock: Arc<dyn Clock>,
	backend: Option<Arc<dyn CacheBackend>>,
	local: LocalStaleCache,
	breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
	metrics: Arc<ResilienceMetrics>,
}
impl ResilienceCoordinator {
	/// Create a [`ResilienceCoordinatorBuilder`].
	pub fn builder(
		caching: CachingConfig,
		circuit_breaker: CircuitBreakerConfig,
	) -> ResilienceCoordinatorBuilder {
		ResilienceCoordinatorBuilder::new(caching, circuit_breaker)
	}

	/// Caching configuration this coordinator was built with.
	pub fn caching_config(&self) -> &CachingConfig {
		&self.caching
	}

	/// Local stale cache, exposed for inspection.
	pub fn local_cache(&self) -> &LocalStaleCache {
		&self.local
	}

	/// Coordinator counters.
	pub fn metrics(&self) -> ResilienceMetricsSnapshot {
		self.metrics.snapshot()
	}

	/// Circuit for `operation_name`, created on first use.
	pub async fn breaker(&self, operation_name: &str) -> Result<Arc<CircuitBreaker>> {
		if let Some(breaker) = self.breakers.read().await.get(operation_name) {
			return Ok(breaker.clone());
		}

		let mut breakers = self.breakers.write().await;

		if let Some(breaker) = breakers.get(operation_name) {
			return Ok(breaker.clone());
		}

		let breaker = Arc::new(CircuitBreaker::new(
			operation_name,
			self.circuit_breaker.clone(),
			self.clock.clone(),
			self.metrics.clone(),
		)?);

		breakers.insert(operation_name.to_owned(), breaker.clone());

		Ok(breaker)
	}

	/// Run `operation` for `consumer_id` through the circuit named `operation_name`.
	///
	/// A secret from the authority is written through to the stale tiers and returned. An explicit
	/// `None` is returned as-is with no fallback and no cache write. A failure, timeout, or open
	/// circuit resolves through the fallback chain. The distributed stale write runs in the
	/// background and never delays the returned value.
	#[tracing::instrument(skip_all, fields(operation = operation_name, consumer = consumer_id))]
	pub async fn wrap_operation<F, Fut>(
		&self,
		operation_name: &str,
		consumer_id: &str,
		operation: F,
	) -> Option<ConsumerSecret>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<Option<ConsumerSecret>>>,
	{
		let result = match self.breaker(operation_name).await {
			Ok(breaker) => breaker.call(operation).await,
			Err(err) => Err(err),
		};

		match result {
			Ok(Some(secret)) => {
				self.write_through(consumer_id, &secret).await;

				Some(secret)
			},
			Ok(None) => {
				tracing::debug!("authority reported consumer secret not found");

				None
			},
			Err(err) => {
				if err.is_upstream_unavailable() {
					tracing::warn!(error = %err, "authority unavailable; resolving from stale tiers");
				} else {
					tracing::warn!(error = %err, "operation failed; resolving from stale tiers");
				}

				let resolution = self.resolve_fallback(consumer_id).await;

				self.metrics.record_fallback(resolution.source());
				metrics::record_fallback(operation_name, resolution.source());

				resolution.into_secret()
			},
		}
	}

	/// Resolve `consumer_id` from the stale tiers: distributed first, then local.
	pub async fn resolve_fallback(&self, consumer_id: &str) -> FallbackResolution {
		let key = consumer_secret_key(consumer_id);

		match self.lookup_distributed(&key, consumer_id).await {
			DistributedLookup::Hit(secret) => {
				tracing::info!(consumer = consumer_id, "serving secret from distributed stale tier");

				return FallbackResolution::Distributed(secret);
			},
			DistributedLookup::Poisoned { owner } => {
				self.metrics.record_poisoned();
				metrics::record_poisoned("distributed");

				tracing::warn!(key = %key, owner = %owner, "discarded poisoned distributed stale entry");
			},
			DistributedLookup::BackendError(err) => {
				tracing::debug!(error = %err, "distributed stale lookup failed; treating as miss");
			},
			DistributedLookup::TimedOut => {
				tracing::debug!("distributed stale lookup timed out; treating as miss");
			},
			DistributedLookup::Skipped | DistributedLookup::Miss => {},
		}

		match self.local.lookup(&key, consumer_id).await {
			StaleLookup::Hit(secret) => {
				tracing::info!(consumer = consumer_id, "serving secret from local stale cache");

				FallbackResolution::Local(secret)
			},
			StaleLookup::Poisoned { owner } => {
				self.metrics.record_poisoned();
				metrics::record_poisoned("local");

				tracing::warn!(key = %key, owner = %owner, "discarded poisoned local stale entry");

				FallbackResolution::Exhausted
			},
			StaleLookup::Expired => {
				tracing::debug!(key = %key, "local stale entry expired");

				FallbackResolution::Exhausted
			},
			StaleLookup::Miss => FallbackResolution::Exhausted,
		}
	}

	/// Consult the distributed stale tier, bounded by the circuit timeout.
	pub async fn lookup_distributed(&self, key: &str, consumer_id: &str) -> DistributedLookup {
		let Some(backend) = self.distributed_backend() else {
			return DistributedLookup::Skipped;
		};
		let deadline = self.circuit_breaker.timeout();
		let entry = match time::timeout(deadline, backend.get_stale(key)).await {
			Err(_) => return DistributedLookup::TimedOut,
			Ok(Err(err)) => return DistributedLookup::BackendError(err),
			Ok(Ok(None)) => return DistributedLookup::Miss,
			Ok(Ok(Some(entry))) => entry,
		};

		if entry.data.belongs_to(consumer_id) {
			return DistributedLookup::Hit(entry.data);
		}

		match time::timeout(deadline, backend.delete_stale(key)).await {
			Ok(Ok(())) => {},
			Ok(Err(err)) =>
				tracing::debug!(error = %err, key, "failed to delete poisoned distributed entry"),
			Err(_) => tracing::debug!(key, "deleting poisoned distributed entry timed out"),
		}

		DistributedLookup::Poisoned { owner: entry.data.consumer.id }
	}

	/// Report circuits, backend health, and counters.
	pub async fn health(&self) -> HealthReport {
		let breakers: Vec<Arc<CircuitBreaker>> =
			{ self.breakers.read().await.values().cloned().collect() };
		let mut circuits = Vec::with_capacity(breakers.len());

		for breaker in breakers {
			circuits.push(breaker.snapshot().await);
		}

		circuits.sort_by(|a, b| a.operation.cmp(&b.operation));

		let backend_healthy = match &self.backend {
			Some(backend) => Some(
				time::timeout(self.circuit_breaker.timeout(), backend.is_healthy())
					.await
					.unwrap_or(false),
			),
			None => None,
		};

		HealthReport {
			high_availability: self.caching.high_availability,
			backend_healthy,
			local_stale_entries: self.local.len().await,
			circuits,
			metrics: self.metrics.snapshot(),
		}
	}

	/// Drop every circuit and clear the local stale cache.
	///
	/// Idempotent; the coordinator stays usable and starts from a clean slate.
	pub async fn shutdown(&self) {
		self.breakers.write().await.clear();
		self.local.clear().await;

		tracing::debug!("resilience coordinator shut down");
	}

	fn distributed_backend(&self) -> Option<&Arc<dyn CacheBackend>> {
		self.backend
			.as_ref()
			.filter(|backend| self.caching.high_availability && backend.supports_stale())
	}

	async fn write_through(&self, consumer_id: &str, secret: &ConsumerSecret) {
		if !secret.belongs_to(consumer_id) {
			tracing::warn!(
				requested = consumer_id,
				owner = %secret.consumer.id,
				"authority returned a secret for another consumer; not caching it"
			);

			return;
		}

		let key = consumer_secret_key(consumer_id);

		self.local.insert(&key, secret.clone()).await;
		self.metrics.record_write_through();

		if let Some(backend) = self.distributed_backend() {
			let backend = backend.clone();
			let secret = secret.clone();
			let deadline = self.circuit_breaker.timeout();

			// Off the response path; a slow distributed tier must not delay issuance.
			tokio::spawn(async move {
				match time::timeout(deadline, backend.set_stale(&key, &secret)).await {
					Ok(Ok(())) => {},
					Ok(Err(err)) =>
						tracing::debug!(error = %err, key = %key, "distributed stale write failed"),
					Err(_) => tracing::debug!(key = %key, "distributed stale write timed out"),
				}
			});
		}
	}
}
