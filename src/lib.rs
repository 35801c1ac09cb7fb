//! Circuit-breaking, stale-fallback secret resolution for consumer credential authorities.
//!
//! The crate sits between "ask the authority for consumer X's secret" and "return a secret or a
//! definitive not-found". Calls are guarded by a per-operation circuit breaker and, when the
//! authority is unavailable, answered from a distributed stale tier and then a local stale tier,
//! never handing one consumer's secret to another.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod secret;
pub mod service;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use crate::{Error, Result};
}

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	breaker::{CircuitBreaker, CircuitSnapshot, CircuitState},
	cache::{
		CacheBackend, CacheStats, LocalStaleCache, MemoryBackend, StaleLookup, build_backend,
	},
	clock::{Clock, ManualClock, SystemClock},
	config::{CachingConfig, CircuitBreakerConfig, RedisConfig},
	coordinator::{
		DistributedLookup, FallbackResolution, HealthReport, ResilienceCoordinator,
		ResilienceCoordinatorBuilder,
	},
	error::{Error, Result},
	secret::{ConsumerRef, ConsumerSecret, StaleEntry, consumer_id_from_key, consumer_secret_key},
	service::{Authority, SecretService},
};
#[cfg(feature = "redis")] pub use crate::cache::RedisBackend;
