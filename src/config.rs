//! Circuit breaker and caching configuration with validation.
//!
//! Both structs are read once when a coordinator or backend is constructed. Changing them means
//! building a new instance; there is no hot reload.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Default per-call deadline in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;
/// Default failure percentage that trips a circuit.
pub const DEFAULT_ERROR_THRESHOLD_PERCENTAGE: f64 = 50.0;
/// Default open period before a half-open trial is admitted.
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 30_000;
/// Default rolling window span.
pub const DEFAULT_ROLLING_COUNT_TIMEOUT_MS: u64 = 10_000;
/// Default rolling window bucket count.
pub const DEFAULT_ROLLING_COUNT_BUCKETS: u32 = 10;
/// Default minimum call volume before the failure rate is evaluated.
pub const DEFAULT_VOLUME_THRESHOLD: u32 = 10;
/// Default primary cache TTL.
pub const DEFAULT_TTL_SECONDS: u64 = 300;
/// Default stale data tolerance.
pub const DEFAULT_STALE_DATA_TOLERANCE_MINUTES: u64 = 60;
/// Default local stale cache capacity.
pub const DEFAULT_MAX_MEMORY_ENTRIES: usize = 1_000;

/// Circuit breaker tuning shared by every operation circuit of a coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
	/// When disabled, operations run unguarded: no deadline, no window, no short-circuit.
	pub enabled: bool,
	/// Per-call deadline in milliseconds; an overrun counts as a failure.
	pub timeout: u64,
	/// Failure percentage (0, 100] within the window that opens the circuit.
	pub error_threshold_percentage: f64,
	/// Milliseconds an open circuit waits before admitting a half-open trial.
	pub reset_timeout: u64,
	/// Rolling window span in milliseconds.
	pub rolling_count_timeout: u64,
	/// Number of buckets the rolling window is divided into.
	pub rolling_count_buckets: u32,
	/// Minimum number of calls in the window before the failure rate is considered.
	pub volume_threshold: u32,
}
impl CircuitBreakerConfig {
	/// Per-call deadline.
	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}

	/// Open period before a trial call.
	pub fn reset_timeout(&self) -> Duration {
		Duration::from_millis(self.reset_timeout)
	}

	/// Width of one rolling window bucket in milliseconds.
	pub fn bucket_width_millis(&self) -> u64 {
		self.rolling_count_timeout / u64::from(self.rolling_count_buckets.max(1))
	}

	/// Validate invariants for circuit configuration.
	pub fn validate(&self) -> Result<()> {
		if self.timeout == 0 {
			return Err(Error::Validation {
				field: "circuit_breaker.timeout",
				reason: "Must be greater than zero.".into(),
			});
		}
		if !(self.error_threshold_percentage > 0.0 && self.error_threshold_percentage <= 100.0) {
			return Err(Error::Validation {
				field: "circuit_breaker.error_threshold_percentage",
				reason: "Must be within (0, 100].".into(),
			});
		}
		if self.reset_timeout == 0 {
			return Err(Error::Validation {
				field: "circuit_breaker.reset_timeout",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.rolling_count_buckets == 0 {
			return Err(Error::Validation {
				field: "circuit_breaker.rolling_count_buckets",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.rolling_count_timeout < u64::from(self.rolling_count_buckets) {
			return Err(Error::Validation {
				field: "circuit_breaker.rolling_count_timeout",
				reason: "Must allow at least one millisecond per bucket.".into(),
			});
		}

		Ok(())
	}
}
impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			timeout: DEFAULT_TIMEOUT_MS,
			error_threshold_percentage: DEFAULT_ERROR_THRESHOLD_PERCENTAGE,
			reset_timeout: DEFAULT_RESET_TIMEOUT_MS,
			rolling_count_timeout: DEFAULT_ROLLING_COUNT_TIMEOUT_MS,
			rolling_count_buckets: DEFAULT_ROLLING_COUNT_BUCKETS,
			volume_threshold: DEFAULT_VOLUME_THRESHOLD,
		}
	}
}

/// Cache tier configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CachingConfig {
	/// Enables the distributed backend and its stale tier.
	pub high_availability: bool,
	/// Primary tier TTL.
	pub ttl_seconds: u64,
	/// How long stale data may still be served, in both stale tiers.
	pub stale_data_tolerance_minutes: u64,
	/// Capacity of the local stale cache and the in-process backend.
	pub max_memory_entries: usize,
	/// Distributed backend connection parameters.
	pub redis: RedisConfig,
}
impl CachingConfig {
	/// Primary tier TTL.
	pub fn ttl(&self) -> Duration {
		Duration::from_secs(self.ttl_seconds)
	}

	/// Stale tolerance window.
	pub fn stale_tolerance(&self) -> Duration {
		Duration::from_secs(self.stale_data_tolerance_minutes.saturating_mul(60))
	}

	/// Validate invariants for caching configuration.
	pub fn validate(&self) -> Result<()> {
		if self.ttl_seconds == 0 {
			return Err(Error::Validation {
				field: "caching.ttl_seconds",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.stale_data_tolerance_minutes == 0 {
			return Err(Error::Validation {
				field: "caching.stale_data_tolerance_minutes",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.max_memory_entries == 0 {
			return Err(Error::Validation {
				field: "caching.max_memory_entries",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.high_availability {
			self.redis.validate()?;
		}

		Ok(())
	}
}
impl Default for CachingConfig {
	fn default() -> Self {
		Self {
			high_availability: false,
			ttl_seconds: DEFAULT_TTL_SECONDS,
			stale_data_tolerance_minutes: DEFAULT_STALE_DATA_TOLERANCE_MINUTES,
			max_memory_entries: DEFAULT_MAX_MEMORY_ENTRIES,
			redis: RedisConfig::default(),
		}
	}
}

/// Distributed backend connection parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedisConfig {
	/// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
	pub url: String,
	/// Prefix applied to every key written by this service.
	pub namespace: String,
	/// Upper bound on establishing the connection.
	pub connect_timeout_ms: u64,
}
impl RedisConfig {
	/// Connection deadline.
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_millis(self.connect_timeout_ms)
	}

	/// Validate connection parameters.
	pub fn validate(&self) -> Result<()> {
		if self.url.trim().is_empty() {
			return Err(Error::Validation {
				field: "caching.redis.url",
				reason: "Must not be empty when high availability is enabled.".into(),
			});
		}
		if self.namespace.is_empty() || self.namespace.contains(char::is_whitespace) {
			return Err(Error::Validation {
				field: "caching.redis.namespace",
				reason: "Must be non-empty and contain no whitespace.".into(),
			});
		}
		if self.connect_timeout_ms == 0 {
			return Err(Error::Validation {
				field: "caching.redis.connect_timeout_ms",
				reason: "Must be greater than zero.".into(),
			});
		}

		Ok(())
	}
}
impl Default for RedisConfig {
	fn default() -> Self {
		Self {
			url: "redis://127.0.0.1:6379".into(),
			namespace: "kong".into(),
			connect_timeout_ms: 2_000,
		}
	}
}
