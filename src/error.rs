//! Crate-wide error types and `Result` alias.

// std
use std::time::Duration;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the resilience layer.
///
/// Only the authority-facing variants ever leave a [`crate::ResilienceCoordinator`] internally;
/// callers of `wrap_operation` observe `Option<ConsumerSecret>` and nothing else.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Serde(#[from] serde_json::Error),

	#[cfg(feature = "redis")]
	#[error(transparent)]
	Redis(#[from] redis::RedisError),

	#[error("Cache error: {0}")]
	Cache(String),
	#[error("Circuit for operation '{operation}' is open.")]
	CircuitOpen { operation: String },
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Security violation: {0}")]
	Security(String),
	#[error("Operation '{operation}' timed out after {timeout:?}.")]
	Timeout { operation: String, timeout: Duration },
	#[error("Upstream authority error: {0}")]
	Upstream(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Whether the error means the authority could not give an answer.
	///
	/// Every such error sends the coordinator into its fallback chain.
	pub fn is_upstream_unavailable(&self) -> bool {
		matches!(self, Self::CircuitOpen { .. } | Self::Timeout { .. } | Self::Upstream(_))
	}
}
