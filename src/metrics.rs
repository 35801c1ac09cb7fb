//! Metrics helpers and per-coordinator telemetry bookkeeping.

// std
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
// self
use crate::{_prelude::*, breaker::CircuitState};

type LabelSet = SmallVec<[Label; 4]>;

const METRIC_CALLS_TOTAL: &str = "kong_resilience_calls_total";
const METRIC_CALL_DURATION: &str = "kong_resilience_call_duration_seconds";
const METRIC_REJECTIONS_TOTAL: &str = "kong_resilience_rejections_total";
const METRIC_TRANSITIONS_TOTAL: &str = "kong_resilience_circuit_transitions_total";
const METRIC_FALLBACK_TOTAL: &str = "kong_resilience_fallback_total";
const METRIC_POISONED_TOTAL: &str = "kong_resilience_poisoned_total";
const METRIC_EVICTIONS_TOTAL: &str = "kong_resilience_local_evictions_total";

#[cfg(feature = "prometheus")]
/// Shared Prometheus handle installed by [`install_default_exporter`].
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// How a guarded call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
	/// Authority answered, with a secret or an explicit "not found".
	Success,
	/// Authority call failed.
	Failure,
	/// Authority call exceeded its deadline.
	Timeout,
}
impl CallOutcome {
	fn as_str(self) -> &'static str {
		match self {
			Self::Success => "success",
			Self::Failure => "failure",
			Self::Timeout => "timeout",
		}
	}
}

/// Where a fallback resolution was answered from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackSource {
	/// Distributed stale tier.
	Distributed,
	/// Local stale cache.
	Local,
	/// Nothing usable anywhere.
	Exhausted,
}
impl FallbackSource {
	fn as_str(self) -> &'static str {
		match self {
			Self::Distributed => "distributed",
			Self::Local => "local",
			Self::Exhausted => "exhausted",
		}
	}
}

/// Thread-safe metrics accumulator for a single coordinator.
#[derive(Debug, Default)]
pub struct ResilienceMetrics {
	calls: AtomicU64,
	failures: AtomicU64,
	rejections: AtomicU64,
	fallback_distributed: AtomicU64,
	fallback_local: AtomicU64,
	fallback_exhausted: AtomicU64,
	poisoned: AtomicU64,
	write_throughs: AtomicU64,
}
impl ResilienceMetrics {
	/// Create a new metrics accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record a completed or rejected call.
	pub fn record_call(&self, failed: bool) {
		self.calls.fetch_add(1, Ordering::Relaxed);

		if failed {
			self.failures.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Record a short-circuited call.
	pub fn record_rejection(&self) {
		self.calls.fetch_add(1, Ordering::Relaxed);
		self.rejections.fetch_add(1, Ordering::Relaxed);
	}

	/// Record the tier that answered a fallback.
	pub fn record_fallback(&self, source: FallbackSource) {
		let counter = match source {
			FallbackSource::Distributed => &self.fallback_distributed,
			FallbackSource::Local => &self.fallback_local,
			FallbackSource::Exhausted => &self.fallback_exhausted,
		};

		counter.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a discarded poisoned entry.
	pub fn record_poisoned(&self) {
		self.poisoned.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a stale cache write-through.
	pub fn record_write_through(&self) {
		self.write_throughs.fetch_add(1, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot for health reporting.
	pub fn snapshot(&self) -> ResilienceMetricsSnapshot {
		ResilienceMetricsSnapshot {
			calls: self.calls.load(Ordering::Relaxed),
			failures: self.failures.load(Ordering::Relaxed),
			rejections: self.rejections.load(Ordering::Relaxed),
			fallback_distributed: self.fallback_distributed.load(Ordering::Relaxed),
			fallback_local: self.fallback_local.load(Ordering::Relaxed),
			fallback_exhausted: self.fallback_exhausted.load(Ordering::Relaxed),
			poisoned: self.poisoned.load(Ordering::Relaxed),
			write_throughs: self.write_throughs.load(Ordering::Relaxed),
		}
	}
}

/// Read-only snapshot of coordinator counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceMetricsSnapshot {
	/// Calls observed, including short-circuited ones.
	pub calls: u64,
	/// Calls that failed or timed out.
	pub failures: u64,
	/// Calls rejected by an open circuit.
	pub rejections: u64,
	/// Fallbacks answered by the distributed stale tier.
	pub fallback_distributed: u64,
	/// Fallbacks answered by the local stale cache.
	pub fallback_local: u64,
	/// Fallbacks with nothing to serve.
	pub fallback_exhausted: u64,
	/// Poisoned entries discarded across tiers.
	pub poisoned: u64,
	/// Successful results copied into stale tiers.
	pub write_throughs: u64,
}
impl ResilienceMetricsSnapshot {
	/// Ratio of fallbacks that still produced a secret.
	pub fn fallback_hit_rate(&self) -> f64 {
		let served = self.fallback_distributed + self.fallback_local;
		let total = served + self.fallback_exhausted;

		if total == 0 { 0.0 } else { served as f64 / total as f64 }
	}
}

#[cfg(feature = "prometheus")]
/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

#[cfg(feature = "prometheus")]
/// Access the global Prometheus exporter handle when installed.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a finished authority call and its latency.
pub fn record_call(operation: &str, outcome: CallOutcome, duration: Duration) {
	metrics::counter!(METRIC_CALLS_TOTAL, outcome_labels(operation, outcome.as_str()).iter())
		.increment(1);
	metrics::histogram!(METRIC_CALL_DURATION, operation_labels(operation).iter())
		.record(duration.as_secs_f64());
}

/// Record a call short-circuited by an open circuit.
pub fn record_rejection(operation: &str) {
	metrics::counter!(METRIC_REJECTIONS_TOTAL, operation_labels(operation).iter()).increment(1);
}

/// Record a circuit state transition.
pub fn record_transition(operation: &str, to: CircuitState) {
	let mut labels = operation_labels(operation);

	labels.push(Label::new("state", to.as_str()));

	metrics::counter!(METRIC_TRANSITIONS_TOTAL, labels.iter()).increment(1);
}

/// Record which tier resolved a fallback.
pub fn record_fallback(operation: &str, source: FallbackSource) {
	let mut labels = operation_labels(operation);

	labels.push(Label::new("source", source.as_str()));

	metrics::counter!(METRIC_FALLBACK_TOTAL, labels.iter()).increment(1);
}

/// Record a poisoned entry discovered in `tier`.
pub fn record_poisoned(tier: &'static str) {
	metrics::counter!(METRIC_POISONED_TOTAL, "tier" => tier).increment(1);
}

/// Record a capacity eviction from the local stale cache.
pub fn record_local_eviction() {
	metrics::counter!(METRIC_EVICTIONS_TOTAL).increment(1);
}

fn operation_labels(operation: &str) -> LabelSet {
	let mut labels = LabelSet::with_capacity(2);

	labels.push(Label::new("operation", operation.to_owned()));

	labels
}

fn outcome_labels(operation: &str, outcome: &'static str) -> LabelSet {
	let mut labels = operation_labels(operation);

	labels.push(Label::new("outcome", outcome));

	labels
}
