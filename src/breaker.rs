//! Per-operation circuit breaker with a bucketed rolling window.
//!
//! # State transitions
//! ```text
//! Closed   -> Open:     window volume >= volume_threshold and failure % >= threshold
//! Open     -> HalfOpen: first call at or after opened_at + reset_timeout
//! HalfOpen -> Closed:   trial call succeeds (window reset)
//! HalfOpen -> Open:     trial call fails (reset countdown restarts)
//! ```
//!
//! Reset and window aging are evaluated against the injected [`Clock`] when a call arrives, so
//! the breaker owns no timers.

// std
use std::fmt::{Display, Formatter, Result as FmtResult};
// crates.io
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time};
// self
use crate::{
	_prelude::*,
	clock::{Clock, duration_millis},
	config::CircuitBreakerConfig,
	metrics::{self, CallOutcome, ResilienceMetrics},
};

/// Circuit lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
	/// Calls execute normally and feed the rolling window.
	Closed,
	/// Calls are rejected without invoking the operation.
	Open,
	/// A single trial call decides the next state.
	HalfOpen,
}
impl CircuitState {
	/// Stable lowercase label used in logs and metrics.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Closed => "closed",
			Self::Open => "open",
			Self::HalfOpen => "half_open",
		}
	}
}
impl Display for CircuitState {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Point-in-time view of one circuit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
	/// Operation the circuit protects.
	pub operation: String,
	/// Current state.
	pub state: CircuitState,
	/// Successful calls inside the rolling window.
	pub window_successes: u64,
	/// Failed calls inside the rolling window.
	pub window_failures: u64,
	/// Epoch millis when the circuit last opened.
	pub opened_at: Option<i64>,
	/// Lifetime count of short-circuited calls.
	pub rejections: u64,
	/// Lifetime count of calls that overran the deadline.
	pub timeouts: u64,
}
impl CircuitSnapshot {
	/// Failure percentage inside the window.
	pub fn failure_percentage(&self) -> f64 {
		let total = self.window_successes + self.window_failures;

		if total == 0 { 0.0 } else { self.window_failures as f64 * 100.0 / total as f64 }
	}
}

/// Circuit breaker guarding a single named operation.
#[derive(Debug)]
pub struct CircuitBreaker {
	operation: Arc<str>,
	config: CircuitBreakerConfig,
	clock: Arc<dyn Clock>,
	metrics: Arc<ResilienceMetrics>,
	inner: Mutex<BreakerInner>,
}
impl CircuitBreaker {
	/// Create a closed breaker for `operation`.
	pub fn new(
		operation: impl Into<Arc<str>>,
		config: CircuitBreakerConfig,
		clock: Arc<dyn Clock>,
		metrics: Arc<ResilienceMetrics>,
	) -> Result<Self> {
		config.validate()?;

		let window = RollingWindow::new(
			config.rolling_count_buckets as usize,
			config.bucket_width_millis() as i64,
		);

		Ok(Self {
			operation: operation.into(),
			config,
			clock,
			metrics,
			inner: Mutex::new(BreakerInner {
				state: CircuitState::Closed,
				window,
				opened_at: None,
				trial_started_at: None,
				rejections: 0,
				timeouts: 0,
			}),
		})
	}

	/// Operation name this breaker protects.
	pub fn operation(&self) -> &str {
		&self.operation
	}

	/// Current state as it would be observed by the next call.
	pub async fn state(&self) -> CircuitState {
		self.inner.lock().await.state
	}

	/// Capture window counters and state.
	pub async fn snapshot(&self) -> CircuitSnapshot {
		let now = self.clock.now_millis();
		let inner = self.inner.lock().await;
		let (window_successes, window_failures) = inner.window.totals(now);

		CircuitSnapshot {
			operation: self.operation.to_string(),
			state: inner.state,
			window_successes,
			window_failures,
			opened_at: inner.opened_at,
			rejections: inner.rejections,
			timeouts: inner.timeouts,
		}
	}

	/// Run `operation` under this circuit.
	///
	/// Returns [`Error::CircuitOpen`] without invoking the operation while the circuit is open,
	/// and [`Error::Timeout`] when the call overruns its deadline. A timed-out future is dropped,
	/// so a late settle is never recorded.
	pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		if !self.config.enabled {
			return operation().await;
		}

		let admission = self.admit().await;

		if matches!(admission, Admission::Rejected) {
			self.metrics.record_rejection();
			metrics::record_rejection(&self.operation);

			return Err(Error::CircuitOpen { operation: self.operation.to_string() });
		}

		let started = time::Instant::now();
		let timeout = self.config.timeout();
		let (result, outcome) = match time::timeout(timeout, operation()).await {
			Ok(Ok(value)) => (Ok(value), CallOutcome::Success),
			Ok(Err(err)) => (Err(err), CallOutcome::Failure),
			Err(_) => (
				Err(Error::Timeout { operation: self.operation.to_string(), timeout }),
				CallOutcome::Timeout,
			),
		};

		metrics::record_call(&self.operation, outcome, started.elapsed());
		self.metrics.record_call(outcome != CallOutcome::Success);
		self.settle(admission, outcome).await;

		result
	}

	/// Drop all window history and close the circuit.
	pub async fn reset(&self) {
		let mut inner = self.inner.lock().await;

		inner.window.reset();
		inner.state = CircuitState::Closed;
		inner.opened_at = None;
		inner.trial_started_at = None;
	}

	async fn admit(&self) -> Admission {
		let now = self.clock.now_millis();
		let reset_after = duration_millis(self.config.reset_timeout());
		let mut inner = self.inner.lock().await;

		match inner.state {
			CircuitState::Closed => Admission::Closed,
			CircuitState::Open => {
				let opened_at = inner.opened_at.unwrap_or(now);

				if now >= opened_at.saturating_add(reset_after) {
					inner.state = CircuitState::HalfOpen;
					inner.trial_started_at = Some(now);

					tracing::info!(operation = %self.operation, "circuit half-open; admitting trial call");
					metrics::record_transition(&self.operation, CircuitState::HalfOpen);

					Admission::Trial
				} else {
					inner.rejections = inner.rejections.saturating_add(1);

					Admission::Rejected
				}
			},
			CircuitState::HalfOpen => {
				// A trial abandoned by its caller never settles; admit a new one once its
				// deadline has certainly passed.
				let deadline = duration_millis(self.config.timeout());
				let abandoned = inner
					.trial_started_at
					.is_none_or(|started| now >= started.saturating_add(deadline));

				if abandoned {
					inner.trial_started_at = Some(now);

					Admission::Trial
				} else {
					inner.rejections = inner.rejections.saturating_add(1);

					Admission::Rejected
				}
			},
		}
	}

	async fn settle(&self, admission: Admission, outcome: CallOutcome) {
		let now = self.clock.now_millis();
		let success = outcome == CallOutcome::Success;
		let mut inner = self.inner.lock().await;

		if outcome == CallOutcome::Timeout {
			inner.timeouts = inner.timeouts.saturating_add(1);
		}

		match (admission, inner.state) {
			(Admission::Trial, CircuitState::HalfOpen) =>
				if success {
					inner.window.reset();
					inner.state = CircuitState::Closed;
					inner.opened_at = None;
					inner.trial_started_at = None;

					tracing::info!(operation = %self.operation, "trial call succeeded; circuit closed");
					metrics::record_transition(&self.operation, CircuitState::Closed);
				} else {
					self.trip(&mut inner, now, "trial call failed");
				},
			(Admission::Closed, CircuitState::Closed) => {
				inner.window.record(now, success);

				let (successes, failures) = inner.window.totals(now);
				let total = successes + failures;
				let failure_pct =
					if total == 0 { 0.0 } else { failures as f64 * 100.0 / total as f64 };

				if total >= u64::from(self.config.volume_threshold)
					&& failure_pct >= self.config.error_threshold_percentage
				{
					self.trip(&mut inner, now, "failure threshold reached");
				}
			},
			// Calls admitted before a transition settle into a circuit that has already moved on.
			_ => {},
		}
	}

	fn trip(&self, inner: &mut BreakerInner, now: i64, reason: &'static str) {
		inner.state = CircuitState::Open;
		inner.opened_at = Some(now);
		inner.trial_started_at = None;

		tracing::warn!(operation = %self.operation, reason, "circuit opened");
		metrics::record_transition(&self.operation, CircuitState::Open);
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
	Closed,
	Trial,
	Rejected,
}

#[derive(Debug)]
struct BreakerInner {
	state: CircuitState,
	window: RollingWindow,
	opened_at: Option<i64>,
	trial_started_at: Option<i64>,
	rejections: u64,
	timeouts: u64,
}

/// Ring of time buckets; a bucket is live while its epoch is within the last `len` epochs.
#[derive(Debug)]
struct RollingWindow {
	buckets: Vec<Bucket>,
	bucket_width: i64,
}
impl RollingWindow {
	fn new(len: usize, bucket_width: i64) -> Self {
		Self { buckets: vec![Bucket::default(); len.max(1)], bucket_width: bucket_width.max(1) }
	}

	fn epoch(&self, now: i64) -> i64 {
		now.div_euclid(self.bucket_width)
	}

	fn record(&mut self, now: i64, success: bool) {
		let epoch = self.epoch(now);
		let len = self.buckets.len() as i64;
		let bucket = &mut self.buckets[epoch.rem_euclid(len) as usize];

		if bucket.epoch != epoch {
			*bucket = Bucket { epoch, ..Bucket::default() };
		}
		if success {
			bucket.successes += 1;
		} else {
			bucket.failures += 1;
		}
	}

	fn totals(&self, now: i64) -> (u64, u64) {
		let current = self.epoch(now);
		let oldest_live = current - self.buckets.len() as i64;

		self.buckets
			.iter()
			.filter(|bucket| bucket.epoch > oldest_live && bucket.epoch <= current)
			.fold((0, 0), |(s, f), bucket| (s + bucket.successes, f + bucket.failures))
	}

	fn reset(&mut self) {
		self.buckets.iter_mut().for_each(|bucket| *bucket = Bucket::default());
	}
}

#[derive(Clone, Copy, Debug)]
struct Bucket {
	epoch: i64,
	successes: u64,
	failures: u64,
}
impl Default for Bucket {
	fn default() -> Self {
		Self { epoch: i64::MIN, successes: 0, failures: 0 }
	}
}
