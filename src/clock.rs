//! Wall-clock abstraction driving circuit reset, window aging, and staleness checks.
//!
//! Every time-dependent decision in the crate is evaluated lazily against a [`Clock`] when a
//! call arrives, so no timers are scheduled and tests can move time explicitly.

// std
use std::{
	fmt::Debug,
	sync::atomic::{AtomicI64, Ordering},
};
// crates.io
use chrono::Utc;
// self
use crate::_prelude::*;

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send + Sync + Debug {
	/// Current wall-clock time in milliseconds since the Unix epoch.
	fn now_millis(&self) -> i64;
}

/// Clock backed by the system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl SystemClock {
	/// Shared handle suitable for injection.
	pub fn shared() -> Arc<dyn Clock> {
		Arc::new(Self)
	}
}
impl Clock for SystemClock {
	fn now_millis(&self) -> i64 {
		Utc::now().timestamp_millis()
	}
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
	now: AtomicI64,
}
impl ManualClock {
	/// Create a clock frozen at `start_millis`.
	pub fn new(start_millis: i64) -> Arc<Self> {
		Arc::new(Self { now: AtomicI64::new(start_millis) })
	}

	/// Jump to an absolute time.
	pub fn set(&self, millis: i64) {
		self.now.store(millis, Ordering::SeqCst);
	}

	/// Move time forward by `delta`.
	pub fn advance(&self, delta: Duration) {
		self.now.fetch_add(duration_millis(delta), Ordering::SeqCst);
	}
}
impl Clock for ManualClock {
	fn now_millis(&self) -> i64 {
		self.now.load(Ordering::SeqCst)
	}
}

/// Saturating conversion of a [`Duration`] into signed milliseconds.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
	i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
