//! Circuit lifecycle observed through the coordinator.

// std
use std::{
	sync::atomic::{AtomicUsize, Ordering},
	time::Duration,
};
// crates.io
use kong_resilience::{CachingConfig, CircuitState, ResilienceCoordinator};
// self
use crate::support::{READ, coordinator, failing, secret};

const CREATE: &str = "createConsumerSecret";

async fn state(coordinator: &ResilienceCoordinator, operation: &str) -> CircuitState {
	coordinator.breaker(operation).await.expect("breaker").state().await
}

async fn fail_times(coordinator: &ResilienceCoordinator, operation: &str, times: usize) {
	for _ in 0..times {
		coordinator.wrap_operation(operation, "c1", failing).await;
	}
}

#[tokio::test]
async fn opens_once_volume_and_threshold_are_met() {
	let (coordinator, _) = coordinator(CachingConfig::default(), None);

	fail_times(&coordinator, READ, 2).await;

	assert_eq!(state(&coordinator, READ).await, CircuitState::Closed, "below volume");

	fail_times(&coordinator, READ, 1).await;

	assert_eq!(state(&coordinator, READ).await, CircuitState::Open);
}

#[tokio::test]
async fn stays_closed_below_error_threshold() {
	let (coordinator, _) = coordinator(CachingConfig::default(), None);

	for _ in 0..2 {
		coordinator.wrap_operation(READ, "c1", || async { Ok(Some(secret("c1"))) }).await;
	}

	fail_times(&coordinator, READ, 1).await;

	assert_eq!(state(&coordinator, READ).await, CircuitState::Closed, "33% failures");

	fail_times(&coordinator, READ, 1).await;

	assert_eq!(state(&coordinator, READ).await, CircuitState::Open, "50% failures");
}

#[tokio::test]
async fn open_circuit_skips_operation_and_serves_stale() {
	let (coordinator, _) = coordinator(CachingConfig::default(), None);
	let calls = AtomicUsize::new(0);

	coordinator.wrap_operation(READ, "c1", || async { Ok(Some(secret("c1"))) }).await;
	fail_times(&coordinator, READ, 2).await;

	assert_eq!(state(&coordinator, READ).await, CircuitState::Open);

	let served = coordinator
		.wrap_operation(READ, "c1", || {
			calls.fetch_add(1, Ordering::SeqCst);

			async { Ok(Some(secret("fresh"))) }
		})
		.await;

	assert_eq!(served, Some(secret("c1")));
	assert_eq!(calls.load(Ordering::SeqCst), 0);
	assert_eq!(coordinator.metrics().rejections, 1);
}

#[tokio::test]
async fn successful_trial_closes_circuit() {
	let (coordinator, clock) = coordinator(CachingConfig::default(), None);
	let calls = AtomicUsize::new(0);
	let probe = || {
		calls.fetch_add(1, Ordering::SeqCst);

		async { Ok(Some(secret("c1"))) }
	};

	fail_times(&coordinator, READ, 3).await;
	clock.advance(Duration::from_millis(4_999));
	coordinator.wrap_operation(READ, "c1", probe).await;

	assert_eq!(calls.load(Ordering::SeqCst), 0, "still inside reset timeout");

	clock.advance(Duration::from_millis(1));

	assert_eq!(coordinator.wrap_operation(READ, "c1", probe).await, Some(secret("c1")));
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert_eq!(state(&coordinator, READ).await, CircuitState::Closed);

	let snapshot = coordinator.breaker(READ).await.expect("breaker").snapshot().await;

	assert_eq!((snapshot.window_successes, snapshot.window_failures), (0, 0), "window reset");
}

#[tokio::test]
async fn failed_trial_reopens_circuit() {
	let (coordinator, clock) = coordinator(CachingConfig::default(), None);

	fail_times(&coordinator, READ, 3).await;
	clock.advance(Duration::from_millis(5_000));
	fail_times(&coordinator, READ, 1).await;

	assert_eq!(state(&coordinator, READ).await, CircuitState::Open);

	let before = coordinator.metrics().rejections;

	clock.advance(Duration::from_millis(4_999));
	fail_times(&coordinator, READ, 1).await;

	assert_eq!(coordinator.metrics().rejections, before + 1, "reset countdown restarted");
}

#[tokio::test(start_paused = true)]
async fn timeouts_count_as_failures() {
	let (coordinator, _) = coordinator(CachingConfig::default(), None);

	for _ in 0..3 {
		let result = coordinator
			.wrap_operation(READ, "c1", || async {
				tokio::time::sleep(Duration::from_secs(5)).await;

				Ok(Some(secret("c1")))
			})
			.await;

		assert_eq!(result, None);
	}

	let snapshot = coordinator.breaker(READ).await.expect("breaker").snapshot().await;

	assert_eq!(snapshot.state, CircuitState::Open);
	assert_eq!(snapshot.timeouts, 3);
}

#[tokio::test]
async fn circuits_are_independent_per_operation() {
	let (coordinator, _) = coordinator(CachingConfig::default(), None);

	fail_times(&coordinator, READ, 3).await;

	let created = coordinator.wrap_operation(CREATE, "c1", || async { Ok(Some(secret("c1"))) }).await;

	assert_eq!(created, Some(secret("c1")));
	assert_eq!(state(&coordinator, READ).await, CircuitState::Open);
	assert_eq!(state(&coordinator, CREATE).await, CircuitState::Closed);

	let operations: Vec<_> =
		coordinator.health().await.circuits.into_iter().map(|c| c.operation).collect();

	assert_eq!(operations, [CREATE, READ]);
}

#[tokio::test]
async fn failures_age_out_of_rolling_window() {
	let (coordinator, clock) = coordinator(CachingConfig::default(), None);

	fail_times(&coordinator, READ, 2).await;
	clock.advance(Duration::from_millis(10_000));
	fail_times(&coordinator, READ, 1).await;

	assert_eq!(state(&coordinator, READ).await, CircuitState::Closed);

	let snapshot = coordinator.breaker(READ).await.expect("breaker").snapshot().await;

	assert_eq!(snapshot.window_failures, 1);
}

#[tokio::test]
async fn disabled_breaker_never_opens() {
	let _ = tracing_subscriber::fmt::try_init();

	let config = kong_resilience::CircuitBreakerConfig {
		enabled: false,
		..crate::support::breaker_config()
	};
	let coordinator = ResilienceCoordinator::builder(CachingConfig::default(), config)
		.build()
		.expect("coordinator");

	fail_times(&coordinator, READ, 10).await;

	assert_eq!(state(&coordinator, READ).await, CircuitState::Closed);
	assert_eq!(coordinator.metrics().rejections, 0);
}
