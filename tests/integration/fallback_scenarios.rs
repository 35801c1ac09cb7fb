//! Fallback resolution scenarios across the distributed and local stale tiers.

// std
use std::{sync::atomic::Ordering, time::Duration};
// crates.io
use kong_resilience::{CachingConfig, FallbackResolution, StaleEntry, consumer_secret_key};
// self
use crate::support::{FlakyBackend, READ, coordinator, failing, secret};

fn ha() -> CachingConfig {
	CachingConfig { high_availability: true, ..Default::default() }
}

#[tokio::test]
async fn successful_read_is_served_after_authority_failure() {
	let (coordinator, _) = coordinator(CachingConfig::default(), None);
	let s1 = secret("c1");
	let fresh = coordinator.wrap_operation(READ, "c1", || async { Ok(Some(secret("c1"))) }).await;

	assert_eq!(fresh.as_ref(), Some(&s1));
	assert!(coordinator.local_cache().contains(&consumer_secret_key("c1")).await);

	let fallback = coordinator.wrap_operation(READ, "c1", failing).await;

	assert_eq!(fallback, Some(s1));
}

#[tokio::test]
async fn entry_past_tolerance_is_dropped() {
	let (coordinator, clock) = coordinator(CachingConfig::default(), None);
	let key = consumer_secret_key("c1");
	let now = 1_700_000_000_000;

	clock.set(now);
	coordinator
		.local_cache()
		.insert_entry(&key, StaleEntry { data: secret("c1"), timestamp: now - 61 * 60_000 })
		.await;

	assert_eq!(coordinator.wrap_operation(READ, "c1", failing).await, None);
	assert!(!coordinator.local_cache().contains(&key).await);
}

#[tokio::test]
async fn staleness_boundary_around_tolerance() {
	let (coordinator, clock) = coordinator(CachingConfig::default(), None);
	let key = consumer_secret_key("c1");
	let tolerance = 60 * 60_000;
	let written_at = 1_700_000_000_000;

	coordinator
		.local_cache()
		.insert_entry(&key, StaleEntry { data: secret("c1"), timestamp: written_at })
		.await;
	clock.set(written_at + tolerance - 1);

	assert_eq!(coordinator.resolve_fallback("c1").await, FallbackResolution::Local(secret("c1")));

	clock.set(written_at + tolerance + 1);

	assert_eq!(coordinator.resolve_fallback("c1").await, FallbackResolution::Exhausted);
	assert!(coordinator.local_cache().is_empty().await);
}

#[tokio::test]
async fn poisoned_distributed_entry_with_empty_local_yields_none() {
	let backend = FlakyBackend::new();
	let key = consumer_secret_key("c1");

	backend.seed(&key, secret("c2")).await;

	let (coordinator, _) = coordinator(ha(), Some(backend.clone()));

	assert_eq!(coordinator.wrap_operation(READ, "c1", failing).await, None);
	assert!(backend.stale.lock().await.is_empty(), "poisoned entry removed by the read");
}

#[tokio::test]
async fn poisoned_local_entry_is_never_served() {
	let (coordinator, _) = coordinator(CachingConfig::default(), None);
	let key = consumer_secret_key("c1");

	coordinator.local_cache().insert(&key, secret("c2")).await;

	assert_eq!(coordinator.wrap_operation(READ, "c1", failing).await, None);
	assert!(!coordinator.local_cache().contains(&key).await);
	assert_eq!(coordinator.metrics().poisoned, 1);
}

#[tokio::test]
async fn local_eviction_keeps_newest_entries() {
	let caching = CachingConfig { max_memory_entries: 3, ..Default::default() };
	let (coordinator, clock) = coordinator(caching, None);

	for (offset, id) in ["k1", "k2", "k3", "k4"].into_iter().enumerate() {
		clock.set(offset as i64);
		coordinator.wrap_operation(READ, id, || async move { Ok(Some(secret(id))) }).await;
	}

	let cache = coordinator.local_cache();

	assert!(!cache.contains(&consumer_secret_key("k1")).await);

	for id in ["k2", "k3", "k4"] {
		assert!(cache.contains(&consumer_secret_key(id)).await, "{id} retained");
	}
}

#[tokio::test]
async fn unreachable_distributed_tier_falls_through_to_local() {
	let backend = FlakyBackend::new();
	let (coordinator, _) = coordinator(ha(), Some(backend.clone()));

	coordinator.wrap_operation(READ, "c1", || async { Ok(Some(secret("c1"))) }).await;
	backend.unreachable.store(true, Ordering::SeqCst);

	assert_eq!(coordinator.wrap_operation(READ, "c1", failing).await, Some(secret("c1")));
	assert_eq!(backend.stale_reads(), 1);
	assert_eq!(coordinator.metrics().fallback_local, 1);
}

#[tokio::test]
async fn distributed_miss_falls_through_to_local() {
	let backend = FlakyBackend::new();
	let (coordinator, _) = coordinator(ha(), Some(backend.clone()));

	coordinator.local_cache().insert(&consumer_secret_key("c1"), secret("c1")).await;

	assert_eq!(coordinator.wrap_operation(READ, "c1", failing).await, Some(secret("c1")));
	assert_eq!(backend.stale_reads(), 1);
}

#[tokio::test(start_paused = true)]
async fn distributed_tier_serves_instances_with_cold_local_cache() {
	let backend = FlakyBackend::new();
	let (warm, _) = coordinator(ha(), Some(backend.clone()));
	let (cold, _) = coordinator(ha(), Some(backend.clone()));

	warm.wrap_operation(READ, "c1", || async { Ok(Some(secret("c1"))) }).await;
	tokio::time::sleep(Duration::from_millis(1)).await;

	assert!(cold.local_cache().is_empty().await);
	assert_eq!(
		cold.resolve_fallback("c1").await,
		FallbackResolution::Distributed(secret("c1"))
	);
}

#[tokio::test]
async fn non_ha_mode_never_consults_distributed_tier() {
	let backend = FlakyBackend::new();

	backend.seed(&consumer_secret_key("c1"), secret("c1")).await;

	let (coordinator, _) = coordinator(CachingConfig::default(), Some(backend.clone()));

	assert_eq!(coordinator.wrap_operation(READ, "c1", failing).await, None);
	assert_eq!(backend.stale_reads(), 0);
}

#[tokio::test]
async fn not_found_never_writes_or_falls_back() {
	let backend = FlakyBackend::new();
	let (coordinator, _) = coordinator(ha(), Some(backend.clone()));

	coordinator.local_cache().insert(&consumer_secret_key("c1"), secret("c1")).await;

	assert_eq!(coordinator.wrap_operation(READ, "c2", || async { Ok(None) }).await, None);
	assert_eq!(backend.stale_reads(), 0);
	assert!(backend.stale.lock().await.is_empty());
	assert!(!coordinator.local_cache().contains(&consumer_secret_key("c2")).await);
}

#[tokio::test(start_paused = true)]
async fn slow_authority_times_out_into_fallback() {
	let (coordinator, _) = coordinator(CachingConfig::default(), None);

	coordinator.wrap_operation(READ, "c1", || async { Ok(Some(secret("c1"))) }).await;

	let result = coordinator
		.wrap_operation(READ, "c1", || async {
			tokio::time::sleep(Duration::from_secs(30)).await;

			Ok(Some(secret("late")))
		})
		.await;

	assert_eq!(result, Some(secret("c1")));
	assert_eq!(coordinator.metrics().failures, 1);
}

#[tokio::test]
async fn shutdown_leaves_no_state_for_next_case() {
	let (coordinator, _) = coordinator(CachingConfig::default(), None);

	coordinator.wrap_operation(READ, "c1", || async { Ok(Some(secret("c1"))) }).await;
	coordinator.shutdown().await;

	assert_eq!(coordinator.wrap_operation(READ, "c1", failing).await, None);
	coordinator.shutdown().await;
	assert!(coordinator.health().await.circuits.is_empty());
}
