//! Distributed backend shared across instances, with a primary and a stale keyspace.
//!
//! Keys are laid out as `{namespace}:{key}` (primary, expires after `ttl_seconds`) and
//! `{namespace}:stale:{key}` (stale, expires after the stale tolerance). Payloads are JSON.
//!
//! The connection is a [`ConnectionManager`], which re-dials after the server drops the socket, so
//! a Redis restart costs failed calls for the outage only.

// std
use std::{
	fmt::{Debug, Formatter, Result as FmtResult},
	sync::atomic::{AtomicU64, Ordering},
};
// crates.io
use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, aio::ConnectionManager};
use tokio::{sync::RwLock, time};
// self
use crate::{
	_prelude::*,
	cache::{CacheBackend, CacheStats, ensure_owner},
	config::CachingConfig,
	secret::{ConsumerSecret, StaleEntry},
};

/// Redis-backed primary and stale tiers.
pub struct RedisBackend {
	client: redis::Client,
	namespace: Arc<str>,
	ttl: Duration,
	stale_ttl: Duration,
	connect_timeout: Duration,
	connection: RwLock<Option<ConnectionManager>>,
	hits: AtomicU64,
	misses: AtomicU64,
}
impl RedisBackend {
	/// Build a backend from `config.redis`; no connection is made until [`CacheBackend::connect`].
	pub fn new(config: &CachingConfig) -> Result<Self> {
		config.redis.validate()?;

		Ok(Self {
			client: redis::Client::open(config.redis.url.as_str())?,
			namespace: Arc::from(config.redis.namespace.as_str()),
			ttl: config.ttl(),
			stale_ttl: config.stale_tolerance(),
			connect_timeout: config.redis.connect_timeout(),
			connection: RwLock::new(None),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
		})
	}

	fn primary_key(&self, key: &str) -> String {
		format!("{}:{key}", self.namespace)
	}

	fn stale_key(&self, key: &str) -> String {
		format!("{}:stale:{key}", self.namespace)
	}

	async fn connection(&self) -> Result<ConnectionManager> {
		if let Some(conn) = self.connection.read().await.as_ref() {
			return Ok(conn.clone());
		}

		self.connect().await?;

		self.connection
			.read()
			.await
			.clone()
			.ok_or_else(|| Error::Cache("Redis connection unavailable.".into()))
	}

	async fn keys_matching(&self, conn: &mut ConnectionManager, pattern: &str) -> Result<Vec<String>> {
		Ok(redis::cmd("KEYS").arg(pattern).query_async(conn).await?)
	}

	async fn delete_keys(&self, conn: &mut ConnectionManager, keys: Vec<String>) -> Result<usize> {
		if keys.is_empty() {
			return Ok(0);
		}

		let count = keys.len();

		conn.del::<_, ()>(keys).await?;

		Ok(count)
	}
}
impl Debug for RedisBackend {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("RedisBackend")
			.field("namespace", &self.namespace)
			.field("ttl", &self.ttl)
			.field("stale_ttl", &self.stale_ttl)
			.field("connect_timeout", &self.connect_timeout)
			.finish_non_exhaustive()
	}
}
#[async_trait]
impl CacheBackend for RedisBackend {
	fn name(&self) -> &'static str {
		"redis"
	}

	async fn get(&self, key: &str) -> Result<Option<ConsumerSecret>> {
		let mut conn = self.connection().await?;
		let raw: Option<String> = conn.get(self.primary_key(key)).await?;
		let value = raw.map(|json| serde_json::from_str::<ConsumerSecret>(&json)).transpose()?;
		let counter = if value.is_some() { &self.hits } else { &self.misses };

		counter.fetch_add(1, Ordering::Relaxed);

		Ok(value)
	}

	async fn set(&self, key: &str, value: &ConsumerSecret, ttl: Option<Duration>) -> Result<()> {
		ensure_owner(key, value)?;

		let payload = serde_json::to_string(value)?;
		let ttl_secs = ttl.unwrap_or(self.ttl).as_secs().max(1);
		let mut conn = self.connection().await?;

		conn.set_ex::<_, _, ()>(self.primary_key(key), payload, ttl_secs).await?;

		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<()> {
		let mut conn = self.connection().await?;

		conn.del::<_, ()>(self.primary_key(key)).await?;

		Ok(())
	}

	async fn clear(&self) -> Result<()> {
		let mut conn = self.connection().await?;
		let stale_prefix = self.stale_key("");
		let keys = self
			.keys_matching(&mut conn, &format!("{}:*", self.namespace))
			.await?
			.into_iter()
			.filter(|key| !key.starts_with(&stale_prefix))
			.collect();
		let removed = self.delete_keys(&mut conn, keys).await?;

		tracing::debug!(namespace = %self.namespace, removed, "cleared primary keyspace");

		Ok(())
	}

	async fn stats(&self) -> Result<CacheStats> {
		let mut conn = self.connection().await?;
		let stale_prefix = self.stale_key("");
		let keys = self.keys_matching(&mut conn, &format!("{}:*", self.namespace)).await?;
		let stale_size = keys.iter().filter(|key| key.starts_with(&stale_prefix)).count();

		Ok(CacheStats {
			backend: self.name().into(),
			size: keys.len() - stale_size,
			stale_size: Some(stale_size),
			hits: Some(self.hits.load(Ordering::Relaxed)),
			misses: Some(self.misses.load(Ordering::Relaxed)),
			evictions: None,
		})
	}

	async fn is_healthy(&self) -> bool {
		let Ok(mut conn) = self.connection().await else {
			return false;
		};

		redis::cmd("PING").query_async::<String>(&mut conn).await.is_ok()
	}

	async fn connect(&self) -> Result<()> {
		let mut slot = self.connection.write().await;

		if slot.is_some() {
			return Ok(());
		}

		let conn = time::timeout(self.connect_timeout, self.client.get_connection_manager())
			.await
			.map_err(|_| {
				Error::Cache(format!("Redis connect timed out after {:?}.", self.connect_timeout))
			})??;

		*slot = Some(conn);

		tracing::info!(namespace = %self.namespace, "redis cache connected");

		Ok(())
	}

	async fn disconnect(&self) -> Result<()> {
		if self.connection.write().await.take().is_some() {
			tracing::info!(namespace = %self.namespace, "redis cache disconnected");
		}

		Ok(())
	}

	fn supports_stale(&self) -> bool {
		true
	}

	async fn get_stale(&self, key: &str) -> Result<Option<StaleEntry>> {
		let mut conn = self.connection().await?;
		let raw: Option<String> = conn.get(self.stale_key(key)).await?;

		Ok(raw.map(|json| serde_json::from_str::<StaleEntry>(&json)).transpose()?)
	}

	async fn set_stale(&self, key: &str, value: &ConsumerSecret) -> Result<()> {
		ensure_owner(key, value)?;

		let entry = StaleEntry { data: value.clone(), timestamp: Utc::now().timestamp_millis() };
		let payload = serde_json::to_string(&entry)?;
		let ttl_secs = self.stale_ttl.as_secs().max(1);
		let mut conn = self.connection().await?;

		conn.set_ex::<_, _, ()>(self.stale_key(key), payload, ttl_secs).await?;

		Ok(())
	}

	async fn delete_stale(&self, key: &str) -> Result<()> {
		let mut conn = self.connection().await?;

		conn.del::<_, ()>(self.stale_key(key)).await?;

		Ok(())
	}

	async fn clear_stale(&self) -> Result<()> {
		let mut conn = self.connection().await?;
		let keys = self.keys_matching(&mut conn, &format!("{}*", self.stale_key(""))).await?;
		let removed = self.delete_keys(&mut conn, keys).await?;

		tracing::debug!(namespace = %self.namespace, removed, "cleared stale keyspace");

		Ok(())
	}
}
