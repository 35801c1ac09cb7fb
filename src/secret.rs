//! Consumer secret payloads, stale entries, and cache key derivation.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix shared by every consumer secret cache key.
pub const CONSUMER_SECRET_PREFIX: &str = "consumer_secret:";

/// Derive the cache key for a consumer; identical across every tier.
pub fn consumer_secret_key(consumer_id: &str) -> String {
	format!("{CONSUMER_SECRET_PREFIX}{consumer_id}")
}

/// Extract the consumer id encoded in a cache key.
pub fn consumer_id_from_key(key: &str) -> Option<&str> {
	key.strip_prefix(CONSUMER_SECRET_PREFIX).filter(|id| !id.is_empty())
}

/// Consumer identity a secret was issued for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRef {
	/// Authority-assigned consumer id.
	pub id: String,
	/// Human-readable consumer name.
	#[serde(default)]
	pub username: String,
}

/// Signing secret issued by the authority for one consumer.
///
/// Never mutated by the cache layer; tiers only copy or evict it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSecret {
	/// Secret identifier.
	pub id: String,
	/// Public consumer key.
	pub key: String,
	/// Signing material.
	pub secret: String,
	/// Owning consumer.
	pub consumer: ConsumerRef,
}
impl ConsumerSecret {
	/// Build a secret owned by `consumer_id`.
	pub fn new(
		id: impl Into<String>,
		key: impl Into<String>,
		secret: impl Into<String>,
		consumer_id: impl Into<String>,
		username: impl Into<String>,
	) -> Self {
		Self {
			id: id.into(),
			key: key.into(),
			secret: secret.into(),
			consumer: ConsumerRef { id: consumer_id.into(), username: username.into() },
		}
	}

	/// Whether this secret belongs to the given consumer.
	pub fn belongs_to(&self, consumer_id: &str) -> bool {
		self.consumer.id == consumer_id
	}

	/// Whether this secret may be stored under `key`.
	pub fn matches_key(&self, key: &str) -> bool {
		consumer_id_from_key(key).is_some_and(|id| self.belongs_to(id))
	}

	/// SHA-256 fingerprint of the signing material, safe for logs.
	pub fn fingerprint(&self) -> String {
		BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(self.secret.as_bytes()))
	}
}
impl Debug for ConsumerSecret {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("ConsumerSecret")
			.field("id", &self.id)
			.field("key", &self.key)
			.field("secret", &format_args!("sha256:{}", self.fingerprint()))
			.field("consumer", &self.consumer)
			.finish()
	}
}

/// Secret retained past its freshness window, stamped with its write time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleEntry {
	/// Cached payload.
	pub data: ConsumerSecret,
	/// Write time in epoch milliseconds.
	pub timestamp: i64,
}
impl StaleEntry {
	/// Age of the entry at `now_millis`.
	pub fn age_millis(&self, now_millis: i64) -> i64 {
		now_millis.saturating_sub(self.timestamp)
	}
}
