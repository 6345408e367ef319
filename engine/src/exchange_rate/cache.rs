// Copyright 2025 Chainflip Labs GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Rate-cache backends.
//!
//! The last-update map is independent of the value map but shares its keys:
//! deleting or expiring a value does not clear when it was last refreshed.

use super::ExchangeRate;
use crate::errors::RateError;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::MultiplexedConnection, AsyncCommands};
use std::{
	collections::HashMap,
	sync::Arc,
	time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait RateCache: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<ExchangeRate>, RateError>;
	async fn set(&self, key: &str, rate: &ExchangeRate, ttl: Duration) -> Result<(), RateError>;
	async fn delete(&self, key: &str) -> Result<(), RateError>;
	async fn last_update(&self, key: &str) -> Result<Option<DateTime<Utc>>, RateError>;
	async fn set_last_update(&self, key: &str, at: DateTime<Utc>) -> Result<(), RateError>;
}

struct CachedRate {
	rate: ExchangeRate,
	evict_at: Instant,
}

/// Process-local cache. Expired entries are invisible to readers
/// immediately and physically removed by the periodic scavenger.
#[derive(Default)]
pub struct InMemoryRateCache {
	entries: RwLock<HashMap<String, CachedRate>>,
	last_updates: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryRateCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Removes entries past their TTL. Last-update stamps are left alone.
	pub async fn scavenge(&self) {
		let now = Instant::now();
		let mut entries = self.entries.write().await;
		let before = entries.len();
		entries.retain(|_, entry| entry.evict_at > now);
		let evicted = before - entries.len();
		if evicted > 0 {
			debug!("Scavenged {evicted} expired exchange rates");
		}
	}

	/// Scavenges on `interval` until `shutdown` fires.
	pub async fn run_scavenger(
		self: Arc<Self>,
		interval: Duration,
		mut shutdown: tokio::sync::watch::Receiver<bool>,
	) {
		loop {
			tokio::select! {
				_ = tokio::time::sleep(interval) => self.scavenge().await,
				_ = shutdown.changed() => return,
			}
		}
	}
}

#[async_trait]
impl RateCache for InMemoryRateCache {
	async fn get(&self, key: &str) -> Result<Option<ExchangeRate>, RateError> {
		Ok(self
			.entries
			.read()
			.await
			.get(key)
			.filter(|entry| entry.evict_at > Instant::now())
			.map(|entry| entry.rate.clone()))
	}

	async fn set(&self, key: &str, rate: &ExchangeRate, ttl: Duration) -> Result<(), RateError> {
		self.entries.write().await.insert(
			key.to_string(),
			CachedRate { rate: rate.clone(), evict_at: Instant::now() + ttl },
		);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), RateError> {
		self.entries.write().await.remove(key);
		Ok(())
	}

	async fn last_update(&self, key: &str) -> Result<Option<DateTime<Utc>>, RateError> {
		Ok(self.last_updates.read().await.get(key).copied())
	}

	async fn set_last_update(&self, key: &str, at: DateTime<Utc>) -> Result<(), RateError> {
		self.last_updates.write().await.insert(key.to_string(), at);
		Ok(())
	}
}

/// Redis-backed cache; values are JSON under `{prefix}:rate:{key}` with
/// Redis-side expiry, last-update stamps under `{prefix}:rate_updated:{key}`.
#[derive(Clone)]
pub struct RedisRateCache {
	con: MultiplexedConnection,
	prefix: String,
}

impl RedisRateCache {
	pub fn new(con: MultiplexedConnection, prefix: &str) -> Self {
		Self { con, prefix: prefix.to_string() }
	}

	fn value_key(&self, key: &str) -> String {
		format!("{}:rate:{key}", self.prefix)
	}

	fn updated_key(&self, key: &str) -> String {
		format!("{}:rate_updated:{key}", self.prefix)
	}
}

#[async_trait]
impl RateCache for RedisRateCache {
	async fn get(&self, key: &str) -> Result<Option<ExchangeRate>, RateError> {
		let mut con = self.con.clone();
		let raw: Option<String> = con
			.get(self.value_key(key))
			.await
			.context("Reading rate from Redis")
			.map_err(RateError::Cache)?;
		raw.map(|raw| serde_json::from_str(&raw).context("Decoding cached rate"))
			.transpose()
			.map_err(RateError::Cache)
	}

	async fn set(&self, key: &str, rate: &ExchangeRate, ttl: Duration) -> Result<(), RateError> {
		let mut con = self.con.clone();
		let raw = serde_json::to_string(rate)
			.context("Encoding rate for Redis")
			.map_err(RateError::Cache)?;
		con.set_ex::<_, _, ()>(self.value_key(key), raw, ttl.as_secs().max(1))
			.await
			.context("Writing rate to Redis")
			.map_err(RateError::Cache)
	}

	async fn delete(&self, key: &str) -> Result<(), RateError> {
		let mut con = self.con.clone();
		con.del::<_, ()>(self.value_key(key))
			.await
			.context("Deleting rate from Redis")
			.map_err(RateError::Cache)
	}

	async fn last_update(&self, key: &str) -> Result<Option<DateTime<Utc>>, RateError> {
		let mut con = self.con.clone();
		let raw: Option<String> = con
			.get(self.updated_key(key))
			.await
			.context("Reading last-update stamp from Redis")
			.map_err(RateError::Cache)?;
		raw.map(|raw| {
			DateTime::parse_from_rfc3339(&raw)
				.map(|at| at.with_timezone(&Utc))
				.context("Decoding last-update stamp")
		})
		.transpose()
		.map_err(RateError::Cache)
	}

	async fn set_last_update(&self, key: &str, at: DateTime<Utc>) -> Result<(), RateError> {
		let mut con = self.con.clone();
		con.set::<_, _, ()>(self.updated_key(key), at.to_rfc3339())
			.await
			.context("Writing last-update stamp to Redis")
			.map_err(RateError::Cache)
	}
}
