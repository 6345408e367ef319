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

//! Exchange-rate service: cache in front of a prioritized provider chain.
//!
//! Lookup order for `get_rate(from, to)`: synthesized identity rate, cache,
//! inverted reverse-pair cache entry, then each healthy provider in
//! configured order. Provider results are cached with the TTL they declare;
//! reverse inferences are served without being written back.

pub mod cache;
pub mod providers;

use crate::{constants::IDENTITY_RATE_VALIDITY, errors::RateError};
use async_trait::async_trait;
use self::cache::RateCache;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ledger_primitives::CurrencyCode;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, warn};

pub use self::cache::{InMemoryRateCache, RedisRateCache};
pub use self::providers::ExchangeRateApiProvider;

/// A conversion rate between two currencies at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
	pub from: CurrencyCode,
	pub to: CurrencyCode,
	pub rate: f64,
	pub last_updated: DateTime<Utc>,
	pub source: String,
	pub expires_at: DateTime<Utc>,
}

/// What a provider reports for one currency pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RateInfo {
	pub rate: f64,
	pub timestamp: DateTime<Utc>,
	/// Providers that publish an update schedule report when this rate
	/// stops being current; otherwise the service applies its default TTL.
	pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RateProvider: Send + Sync {
	fn name(&self) -> &str;

	/// Unhealthy providers are skipped without being called.
	async fn is_healthy(&self) -> bool;

	async fn rate(&self, from: CurrencyCode, to: CurrencyCode) -> Result<RateInfo, RateError>;

	/// Batched variant; implementations should fetch all requested
	/// currencies in one request where the upstream API allows it.
	async fn rates(
		&self,
		from: CurrencyCode,
		to: &[CurrencyCode],
	) -> Result<HashMap<CurrencyCode, RateInfo>, RateError>;
}

fn is_valid_rate(rate: f64) -> bool {
	rate > 0.0 && rate.is_finite()
}

pub struct RateService {
	cache: Arc<dyn RateCache>,
	providers: Vec<Arc<dyn RateProvider>>,
	/// Maximum wall-clock age of a cached rate below which it is served
	/// without provider contact.
	validity_window: Duration,
	/// TTL applied when a provider does not declare an expiry.
	default_ttl: Duration,
}

impl RateService {
	pub fn new(
		cache: Arc<dyn RateCache>,
		providers: Vec<Arc<dyn RateProvider>>,
		validity_window: Duration,
		default_ttl: Duration,
	) -> Self {
		Self { cache, providers, validity_window, default_ttl }
	}

	fn cache_key(from: CurrencyCode, to: CurrencyCode) -> String {
		format!("{from}:{to}")
	}

	pub async fn get_rate(
		&self,
		from: CurrencyCode,
		to: CurrencyCode,
	) -> Result<ExchangeRate, RateError> {
		if from == to {
			let now = Utc::now();
			return Ok(ExchangeRate {
				from,
				to,
				rate: 1.0,
				last_updated: now,
				source: "internal".to_string(),
				expires_at: now +
					ChronoDuration::from_std(IDENTITY_RATE_VALIDITY)
						.expect("constant fits chrono range"),
			});
		}

		if let Some(rate) = self.cached(from, to).await? {
			return Ok(rate);
		}

		if let Some(inverted) = self.inverted_from_reverse(from, to).await? {
			return Ok(inverted);
		}

		for provider in &self.providers {
			if !provider.is_healthy().await {
				debug!(provider = provider.name(), "Skipping unhealthy rate provider");
				continue;
			}
			match provider.rate(from, to).await {
				Ok(info) if is_valid_rate(info.rate) => {
					return self.admit(provider.name(), from, to, info).await;
				},
				Ok(info) => {
					warn!(
						provider = provider.name(),
						rate = info.rate,
						"Provider returned an invalid rate for {from}:{to}"
					);
				},
				Err(error) => {
					warn!(
						provider = provider.name(),
						"Provider failed for {from}:{to}: {error:#}"
					);
				},
			}
		}

		Err(RateError::Unavailable { from, to })
	}

	/// Per-currency version of [Self::get_rate] that batches the provider
	/// round-trip for everything the cache could not serve. Currencies no
	/// provider could supply are absent from the result.
	pub async fn get_rates(
		&self,
		from: CurrencyCode,
		to: &[CurrencyCode],
	) -> Result<HashMap<CurrencyCode, ExchangeRate>, RateError> {
		let mut rates = HashMap::new();
		let mut missing = Vec::new();

		for &target in to {
			if target == from {
				rates.insert(target, self.get_rate(from, target).await?);
			} else if let Some(cached) = self.cached(from, target).await? {
				rates.insert(target, cached);
			} else {
				missing.push(target);
			}
		}

		if !missing.is_empty() {
			for provider in &self.providers {
				if missing.is_empty() {
					break;
				}
				if !provider.is_healthy().await {
					debug!(provider = provider.name(), "Skipping unhealthy rate provider");
					continue;
				}
				match provider.rates(from, &missing).await {
					Ok(batch) => {
						for (target, info) in batch {
							if !missing.contains(&target) || !is_valid_rate(info.rate) {
								continue;
							}
							let admitted =
								self.admit(provider.name(), from, target, info).await?;
							missing.retain(|&c| c != target);
							rates.insert(target, admitted);
						}
					},
					Err(error) => {
						warn!(
							provider = provider.name(),
							"Batched rate request from {from} failed: {error:#}"
						);
					},
				}
			}
		}

		if rates.is_empty() && !to.is_empty() {
			return Err(RateError::NoneAvailable { from });
		}
		if !missing.is_empty() {
			warn!("No rate available from {from} for {missing:?}");
		}
		Ok(rates)
	}

	/// Caches a provider-sourced rate and returns it.
	async fn admit(
		&self,
		provider_name: &str,
		from: CurrencyCode,
		to: CurrencyCode,
		info: RateInfo,
	) -> Result<ExchangeRate, RateError> {
		let now = Utc::now();
		let expires_at = info.expires_at.unwrap_or(
			now + ChronoDuration::from_std(self.default_ttl)
				.expect("configured ttl fits chrono range"),
		);
		let rate = ExchangeRate {
			from,
			to,
			rate: info.rate,
			last_updated: info.timestamp,
			source: provider_name.to_string(),
			expires_at,
		};
		let ttl = (expires_at - now).to_std().unwrap_or(self.default_ttl);
		let key = Self::cache_key(from, to);
		self.cache.set(&key, &rate, ttl).await?;
		self.cache.set_last_update(&key, now).await?;
		Ok(rate)
	}

	/// A cache entry is served only while unexpired AND younger than the
	/// validity window.
	async fn cached(
		&self,
		from: CurrencyCode,
		to: CurrencyCode,
	) -> Result<Option<ExchangeRate>, RateError> {
		let key = Self::cache_key(from, to);
		let Some(entry) = self.cache.get(&key).await? else { return Ok(None) };
		let now = Utc::now();
		if now >= entry.expires_at {
			return Ok(None);
		}
		let last_updated = self.cache.last_update(&key).await?.unwrap_or(entry.last_updated);
		let window =
			ChronoDuration::from_std(self.validity_window).expect("window fits chrono range");
		if now - last_updated >= window {
			return Ok(None);
		}
		Ok(Some(entry))
	}

	/// Serves `1/rate` of a fresh reverse-pair entry, without writing the
	/// inference back to the cache.
	async fn inverted_from_reverse(
		&self,
		from: CurrencyCode,
		to: CurrencyCode,
	) -> Result<Option<ExchangeRate>, RateError> {
		let Some(reverse) = self.cached(to, from).await? else { return Ok(None) };
		if reverse.rate == 0.0 {
			return Ok(None);
		}
		Ok(Some(ExchangeRate {
			from,
			to,
			rate: 1.0 / reverse.rate,
			last_updated: reverse.last_updated,
			source: format!("{} (reversed)", reverse.source),
			expires_at: reverse.expires_at,
		}))
	}
}
