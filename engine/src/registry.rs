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

//! Process-wide currency registry.
//!
//! Constructed explicitly and injected where needed; there is no ambient
//! instance, so tests can build a fresh registry per case. Entries are
//! cached with an optional TTL: with a backend attached, stale entries are
//! reloaded from it; without one the TTL is inert and entries are served
//! as registered. The three-uppercase-letters code shape is enforced by
//! [CurrencyCode] itself; the injectable validator carries any further
//! registry-level rules.

use crate::errors::RegistryError;
use async_trait::async_trait;
use ledger_primitives::{Currency, CurrencyCode, CurrencyError, MAX_CURRENCY_DECIMALS};
use std::{collections::HashMap, sync::Arc, time::{Duration, Instant}};
use tokio::sync::RwLock;

pub type CurrencyValidator = Arc<dyn Fn(&Currency) -> Result<(), CurrencyError> + Send + Sync>;

/// Optional persistence hook for registered currencies.
#[async_trait]
pub trait CurrencyBackend: Send + Sync {
	async fn load(&self, code: CurrencyCode) -> anyhow::Result<Option<Currency>>;
	async fn save(&self, currency: &Currency) -> anyhow::Result<()>;
}

struct CachedCurrency {
	currency: Currency,
	cached_at: Instant,
}

pub struct CurrencyRegistry {
	entries: RwLock<HashMap<CurrencyCode, CachedCurrency>>,
	ttl: Option<Duration>,
	validator: CurrencyValidator,
	backend: Option<Arc<dyn CurrencyBackend>>,
}

impl Default for CurrencyRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl CurrencyRegistry {
	pub fn new() -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
			ttl: None,
			validator: Arc::new(default_validator),
			backend: None,
		}
	}

	pub fn with_ttl(mut self, ttl: Duration) -> Self {
		self.ttl = Some(ttl);
		self
	}

	pub fn with_validator(mut self, validator: CurrencyValidator) -> Self {
		self.validator = validator;
		self
	}

	pub fn with_backend(mut self, backend: Arc<dyn CurrencyBackend>) -> Self {
		self.backend = Some(backend);
		self
	}

	pub async fn register(&self, currency: Currency) -> Result<(), RegistryError> {
		(self.validator)(&currency)?;
		if let Some(backend) = &self.backend {
			backend.save(&currency).await.map_err(RegistryError::Backend)?;
		}
		self.entries.write().await.insert(
			currency.code,
			CachedCurrency { currency, cached_at: Instant::now() },
		);
		Ok(())
	}

	pub async fn get(&self, code: CurrencyCode) -> Option<Currency> {
		let stale = {
			let entries = self.entries.read().await;
			match entries.get(&code) {
				Some(entry) => match self.ttl {
					Some(ttl) if entry.cached_at.elapsed() >= ttl => true,
					_ => return Some(entry.currency.clone()),
				},
				None => false,
			}
		};

		let Some(backend) = &self.backend else {
			// No backend to refresh from: a stale entry is still the best
			// answer we have, a missing one stays missing.
			return if stale {
				self.entries.read().await.get(&code).map(|e| e.currency.clone())
			} else {
				None
			};
		};

		match backend.load(code).await {
			Ok(Some(currency)) => {
				self.entries.write().await.insert(
					code,
					CachedCurrency { currency: currency.clone(), cached_at: Instant::now() },
				);
				Some(currency)
			},
			Ok(None) => {
				self.entries.write().await.remove(&code);
				None
			},
			Err(error) => {
				tracing::warn!("Currency backend load failed for {code}: {error:#}");
				self.entries.read().await.get(&code).map(|e| e.currency.clone())
			},
		}
	}

	pub async fn active_codes(&self) -> Vec<CurrencyCode> {
		self.entries
			.read()
			.await
			.values()
			.filter(|e| e.currency.active)
			.map(|e| e.currency.code)
			.collect()
	}

	/// Registers the common ISO-4217 currencies the ledger supports out of
	/// the box.
	pub async fn seed_defaults(&self) -> Result<(), RegistryError> {
		for (code, name, symbol, decimals) in [
			("USD", "United States Dollar", "$", 2),
			("EUR", "Euro", "€", 2),
			("GBP", "Pound Sterling", "£", 2),
			("CHF", "Swiss Franc", "Fr", 2),
			("JPY", "Japanese Yen", "¥", 0),
			("AUD", "Australian Dollar", "A$", 2),
			("CAD", "Canadian Dollar", "C$", 2),
		] {
			let code = CurrencyCode::new(code).map_err(RegistryError::Currency)?;
			self.register(Currency::new(code, name, symbol, decimals)?).await?;
		}
		Ok(())
	}
}

fn default_validator(currency: &Currency) -> Result<(), CurrencyError> {
	if currency.decimals > MAX_CURRENCY_DECIMALS {
		return Err(CurrencyError::InvalidDecimals(currency.decimals));
	}
	if currency.name.is_empty() {
		return Err(CurrencyError::InvalidCode(currency.code.to_string()));
	}
	Ok(())
}
