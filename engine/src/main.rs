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

use anyhow::Context;
use clap::Parser;
use ledger_engine::{
	account::AccountLocks,
	bus::{EventBus, LocalBus, RedisBus},
	constants::{PERSIST_MAX_ATTEMPTS, PERSIST_RETRY_DELAY, RATE_SCAVENGE_INTERVAL},
	exchange_rate::{
		cache::RateCache, ExchangeRateApiProvider, InMemoryRateCache, RateService,
		RedisRateCache,
	},
	flows::{self, FlowContext},
	health::HealthChecker,
	logging,
	payment::StripeClient,
	registry::CurrencyRegistry,
	retrier::RetryPolicy,
	settings::{CommandLineOptions, Settings},
	store::RocksStore,
};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let settings = match Settings::load(CommandLineOptions::parse()) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("Error reading settings: {error}");
			return Err(error.into());
		},
	};

	logging::init(false);
	info!("Starting the ledger engine");

	let store = Arc::new(
		RocksStore::open(Path::new(&settings.db.url)).context("Failed to open the ledger db")?,
	);

	let registry = Arc::new(
		CurrencyRegistry::new()
			.with_ttl(Duration::from_secs(settings.exchange_rate_cache.ttl_seconds))
			.with_backend(store.clone()),
	);
	registry.seed_defaults().await.context("Failed to seed the currency registry")?;

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

	// With Redis configured the engine consumes durable event streams and
	// shares its rate cache; without it everything stays in-process.
	let mut broker: Option<Arc<RedisBus>> = None;
	let (bus, rate_cache): (Arc<dyn EventBus>, Arc<dyn RateCache>) = match &settings.redis {
		Some(redis) => {
			let redis_bus = Arc::new(
				RedisBus::connect(&redis.url, &redis.key_prefix, "ledger-engine")
					.await
					.context("Failed to connect the event bus to Redis")?,
			);
			broker = Some(redis_bus.clone());
			let client = redis::Client::open(redis.url.as_str())
				.context("Invalid Redis url for the rate cache")?;
			let connection = client
				.get_multiplexed_async_connection()
				.await
				.context("Failed to connect the rate cache to Redis")?;
			(
				redis_bus,
				Arc::new(RedisRateCache::new(
					connection,
					&format!("{}:{}", redis.key_prefix, settings.exchange_rate_cache.prefix),
				)),
			)
		},
		None => {
			let cache = Arc::new(InMemoryRateCache::new());
			tokio::spawn(cache.clone().run_scavenger(
				RATE_SCAVENGE_INTERVAL,
				shutdown_rx.clone(),
			));
			(Arc::new(LocalBus::new()), cache)
		},
	};

	let rates = Arc::new(RateService::new(
		rate_cache,
		vec![Arc::new(
			ExchangeRateApiProvider::new(&settings.exchange_rate_provider.exchangerate)
				.context("Failed to build the exchange rate provider")?,
		)],
		Duration::from_secs(settings.exchange_rate_cache.validity_window_seconds),
		Duration::from_secs(settings.exchange_rate_cache.ttl_seconds),
	));

	let stripe = Arc::new(
		StripeClient::new(
			&settings.payment_provider.stripe,
			&settings.server,
			Duration::from_secs(
				settings.exchange_rate_provider.exchangerate.http_timeout_seconds,
			),
		)
		.context("Failed to build the Stripe client")?,
	);

	flows::register_handlers(Arc::new(FlowContext {
		store: store.clone(),
		bus: bus.clone(),
		rates,
		registry,
		locks: Arc::new(AccountLocks::new()),
		payments: stripe,
		service_fee_percentage: settings.fee.service_fee_percentage,
		retry: RetryPolicy::new(PERSIST_RETRY_DELAY, PERSIST_MAX_ATTEMPTS),
	}))
	.await;

	let mut tasks = Vec::new();
	if let Some(broker) = broker {
		let shutdown_rx = shutdown_rx.clone();
		tasks.push(tokio::spawn(async move {
			broker.run(shutdown_rx).await.context("Event bus consumer failed")
		}));
	}
	if let Some(health_check) = &settings.health_check {
		let checker = HealthChecker::new(health_check).await?;
		tasks.push(tokio::spawn(checker.run(shutdown_rx.clone())));
	}

	tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
	info!("Shutting down");
	let _ = shutdown_tx.send(true);
	for task in tasks {
		task.abort();
	}
	Ok(())
}
