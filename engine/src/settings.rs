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

//! Layered configuration: defaults, then an optional TOML file, then
//! environment variables (`__`-separated, e.g. `AUTH__JWT__SECRET`), then
//! command-line overrides. Secrets deliberately have no defaults and fail
//! validation when absent.

use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source, Value};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
	pub host: String,
	pub port: u16,
	pub scheme: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbSettings {
	/// Directory of the embedded database.
	pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JwtSettings {
	pub secret: String,
	pub expiry_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
	pub jwt: JwtSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisSettings {
	pub url: String,
	pub key_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateCacheSettings {
	pub ttl_seconds: u64,
	pub max_retries: u32,
	pub prefix: String,
	/// Maximum age of a cached rate before providers are consulted again.
	pub validity_window_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeRateApiSettings {
	pub api_key: String,
	pub api_url: String,
	pub http_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateProviderSettings {
	pub exchangerate: ExchangeRateApiSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StripeSettings {
	pub api_key: String,
	pub signing_secret: String,
	pub api_url: String,
	pub success_path: String,
	pub cancel_path: String,
	pub webhook_tolerance_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentProviderSettings {
	pub stripe: StripeSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeeSettings {
	pub service_fee_percentage: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckSettings {
	pub hostname: String,
	pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub server: ServerSettings,
	pub db: DbSettings,
	pub auth: AuthSettings,
	pub redis: Option<RedisSettings>,
	pub exchange_rate_cache: RateCacheSettings,
	pub exchange_rate_provider: RateProviderSettings,
	pub payment_provider: PaymentProviderSettings,
	pub fee: FeeSettings,
	pub health_check: Option<HealthCheckSettings>,
}

#[derive(Parser, Debug, Clone, Default)]
#[clap(version)]
pub struct CommandLineOptions {
	/// Path of a TOML settings file merged over the defaults.
	#[clap(long = "config", short = 'c')]
	pub config_path: Option<String>,

	#[clap(long = "server.port")]
	server_port: Option<u16>,
	#[clap(long = "db.url")]
	db_url: Option<String>,
	#[clap(long = "redis.url")]
	redis_url: Option<String>,
	#[clap(long = "redis.key_prefix")]
	redis_key_prefix: Option<String>,
	#[clap(long = "health_check.hostname")]
	health_check_hostname: Option<String>,
	#[clap(long = "health_check.port")]
	health_check_port: Option<u16>,
}

pub fn insert_command_line_option<T>(
	map: &mut HashMap<String, Value>,
	key: &str,
	option: &Option<T>,
) where
	T: Clone + Into<Value>,
{
	if let Some(value) = option {
		map.insert(key.to_string(), value.clone().into());
	}
}

impl Source for CommandLineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(
			&mut map,
			"server.port",
			&self.server_port.map(|port| port as i64),
		);
		insert_command_line_option(&mut map, "db.url", &self.db_url);
		insert_command_line_option(&mut map, "redis.url", &self.redis_url);
		insert_command_line_option(&mut map, "redis.key_prefix", &self.redis_key_prefix);
		insert_command_line_option(
			&mut map,
			"health_check.hostname",
			&self.health_check_hostname,
		);
		insert_command_line_option(
			&mut map,
			"health_check.port",
			&self.health_check_port.map(|port| port as i64),
		);

		Ok(map)
	}
}

impl Settings {
	pub fn load(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let mut builder = Self::set_defaults(Config::builder())?;
		if let Some(path) = &opts.config_path {
			builder = builder.add_source(File::with_name(path));
		}
		let settings: Settings = builder
			.add_source(Environment::default().separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()?;
		settings.validate()?;
		Ok(settings)
	}

	fn set_defaults(
		config_builder: ConfigBuilder<config::builder::DefaultState>,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		// Secrets (jwt secret, provider keys) have no defaults on purpose.
		config_builder
			.set_default("server.host", "127.0.0.1")?
			.set_default("server.port", 8080)?
			.set_default("server.scheme", "http")?
			.set_default("db.url", "data/ledger.db")?
			.set_default("auth.jwt.expiry_seconds", 3600)?
			.set_default("exchange_rate_cache.ttl_seconds", 900)?
			.set_default("exchange_rate_cache.max_retries", 3)?
			.set_default("exchange_rate_cache.prefix", "rates")?
			.set_default("exchange_rate_cache.validity_window_seconds", 900)?
			.set_default(
				"exchange_rate_provider.exchangerate.api_url",
				"https://v6.exchangerate-api.com/v6",
			)?
			.set_default("exchange_rate_provider.exchangerate.http_timeout_seconds", 10)?
			.set_default("payment_provider.stripe.api_url", "https://api.stripe.com")?
			.set_default("payment_provider.stripe.success_path", "/payments/success")?
			.set_default("payment_provider.stripe.cancel_path", "/payments/cancel")?
			.set_default("payment_provider.stripe.webhook_tolerance_seconds", 300)?
			.set_default("fee.service_fee_percentage", 0.0)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		let require = |name: &str, value: &str| {
			if value.trim().is_empty() {
				Err(ConfigError::Message(format!("{name} must be set")))
			} else {
				Ok(())
			}
		};
		require("auth.jwt.secret", &self.auth.jwt.secret)?;
		require(
			"exchange_rate_provider.exchangerate.api_key",
			&self.exchange_rate_provider.exchangerate.api_key,
		)?;
		require("payment_provider.stripe.api_key", &self.payment_provider.stripe.api_key)?;
		require(
			"payment_provider.stripe.signing_secret",
			&self.payment_provider.stripe.signing_secret,
		)?;
		if !(0.0..=100.0).contains(&self.fee.service_fee_percentage) {
			return Err(ConfigError::Message(
				"fee.service_fee_percentage must be within 0..=100".to_string(),
			));
		}
		if let Some(redis) = &self.redis {
			url::Url::parse(&redis.url).map_err(|e| {
				ConfigError::Message(format!("redis.url is not a valid url: {e}"))
			})?;
		}
		Ok(())
	}
}
