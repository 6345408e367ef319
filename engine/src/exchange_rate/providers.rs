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

use super::{RateInfo, RateProvider};
use crate::{constants::PROVIDER_HEALTH_BACKOFF, errors::RateError, settings::ExchangeRateApiSettings};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_primitives::CurrencyCode;
use serde::Deserialize;
use std::{
	collections::HashMap,
	sync::Mutex,
	time::{Duration, Instant},
};

const PROVIDER_NAME: &str = "exchangerate-api";

/// HTTP client for the exchangerate-api.com v6 API.
///
/// A transport or API-level failure marks the provider unhealthy for
/// [PROVIDER_HEALTH_BACKOFF], during which the service skips it without
/// issuing requests.
pub struct ExchangeRateApiProvider {
	client: reqwest::Client,
	api_url: String,
	api_key: String,
	unhealthy_until: Mutex<Option<Instant>>,
}

#[derive(Debug, Deserialize)]
struct PairResponse {
	result: String,
	#[serde(rename = "error-type")]
	error_type: Option<String>,
	conversion_rate: Option<f64>,
	time_last_update_unix: Option<i64>,
	time_next_update_unix: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
	result: String,
	#[serde(rename = "error-type")]
	error_type: Option<String>,
	conversion_rates: Option<HashMap<String, f64>>,
	time_last_update_unix: Option<i64>,
	time_next_update_unix: Option<i64>,
}

fn timestamps(last: Option<i64>, next: Option<i64>) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
	let last_updated =
		last.and_then(|unix| DateTime::from_timestamp(unix, 0)).unwrap_or_else(Utc::now);
	let expires_at = next.and_then(|unix| DateTime::from_timestamp(unix, 0));
	(last_updated, expires_at)
}

impl ExchangeRateApiProvider {
	pub fn new(settings: &ExchangeRateApiSettings) -> Result<Self, RateError> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(settings.http_timeout_seconds))
			.build()
			.map_err(|e| RateError::Provider {
				provider: PROVIDER_NAME.to_string(),
				source: e.into(),
			})?;
		Ok(Self {
			client,
			api_url: settings.api_url.trim_end_matches('/').to_string(),
			api_key: settings.api_key.clone(),
			unhealthy_until: Mutex::new(None),
		})
	}

	fn mark_unhealthy(&self) {
		*self.unhealthy_until.lock().unwrap() = Some(Instant::now() + PROVIDER_HEALTH_BACKOFF);
	}

	fn provider_error(&self, source: anyhow::Error) -> RateError {
		self.mark_unhealthy();
		RateError::Provider { provider: PROVIDER_NAME.to_string(), source }
	}

	async fn get_json<T: serde::de::DeserializeOwned>(&self, path: String) -> Result<T, RateError> {
		let url = format!("{}/{}/{path}", self.api_url, self.api_key);
		let response = self
			.client
			.get(&url)
			.send()
			.await
			.map_err(|e| self.provider_error(anyhow!("transport: {e}")))?;
		if !response.status().is_success() {
			return Err(self.provider_error(anyhow!("http status {}", response.status())));
		}
		response.json().await.map_err(|e| self.provider_error(anyhow!("decoding body: {e}")))
	}
}

#[async_trait]
impl RateProvider for ExchangeRateApiProvider {
	fn name(&self) -> &str {
		PROVIDER_NAME
	}

	async fn is_healthy(&self) -> bool {
		match *self.unhealthy_until.lock().unwrap() {
			Some(until) => Instant::now() >= until,
			None => true,
		}
	}

	async fn rate(&self, from: CurrencyCode, to: CurrencyCode) -> Result<RateInfo, RateError> {
		let response: PairResponse = self.get_json(format!("pair/{from}/{to}")).await?;
		if response.result != "success" {
			return Err(self.provider_error(anyhow!(
				"api error: {}",
				response.error_type.unwrap_or_else(|| "unknown".to_string())
			)));
		}
		let rate = response
			.conversion_rate
			.ok_or_else(|| self.provider_error(anyhow!("response missing conversion_rate")))?;
		let (timestamp, expires_at) =
			timestamps(response.time_last_update_unix, response.time_next_update_unix);
		Ok(RateInfo { rate, timestamp, expires_at })
	}

	async fn rates(
		&self,
		from: CurrencyCode,
		to: &[CurrencyCode],
	) -> Result<HashMap<CurrencyCode, RateInfo>, RateError> {
		let response: LatestResponse = self.get_json(format!("latest/{from}")).await?;
		if response.result != "success" {
			return Err(self.provider_error(anyhow!(
				"api error: {}",
				response.error_type.unwrap_or_else(|| "unknown".to_string())
			)));
		}
		let all = response
			.conversion_rates
			.ok_or_else(|| self.provider_error(anyhow!("response missing conversion_rates")))?;
		let (timestamp, expires_at) =
			timestamps(response.time_last_update_unix, response.time_next_update_unix);
		Ok(to
			.iter()
			.filter_map(|code| {
				all.get(code.as_str())
					.map(|&rate| (*code, RateInfo { rate, timestamp, expires_at }))
			})
			.collect())
	}
}
