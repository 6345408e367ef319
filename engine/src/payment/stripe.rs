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

use super::{InitiatePaymentRequest, InitiatedPayment, PaymentProvider, PaymentStatus};
use crate::{
	errors::PaymentError,
	settings::{ServerSettings, StripeSettings},
};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

/// Minimal Stripe REST client: checkout-session creation for deposits and
/// balance-transaction retrieval for fee extraction. Metadata is attached
/// both to the session and to the payment intent it creates, so every
/// webhook event type carries the ids the state machine needs.
pub struct StripeClient {
	client: reqwest::Client,
	api_url: String,
	api_key: String,
	success_url: String,
	cancel_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
	pub id: String,
	pub url: Option<String>,
	pub payment_intent: Option<String>,
	pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceTransactionObject {
	pub id: String,
	/// Provider fee in minor units of `currency`.
	pub fee: i64,
	pub currency: String,
}

impl StripeClient {
	pub fn new(
		stripe: &StripeSettings,
		server: &ServerSettings,
		http_timeout: Duration,
	) -> Result<Self, PaymentError> {
		let client = reqwest::Client::builder()
			.timeout(http_timeout)
			.build()
			.map_err(|e| PaymentError::Request(e.into()))?;
		let base = format!("{}://{}:{}", server.scheme, server.host, server.port);
		Ok(Self {
			client,
			api_url: stripe.api_url.trim_end_matches('/').to_string(),
			api_key: stripe.api_key.clone(),
			success_url: format!("{base}{}", stripe.success_path),
			cancel_url: format!("{base}{}", stripe.cancel_path),
		})
	}

	async fn post_form<T: serde::de::DeserializeOwned>(
		&self,
		path: &str,
		form: &[(String, String)],
	) -> Result<T, PaymentError> {
		let response = self
			.client
			.post(format!("{}{path}", self.api_url))
			.basic_auth(&self.api_key, None::<&str>)
			.form(form)
			.send()
			.await
			.map_err(|e| PaymentError::Request(anyhow!("transport: {e}")))?;
		if !response.status().is_success() {
			let status = response.status();
			let body = response.text().await.unwrap_or_default();
			return Err(PaymentError::Request(anyhow!("http status {status}: {body}")));
		}
		response.json().await.map_err(|e| PaymentError::Request(anyhow!("decoding body: {e}")))
	}

	async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, PaymentError> {
		let response = self
			.client
			.get(format!("{}{path}", self.api_url))
			.basic_auth(&self.api_key, None::<&str>)
			.send()
			.await
			.map_err(|e| PaymentError::Request(anyhow!("transport: {e}")))?;
		if !response.status().is_success() {
			return Err(PaymentError::Request(anyhow!("http status {}", response.status())));
		}
		response.json().await.map_err(|e| PaymentError::Request(anyhow!("decoding body: {e}")))
	}

	pub async fn create_checkout_session(
		&self,
		request: &InitiatePaymentRequest,
	) -> Result<CheckoutSessionObject, PaymentError> {
		let metadata = [
			("user_id", request.user_id.to_string()),
			("account_id", request.account_id.to_string()),
			("transaction_id", request.transaction_id.to_string()),
			("currency", request.currency.to_string()),
		];

		let mut form: Vec<(String, String)> = vec![
			("mode".into(), "payment".into()),
			("success_url".into(), self.success_url.clone()),
			("cancel_url".into(), self.cancel_url.clone()),
			("line_items[0][quantity]".into(), "1".into()),
			(
				"line_items[0][price_data][currency]".into(),
				request.currency.as_str().to_lowercase(),
			),
			(
				"line_items[0][price_data][unit_amount]".into(),
				request.amount_minor.to_string(),
			),
			(
				"line_items[0][price_data][product_data][name]".into(),
				"Account deposit".into(),
			),
		];
		for (key, value) in metadata {
			form.push((format!("metadata[{key}]"), value.clone()));
			// Mirrored onto the payment intent so intent and charge events
			// carry the same ids.
			form.push((format!("payment_intent_data[metadata][{key}]"), value));
		}

		self.post_form("/v1/checkout/sessions", &form).await
	}

	/// Fee extraction for `charge.*` events.
	pub async fn balance_transaction(
		&self,
		id: &str,
	) -> Result<BalanceTransactionObject, PaymentError> {
		self.get_json(&format!("/v1/balance_transactions/{id}")).await
	}
}

#[async_trait]
impl PaymentProvider for StripeClient {
	fn name(&self) -> &'static str {
		"stripe"
	}

	async fn initiate_payment(
		&self,
		request: InitiatePaymentRequest,
	) -> Result<InitiatedPayment, PaymentError> {
		let session = self.create_checkout_session(&request).await?;
		let checkout_url =
			session.url.ok_or(PaymentError::MalformedResponse("checkout url"))?;
		let expires_at = session
			.expires_at
			.and_then(|unix| DateTime::from_timestamp(unix, 0))
			.unwrap_or_else(|| Utc::now() + chrono::Duration::hours(24));
		Ok(InitiatedPayment {
			status: PaymentStatus::Pending,
			payment_id: session.payment_intent,
			session_id: session.id,
			checkout_url,
			expires_at,
		})
	}
}
