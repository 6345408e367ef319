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

//! Payment-provider adapter: checkout initiation and the webhook state
//! machine that converts provider notifications into internal events.

pub mod stripe;
pub mod webhook;

use crate::errors::PaymentError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_primitives::{AccountId, CurrencyCode, TransactionId, UserId};

pub use self::stripe::StripeClient;
pub use self::webhook::{PaymentEvent, PaymentEventKind, StripeWebhook, WebhookSignature};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
	Pending,
	Completed,
	Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitiatePaymentRequest {
	pub user_id: UserId,
	pub account_id: AccountId,
	pub transaction_id: TransactionId,
	/// Amount in minor units of `currency`, i.e. what the user pays.
	pub amount_minor: i64,
	pub currency: CurrencyCode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitiatedPayment {
	pub status: PaymentStatus,
	/// The provider's payment id, when it is already known at initiation.
	/// Stripe only allocates the payment intent on checkout completion, in
	/// which case this stays empty until the webhook supplies it.
	pub payment_id: Option<String>,
	pub session_id: String,
	pub checkout_url: String,
	pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
	fn name(&self) -> &'static str;

	async fn initiate_payment(
		&self,
		request: InitiatePaymentRequest,
	) -> Result<InitiatedPayment, PaymentError>;
}
