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

//! Transaction and checkout-session entities. Transactions record the signed
//! balance delta they applied, so `balance_snapshot = prior_balance + amount`
//! holds for every completed transaction regardless of direction.

use crate::errors::DomainError;
use chrono::{DateTime, Utc};
use ledger_primitives::{AccountId, CurrencyCode, Money, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
	Initiated,
	Pending,
	Completed,
	Failed,
	Expired,
}

impl TransactionStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Expired)
	}

	/// Exhaustive transition table, forward only. If an edge is not listed
	/// here it is not allowed.
	pub fn can_transition_to(&self, new: &Self) -> bool {
		matches!(
			(self, new),
			(Self::Initiated, Self::Pending) |
				(Self::Initiated, Self::Completed) |
				(Self::Initiated, Self::Failed) |
				(Self::Initiated, Self::Expired) |
				(Self::Pending, Self::Completed) |
				(Self::Pending, Self::Failed) |
				(Self::Pending, Self::Expired)
		)
	}
}

impl fmt::Display for TransactionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Initiated => "initiated",
			Self::Pending => "pending",
			Self::Completed => "completed",
			Self::Failed => "failed",
			Self::Expired => "expired",
		};
		f.write_str(s)
	}
}

/// Where the money entering or leaving an account comes from or goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoneySource {
	Internal,
	BankAccount,
	Card,
	Cash,
	ExternalWallet,
	Stripe,
}

impl MoneySource {
	/// Whether a deposit from this source goes through the external payment
	/// provider (checkout + webhook) before funds are credited.
	pub fn requires_provider(&self) -> bool {
		!matches!(self, Self::Internal | Self::Cash)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
	pub id: TransactionId,
	pub user_id: UserId,
	pub account_id: AccountId,
	/// Signed delta applied to the account balance, in the account currency.
	pub amount: Money,
	/// Account balance after this transaction was applied (equal to the
	/// balance before it for transactions that never completed).
	pub balance_snapshot: Money,
	pub money_source: MoneySource,
	pub status: TransactionStatus,
	pub payment_id: Option<String>,
	pub external_target: Option<String>,
	/// The user-supplied amount before currency conversion, if any.
	pub original_amount: Option<Money>,
	pub conversion_rate: Option<f64>,
	pub fee: Option<Money>,
	pub target_currency: Option<CurrencyCode>,
	pub created_at: DateTime<Utc>,
}

impl Transaction {
	pub fn transition_to(&mut self, new: TransactionStatus) -> Result<(), DomainError> {
		if !self.status.can_transition_to(&new) {
			return Err(DomainError::InvalidStatusTransition { from: self.status, to: new });
		}
		self.status = new;
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
	Open,
	Completed,
	Expired,
}

/// Short-lived artifact correlating a provider checkout flow with an
/// internal transaction. TTL-bound via `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
	/// Provider session id, e.g. `cs_...` for Stripe.
	pub id: String,
	pub payment_id: Option<String>,
	pub transaction_id: TransactionId,
	pub user_id: UserId,
	pub account_id: AccountId,
	pub amount_minor: i64,
	pub currency: CurrencyCode,
	pub url: String,
	pub status: SessionStatus,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
}

impl CheckoutSession {
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now >= self.expires_at
	}
}

/// Minimal user record; authentication itself lives outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
	pub id: UserId,
	pub email: String,
	pub display_name: String,
	pub created_at: DateTime<Utc>,
}
