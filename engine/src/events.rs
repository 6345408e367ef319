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

//! The event taxonomy of the transactional pipeline.
//!
//! Every event carries a [FlowEvent] header by composition. Handlers read
//! the header and never inspect "parent" events; the correlation id is the
//! only thread tying the stages of one flow together, and it equals the
//! transaction id of that flow.
//!
//! [LedgerEvent] serializes as `{"type": "<EventName>", "payload": {...}}`,
//! which is the self-describing shape the broker-backed bus persists.

use crate::{
	errors::{DomainError, FlowError, TxError},
	transaction::{MoneySource, TransactionStatus},
};
use chrono::{DateTime, Utc};
use ledger_primitives::{AccountId, CurrencyCode, Money, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
	Deposit,
	Withdraw,
	Transfer,
	Payment,
}

/// Header embedded in every domain event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
	/// Unique per event.
	pub id: Uuid,
	pub user_id: UserId,
	pub account_id: AccountId,
	pub flow_type: FlowType,
	/// Ties all events of one user intent together; equals the transaction
	/// id allocated for the flow.
	pub correlation_id: TransactionId,
	pub timestamp: DateTime<Utc>,
}

impl FlowEvent {
	pub fn new(
		user_id: UserId,
		account_id: AccountId,
		flow_type: FlowType,
		correlation_id: TransactionId,
	) -> Self {
		Self { id: Uuid::new_v4(), user_id, account_id, flow_type, correlation_id, timestamp: Utc::now() }
	}

	/// Header for the next stage of the same flow: fresh event id and
	/// timestamp, everything else carried over.
	pub fn next(&self) -> Self {
		Self { id: Uuid::new_v4(), timestamp: Utc::now(), ..*self }
	}

	/// As [Self::next], but re-targeted at another account (the incoming leg
	/// of a transfer).
	pub fn next_for_account(&self, account_id: AccountId) -> Self {
		Self { id: Uuid::new_v4(), timestamp: Utc::now(), account_id, ..*self }
	}
}

/// What a conversion stage did to the requested amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConversionInfo {
	pub original: Money,
	pub converted: Money,
	pub rate: f64,
}

/// Why a flow failed, in terms coarse enough to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
	NotOwner,
	AmountNotPositive,
	InvalidAmount,
	InsufficientFunds,
	CurrencyMismatch,
	SameAccount,
	Overflow,
	AccountNotFound,
	CurrencyNotFound,
	RateUnavailable,
	Storage,
	Provider,
}

impl FailureKind {
	pub fn from_flow_error(error: &FlowError) -> Self {
		match error {
			FlowError::Domain(e) | FlowError::Store(TxError::Domain(e)) => match e {
				DomainError::NotOwner => Self::NotOwner,
				DomainError::TransactionAmountMustBePositive => Self::AmountNotPositive,
				DomainError::InsufficientFunds => Self::InsufficientFunds,
				DomainError::CannotTransferToSameAccount => Self::SameAccount,
				DomainError::DepositExceedsMaxSafeInt => Self::Overflow,
				DomainError::MismatchedTransferCurrencies(..) => Self::CurrencyMismatch,
				DomainError::AccountNotFound(_) => Self::AccountNotFound,
				DomainError::TransactionNotFound(_) => Self::Storage,
				DomainError::CurrencyNotFound(_) => Self::CurrencyNotFound,
				DomainError::InvalidStatusTransition { .. } => Self::Storage,
				DomainError::Money(e) => match e {
					ledger_primitives::MoneyError::CurrencyMismatch { .. } => Self::CurrencyMismatch,
					ledger_primitives::MoneyError::AmountOverflow => Self::Overflow,
					_ => Self::InvalidAmount,
				},
				DomainError::Currency(_) => Self::CurrencyNotFound,
			},
			FlowError::Rate(_) => Self::RateUnavailable,
			FlowError::Store(TxError::Store(_)) => Self::Storage,
			FlowError::Payment(_) => Self::Provider,
			FlowError::Bus(_) => Self::Storage,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeKind {
	Provider,
	Service,
	Conversion,
}

// Stage payloads, one struct per event type.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRequested {
	pub flow: FlowEvent,
	/// User-supplied decimal amount in main units of `currency`.
	pub amount: String,
	pub currency: CurrencyCode,
	pub source: MoneySource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawRequested {
	pub flow: FlowEvent,
	pub amount: String,
	pub currency: CurrencyCode,
	pub external_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequested {
	pub flow: FlowEvent,
	pub to_account_id: AccountId,
	pub amount: String,
	pub currency: CurrencyCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositValidated {
	pub flow: FlowEvent,
	/// Amount in the account currency (conversion already applied).
	pub amount: Money,
	pub source: MoneySource,
	pub conversion: Option<ConversionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawValidated {
	pub flow: FlowEvent,
	pub amount: Money,
	pub external_target: Option<String>,
	pub conversion: Option<ConversionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferValidated {
	pub flow: FlowEvent,
	pub to_account_id: AccountId,
	/// Amount in the shared currency of both accounts.
	pub amount: Money,
	pub conversion: Option<ConversionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountConverted {
	pub flow: FlowEvent,
	pub conversion: ConversionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPersisted {
	pub flow: FlowEvent,
	pub transaction_id: TransactionId,
	pub status: TransactionStatus,
	pub amount: Money,
	pub balance: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutInitiated {
	pub flow: FlowEvent,
	pub transaction_id: TransactionId,
	pub session_id: String,
	pub payment_id: Option<String>,
	pub checkout_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentProcessed {
	pub flow: FlowEvent,
	pub transaction_id: TransactionId,
	pub payment_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCompleted {
	pub flow: FlowEvent,
	pub transaction_id: TransactionId,
	pub payment_id: String,
	/// The amount as received from the provider, in the checkout currency.
	pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailed {
	pub flow: FlowEvent,
	pub transaction_id: TransactionId,
	pub payment_id: Option<String>,
	pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositCompleted {
	pub flow: FlowEvent,
	pub transaction_id: TransactionId,
	pub balance: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawCompleted {
	pub flow: FlowEvent,
	pub transaction_id: TransactionId,
	pub balance: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferCompleted {
	pub flow: FlowEvent,
	pub outgoing_id: TransactionId,
	pub incoming_id: TransactionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositFailed {
	pub flow: FlowEvent,
	pub kind: FailureKind,
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawFailed {
	pub flow: FlowEvent,
	pub kind: FailureKind,
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferFailed {
	pub flow: FlowEvent,
	pub kind: FailureKind,
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeesCalculated {
	pub flow: FlowEvent,
	pub transaction_id: TransactionId,
	pub fee: Money,
	pub fee_kind: FeeKind,
}

macro_rules! ledger_events {
	($($variant:ident),* $(,)?) => {
		/// Every event the pipeline can emit. The serialized form is
		/// adjacently tagged so broker payloads are self-describing.
		#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
		#[serde(tag = "type", content = "payload")]
		pub enum LedgerEvent {
			$($variant($variant),)*
		}

		impl LedgerEvent {
			/// The type-name discriminator used for subscription routing.
			pub fn event_type(&self) -> &'static str {
				match self {
					$(Self::$variant(_) => stringify!($variant),)*
				}
			}

			pub fn flow(&self) -> &FlowEvent {
				match self {
					$(Self::$variant(inner) => &inner.flow,)*
				}
			}
		}

		$(impl From<$variant> for LedgerEvent {
			fn from(inner: $variant) -> Self {
				Self::$variant(inner)
			}
		})*

		/// Event-type name constants, for subscribing without constructing
		/// an event.
		pub mod event_type {
			$(
				#[allow(non_upper_case_globals)]
				pub const $variant: &str = stringify!($variant);
			)*
		}
	};
}

ledger_events! {
	DepositRequested,
	WithdrawRequested,
	TransferRequested,
	DepositValidated,
	WithdrawValidated,
	TransferValidated,
	AmountConverted,
	TransactionPersisted,
	CheckoutInitiated,
	PaymentProcessed,
	PaymentCompleted,
	PaymentFailed,
	DepositCompleted,
	WithdrawCompleted,
	TransferCompleted,
	DepositFailed,
	WithdrawFailed,
	TransferFailed,
	FeesCalculated,
}
