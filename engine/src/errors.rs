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

//! Error taxonomy of the ledger engine.
//!
//! Invariant violations ([DomainError]) are returned synchronously from
//! validation and never retried. External-service failures ([RateError],
//! [PaymentError]) are retried at provider-selection level. Storage
//! conflicts ([StoreError::Conflict]) may be retried by the persisting
//! handler with backoff, but never past the payment-provider stage.

use crate::transaction::TransactionStatus;
use ledger_primitives::{AccountId, CurrencyCode, CurrencyError, MoneyError, TransactionId};
use thiserror::Error;

/// Violations of domain invariants and lookups that came up empty. These are
/// terminal for the operation that triggered them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
	#[error("operation attempted by a non-owner")]
	NotOwner,

	#[error("transaction amount must be positive")]
	TransactionAmountMustBePositive,

	#[error("insufficient funds")]
	InsufficientFunds,

	#[error("cannot transfer to the same account")]
	CannotTransferToSameAccount,

	#[error("deposit would exceed the maximum representable balance")]
	DepositExceedsMaxSafeInt,

	#[error("transfer legs must share a currency ({0} vs {1})")]
	MismatchedTransferCurrencies(CurrencyCode, CurrencyCode),

	#[error("transaction status may not move from {from} to {to}")]
	InvalidStatusTransition { from: TransactionStatus, to: TransactionStatus },

	#[error("account not found: {0}")]
	AccountNotFound(AccountId),

	#[error("transaction not found: {0}")]
	TransactionNotFound(TransactionId),

	#[error("currency not found: {0}")]
	CurrencyNotFound(CurrencyCode),

	#[error(transparent)]
	Money(#[from] MoneyError),

	#[error(transparent)]
	Currency(#[from] CurrencyError),
}

/// Failures of the storage backend itself.
#[derive(Error, Debug)]
pub enum StoreError {
	/// The storage engine could not serialize this transaction against a
	/// concurrent one. Safe to retry with backoff.
	#[error("storage serialization conflict")]
	Conflict,

	#[error("constraint violation: {0}")]
	Constraint(String),

	#[error("codec: {0}")]
	Codec(#[from] serde_json::Error),

	#[error("storage backend: {0}")]
	Backend(#[source] anyhow::Error),
}

/// Error type of a unit-of-work closure: either the store failed, or the
/// domain logic running inside the boundary rejected the operation. Both
/// roll the transaction back.
#[derive(Error, Debug)]
pub enum TxError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Domain(#[from] DomainError),
}

/// Exchange-rate lookups.
#[derive(Error, Debug)]
pub enum RateError {
	#[error("no provider could supply a rate for {from}:{to}")]
	Unavailable { from: CurrencyCode, to: CurrencyCode },

	#[error("no provider could supply any rate from {from}")]
	NoneAvailable { from: CurrencyCode },

	#[error("provider {provider} returned an invalid rate {rate}")]
	InvalidRate { provider: String, rate: f64 },

	#[error("provider {provider}: {source}")]
	Provider {
		provider: String,
		#[source]
		source: anyhow::Error,
	},

	#[error("rate cache backend: {0}")]
	Cache(#[source] anyhow::Error),
}

/// Payment-provider (checkout / fee retrieval) failures.
#[derive(Error, Debug)]
pub enum PaymentError {
	#[error("payment provider request failed: {0}")]
	Request(#[source] anyhow::Error),

	#[error("payment provider response missing {0}")]
	MalformedResponse(&'static str),
}

/// Event bus failures. Handler errors are NOT surfaced here: the bus logs
/// them and keeps dispatching.
#[derive(Error, Debug)]
pub enum BusError {
	#[error("serializing event: {0}")]
	Codec(#[from] serde_json::Error),

	#[error("broker: {0}")]
	Broker(#[source] anyhow::Error),
}

/// Everything a flow handler can run into while advancing a pipeline stage.
#[derive(Error, Debug)]
pub enum FlowError {
	#[error(transparent)]
	Domain(#[from] DomainError),

	#[error(transparent)]
	Rate(#[from] RateError),

	#[error(transparent)]
	Store(#[from] TxError),

	#[error(transparent)]
	Payment(#[from] PaymentError),

	#[error(transparent)]
	Bus(#[from] BusError),
}

impl From<MoneyError> for FlowError {
	fn from(e: MoneyError) -> Self {
		FlowError::Domain(e.into())
	}
}

/// Webhook ingestion failures (§ payment adapter).
#[derive(Error, Debug)]
pub enum WebhookError {
	#[error("invalid webhook signature")]
	InvalidSignature,

	#[error("malformed signature header")]
	MalformedSignatureHeader,

	#[error("malformed webhook payload: {0}")]
	MalformedPayload(#[source] serde_json::Error),

	#[error("invalid webhook metadata: {0}")]
	InvalidMetadata(String),

	#[error("webhook references unknown transaction {0}")]
	UnknownTransaction(TransactionId),

	#[error(transparent)]
	Store(#[from] TxError),

	#[error(transparent)]
	Provider(#[from] PaymentError),

	#[error(transparent)]
	Bus(#[from] BusError),
}

/// Currency registry failures.
#[derive(Error, Debug)]
pub enum RegistryError {
	#[error(transparent)]
	Currency(#[from] CurrencyError),

	#[error("currency backend: {0}")]
	Backend(#[source] anyhow::Error),
}

/// Errors surfaced by the public command shims, i.e. everything that can be
/// rejected before the `*Requested` event is accepted.
#[derive(Error, Debug)]
pub enum CommandError {
	#[error(transparent)]
	Domain(#[from] DomainError),

	#[error(transparent)]
	Store(#[from] TxError),

	#[error(transparent)]
	Bus(#[from] BusError),
}

impl From<MoneyError> for CommandError {
	fn from(e: MoneyError) -> Self {
		CommandError::Domain(e.into())
	}
}
