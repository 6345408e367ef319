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

//! Public command shims.
//!
//! A command validates its inputs synchronously, allocates the transaction
//! id that doubles as the flow's correlation id, publishes the
//! `*Requested` event and returns. Everything after that is handler work;
//! the caller observes the outcome through transaction status queries or
//! by subscribing to the bus.

use crate::{
	bus::EventBus,
	errors::{CommandError, DomainError},
	events::{
		DepositRequested, FlowEvent, FlowType, TransferRequested, WithdrawRequested,
	},
	registry::CurrencyRegistry,
	store::{read_account, LedgerStore},
	transaction::MoneySource,
};
use ledger_primitives::{AccountId, CurrencyCode, Money, TransactionId, UserId};
use std::sync::Arc;
use tracing::info;

pub struct LedgerCommands {
	store: Arc<dyn LedgerStore>,
	bus: Arc<dyn EventBus>,
	registry: Arc<CurrencyRegistry>,
}

impl LedgerCommands {
	pub fn new(
		store: Arc<dyn LedgerStore>,
		bus: Arc<dyn EventBus>,
		registry: Arc<CurrencyRegistry>,
	) -> Self {
		Self { store, bus, registry }
	}

	/// Parses and positivity-checks the amount against the registry's
	/// decimals for `currency`, without converting anything yet.
	async fn pre_validate_amount(
		&self,
		amount: &str,
		currency: CurrencyCode,
	) -> Result<(), CommandError> {
		let registered = self
			.registry
			.get(currency)
			.await
			.ok_or(DomainError::CurrencyNotFound(currency))?;
		let amount = Money::from_decimal_str(amount, currency, registered.decimals)
			.map_err(DomainError::from)?;
		if !amount.is_positive() {
			return Err(DomainError::TransactionAmountMustBePositive.into());
		}
		Ok(())
	}

	async fn owned_account(
		&self,
		user_id: UserId,
		account_id: AccountId,
	) -> Result<(), CommandError> {
		let account = read_account(self.store.as_ref(), account_id)
			.await?
			.ok_or(DomainError::AccountNotFound(account_id))?;
		account.ensure_owner(user_id)?;
		Ok(())
	}

	pub async fn deposit(
		&self,
		user_id: UserId,
		account_id: AccountId,
		amount: &str,
		currency: CurrencyCode,
		source: MoneySource,
	) -> Result<TransactionId, CommandError> {
		self.pre_validate_amount(amount, currency).await?;
		self.owned_account(user_id, account_id).await?;

		let correlation_id = TransactionId::new_random();
		let flow = FlowEvent::new(user_id, account_id, FlowType::Deposit, correlation_id);
		info!(correlation_id = %correlation_id, "Accepted deposit request");
		self.bus
			.emit(
				DepositRequested { flow, amount: amount.to_string(), currency, source }.into(),
			)
			.await?;
		Ok(correlation_id)
	}

	pub async fn withdraw(
		&self,
		user_id: UserId,
		account_id: AccountId,
		amount: &str,
		currency: CurrencyCode,
		external_target: Option<String>,
	) -> Result<TransactionId, CommandError> {
		self.pre_validate_amount(amount, currency).await?;
		self.owned_account(user_id, account_id).await?;

		let correlation_id = TransactionId::new_random();
		let flow = FlowEvent::new(user_id, account_id, FlowType::Withdraw, correlation_id);
		info!(correlation_id = %correlation_id, "Accepted withdraw request");
		self.bus
			.emit(
				WithdrawRequested {
					flow,
					amount: amount.to_string(),
					currency,
					external_target,
				}
				.into(),
			)
			.await?;
		Ok(correlation_id)
	}

	pub async fn transfer(
		&self,
		user_id: UserId,
		from_account_id: AccountId,
		to_account_id: AccountId,
		amount: &str,
		currency: CurrencyCode,
	) -> Result<TransactionId, CommandError> {
		if from_account_id == to_account_id {
			return Err(DomainError::CannotTransferToSameAccount.into());
		}
		self.pre_validate_amount(amount, currency).await?;
		self.owned_account(user_id, from_account_id).await?;

		let correlation_id = TransactionId::new_random();
		let flow = FlowEvent::new(user_id, from_account_id, FlowType::Transfer, correlation_id);
		info!(correlation_id = %correlation_id, "Accepted transfer request");
		self.bus
			.emit(
				TransferRequested {
					flow,
					to_account_id,
					amount: amount.to_string(),
					currency,
				}
				.into(),
			)
			.await?;
		Ok(correlation_id)
	}
}
