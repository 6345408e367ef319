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

use super::{convert_amount, FlowContext};
use crate::{
	bus::EventHandler,
	errors::{DomainError, FlowError, StoreError, TxError},
	events::{
		AmountConverted, FailureKind, LedgerEvent, TransactionPersisted, WithdrawCompleted,
		WithdrawFailed, WithdrawRequested, WithdrawValidated,
	},
	store::{read_account, read_transaction},
	transaction::{MoneySource, Transaction, TransactionStatus},
};
use async_trait::async_trait;
use chrono::Utc;
use ledger_primitives::Money;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stages 1-3 of the withdraw flow. Withdrawals never touch the payment
/// provider; the external target is recorded on the transaction only.
pub struct WithdrawRequestedHandler {
	ctx: Arc<FlowContext>,
}

impl WithdrawRequestedHandler {
	pub fn new(ctx: Arc<FlowContext>) -> Self {
		Self { ctx }
	}

	async fn process(&self, request: &WithdrawRequested) -> Result<(), FlowError> {
		let account = read_account(self.ctx.store.as_ref(), request.flow.account_id)
			.await?
			.ok_or(DomainError::AccountNotFound(request.flow.account_id))?;
		account.ensure_owner(request.flow.user_id)?;

		let currency = self
			.ctx
			.registry
			.get(request.currency)
			.await
			.ok_or(DomainError::CurrencyNotFound(request.currency))?;
		let amount =
			Money::from_decimal_str(&request.amount, request.currency, currency.decimals)
				.map_err(DomainError::from)?;
		if !amount.is_positive() {
			return Err(DomainError::TransactionAmountMustBePositive.into());
		}

		let (amount, conversion) = if amount.currency() != account.currency() {
			let (converted, info) = convert_amount(&self.ctx, amount, account.currency()).await?;
			(converted, Some(info))
		} else {
			(amount, None)
		};

		account.validate_withdraw(request.flow.user_id, &amount)?;

		if let Some(conversion) = conversion {
			self.ctx
				.bus
				.emit(AmountConverted { flow: request.flow.next(), conversion }.into())
				.await?;
		}
		self.ctx
			.bus
			.emit(
				WithdrawValidated {
					flow: request.flow.next(),
					amount,
					external_target: request.external_target.clone(),
					conversion,
				}
				.into(),
			)
			.await?;
		Ok(())
	}
}

#[async_trait]
impl EventHandler for WithdrawRequestedHandler {
	fn name(&self) -> &'static str {
		"withdraw-requested"
	}

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
		let LedgerEvent::WithdrawRequested(request) = event else { return Ok(()) };
		if let Err(error) = self.process(request).await {
			warn!(correlation_id = %request.flow.correlation_id, "Withdraw rejected: {error:#}");
			self.ctx
				.bus
				.emit(
					WithdrawFailed {
						flow: request.flow.next(),
						kind: FailureKind::from_flow_error(&error),
						message: error.to_string(),
					}
					.into(),
				)
				.await?;
		}
		Ok(())
	}
}

/// Stage 4: the debit and the transaction land in one unit of work.
pub struct WithdrawValidatedHandler {
	ctx: Arc<FlowContext>,
}

impl WithdrawValidatedHandler {
	pub fn new(ctx: Arc<FlowContext>) -> Self {
		Self { ctx }
	}

	async fn process(&self, validated: &WithdrawValidated) -> Result<(), FlowError> {
		let flow = validated.flow;
		let transaction_id = flow.correlation_id;
		let amount = validated.amount;

		if read_transaction(self.ctx.store.as_ref(), transaction_id).await?.is_some() {
			debug!("Transaction {transaction_id} already persisted; skipping");
			return Ok(());
		}

		let lock = self.ctx.locks.acquire(flow.account_id).await;
		let _guard = lock.lock().await;

		let mut persisted = None;
		let mut attempt = 0;
		loop {
			let external_target = validated.external_target.clone();
			let conversion = validated.conversion;
			let result = self
				.ctx
				.store
				.in_transaction(Box::new(|tx| {
					let mut account = tx
						.accounts()
						.get(flow.account_id)?
						.ok_or(DomainError::AccountNotFound(flow.account_id))?;
					account.validate_withdraw(flow.user_id, &amount)?;
					let balance = account.withdrawn(&amount)?;
					account.set_balance(balance);
					tx.accounts().update(&account)?;

					let transaction = Transaction {
						id: transaction_id,
						user_id: flow.user_id,
						account_id: flow.account_id,
						amount: amount.negate().map_err(DomainError::from)?,
						balance_snapshot: balance,
						money_source: MoneySource::Internal,
						status: TransactionStatus::Completed,
						payment_id: None,
						external_target,
						original_amount: conversion.map(|c| c.original),
						conversion_rate: conversion.map(|c| c.rate),
						fee: None,
						target_currency: None,
						created_at: Utc::now(),
					};
					tx.transactions().create(&transaction)?;
					persisted = Some(transaction);
					Ok(())
				}))
				.await;

			match result {
				Ok(()) => break,
				Err(TxError::Store(StoreError::Conflict))
					if self.ctx.retry.allows_retry(attempt) =>
				{
					let delay = self.ctx.retry.sleep_duration(attempt);
					warn!(
						"Withdraw persistence conflict for {transaction_id}; retrying in {delay:?}"
					);
					tokio::time::sleep(delay).await;
					attempt += 1;
				},
				Err(error) => return Err(error.into()),
			}
		}

		let transaction = persisted.expect("set when the unit of work commits");
		let balance = transaction.balance_snapshot;
		self.ctx
			.bus
			.emit(
				TransactionPersisted {
					flow: flow.next(),
					transaction_id,
					status: transaction.status,
					amount: transaction.amount,
					balance,
				}
				.into(),
			)
			.await?;
		self.ctx
			.bus
			.emit(WithdrawCompleted { flow: flow.next(), transaction_id, balance }.into())
			.await?;
		Ok(())
	}
}

#[async_trait]
impl EventHandler for WithdrawValidatedHandler {
	fn name(&self) -> &'static str {
		"withdraw-validated"
	}

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
		let LedgerEvent::WithdrawValidated(validated) = event else { return Ok(()) };
		if let Err(error) = self.process(validated).await {
			warn!(
				correlation_id = %validated.flow.correlation_id,
				"Withdraw persistence failed: {error:#}"
			);
			self.ctx
				.bus
				.emit(
					WithdrawFailed {
						flow: validated.flow.next(),
						kind: FailureKind::from_flow_error(&error),
						message: error.to_string(),
					}
					.into(),
				)
				.await?;
		}
		Ok(())
	}
}
