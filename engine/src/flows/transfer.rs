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

//! Transfer flow. Both legs land in one unit of work; legs never convert,
//! so accounts with different currencies reject the transfer outright. The
//! request amount itself may still be converted into the shared account
//! currency first.

use super::{convert_amount, FlowContext};
use crate::{
	bus::EventHandler,
	errors::{DomainError, FlowError, StoreError, TxError},
	events::{
		AmountConverted, FailureKind, LedgerEvent, TransactionPersisted, TransferCompleted,
		TransferFailed, TransferRequested, TransferValidated,
	},
	store::read_transaction,
	transaction::{MoneySource, Transaction, TransactionStatus},
};
use async_trait::async_trait;
use chrono::Utc;
use ledger_primitives::{Money, TransactionId};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TransferRequestedHandler {
	ctx: Arc<FlowContext>,
}

impl TransferRequestedHandler {
	pub fn new(ctx: Arc<FlowContext>) -> Self {
		Self { ctx }
	}

	async fn process(&self, request: &TransferRequested) -> Result<(), FlowError> {
		let flow = request.flow;
		if flow.account_id == request.to_account_id {
			return Err(DomainError::CannotTransferToSameAccount.into());
		}

		let (source, destination) = {
			let mut accounts = (None, None);
			let (source_id, destination_id) = (flow.account_id, request.to_account_id);
			let out = &mut accounts;
			self.ctx
				.store
				.in_transaction(Box::new(move |tx| {
					out.0 = tx.accounts().get(source_id)?;
					out.1 = tx.accounts().get(destination_id)?;
					Ok(())
				}))
				.await?;
			(
				accounts.0.ok_or(DomainError::AccountNotFound(flow.account_id))?,
				accounts.1.ok_or(DomainError::AccountNotFound(request.to_account_id))?,
			)
		};

		source.ensure_owner(flow.user_id)?;
		if source.currency() != destination.currency() {
			return Err(DomainError::MismatchedTransferCurrencies(
				source.currency(),
				destination.currency(),
			)
			.into());
		}

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

		let (amount, conversion) = if amount.currency() != source.currency() {
			let (converted, info) = convert_amount(&self.ctx, amount, source.currency()).await?;
			(converted, Some(info))
		} else {
			(amount, None)
		};

		source.validate_transfer(flow.user_id, destination.id, &amount)?;
		// The receiving leg must be able to absorb the credit.
		destination.deposited(&amount)?;

		if let Some(conversion) = conversion {
			self.ctx
				.bus
				.emit(AmountConverted { flow: flow.next(), conversion }.into())
				.await?;
		}
		self.ctx
			.bus
			.emit(
				TransferValidated {
					flow: flow.next(),
					to_account_id: destination.id,
					amount,
					conversion,
				}
				.into(),
			)
			.await?;
		Ok(())
	}
}

#[async_trait]
impl EventHandler for TransferRequestedHandler {
	fn name(&self) -> &'static str {
		"transfer-requested"
	}

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
		let LedgerEvent::TransferRequested(request) = event else { return Ok(()) };
		if let Err(error) = self.process(request).await {
			warn!(correlation_id = %request.flow.correlation_id, "Transfer rejected: {error:#}");
			self.ctx
				.bus
				.emit(
					TransferFailed {
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

/// Stage 4: both legs (outgoing debit, incoming credit) in one unit of
/// work. The outgoing transaction takes the flow's correlation id, the
/// incoming leg gets its own id.
pub struct TransferValidatedHandler {
	ctx: Arc<FlowContext>,
}

impl TransferValidatedHandler {
	pub fn new(ctx: Arc<FlowContext>) -> Self {
		Self { ctx }
	}

	async fn process(&self, validated: &TransferValidated) -> Result<(), FlowError> {
		let flow = validated.flow;
		let outgoing_id = flow.correlation_id;
		let amount = validated.amount;

		if read_transaction(self.ctx.store.as_ref(), outgoing_id).await?.is_some() {
			debug!("Transaction {outgoing_id} already persisted; skipping");
			return Ok(());
		}
		let incoming_id = TransactionId::new_random();

		// Both instance locks around the two-leg unit of work, in id order
		// so concurrent opposite-direction transfers cannot deadlock.
		let (first, second) = if flow.account_id < validated.to_account_id {
			(flow.account_id, validated.to_account_id)
		} else {
			(validated.to_account_id, flow.account_id)
		};
		let first_lock = self.ctx.locks.acquire(first).await;
		let _first_guard = first_lock.lock().await;
		let second_lock = self.ctx.locks.acquire(second).await;
		let _second_guard = second_lock.lock().await;

		let mut persisted = None;
		let mut attempt = 0;
		loop {
			let conversion = validated.conversion;
			let destination_id = validated.to_account_id;
			let result = self
				.ctx
				.store
				.in_transaction(Box::new(|tx| {
					let mut source = tx
						.accounts()
						.get(flow.account_id)?
						.ok_or(DomainError::AccountNotFound(flow.account_id))?;
					let mut destination = tx
						.accounts()
						.get(destination_id)?
						.ok_or(DomainError::AccountNotFound(destination_id))?;

					source.validate_transfer(flow.user_id, destination.id, &amount)?;
					let source_balance = source.withdrawn(&amount)?;
					let destination_balance = destination.deposited(&amount)?;
					source.set_balance(source_balance);
					destination.set_balance(destination_balance);
					tx.accounts().update(&source)?;
					tx.accounts().update(&destination)?;

					let created_at = Utc::now();
					let outgoing = Transaction {
						id: outgoing_id,
						user_id: flow.user_id,
						account_id: source.id,
						amount: amount.negate().map_err(DomainError::from)?,
						balance_snapshot: source_balance,
						money_source: MoneySource::Internal,
						status: TransactionStatus::Completed,
						payment_id: None,
						external_target: None,
						original_amount: conversion.map(|c| c.original),
						conversion_rate: conversion.map(|c| c.rate),
						fee: None,
						target_currency: Some(destination.currency()),
						created_at,
					};
					let incoming = Transaction {
						id: incoming_id,
						user_id: destination.user_id,
						account_id: destination.id,
						amount,
						balance_snapshot: destination_balance,
						money_source: MoneySource::Internal,
						status: TransactionStatus::Completed,
						payment_id: None,
						external_target: None,
						original_amount: None,
						conversion_rate: None,
						fee: None,
						target_currency: None,
						created_at,
					};
					tx.transactions().create(&outgoing)?;
					tx.transactions().create(&incoming)?;
					persisted = Some((outgoing, incoming));
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
						"Transfer persistence conflict for {outgoing_id}; retrying in {delay:?}"
					);
					tokio::time::sleep(delay).await;
					attempt += 1;
				},
				Err(error) => return Err(error.into()),
			}
		}

		let (outgoing, incoming) = persisted.expect("set when the unit of work commits");
		self.ctx
			.bus
			.emit(
				TransactionPersisted {
					flow: flow.next(),
					transaction_id: outgoing.id,
					status: outgoing.status,
					amount: outgoing.amount,
					balance: outgoing.balance_snapshot,
				}
				.into(),
			)
			.await?;
		self.ctx
			.bus
			.emit(
				TransactionPersisted {
					flow: flow.next_for_account(incoming.account_id),
					transaction_id: incoming.id,
					status: incoming.status,
					amount: incoming.amount,
					balance: incoming.balance_snapshot,
				}
				.into(),
			)
			.await?;
		self.ctx
			.bus
			.emit(
				TransferCompleted { flow: flow.next(), outgoing_id, incoming_id }.into(),
			)
			.await?;
		Ok(())
	}
}

#[async_trait]
impl EventHandler for TransferValidatedHandler {
	fn name(&self) -> &'static str {
		"transfer-validated"
	}

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
		let LedgerEvent::TransferValidated(validated) = event else { return Ok(()) };
		if let Err(error) = self.process(validated).await {
			warn!(
				correlation_id = %validated.flow.correlation_id,
				"Transfer persistence failed: {error:#}"
			);
			self.ctx
				.bus
				.emit(
					TransferFailed {
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
