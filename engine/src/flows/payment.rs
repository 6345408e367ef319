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

//! Payment-stage handlers: the bridge from webhook-emitted events back to
//! the deposit flow they complete. All of them tolerate redelivery, since
//! both webhooks and the broker bus are at-least-once.

use super::FlowContext;
use crate::{
	bus::EventHandler,
	errors::{DomainError, FlowError, StoreError, TxError},
	events::{
		DepositCompleted, DepositFailed, FailureKind, FlowEvent, FlowType, LedgerEvent,
		PaymentCompleted, PaymentFailed, PaymentProcessed,
	},
	transaction::{SessionStatus, TransactionStatus},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Backfills the payment id onto the transaction and completes the
/// checkout session record.
pub struct PaymentProcessedHandler {
	ctx: Arc<FlowContext>,
}

impl PaymentProcessedHandler {
	pub fn new(ctx: Arc<FlowContext>) -> Self {
		Self { ctx }
	}
}

#[async_trait]
impl EventHandler for PaymentProcessedHandler {
	fn name(&self) -> &'static str {
		"payment-processed"
	}

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
		let LedgerEvent::PaymentProcessed(processed) = event else { return Ok(()) };
		let transaction_id = processed.transaction_id;
		let payment_id = processed.payment_id.clone();

		self.ctx
			.store
			.in_transaction(Box::new(move |tx| {
				let Some(mut transaction) = tx.transactions().get(transaction_id)? else {
					warn!("PaymentProcessed for unknown transaction {transaction_id}");
					return Ok(());
				};
				if transaction.payment_id.is_none() {
					transaction.payment_id = Some(payment_id.clone());
					tx.transactions().update(&transaction)?;
				}

				if let Some(mut session) =
					tx.checkout_sessions().get_by_transaction_id(transaction_id)?
				{
					if session.status != SessionStatus::Completed {
						session.status = SessionStatus::Completed;
					}
					if session.payment_id.is_none() {
						session.payment_id = Some(payment_id);
					}
					tx.checkout_sessions().update(&session)?;
				}
				Ok(())
			}))
			.await?;
		Ok(())
	}
}

/// Applies the balance delta of a provider-confirmed deposit and completes
/// the transaction, then closes the deposit flow.
pub struct PaymentCompletedHandler {
	ctx: Arc<FlowContext>,
}

impl PaymentCompletedHandler {
	pub fn new(ctx: Arc<FlowContext>) -> Self {
		Self { ctx }
	}

	async fn process(&self, completed: &PaymentCompleted) -> Result<(), FlowError> {
		let transaction_id = completed.transaction_id;
		let payment_id = completed.payment_id.clone();

		let lock = self.ctx.locks.acquire(completed.flow.account_id).await;
		let _guard = lock.lock().await;

		let mut finalized = None;
		let mut attempt = 0;
		loop {
			let payment_id = payment_id.clone();
			let result = self
				.ctx
				.store
				.in_transaction(Box::new(|tx| {
					let Some(mut transaction) = tx.transactions().get(transaction_id)? else {
						warn!("PaymentCompleted for unknown transaction {transaction_id}");
						return Ok(());
					};
					if !transaction.status.can_transition_to(&TransactionStatus::Completed) {
						debug!(
							"Transaction {transaction_id} already {}; ignoring redelivery",
							transaction.status
						);
						return Ok(());
					}

					let mut account = tx
						.accounts()
						.get(transaction.account_id)?
						.ok_or(DomainError::AccountNotFound(transaction.account_id))?;
					let balance = account.deposited(&transaction.amount)?;
					account.set_balance(balance);
					tx.accounts().update(&account)?;

					transaction.balance_snapshot = balance;
					transaction.transition_to(TransactionStatus::Completed)?;
					if transaction.payment_id.is_none() {
						transaction.payment_id = Some(payment_id);
					}
					tx.transactions().update(&transaction)?;
					finalized = Some(transaction);
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
						"Payment finalization conflict for {transaction_id}; retrying in {delay:?}"
					);
					tokio::time::sleep(delay).await;
					attempt += 1;
				},
				Err(error) => return Err(error.into()),
			}
		}

		if let Some(transaction) = finalized {
			self.ctx
				.bus
				.emit(
					DepositCompleted {
						flow: FlowEvent {
							flow_type: FlowType::Deposit,
							..completed.flow.next()
						},
						transaction_id,
						balance: transaction.balance_snapshot,
					}
					.into(),
				)
				.await?;
		}
		Ok(())
	}
}

#[async_trait]
impl EventHandler for PaymentCompletedHandler {
	fn name(&self) -> &'static str {
		"payment-completed"
	}

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
		let LedgerEvent::PaymentCompleted(completed) = event else { return Ok(()) };
		if let Err(error) = self.process(completed).await {
			warn!(
				correlation_id = %completed.flow.correlation_id,
				"Payment finalization failed: {error:#}"
			);
			self.ctx
				.bus
				.emit(
					DepositFailed {
						flow: FlowEvent {
							flow_type: FlowType::Deposit,
							..completed.flow.next()
						},
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

/// Marks the transaction failed and closes the deposit flow. The balance
/// was never credited, so there is nothing to compensate.
pub struct PaymentFailedHandler {
	ctx: Arc<FlowContext>,
}

impl PaymentFailedHandler {
	pub fn new(ctx: Arc<FlowContext>) -> Self {
		Self { ctx }
	}
}

#[async_trait]
impl EventHandler for PaymentFailedHandler {
	fn name(&self) -> &'static str {
		"payment-failed"
	}

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
		let LedgerEvent::PaymentFailed(failed) = event else { return Ok(()) };
		let transaction_id = failed.transaction_id;

		let mut marked = false;
		self.ctx
			.store
			.in_transaction(Box::new(|tx| {
				let Some(mut transaction) = tx.transactions().get(transaction_id)? else {
					warn!("PaymentFailed for unknown transaction {transaction_id}");
					return Ok(());
				};
				if !transaction.status.can_transition_to(&TransactionStatus::Failed) {
					debug!(
						"Transaction {transaction_id} already {}; ignoring redelivery",
						transaction.status
					);
					return Ok(());
				}
				transaction.transition_to(TransactionStatus::Failed)?;
				tx.transactions().update(&transaction)?;
				marked = true;
				Ok(())
			}))
			.await?;

		if marked {
			self.ctx
				.bus
				.emit(
					DepositFailed {
						flow: FlowEvent { flow_type: FlowType::Deposit, ..failed.flow.next() },
						kind: FailureKind::Provider,
						message: failed.reason.clone(),
					}
					.into(),
				)
				.await?;
		}
		Ok(())
	}
}
