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

use super::{convert_amount, service_fee, FlowContext};
use crate::{
	bus::EventHandler,
	errors::{DomainError, FlowError, StoreError, TxError},
	events::{
		AmountConverted, CheckoutInitiated, DepositCompleted, DepositFailed, DepositRequested,
		DepositValidated, FailureKind, FeeKind, FeesCalculated, LedgerEvent, TransactionPersisted,
	},
	payment::InitiatePaymentRequest,
	store::{read_account, read_transaction},
	transaction::{CheckoutSession, SessionStatus, Transaction, TransactionStatus},
};
use async_trait::async_trait;
use chrono::Utc;
use ledger_primitives::{Money, MoneyError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Stages 1-3 of the deposit flow: account and ownership checks, Money
/// construction in the request currency, conditional conversion into the
/// account currency.
pub struct DepositRequestedHandler {
	ctx: Arc<FlowContext>,
}

impl DepositRequestedHandler {
	pub fn new(ctx: Arc<FlowContext>) -> Self {
		Self { ctx }
	}

	async fn process(&self, request: &DepositRequested) -> Result<(), FlowError> {
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

		account.validate_deposit(request.flow.user_id, &amount)?;

		if let Some(conversion) = conversion {
			self.ctx
				.bus
				.emit(AmountConverted { flow: request.flow.next(), conversion }.into())
				.await?;
		}
		self.ctx
			.bus
			.emit(
				DepositValidated {
					flow: request.flow.next(),
					amount,
					source: request.source,
					conversion,
				}
				.into(),
			)
			.await?;
		Ok(())
	}
}

#[async_trait]
impl EventHandler for DepositRequestedHandler {
	fn name(&self) -> &'static str {
		"deposit-requested"
	}

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
		let LedgerEvent::DepositRequested(request) = event else { return Ok(()) };
		if let Err(error) = self.process(request).await {
			warn!(correlation_id = %request.flow.correlation_id, "Deposit rejected: {error:#}");
			self.ctx
				.bus
				.emit(
					DepositFailed {
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

/// Stages 4-5: persistence inside one unit of work and, for provider-backed
/// sources, checkout initiation.
pub struct DepositValidatedHandler {
	ctx: Arc<FlowContext>,
}

impl DepositValidatedHandler {
	pub fn new(ctx: Arc<FlowContext>) -> Self {
		Self { ctx }
	}

	async fn process(&self, validated: &DepositValidated) -> Result<(), FlowError> {
		let transaction_id = validated.flow.correlation_id;

		// Redelivered events find their transaction already allocated.
		if read_transaction(self.ctx.store.as_ref(), transaction_id).await?.is_some() {
			debug!("Transaction {transaction_id} already persisted; skipping");
			return Ok(());
		}

		if validated.source.requires_provider() {
			self.persist_pending_checkout(validated).await
		} else {
			self.persist_completed(validated).await
		}
	}

	fn transaction_template(&self, validated: &DepositValidated) -> Transaction {
		Transaction {
			id: validated.flow.correlation_id,
			user_id: validated.flow.user_id,
			account_id: validated.flow.account_id,
			amount: validated.amount,
			balance_snapshot: validated.amount,
			money_source: validated.source,
			status: TransactionStatus::Initiated,
			payment_id: None,
			external_target: None,
			original_amount: validated.conversion.map(|c| c.original),
			conversion_rate: validated.conversion.map(|c| c.rate),
			fee: None,
			target_currency: None,
			created_at: Utc::now(),
		}
	}

	/// Internal-source deposit: balance applied and transaction completed
	/// in one unit of work, holding the account's in-process lock.
	async fn persist_completed(&self, validated: &DepositValidated) -> Result<(), FlowError> {
		let flow = validated.flow;
		let amount = validated.amount;
		let fee = service_fee(amount, self.ctx.service_fee_percentage);
		let mut template = self.transaction_template(validated);
		template.status = TransactionStatus::Completed;
		template.fee = fee;

		let lock = self.ctx.locks.acquire(flow.account_id).await;
		let _guard = lock.lock().await;

		let mut persisted = None;
		let mut attempt = 0;
		loop {
			let template = template.clone();
			let result = self
				.ctx
				.store
				.in_transaction(Box::new(|tx| {
					let mut account = tx
						.accounts()
						.get(flow.account_id)?
						.ok_or(DomainError::AccountNotFound(flow.account_id))?;
					account.validate_deposit(flow.user_id, &amount)?;
					let balance = account.deposited(&amount)?;
					account.set_balance(balance);
					tx.accounts().update(&account)?;

					let transaction = Transaction { balance_snapshot: balance, ..template };
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
						"Deposit persistence conflict for {}; retrying in {delay:?}",
						flow.correlation_id
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
					transaction_id: transaction.id,
					status: transaction.status,
					amount,
					balance,
				}
				.into(),
			)
			.await?;
		if let Some(fee) = fee {
			self.ctx
				.bus
				.emit(
					FeesCalculated {
						flow: flow.next(),
						transaction_id: transaction.id,
						fee,
						fee_kind: FeeKind::Service,
					}
					.into(),
				)
				.await?;
		}
		self.ctx
			.bus
			.emit(
				DepositCompleted { flow: flow.next(), transaction_id: transaction.id, balance }
					.into(),
			)
			.await?;
		Ok(())
	}

	/// Provider-backed deposit: the transaction is persisted first, then
	/// the checkout is created. The provider call is never retried, a
	/// failure marks the transaction failed instead.
	async fn persist_pending_checkout(
		&self,
		validated: &DepositValidated,
	) -> Result<(), FlowError> {
		let flow = validated.flow;
		let template = self.transaction_template(validated);

		let mut attempt = 0;
		loop {
			let (template, mut snapshot) = (template.clone(), None);
			let result = self
				.ctx
				.store
				.in_transaction(Box::new(|tx| {
					let account = tx
						.accounts()
						.get(flow.account_id)?
						.ok_or(DomainError::AccountNotFound(flow.account_id))?;
					account.validate_deposit(flow.user_id, &template.amount)?;
					let transaction =
						Transaction { balance_snapshot: account.balance, ..template };
					tx.transactions().create(&transaction)?;
					snapshot = Some(transaction);
					Ok(())
				}))
				.await;

			match result {
				Ok(()) => {
					let transaction = snapshot.expect("set when the unit of work commits");
					self.ctx
						.bus
						.emit(
							TransactionPersisted {
								flow: flow.next(),
								transaction_id: transaction.id,
								status: transaction.status,
								amount: transaction.amount,
								balance: transaction.balance_snapshot,
							}
							.into(),
						)
						.await?;
					break;
				},
				Err(TxError::Store(StoreError::Conflict))
					if self.ctx.retry.allows_retry(attempt) =>
				{
					let delay = self.ctx.retry.sleep_duration(attempt);
					warn!(
						"Deposit persistence conflict for {}; retrying in {delay:?}",
						flow.correlation_id
					);
					tokio::time::sleep(delay).await;
					attempt += 1;
				},
				Err(error) => return Err(error.into()),
			}
		}

		// The user pays in the currency they asked to deposit.
		let charged = validated.conversion.map(|c| c.original).unwrap_or(validated.amount);
		let amount_minor = i64::try_from(charged.minor_units())
			.map_err(|_| DomainError::Money(MoneyError::AmountOverflow))?;

		let initiated = match self
			.ctx
			.payments
			.initiate_payment(InitiatePaymentRequest {
				user_id: flow.user_id,
				account_id: flow.account_id,
				transaction_id: flow.correlation_id,
				amount_minor,
				currency: charged.currency(),
			})
			.await
		{
			Ok(initiated) => initiated,
			Err(error) => {
				self.mark_failed(validated).await;
				return Err(error.into());
			},
		};

		let session = CheckoutSession {
			id: initiated.session_id.clone(),
			payment_id: initiated.payment_id.clone(),
			transaction_id: flow.correlation_id,
			user_id: flow.user_id,
			account_id: flow.account_id,
			amount_minor,
			currency: charged.currency(),
			url: initiated.checkout_url.clone(),
			status: SessionStatus::Open,
			created_at: Utc::now(),
			expires_at: initiated.expires_at,
		};
		let payment_id = initiated.payment_id.clone();
		self.ctx
			.store
			.in_transaction(Box::new(move |tx| {
				tx.checkout_sessions().create(&session)?;
				let Some(mut transaction) = tx.transactions().get(session.transaction_id)?
				else {
					return Ok(());
				};
				transaction.payment_id = payment_id;
				transaction.transition_to(TransactionStatus::Pending)?;
				tx.transactions().update(&transaction)?;
				Ok(())
			}))
			.await?;

		self.ctx
			.bus
			.emit(
				CheckoutInitiated {
					flow: flow.next(),
					transaction_id: flow.correlation_id,
					session_id: initiated.session_id,
					payment_id: initiated.payment_id,
					checkout_url: initiated.checkout_url,
				}
				.into(),
			)
			.await?;
		Ok(())
	}

	/// Best-effort terminal mark after a provider failure.
	async fn mark_failed(&self, validated: &DepositValidated) {
		let transaction_id = validated.flow.correlation_id;
		let marked = self
			.ctx
			.store
			.in_transaction(Box::new(move |tx| {
				if let Some(mut transaction) = tx.transactions().get(transaction_id)? {
					if transaction.status.can_transition_to(&TransactionStatus::Failed) {
						transaction.status = TransactionStatus::Failed;
						tx.transactions().update(&transaction)?;
					}
				}
				Ok(())
			}))
			.await;
		if let Err(error) = marked {
			warn!("Could not mark transaction {transaction_id} failed: {error:#}");
		}
	}
}

#[async_trait]
impl EventHandler for DepositValidatedHandler {
	fn name(&self) -> &'static str {
		"deposit-validated"
	}

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
		let LedgerEvent::DepositValidated(validated) = event else { return Ok(()) };
		if let Err(error) = self.process(validated).await {
			warn!(
				correlation_id = %validated.flow.correlation_id,
				"Deposit persistence failed: {error:#}"
			);
			self.ctx
				.bus
				.emit(
					DepositFailed {
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
