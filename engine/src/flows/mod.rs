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

//! The transaction-flow orchestrator.
//!
//! There is no orchestrator object: deposits, withdrawals and transfers
//! are implemented entirely by the handlers this module registers on the
//! bus. Each handler consumes one event type, does one stage's work and
//! emits the next stage's event with the same correlation id; webhooks
//! join the pipeline at the payment stage. The request-stage handlers
//! validate and convert, the validated-stage handlers persist inside a
//! unit of work (retrying storage conflicts with backoff), and the
//! payment-stage handlers finalize provider-backed deposits. Nothing after
//! the provider call is ever retried automatically.

pub mod deposit;
pub mod payment;
pub mod transfer;
pub mod withdraw;

use crate::{
	account::AccountLocks,
	bus::EventBus,
	errors::{DomainError, FlowError},
	events::ConversionInfo,
	events::event_type,
	exchange_rate::RateService,
	payment::PaymentProvider,
	registry::CurrencyRegistry,
	retrier::RetryPolicy,
	store::LedgerStore,
};
use ledger_primitives::{CurrencyCode, Money, MoneyError};
use std::sync::Arc;

/// Everything a flow handler needs, injected once at wiring time.
pub struct FlowContext {
	pub store: Arc<dyn LedgerStore>,
	pub bus: Arc<dyn EventBus>,
	pub rates: Arc<RateService>,
	pub registry: Arc<CurrencyRegistry>,
	pub locks: Arc<AccountLocks>,
	pub payments: Arc<dyn PaymentProvider>,
	pub service_fee_percentage: f64,
	pub retry: RetryPolicy,
}

/// Subscribes the full handler set. Registration order within one event
/// type is invocation order, so this is the single place that fixes it.
pub async fn register_handlers(ctx: Arc<FlowContext>) {
	let bus = ctx.bus.clone();

	bus.subscribe(
		event_type::DepositRequested,
		Arc::new(deposit::DepositRequestedHandler::new(ctx.clone())),
	)
	.await;
	bus.subscribe(
		event_type::DepositValidated,
		Arc::new(deposit::DepositValidatedHandler::new(ctx.clone())),
	)
	.await;
	bus.subscribe(
		event_type::WithdrawRequested,
		Arc::new(withdraw::WithdrawRequestedHandler::new(ctx.clone())),
	)
	.await;
	bus.subscribe(
		event_type::WithdrawValidated,
		Arc::new(withdraw::WithdrawValidatedHandler::new(ctx.clone())),
	)
	.await;
	bus.subscribe(
		event_type::TransferRequested,
		Arc::new(transfer::TransferRequestedHandler::new(ctx.clone())),
	)
	.await;
	bus.subscribe(
		event_type::TransferValidated,
		Arc::new(transfer::TransferValidatedHandler::new(ctx.clone())),
	)
	.await;
	bus.subscribe(
		event_type::PaymentProcessed,
		Arc::new(payment::PaymentProcessedHandler::new(ctx.clone())),
	)
	.await;
	bus.subscribe(
		event_type::PaymentCompleted,
		Arc::new(payment::PaymentCompletedHandler::new(ctx.clone())),
	)
	.await;
	bus.subscribe(
		event_type::PaymentFailed,
		Arc::new(payment::PaymentFailedHandler::new(ctx.clone())),
	)
	.await;
}

/// Converts `amount` into `target` via the rate service, scaling between
/// the two currencies' minor units.
pub(crate) async fn convert_amount(
	ctx: &FlowContext,
	amount: Money,
	target: CurrencyCode,
) -> Result<(Money, ConversionInfo), FlowError> {
	let from = ctx
		.registry
		.get(amount.currency())
		.await
		.ok_or(DomainError::CurrencyNotFound(amount.currency()))?;
	let to = ctx.registry.get(target).await.ok_or(DomainError::CurrencyNotFound(target))?;

	let rate = ctx.rates.get_rate(amount.currency(), target).await?;

	let scale = 10f64.powi(i32::from(to.decimals) - i32::from(from.decimals));
	let converted_minor = (amount.minor_units() as f64 * rate.rate * scale).round();
	if !converted_minor.is_finite() {
		return Err(DomainError::Money(MoneyError::AmountOverflow).into());
	}
	let converted = Money::new(converted_minor as i128, target);
	Ok((converted, ConversionInfo { original: amount, converted, rate: rate.rate }))
}

/// The configured service fee for `amount`, if it rounds to at least one
/// minor unit. Recorded on the transaction, never debited.
pub(crate) fn service_fee(amount: Money, percentage: f64) -> Option<Money> {
	if percentage <= 0.0 {
		return None;
	}
	let fee_minor = (amount.minor_units() as f64 * percentage / 100.0).round() as i128;
	(fee_minor > 0).then(|| Money::new(fee_minor, amount.currency()))
}
