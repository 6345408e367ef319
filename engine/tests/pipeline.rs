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

//! End-to-end pipeline tests on the local bus and the in-memory store,
//! with stubbed rate and payment providers.

use async_trait::async_trait;
use chrono::Utc;
use ledger_engine::{
	account::{Account, AccountLocks},
	bus::{EventBus, EventHandler, LocalBus},
	commands::LedgerCommands,
	errors::{CommandError, DomainError, RateError, StoreError, TxError},
	events::{event_type, FailureKind, LedgerEvent},
	exchange_rate::{InMemoryRateCache, RateInfo, RateProvider, RateService},
	flows::{self, FlowContext},
	payment::{
		InitiatePaymentRequest, InitiatedPayment, PaymentProvider, PaymentStatus, StripeClient,
		StripeWebhook, WebhookSignature,
	},
	queries::LedgerQueries,
	registry::CurrencyRegistry,
	retrier::RetryPolicy,
	settings::{ServerSettings, StripeSettings},
	store::{read_checkout_session, read_transaction, LedgerStore, MemoryStore, TxClosure},
	transaction::{MoneySource, SessionStatus, TransactionStatus},
	errors::PaymentError,
};
use ledger_primitives::{AccountId, CurrencyCode, Money, UserId};
use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::Duration,
};

const SIGNING_SECRET: &str = "whsec_pipeline_test";

const ALL_EVENT_TYPES: [&str; 19] = [
	event_type::DepositRequested,
	event_type::WithdrawRequested,
	event_type::TransferRequested,
	event_type::DepositValidated,
	event_type::WithdrawValidated,
	event_type::TransferValidated,
	event_type::AmountConverted,
	event_type::TransactionPersisted,
	event_type::CheckoutInitiated,
	event_type::PaymentProcessed,
	event_type::PaymentCompleted,
	event_type::PaymentFailed,
	event_type::DepositCompleted,
	event_type::WithdrawCompleted,
	event_type::TransferCompleted,
	event_type::DepositFailed,
	event_type::WithdrawFailed,
	event_type::TransferFailed,
	event_type::FeesCalculated,
];

struct Recorder {
	seen: Mutex<Vec<LedgerEvent>>,
}

impl Recorder {
	fn of_type(&self, event_type: &str) -> Vec<LedgerEvent> {
		self.seen
			.lock()
			.unwrap()
			.iter()
			.filter(|e| e.event_type() == event_type)
			.cloned()
			.collect()
	}

	fn type_sequence(&self) -> Vec<&'static str> {
		self.seen.lock().unwrap().iter().map(|e| e.event_type()).collect()
	}

	fn is_empty(&self) -> bool {
		self.seen.lock().unwrap().is_empty()
	}
}

#[async_trait]
impl EventHandler for Recorder {
	fn name(&self) -> &'static str {
		"recorder"
	}

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
		self.seen.lock().unwrap().push(event.clone());
		Ok(())
	}
}

struct StubRateProvider {
	name: String,
	healthy: bool,
	rate: f64,
}

#[async_trait]
impl RateProvider for StubRateProvider {
	fn name(&self) -> &str {
		&self.name
	}

	async fn is_healthy(&self) -> bool {
		self.healthy
	}

	async fn rate(&self, _from: CurrencyCode, _to: CurrencyCode) -> Result<RateInfo, RateError> {
		Ok(RateInfo { rate: self.rate, timestamp: Utc::now(), expires_at: None })
	}

	async fn rates(
		&self,
		from: CurrencyCode,
		to: &[CurrencyCode],
	) -> Result<HashMap<CurrencyCode, RateInfo>, RateError> {
		let mut rates = HashMap::new();
		for &code in to {
			rates.insert(code, self.rate(from, code).await?);
		}
		Ok(rates)
	}
}

struct StubPaymentProvider {
	requests: Mutex<Vec<InitiatePaymentRequest>>,
}

#[async_trait]
impl PaymentProvider for StubPaymentProvider {
	fn name(&self) -> &'static str {
		"stub"
	}

	async fn initiate_payment(
		&self,
		request: InitiatePaymentRequest,
	) -> Result<InitiatedPayment, PaymentError> {
		self.requests.lock().unwrap().push(request);
		Ok(InitiatedPayment {
			status: PaymentStatus::Pending,
			payment_id: Some("pi_123".to_string()),
			session_id: "cs_test_1".to_string(),
			checkout_url: "https://checkout.stripe.com/c/pay/cs_test_1".to_string(),
			expires_at: Utc::now() + chrono::Duration::hours(24),
		})
	}
}

struct Harness {
	bus: Arc<LocalBus>,
	store: Arc<MemoryStore>,
	commands: LedgerCommands,
	recorder: Arc<Recorder>,
	payments: Arc<StubPaymentProvider>,
}

impl Harness {
	async fn new(providers: Vec<Arc<dyn RateProvider>>) -> Self {
		let bus = Arc::new(LocalBus::new());
		let store = Arc::new(MemoryStore::new());
		let registry = Arc::new(CurrencyRegistry::new());
		registry.seed_defaults().await.unwrap();

		let rates = Arc::new(RateService::new(
			Arc::new(InMemoryRateCache::new()),
			providers,
			Duration::from_secs(900),
			Duration::from_secs(900),
		));
		let payments =
			Arc::new(StubPaymentProvider { requests: Mutex::new(Vec::new()) });

		flows::register_handlers(Arc::new(FlowContext {
			store: store.clone(),
			bus: bus.clone(),
			rates,
			registry: registry.clone(),
			locks: Arc::new(AccountLocks::new()),
			payments: payments.clone(),
			service_fee_percentage: 0.0,
			retry: RetryPolicy::new(Duration::from_millis(10), 3),
		}))
		.await;

		let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
		for event_type in ALL_EVENT_TYPES {
			bus.subscribe(event_type, recorder.clone()).await;
		}

		let commands = LedgerCommands::new(store.clone(), bus.clone(), registry);
		Self { bus, store, commands, recorder, payments }
	}

	async fn open_account(&self, currency: &str, balance_minor: i128) -> (UserId, AccountId) {
		let user_id = UserId::new_random();
		let mut account = Account::open(user_id, CurrencyCode::new(currency).unwrap());
		account.balance = Money::new(balance_minor, CurrencyCode::new(currency).unwrap());
		let account_id = account.id;
		self.store
			.in_transaction(Box::new(move |tx| {
				tx.accounts().create(&account)?;
				Ok(())
			}))
			.await
			.unwrap();
		(user_id, account_id)
	}

	async fn balance_of(&self, account_id: AccountId) -> Money {
		ledger_engine::store::read_account(self.store.as_ref(), account_id)
			.await
			.unwrap()
			.unwrap()
			.balance
	}

	fn webhook(&self) -> StripeWebhook {
		let stripe_settings = StripeSettings {
			api_key: "sk_test_123".to_string(),
			signing_secret: SIGNING_SECRET.to_string(),
			api_url: "https://api.stripe.com".to_string(),
			success_path: "/payments/success".to_string(),
			cancel_path: "/payments/cancel".to_string(),
			webhook_tolerance_seconds: 300,
		};
		let server_settings = ServerSettings {
			host: "127.0.0.1".to_string(),
			port: 8080,
			scheme: "http".to_string(),
		};
		let client = Arc::new(
			StripeClient::new(&stripe_settings, &server_settings, Duration::from_secs(10))
				.unwrap(),
		);
		StripeWebhook::new(
			WebhookSignature::new(SIGNING_SECRET, Duration::from_secs(300)),
			self.store.clone(),
			self.bus.clone(),
			client,
		)
	}
}

fn usd(minor: i128) -> Money {
	Money::new(minor, CurrencyCode::new("USD").unwrap())
}

fn signed_header(payload: &[u8]) -> String {
	let signer = WebhookSignature::new(SIGNING_SECRET, Duration::from_secs(300));
	let timestamp = Utc::now().timestamp();
	format!("t={timestamp},v1={}", signer.sign(timestamp, payload))
}

#[tokio::test]
async fn same_currency_deposit_completes_without_conversion() {
	let harness = Harness::new(vec![]).await;
	let (user_id, account_id) = harness.open_account("USD", 0).await;

	let transaction_id = harness
		.commands
		.deposit(
			user_id,
			account_id,
			"100.00",
			CurrencyCode::new("USD").unwrap(),
			MoneySource::Internal,
		)
		.await
		.unwrap();

	let transaction = read_transaction(harness.store.as_ref(), transaction_id)
		.await
		.unwrap()
		.expect("transaction persisted");
	assert_eq!(transaction.status, TransactionStatus::Completed);
	assert_eq!(transaction.balance_snapshot, usd(10_000));
	assert_eq!(transaction.amount, usd(10_000));
	assert!(transaction.original_amount.is_none());
	assert!(transaction.conversion_rate.is_none());
	assert_eq!(harness.balance_of(account_id).await, usd(10_000));

	assert!(harness.recorder.of_type(event_type::AmountConverted).is_empty());
	assert_eq!(harness.recorder.of_type(event_type::DepositCompleted).len(), 1);

	// Every event of the flow carries the transaction id as correlation id.
	for event in harness.recorder.seen.lock().unwrap().iter() {
		assert_eq!(event.flow().correlation_id, transaction_id);
	}
}

#[tokio::test]
async fn cross_currency_deposit_converts_at_the_provider_rate() {
	let harness = Harness::new(vec![Arc::new(StubRateProvider {
		name: "mock".to_string(),
		healthy: true,
		rate: 1.10,
	})])
	.await;
	let (user_id, account_id) = harness.open_account("USD", 0).await;

	let transaction_id = harness
		.commands
		.deposit(
			user_id,
			account_id,
			"100.00",
			CurrencyCode::new("EUR").unwrap(),
			MoneySource::Internal,
		)
		.await
		.unwrap();

	let conversions = harness.recorder.of_type(event_type::AmountConverted);
	assert_eq!(conversions.len(), 1);
	let LedgerEvent::AmountConverted(converted) = &conversions[0] else { unreachable!() };
	assert_eq!(
		converted.conversion.original,
		Money::new(10_000, CurrencyCode::new("EUR").unwrap())
	);
	assert_eq!(converted.conversion.converted, usd(11_000));
	assert_eq!(converted.conversion.rate, 1.10);

	let transaction = read_transaction(harness.store.as_ref(), transaction_id)
		.await
		.unwrap()
		.expect("transaction persisted");
	assert_eq!(transaction.amount, usd(11_000));
	assert_eq!(
		transaction.original_amount,
		Some(Money::new(10_000, CurrencyCode::new("EUR").unwrap()))
	);
	assert_eq!(transaction.conversion_rate, Some(1.10));
	assert_eq!(harness.balance_of(account_id).await, usd(11_000));
}

#[tokio::test]
async fn insufficient_funds_withdraw_fails_and_leaves_the_balance() {
	let harness = Harness::new(vec![]).await;
	let (user_id, account_id) = harness.open_account("USD", 5_000).await;

	harness
		.commands
		.withdraw(user_id, account_id, "100.00", CurrencyCode::new("USD").unwrap(), None)
		.await
		.unwrap();

	let failures = harness.recorder.of_type(event_type::WithdrawFailed);
	assert_eq!(failures.len(), 1);
	let LedgerEvent::WithdrawFailed(failed) = &failures[0] else { unreachable!() };
	assert_eq!(failed.kind, FailureKind::InsufficientFunds);

	assert_eq!(harness.balance_of(account_id).await, usd(5_000));
	assert!(harness.recorder.of_type(event_type::WithdrawCompleted).is_empty());
}

#[tokio::test]
async fn withdrawing_the_exact_balance_empties_the_account() {
	let harness = Harness::new(vec![]).await;
	let (user_id, account_id) = harness.open_account("USD", 5_000).await;

	let transaction_id = harness
		.commands
		.withdraw(
			user_id,
			account_id,
			"50.00",
			CurrencyCode::new("USD").unwrap(),
			Some("IBAN DE00 1234".to_string()),
		)
		.await
		.unwrap();

	assert_eq!(harness.balance_of(account_id).await, usd(0));
	let transaction = read_transaction(harness.store.as_ref(), transaction_id)
		.await
		.unwrap()
		.expect("transaction persisted");
	assert_eq!(transaction.status, TransactionStatus::Completed);
	assert_eq!(transaction.amount, usd(-5_000));
	assert_eq!(transaction.balance_snapshot, usd(0));
	assert_eq!(transaction.external_target.as_deref(), Some("IBAN DE00 1234"));
}

#[tokio::test]
async fn transfer_to_the_same_account_is_rejected_before_any_event() {
	let harness = Harness::new(vec![]).await;
	let (user_id, account_id) = harness.open_account("USD", 5_000).await;

	let result = harness
		.commands
		.transfer(user_id, account_id, account_id, "10.00", CurrencyCode::new("USD").unwrap())
		.await;
	assert!(matches!(
		result,
		Err(CommandError::Domain(DomainError::CannotTransferToSameAccount))
	));
	assert!(harness.recorder.is_empty());
}

#[tokio::test]
async fn transfer_produces_two_transactions_and_nets_to_zero_on_return() {
	let harness = Harness::new(vec![]).await;
	let (user_id, account_a) = harness.open_account("USD", 10_000).await;
	let (other_user, account_b) = harness.open_account("USD", 2_000).await;

	harness
		.commands
		.transfer(user_id, account_a, account_b, "30.00", CurrencyCode::new("USD").unwrap())
		.await
		.unwrap();
	assert_eq!(harness.balance_of(account_a).await, usd(7_000));
	assert_eq!(harness.balance_of(account_b).await, usd(5_000));

	let completions = harness.recorder.of_type(event_type::TransferCompleted);
	assert_eq!(completions.len(), 1);
	let LedgerEvent::TransferCompleted(completed) = &completions[0] else { unreachable!() };
	let outgoing = read_transaction(harness.store.as_ref(), completed.outgoing_id)
		.await
		.unwrap()
		.expect("outgoing leg persisted");
	let incoming = read_transaction(harness.store.as_ref(), completed.incoming_id)
		.await
		.unwrap()
		.expect("incoming leg persisted");
	assert_eq!(outgoing.amount, usd(-3_000));
	assert_eq!(outgoing.balance_snapshot, usd(7_000));
	assert_eq!(incoming.amount, usd(3_000));
	assert_eq!(incoming.balance_snapshot, usd(5_000));
	assert_eq!(incoming.user_id, other_user);

	// And back again: both balances return to where they started.
	harness
		.commands
		.transfer(other_user, account_b, account_a, "30.00", CurrencyCode::new("USD").unwrap())
		.await
		.unwrap();
	assert_eq!(harness.balance_of(account_a).await, usd(10_000));
	assert_eq!(harness.balance_of(account_b).await, usd(2_000));

	// Both legs of both transfers show up in each account's history.
	let queries = LedgerQueries::new(harness.store.clone());
	assert_eq!(queries.account_history(account_a).await.unwrap().len(), 2);
	assert_eq!(queries.account_history(account_b).await.unwrap().len(), 2);
	assert_eq!(queries.accounts_of(user_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn transfers_across_currencies_are_rejected() {
	let harness = Harness::new(vec![]).await;
	let (user_id, account_usd) = harness.open_account("USD", 10_000).await;
	let (_, account_eur) = harness.open_account("EUR", 0).await;

	harness
		.commands
		.transfer(user_id, account_usd, account_eur, "10.00", CurrencyCode::new("USD").unwrap())
		.await
		.unwrap();

	let failures = harness.recorder.of_type(event_type::TransferFailed);
	assert_eq!(failures.len(), 1);
	let LedgerEvent::TransferFailed(failed) = &failures[0] else { unreachable!() };
	assert_eq!(failed.kind, FailureKind::CurrencyMismatch);
	assert_eq!(harness.balance_of(account_usd).await, usd(10_000));
}

#[tokio::test]
async fn checkout_webhook_completes_a_provider_deposit_exactly_once() {
	let harness = Harness::new(vec![]).await;
	let (user_id, account_id) = harness.open_account("USD", 0).await;

	let transaction_id = harness
		.commands
		.deposit(
			user_id,
			account_id,
			"100.00",
			CurrencyCode::new("USD").unwrap(),
			MoneySource::Card,
		)
		.await
		.unwrap();

	// The provider was asked to collect the requested amount and the
	// transaction is parked pending the webhook.
	assert_eq!(harness.payments.requests.lock().unwrap().len(), 1);
	let pending = read_transaction(harness.store.as_ref(), transaction_id)
		.await
		.unwrap()
		.expect("transaction persisted");
	assert_eq!(pending.status, TransactionStatus::Pending);
	assert_eq!(pending.payment_id.as_deref(), Some("pi_123"));
	assert_eq!(harness.balance_of(account_id).await, usd(0));
	assert_eq!(harness.recorder.of_type(event_type::CheckoutInitiated).len(), 1);

	let payload = serde_json::json!({
		"id": "evt_1",
		"type": "checkout.session.completed",
		"data": { "object": {
			"id": "cs_test_1",
			"payment_intent": "pi_123",
			"amount_total": 10_000,
			"currency": "usd",
			"metadata": {
				"user_id": user_id.to_string(),
				"account_id": account_id.to_string(),
				"transaction_id": transaction_id.to_string(),
				"currency": "USD",
			},
		}},
	})
	.to_string()
	.into_bytes();

	let webhook = harness.webhook();
	let event = webhook
		.handle_webhook(&payload, &signed_header(&payload))
		.await
		.unwrap()
		.expect("a known event type");
	assert_eq!(event.transaction_id, transaction_id);
	assert_eq!(event.payment_id.as_deref(), Some("pi_123"));

	// PaymentProcessed precedes PaymentCompleted.
	let sequence = harness.recorder.type_sequence();
	let processed_at =
		sequence.iter().position(|t| *t == event_type::PaymentProcessed).unwrap();
	let completed_at =
		sequence.iter().position(|t| *t == event_type::PaymentCompleted).unwrap();
	assert!(processed_at < completed_at);

	let transaction = read_transaction(harness.store.as_ref(), transaction_id)
		.await
		.unwrap()
		.expect("transaction persisted");
	assert_eq!(transaction.status, TransactionStatus::Completed);
	assert_eq!(harness.balance_of(account_id).await, usd(10_000));

	let session = read_checkout_session(harness.store.as_ref(), "cs_test_1")
		.await
		.unwrap()
		.expect("session persisted");
	assert_eq!(session.status, SessionStatus::Completed);
	assert_eq!(session.payment_id.as_deref(), Some("pi_123"));

	// Redelivering the same provider event is inert.
	webhook.handle_webhook(&payload, &signed_header(&payload)).await.unwrap();
	assert_eq!(harness.recorder.of_type(event_type::PaymentCompleted).len(), 1);
	assert_eq!(harness.recorder.of_type(event_type::DepositCompleted).len(), 1);
	assert_eq!(harness.balance_of(account_id).await, usd(10_000));
}

#[tokio::test]
async fn cross_currency_provider_deposits_charge_the_requested_currency() {
	let harness = Harness::new(vec![Arc::new(StubRateProvider {
		name: "mock".to_string(),
		healthy: true,
		rate: 1.10,
	})])
	.await;
	let (user_id, account_id) = harness.open_account("USD", 0).await;

	let transaction_id = harness
		.commands
		.deposit(
			user_id,
			account_id,
			"100.00",
			CurrencyCode::new("EUR").unwrap(),
			MoneySource::Stripe,
		)
		.await
		.unwrap();

	// The provider collects 100.00 EUR while the parked transaction is
	// denominated in the converted account currency.
	let requests = harness.payments.requests.lock().unwrap().clone();
	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].amount_minor, 10_000);
	assert_eq!(requests[0].currency, CurrencyCode::new("EUR").unwrap());

	let pending = read_transaction(harness.store.as_ref(), transaction_id)
		.await
		.unwrap()
		.expect("transaction persisted");
	assert_eq!(pending.amount, usd(11_000));
	assert_eq!(pending.conversion_rate, Some(1.10));
	assert_eq!(
		pending.original_amount,
		Some(Money::new(10_000, CurrencyCode::new("EUR").unwrap()))
	);

	// Completion credits the converted amount.
	let payload = serde_json::json!({
		"id": "evt_fx",
		"type": "checkout.session.completed",
		"data": { "object": {
			"id": "cs_test_1",
			"payment_intent": "pi_123",
			"amount_total": 10_000,
			"currency": "eur",
			"metadata": {
				"user_id": user_id.to_string(),
				"account_id": account_id.to_string(),
				"transaction_id": transaction_id.to_string(),
				"currency": "EUR",
			},
		}},
	})
	.to_string()
	.into_bytes();
	harness
		.webhook()
		.handle_webhook(&payload, &signed_header(&payload))
		.await
		.unwrap();

	assert_eq!(harness.balance_of(account_id).await, usd(11_000));
}

#[tokio::test]
async fn unknown_webhook_event_types_are_accepted_as_noops() {
	let harness = Harness::new(vec![]).await;
	let webhook = harness.webhook();

	let payload =
		br#"{"id":"evt_2","type":"customer.created","data":{"object":{}}}"#.to_vec();
	let outcome = webhook.handle_webhook(&payload, &signed_header(&payload)).await.unwrap();
	assert!(outcome.is_none());
	assert!(harness.recorder.is_empty());
}

#[tokio::test]
async fn malformed_webhook_payloads_are_rejected() {
	let harness = Harness::new(vec![]).await;
	let webhook = harness.webhook();

	let payload = b"{not json".to_vec();
	assert!(webhook.handle_webhook(&payload, &signed_header(&payload)).await.is_err());
}

/// Injects serialization conflicts ahead of the real store, to drive the
/// persisting handlers' backoff-and-retry path.
struct ConflictingStore {
	inner: MemoryStore,
	passes_before_conflicts: Mutex<u32>,
	conflicts: Mutex<u32>,
}

#[async_trait]
impl LedgerStore for ConflictingStore {
	async fn in_transaction<'a>(&self, f: TxClosure<'a>) -> Result<(), TxError> {
		{
			let mut passes = self.passes_before_conflicts.lock().unwrap();
			if *passes > 0 {
				*passes -= 1;
			} else {
				let mut conflicts = self.conflicts.lock().unwrap();
				if *conflicts > 0 {
					*conflicts -= 1;
					return Err(StoreError::Conflict.into());
				}
			}
		}
		self.inner.in_transaction(f).await
	}
}

#[tokio::test]
async fn persisting_handlers_retry_serialization_conflicts() {
	use ledger_engine::{
		events::{DepositValidated, FlowEvent, FlowType},
		flows::deposit::DepositValidatedHandler,
	};

	let bus = Arc::new(LocalBus::new());
	let registry = Arc::new(CurrencyRegistry::new());
	registry.seed_defaults().await.unwrap();

	// One pass for the dedup read, then two conflicts before the unit of
	// work is allowed through.
	let store = Arc::new(ConflictingStore {
		inner: MemoryStore::new(),
		passes_before_conflicts: Mutex::new(1),
		conflicts: Mutex::new(2),
	});

	let user_id = UserId::new_random();
	let account = Account::open(user_id, CurrencyCode::new("USD").unwrap());
	let account_id = account.id;
	store
		.inner
		.in_transaction(Box::new(move |tx| {
			tx.accounts().create(&account)?;
			Ok(())
		}))
		.await
		.unwrap();

	let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
	for event_type in [
		event_type::TransactionPersisted,
		event_type::DepositCompleted,
		event_type::DepositFailed,
	] {
		bus.subscribe(event_type, recorder.clone()).await;
	}

	let handler = DepositValidatedHandler::new(Arc::new(FlowContext {
		store: store.clone(),
		bus: bus.clone(),
		rates: Arc::new(RateService::new(
			Arc::new(InMemoryRateCache::new()),
			vec![],
			Duration::from_secs(900),
			Duration::from_secs(900),
		)),
		registry,
		locks: Arc::new(AccountLocks::new()),
		payments: Arc::new(StubPaymentProvider { requests: Mutex::new(Vec::new()) }),
		service_fee_percentage: 0.0,
		retry: RetryPolicy::new(Duration::from_millis(1), 3),
	}));

	let transaction_id = ledger_primitives::TransactionId::new_random();
	let flow = FlowEvent::new(user_id, account_id, FlowType::Deposit, transaction_id);
	let event = DepositValidated {
		flow,
		amount: usd(10_000),
		source: MoneySource::Internal,
		conversion: None,
	}
	.into();
	handler.handle(&event).await.unwrap();

	// Both injected conflicts were consumed, the third attempt landed.
	assert_eq!(*store.conflicts.lock().unwrap(), 0);
	let transaction = read_transaction(&store.inner, transaction_id)
		.await
		.unwrap()
		.expect("persisted after retries");
	assert_eq!(transaction.status, TransactionStatus::Completed);
	assert_eq!(transaction.balance_snapshot, usd(10_000));
	assert!(recorder.of_type(event_type::DepositFailed).is_empty());
	assert_eq!(recorder.of_type(event_type::DepositCompleted).len(), 1);
}

#[tokio::test]
async fn rate_provider_failover_uses_the_next_healthy_provider() {
	let cache = Arc::new(InMemoryRateCache::new());
	let service = RateService::new(
		cache.clone(),
		vec![
			Arc::new(StubRateProvider { name: "P1".to_string(), healthy: false, rate: 9.9 }),
			Arc::new(StubRateProvider { name: "P2".to_string(), healthy: true, rate: 0.85 }),
		],
		Duration::from_secs(900),
		Duration::from_secs(900),
	);

	let rate = service
		.get_rate(CurrencyCode::new("USD").unwrap(), CurrencyCode::new("EUR").unwrap())
		.await
		.unwrap();
	assert_eq!(rate.source, "P2");
	assert_eq!(rate.rate, 0.85);

	use ledger_engine::exchange_rate::cache::RateCache;
	let cached = cache.get("USD:EUR").await.unwrap().expect("written through");
	assert_eq!(cached.rate, 0.85);
	assert!(cached.expires_at > Utc::now());
}
