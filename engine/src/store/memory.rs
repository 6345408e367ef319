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

use super::{
	AccountRepository, CheckoutSessionRepository, LedgerStore, LedgerTx, TransactionRepository,
	TxClosure, UserRepository,
};
use crate::{
	account::Account,
	errors::{StoreError, TxError},
	transaction::{CheckoutSession, Transaction, User},
};
use async_trait::async_trait;
use ledger_primitives::{AccountId, TransactionId, UserId};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// In-memory store used by tests and single-process runs.
///
/// A unit of work operates on a deep copy of the state and swaps it in on
/// commit; the state lock is held for the duration of the closure, which
/// serializes writers the way the SQL backends' row locks would.
#[derive(Default)]
pub struct MemoryStore {
	state: Mutex<State>,
}

#[derive(Default, Clone)]
struct State {
	accounts: HashMap<AccountId, Account>,
	transactions: HashMap<TransactionId, Transaction>,
	users: HashMap<UserId, User>,
	sessions: HashMap<String, CheckoutSession>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl LedgerStore for MemoryStore {
	async fn in_transaction<'a>(&self, f: TxClosure<'a>) -> Result<(), TxError> {
		let mut committed = self.state.lock().await;
		let mut working = MemoryTx { state: committed.clone() };
		f(&mut working)?;
		*committed = working.state;
		Ok(())
	}
}

struct MemoryTx {
	state: State,
}

impl LedgerTx for MemoryTx {
	fn accounts(&mut self) -> &mut dyn AccountRepository {
		self
	}

	fn transactions(&mut self) -> &mut dyn TransactionRepository {
		self
	}

	fn users(&mut self) -> &mut dyn UserRepository {
		self
	}

	fn checkout_sessions(&mut self) -> &mut dyn CheckoutSessionRepository {
		self
	}
}

impl AccountRepository for MemoryTx {
	fn create(&mut self, account: &Account) -> Result<(), StoreError> {
		if self.state.accounts.contains_key(&account.id) {
			return Err(StoreError::Constraint(format!("account {} already exists", account.id)));
		}
		self.state.accounts.insert(account.id, account.clone());
		Ok(())
	}

	fn get(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
		Ok(self.state.accounts.get(&id).cloned())
	}

	fn update(&mut self, account: &Account) -> Result<(), StoreError> {
		let stored = self
			.state
			.accounts
			.get(&account.id)
			.ok_or_else(|| StoreError::Constraint(format!("account {} does not exist", account.id)))?;
		if stored.version != account.version {
			return Err(StoreError::Conflict);
		}
		let mut next = account.clone();
		next.version += 1;
		self.state.accounts.insert(account.id, next);
		Ok(())
	}

	fn list_by_user(&mut self, user_id: UserId) -> Result<Vec<Account>, StoreError> {
		let mut accounts: Vec<Account> =
			self.state.accounts.values().filter(|a| a.user_id == user_id).cloned().collect();
		accounts.sort_by_key(|a| a.created_at);
		Ok(accounts)
	}
}

impl TransactionRepository for MemoryTx {
	fn create(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
		if self.state.transactions.contains_key(&transaction.id) {
			return Err(StoreError::Constraint(format!(
				"transaction {} already exists",
				transaction.id
			)));
		}
		self.state.transactions.insert(transaction.id, transaction.clone());
		Ok(())
	}

	fn get(&mut self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
		Ok(self.state.transactions.get(&id).cloned())
	}

	fn update(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
		if !self.state.transactions.contains_key(&transaction.id) {
			return Err(StoreError::Constraint(format!(
				"transaction {} does not exist",
				transaction.id
			)));
		}
		self.state.transactions.insert(transaction.id, transaction.clone());
		Ok(())
	}

	fn get_by_payment_id(&mut self, payment_id: &str) -> Result<Option<Transaction>, StoreError> {
		Ok(self
			.state
			.transactions
			.values()
			.find(|t| t.payment_id.as_deref() == Some(payment_id))
			.cloned())
	}

	fn list_by_account(&mut self, account_id: AccountId) -> Result<Vec<Transaction>, StoreError> {
		let mut transactions: Vec<Transaction> = self
			.state
			.transactions
			.values()
			.filter(|t| t.account_id == account_id)
			.cloned()
			.collect();
		transactions.sort_by_key(|t| t.created_at);
		Ok(transactions)
	}
}

impl UserRepository for MemoryTx {
	fn create(&mut self, user: &User) -> Result<(), StoreError> {
		if self.state.users.contains_key(&user.id) {
			return Err(StoreError::Constraint(format!("user {} already exists", user.id)));
		}
		self.state.users.insert(user.id, user.clone());
		Ok(())
	}

	fn get(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
		Ok(self.state.users.get(&id).cloned())
	}
}

impl CheckoutSessionRepository for MemoryTx {
	fn create(&mut self, session: &CheckoutSession) -> Result<(), StoreError> {
		if self.state.sessions.contains_key(&session.id) {
			return Err(StoreError::Constraint(format!("session {} already exists", session.id)));
		}
		self.state.sessions.insert(session.id.clone(), session.clone());
		Ok(())
	}

	fn get(&mut self, id: &str) -> Result<Option<CheckoutSession>, StoreError> {
		Ok(self.state.sessions.get(id).cloned())
	}

	fn get_by_transaction_id(
		&mut self,
		transaction_id: TransactionId,
	) -> Result<Option<CheckoutSession>, StoreError> {
		Ok(self
			.state
			.sessions
			.values()
			.find(|s| s.transaction_id == transaction_id)
			.cloned())
	}

	fn update(&mut self, session: &CheckoutSession) -> Result<(), StoreError> {
		if !self.state.sessions.contains_key(&session.id) {
			return Err(StoreError::Constraint(format!("session {} does not exist", session.id)));
		}
		self.state.sessions.insert(session.id.clone(), session.clone());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{errors::DomainError, store::read_account};
	use ledger_primitives::{CurrencyCode, Money};

	fn account() -> Account {
		Account::open(UserId::new_random(), CurrencyCode::new("USD").unwrap())
	}

	#[tokio::test]
	async fn commit_makes_writes_visible() {
		let store = MemoryStore::new();
		let account = account();
		let id = account.id;

		store
			.in_transaction(Box::new(move |tx| {
				tx.accounts().create(&account)?;
				Ok(())
			}))
			.await
			.unwrap();

		assert!(read_account(&store, id).await.unwrap().is_some());
	}

	#[tokio::test]
	async fn errors_roll_the_whole_unit_back() {
		let store = MemoryStore::new();
		let account = account();
		let id = account.id;

		let result = store
			.in_transaction(Box::new(move |tx| {
				tx.accounts().create(&account)?;
				Err(DomainError::InsufficientFunds.into())
			}))
			.await;

		assert!(matches!(result, Err(TxError::Domain(DomainError::InsufficientFunds))));
		assert!(read_account(&store, id).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn duplicate_creates_hit_the_constraint() {
		let store = MemoryStore::new();
		let account = account();

		let first = account.clone();
		store
			.in_transaction(Box::new(move |tx| {
				tx.accounts().create(&first)?;
				Ok(())
			}))
			.await
			.unwrap();

		let result = store
			.in_transaction(Box::new(move |tx| {
				tx.accounts().create(&account)?;
				Ok(())
			}))
			.await;
		assert!(matches!(result, Err(TxError::Store(StoreError::Constraint(_)))));
	}

	#[tokio::test]
	async fn stale_account_updates_conflict() {
		let store = MemoryStore::new();
		let account = account();
		let usd = CurrencyCode::new("USD").unwrap();

		let stale = account.clone();
		store
			.in_transaction(Box::new(move |tx| {
				tx.accounts().create(&account)?;
				Ok(())
			}))
			.await
			.unwrap();

		// A fresh read-modify-write commits and bumps the version.
		let id = stale.id;
		store
			.in_transaction(Box::new(move |tx| {
				let mut fresh = tx.accounts().get(id)?.expect("just created");
				fresh.set_balance(Money::new(100, usd));
				tx.accounts().update(&fresh)?;
				Ok(())
			}))
			.await
			.unwrap();

		// Writing through the pre-update snapshot is a conflict.
		let result = store
			.in_transaction(Box::new(move |tx| {
				tx.accounts().update(&stale)?;
				Ok(())
			}))
			.await;
		assert!(matches!(result, Err(TxError::Store(StoreError::Conflict))));

		let committed = read_account(&store, id).await.unwrap().unwrap();
		assert_eq!(committed.balance, Money::new(100, usd));
		assert_eq!(committed.version, 1);
	}

	#[tokio::test]
	async fn user_and_session_repositories_roundtrip() {
		use crate::transaction::{CheckoutSession, SessionStatus, User};
		use chrono::Utc;
		use ledger_primitives::TransactionId;

		let store = MemoryStore::new();
		let user = User {
			id: UserId::new_random(),
			email: "sam@example.com".to_string(),
			display_name: "Sam".to_string(),
			created_at: Utc::now(),
		};
		let transaction_id = TransactionId::new_random();
		let session = CheckoutSession {
			id: "cs_1".to_string(),
			payment_id: None,
			transaction_id,
			user_id: user.id,
			account_id: ledger_primitives::AccountId::new_random(),
			amount_minor: 10_000,
			currency: CurrencyCode::new("USD").unwrap(),
			url: "https://checkout.stripe.com/c/pay/cs_1".to_string(),
			status: SessionStatus::Open,
			created_at: Utc::now(),
			expires_at: Utc::now() + chrono::Duration::hours(24),
		};

		{
			let (user, session) = (user.clone(), session.clone());
			store
				.in_transaction(Box::new(move |tx| {
					tx.users().create(&user)?;
					tx.checkout_sessions().create(&session)?;
					Ok(())
				}))
				.await
				.unwrap();
		}

		let mut loaded_user = None;
		let mut by_id = None;
		let mut by_transaction = None;
		store
			.in_transaction(Box::new(|tx| {
				loaded_user = tx.users().get(user.id)?;
				by_id = tx.checkout_sessions().get("cs_1")?;
				by_transaction = tx.checkout_sessions().get_by_transaction_id(transaction_id)?;
				Ok(())
			}))
			.await
			.unwrap();
		assert_eq!(loaded_user.unwrap().email, "sam@example.com");
		assert_eq!(by_id, Some(session.clone()));
		assert_eq!(by_transaction, Some(session));
	}

	#[tokio::test]
	async fn writes_are_read_back_within_the_same_unit() {
		let store = MemoryStore::new();
		let mut account = account();
		let id = account.id;
		let user = account.user_id;
		let usd = CurrencyCode::new("USD").unwrap();

		store
			.in_transaction(Box::new(move |tx| {
				tx.accounts().create(&account)?;
				account.set_balance(Money::new(500, usd));
				tx.accounts().update(&account)?;
				let loaded = tx.accounts().get(id)?.expect("just created");
				assert_eq!(loaded.balance, Money::new(500, usd));
				assert_eq!(tx.accounts().list_by_user(user)?.len(), 1);
				Ok(())
			}))
			.await
			.unwrap();
	}
}
