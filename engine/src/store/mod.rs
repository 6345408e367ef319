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

//! The unit-of-work boundary.
//!
//! [LedgerStore::in_transaction] runs a closure against a transaction
//! handle with typed repository accessors: commit happens iff the closure
//! returns `Ok`, anything else (error or unwind) drops the uncommitted
//! buffer. Because the closure only ever sees the handle, not the store,
//! nested units of work are unrepresentable; "nesting flattens to the
//! outermost scope" holds by construction. Repositories must not be
//! retained outside the closure, which the borrow on the handle enforces.

pub mod memory;
pub mod rocks;

use crate::{
	account::Account,
	errors::{StoreError, TxError},
	transaction::{CheckoutSession, Transaction, User},
};
use async_trait::async_trait;
use ledger_primitives::{AccountId, TransactionId, UserId};

pub use self::memory::MemoryStore;
pub use self::rocks::RocksStore;

pub type TxClosure<'a> = Box<dyn FnOnce(&mut dyn LedgerTx) -> Result<(), TxError> + Send + 'a>;

#[async_trait]
pub trait LedgerStore: Send + Sync {
	/// Runs `f` inside one atomic boundary, serialized against concurrent
	/// units of work on the same store.
	async fn in_transaction<'a>(&self, f: TxClosure<'a>) -> Result<(), TxError>;
}

/// Typed repository accessors of one open unit of work.
pub trait LedgerTx: Send {
	fn accounts(&mut self) -> &mut dyn AccountRepository;
	fn transactions(&mut self) -> &mut dyn TransactionRepository;
	fn users(&mut self) -> &mut dyn UserRepository;
	fn checkout_sessions(&mut self) -> &mut dyn CheckoutSessionRepository;
}

pub trait AccountRepository {
	fn create(&mut self, account: &Account) -> Result<(), StoreError>;
	fn get(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;
	/// Compare-and-swap on [Account::version]: updating from a snapshot
	/// that missed an intervening commit fails with
	/// [StoreError::Conflict], the stored version is bumped on success.
	fn update(&mut self, account: &Account) -> Result<(), StoreError>;
	fn list_by_user(&mut self, user_id: UserId) -> Result<Vec<Account>, StoreError>;
}

pub trait TransactionRepository {
	fn create(&mut self, transaction: &Transaction) -> Result<(), StoreError>;
	fn get(&mut self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;
	fn update(&mut self, transaction: &Transaction) -> Result<(), StoreError>;
	fn get_by_payment_id(&mut self, payment_id: &str) -> Result<Option<Transaction>, StoreError>;
	fn list_by_account(&mut self, account_id: AccountId) -> Result<Vec<Transaction>, StoreError>;
}

pub trait UserRepository {
	fn create(&mut self, user: &User) -> Result<(), StoreError>;
	fn get(&mut self, id: UserId) -> Result<Option<User>, StoreError>;
}

pub trait CheckoutSessionRepository {
	fn create(&mut self, session: &CheckoutSession) -> Result<(), StoreError>;
	fn get(&mut self, id: &str) -> Result<Option<CheckoutSession>, StoreError>;
	fn get_by_transaction_id(
		&mut self,
		transaction_id: TransactionId,
	) -> Result<Option<CheckoutSession>, StoreError>;
	fn update(&mut self, session: &CheckoutSession) -> Result<(), StoreError>;
}

/// One-shot read of an account outside any flow.
pub async fn read_account(
	store: &dyn LedgerStore,
	id: AccountId,
) -> Result<Option<Account>, TxError> {
	let mut out = None;
	store
		.in_transaction(Box::new(|tx| {
			out = tx.accounts().get(id)?;
			Ok(())
		}))
		.await?;
	Ok(out)
}

/// One-shot read of a transaction, e.g. for status queries.
pub async fn read_transaction(
	store: &dyn LedgerStore,
	id: TransactionId,
) -> Result<Option<Transaction>, TxError> {
	let mut out = None;
	store
		.in_transaction(Box::new(|tx| {
			out = tx.transactions().get(id)?;
			Ok(())
		}))
		.await?;
	Ok(out)
}

/// One-shot read of a checkout session.
pub async fn read_checkout_session(
	store: &dyn LedgerStore,
	id: &str,
) -> Result<Option<CheckoutSession>, TxError> {
	let mut out = None;
	store
		.in_transaction(Box::new(|tx| {
			out = tx.checkout_sessions().get(id)?;
			Ok(())
		}))
		.await?;
	Ok(out)
}
