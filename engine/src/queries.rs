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

//! Read-side queries.
//!
//! Commands return as soon as the `*Requested` event is accepted; the
//! final outcome of a flow is observed here, by the presentation layer
//! polling transaction status or listing an account's history.

use crate::{
	account::Account,
	errors::TxError,
	store::LedgerStore,
	transaction::{CheckoutSession, Transaction},
};
use ledger_primitives::{AccountId, TransactionId, UserId};
use std::sync::Arc;

pub struct LedgerQueries {
	store: Arc<dyn LedgerStore>,
}

impl LedgerQueries {
	pub fn new(store: Arc<dyn LedgerStore>) -> Self {
		Self { store }
	}

	pub async fn accounts_of(&self, user_id: UserId) -> Result<Vec<Account>, TxError> {
		let mut accounts = Vec::new();
		let out = &mut accounts;
		self.store
			.in_transaction(Box::new(move |tx| {
				*out = tx.accounts().list_by_user(user_id)?;
				Ok(())
			}))
			.await?;
		Ok(accounts)
	}

	/// All transactions recorded against an account, oldest first.
	pub async fn account_history(
		&self,
		account_id: AccountId,
	) -> Result<Vec<Transaction>, TxError> {
		let mut history = Vec::new();
		let out = &mut history;
		self.store
			.in_transaction(Box::new(move |tx| {
				*out = tx.transactions().list_by_account(account_id)?;
				Ok(())
			}))
			.await?;
		Ok(history)
	}

	pub async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>, TxError> {
		crate::store::read_transaction(self.store.as_ref(), id).await
	}

	/// Resolves a provider payment id back to the transaction it settles.
	pub async fn transaction_by_payment_id(
		&self,
		payment_id: &str,
	) -> Result<Option<Transaction>, TxError> {
		let mut found = None;
		let out = &mut found;
		self.store
			.in_transaction(Box::new(move |tx| {
				*out = tx.transactions().get_by_payment_id(payment_id)?;
				Ok(())
			}))
			.await?;
		Ok(found)
	}

	pub async fn checkout_session(&self, id: &str) -> Result<Option<CheckoutSession>, TxError> {
		crate::store::read_checkout_session(self.store.as_ref(), id).await
	}
}
