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

//! The account aggregate.
//!
//! Invariants held on every mutation: only the owner may operate, amounts
//! are strictly positive, the amount currency equals the account currency,
//! additions must not overflow and subtractions must not go negative.
//!
//! In the event pipeline the aggregate validates but does not mutate; the
//! persisting handler writes the new balance inside the unit of work,
//! holding the account's entry in [AccountLocks] across that read-modify-
//! write. The store remains the authoritative serialization point: updates
//! from a stale snapshot fail there with a conflict via [Account::version],
//! and the in-process lock keeps flows on one account from generating
//! those conflicts against each other in the first place.

use crate::errors::DomainError;
use chrono::{DateTime, Utc};
use ledger_primitives::{AccountId, CurrencyCode, Money, MoneyError, UserId};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
	pub id: AccountId,
	pub user_id: UserId,
	pub balance: Money,
	/// Optimistic-concurrency token, bumped by the store on every committed
	/// update. Updating from a snapshot that missed an intervening commit
	/// fails with a serialization conflict.
	#[serde(default)]
	pub version: u64,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Account {
	/// Opens an account with a zero balance. The balance currency is fixed
	/// here for the account's lifetime.
	pub fn open(user_id: UserId, currency: CurrencyCode) -> Self {
		let now = Utc::now();
		Self {
			id: AccountId::new_random(),
			user_id,
			balance: Money::zero(currency),
			version: 0,
			created_at: now,
			updated_at: now,
		}
	}

	pub fn currency(&self) -> CurrencyCode {
		self.balance.currency()
	}

	pub fn ensure_owner(&self, user_id: UserId) -> Result<(), DomainError> {
		if self.user_id == user_id {
			Ok(())
		} else {
			Err(DomainError::NotOwner)
		}
	}

	fn ensure_operable(&self, user_id: UserId, amount: &Money) -> Result<(), DomainError> {
		self.ensure_owner(user_id)?;
		if !amount.is_positive() {
			return Err(DomainError::TransactionAmountMustBePositive);
		}
		if amount.currency() != self.currency() {
			return Err(MoneyError::CurrencyMismatch {
				lhs: amount.currency(),
				rhs: self.currency(),
			}
			.into());
		}
		Ok(())
	}

	pub fn validate_deposit(&self, user_id: UserId, amount: &Money) -> Result<(), DomainError> {
		self.ensure_operable(user_id, amount)?;
		self.deposited(amount).map(|_| ())
	}

	pub fn validate_withdraw(&self, user_id: UserId, amount: &Money) -> Result<(), DomainError> {
		self.ensure_operable(user_id, amount)?;
		self.withdrawn(amount).map(|_| ())
	}

	pub fn validate_transfer(
		&self,
		user_id: UserId,
		destination: AccountId,
		amount: &Money,
	) -> Result<(), DomainError> {
		if self.id == destination {
			return Err(DomainError::CannotTransferToSameAccount);
		}
		self.validate_withdraw(user_id, amount)
	}

	/// The balance after depositing `amount`, without mutating.
	pub(crate) fn deposited(&self, amount: &Money) -> Result<Money, DomainError> {
		self.balance.add(amount).map_err(|e| match e {
			MoneyError::AmountOverflow => DomainError::DepositExceedsMaxSafeInt,
			other => other.into(),
		})
	}

	/// The balance after withdrawing `amount`, without mutating.
	pub(crate) fn withdrawn(&self, amount: &Money) -> Result<Money, DomainError> {
		let remaining = self.balance.subtract(amount)?;
		if remaining.is_negative() {
			return Err(DomainError::InsufficientFunds);
		}
		Ok(remaining)
	}

	pub(crate) fn set_balance(&mut self, balance: Money) {
		self.balance = balance;
		self.updated_at = Utc::now();
	}
}

// Direct-mutation affordances for tests. The event pipeline is the only
// production mutation path.
#[cfg(test)]
impl Account {
	pub fn deposit(&mut self, user_id: UserId, amount: &Money) -> Result<(), DomainError> {
		self.ensure_operable(user_id, amount)?;
		let balance = self.deposited(amount)?;
		self.set_balance(balance);
		Ok(())
	}

	pub fn withdraw(&mut self, user_id: UserId, amount: &Money) -> Result<(), DomainError> {
		self.ensure_operable(user_id, amount)?;
		let balance = self.withdrawn(amount)?;
		self.set_balance(balance);
		Ok(())
	}

	pub fn transfer(
		&mut self,
		user_id: UserId,
		destination: &mut Account,
		amount: &Money,
	) -> Result<(), DomainError> {
		self.validate_transfer(user_id, destination.id, amount)?;
		destination.ensure_operable(destination.user_id, amount)?;
		let own = self.withdrawn(amount)?;
		let theirs = destination.deposited(amount)?;
		self.set_balance(own);
		destination.set_balance(theirs);
		Ok(())
	}
}

/// Per-account mutual exclusion, created on first use. Persisting handlers
/// hold an account's lock across the unit of work that rewrites its
/// balance, so concurrent flows on the same account queue up instead of
/// racing each other into store-level conflicts.
#[derive(Default)]
pub struct AccountLocks {
	locks: RwLock<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl AccountLocks {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn acquire(&self, account_id: AccountId) -> Arc<Mutex<()>> {
		if let Some(lock) = self.locks.read().await.get(&account_id) {
			return lock.clone();
		}
		self.locks
			.write()
			.await
			.entry(account_id)
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone()
	}
}
