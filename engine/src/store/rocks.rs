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

//! RocksDB-backed store.
//!
//! One column family per repository plus a metadata column carrying the
//! schema version. A unit of work accumulates writes in a [WriteBatch]
//! with an overlay for read-your-writes, and commits the batch atomically;
//! dropping the batch on error or unwind is the rollback. Units of work
//! are serialized by a store-level write lock.

use super::{
	AccountRepository, CheckoutSessionRepository, LedgerStore, LedgerTx, TransactionRepository,
	TxClosure, UserRepository,
};
use crate::{
	account::Account,
	errors::{StoreError, TxError},
	registry::CurrencyBackend,
	transaction::{CheckoutSession, Transaction, User},
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ledger_primitives::{AccountId, Currency, CurrencyCode, TransactionId, UserId};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::{
	collections::{BTreeMap, HashMap},
	path::Path,
};
use tracing::info;

/// Bump on any change to the persisted data format, with a migration arm in
/// [migrate_to_version].
const LATEST_SCHEMA_VERSION: u32 = 1;

const DB_SCHEMA_VERSION_KEY: &[u8; 17] = b"db_schema_version";

const ACCOUNTS_COLUMN: &str = "accounts";
const TRANSACTIONS_COLUMN: &str = "transactions";
const USERS_COLUMN: &str = "users";
const SESSIONS_COLUMN: &str = "checkout_sessions";
const CURRENCIES_COLUMN: &str = "currencies";
const METADATA_COLUMN: &str = "metadata";

const DATA_COLUMNS: [&str; 5] =
	[ACCOUNTS_COLUMN, TRANSACTIONS_COLUMN, USERS_COLUMN, SESSIONS_COLUMN, CURRENCIES_COLUMN];

pub struct RocksStore {
	db: DB,
	write_lock: tokio::sync::Mutex<()>,
}

impl RocksStore {
	/// Opens the database at `path`, creating it (at the latest schema
	/// version) if missing, and refusing databases written by a newer
	/// build.
	pub fn open(path: &Path) -> Result<Self, StoreError> {
		let is_existing_db = path.exists();

		let cfs = DATA_COLUMNS
			.iter()
			.chain(std::iter::once(&METADATA_COLUMN))
			.map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));

		let mut opts = Options::default();
		opts.create_missing_column_families(true);
		opts.create_if_missing(true);

		let db = DB::open_cf_descriptors(&opts, path, cfs)
			.map_err(anyhow::Error::msg)
			.with_context(|| format!("Failed to open database at: {}", path.display()))
			.map_err(StoreError::Backend)?;

		if !is_existing_db {
			let mut batch = WriteBatch::default();
			put_schema_version_to_batch(&db, &mut batch, LATEST_SCHEMA_VERSION);
			db.write(batch)
				.map_err(|e| StoreError::Backend(anyhow!("Failed to initialise new db: {e}")))?;
		}

		migrate_to_version(&db, LATEST_SCHEMA_VERSION)?;

		Ok(Self { db, write_lock: tokio::sync::Mutex::new(()) })
	}
}

#[async_trait]
impl LedgerStore for RocksStore {
	async fn in_transaction<'a>(&self, f: TxClosure<'a>) -> Result<(), TxError> {
		let _guard = self.write_lock.lock().await;
		let mut tx = RocksTx { db: &self.db, batch: WriteBatch::default(), overlay: HashMap::new() };
		f(&mut tx)?;
		self.db
			.write(tx.batch)
			.map_err(|e| StoreError::Backend(anyhow!("Failed to commit batch: {e}")))?;
		Ok(())
	}
}

#[async_trait]
impl CurrencyBackend for RocksStore {
	async fn load(&self, code: CurrencyCode) -> anyhow::Result<Option<Currency>> {
		self.db
			.get_cf(column_handle(&self.db, CURRENCIES_COLUMN), code.as_str().as_bytes())?
			.map(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
			.transpose()
	}

	async fn save(&self, currency: &Currency) -> anyhow::Result<()> {
		self.db.put_cf(
			column_handle(&self.db, CURRENCIES_COLUMN),
			currency.code.as_str().as_bytes(),
			serde_json::to_vec(currency)?,
		)?;
		Ok(())
	}
}

struct RocksTx<'a> {
	db: &'a DB,
	batch: WriteBatch,
	/// Uncommitted writes, for read-your-writes within the unit of work.
	/// `None` marks a deletion.
	overlay: HashMap<(&'static str, Vec<u8>), Option<Vec<u8>>>,
}

impl RocksTx<'_> {
	fn read_typed<T: DeserializeOwned>(
		&self,
		column: &'static str,
		key: &[u8],
	) -> Result<Option<T>, StoreError> {
		let bytes = match self.overlay.get(&(column, key.to_vec())) {
			Some(overlaid) => overlaid.clone(),
			None => self
				.db
				.get_cf(column_handle(self.db, column), key)
				.map_err(|e| StoreError::Backend(anyhow!("Failed to read {column}: {e}")))?,
		};
		bytes.map(|bytes| serde_json::from_slice(&bytes).map_err(Into::into)).transpose()
	}

	fn write_typed<T: Serialize>(
		&mut self,
		column: &'static str,
		key: &[u8],
		value: &T,
	) -> Result<(), StoreError> {
		let bytes = serde_json::to_vec(value)?;
		self.batch.put_cf(column_handle(self.db, column), key, &bytes);
		self.overlay.insert((column, key.to_vec()), Some(bytes));
		Ok(())
	}

	/// Full scan of a column merged with the overlay, in key order.
	fn scan_typed<T: DeserializeOwned>(&self, column: &'static str) -> Result<Vec<T>, StoreError> {
		let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
		for item in self.db.iterator_cf(column_handle(self.db, column), IteratorMode::Start) {
			let (key, value) =
				item.map_err(|e| StoreError::Backend(anyhow!("Failed to scan {column}: {e}")))?;
			merged.insert(key.to_vec(), value.to_vec());
		}
		for ((overlay_column, key), value) in &self.overlay {
			if *overlay_column == column {
				match value {
					Some(value) => merged.insert(key.clone(), value.clone()),
					None => merged.remove(key),
				};
			}
		}
		merged
			.into_values()
			.map(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
			.collect()
	}

	fn create_unique<T: Serialize>(
		&mut self,
		column: &'static str,
		key: &[u8],
		value: &T,
		what: &str,
	) -> Result<(), StoreError> {
		if self.read_typed::<serde_json::Value>(column, key)?.is_some() {
			return Err(StoreError::Constraint(format!("{what} already exists")));
		}
		self.write_typed(column, key, value)
	}

	fn update_existing<T: Serialize>(
		&mut self,
		column: &'static str,
		key: &[u8],
		value: &T,
		what: &str,
	) -> Result<(), StoreError> {
		if self.read_typed::<serde_json::Value>(column, key)?.is_none() {
			return Err(StoreError::Constraint(format!("{what} does not exist")));
		}
		self.write_typed(column, key, value)
	}
}

impl LedgerTx for RocksTx<'_> {
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

impl AccountRepository for RocksTx<'_> {
	fn create(&mut self, account: &Account) -> Result<(), StoreError> {
		self.create_unique(
			ACCOUNTS_COLUMN,
			account.id.as_uuid().as_bytes(),
			account,
			&format!("account {}", account.id),
		)
	}

	fn get(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
		self.read_typed(ACCOUNTS_COLUMN, id.as_uuid().as_bytes())
	}

	fn update(&mut self, account: &Account) -> Result<(), StoreError> {
		let key = account.id.as_uuid();
		let stored: Account = self
			.read_typed(ACCOUNTS_COLUMN, key.as_bytes())?
			.ok_or_else(|| StoreError::Constraint(format!("account {} does not exist", account.id)))?;
		if stored.version != account.version {
			return Err(StoreError::Conflict);
		}
		let mut next = account.clone();
		next.version += 1;
		self.write_typed(ACCOUNTS_COLUMN, key.as_bytes(), &next)
	}

	fn list_by_user(&mut self, user_id: UserId) -> Result<Vec<Account>, StoreError> {
		let mut accounts: Vec<Account> = self.scan_typed(ACCOUNTS_COLUMN)?;
		accounts.retain(|a| a.user_id == user_id);
		accounts.sort_by_key(|a| a.created_at);
		Ok(accounts)
	}
}

impl TransactionRepository for RocksTx<'_> {
	fn create(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
		self.create_unique(
			TRANSACTIONS_COLUMN,
			transaction.id.as_uuid().as_bytes(),
			transaction,
			&format!("transaction {}", transaction.id),
		)
	}

	fn get(&mut self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
		self.read_typed(TRANSACTIONS_COLUMN, id.as_uuid().as_bytes())
	}

	fn update(&mut self, transaction: &Transaction) -> Result<(), StoreError> {
		self.update_existing(
			TRANSACTIONS_COLUMN,
			transaction.id.as_uuid().as_bytes(),
			transaction,
			&format!("transaction {}", transaction.id),
		)
	}

	fn get_by_payment_id(&mut self, payment_id: &str) -> Result<Option<Transaction>, StoreError> {
		let transactions: Vec<Transaction> = self.scan_typed(TRANSACTIONS_COLUMN)?;
		Ok(transactions.into_iter().find(|t| t.payment_id.as_deref() == Some(payment_id)))
	}

	fn list_by_account(&mut self, account_id: AccountId) -> Result<Vec<Transaction>, StoreError> {
		let mut transactions: Vec<Transaction> = self.scan_typed(TRANSACTIONS_COLUMN)?;
		transactions.retain(|t| t.account_id == account_id);
		transactions.sort_by_key(|t| t.created_at);
		Ok(transactions)
	}
}

impl UserRepository for RocksTx<'_> {
	fn create(&mut self, user: &User) -> Result<(), StoreError> {
		self.create_unique(
			USERS_COLUMN,
			user.id.as_uuid().as_bytes(),
			user,
			&format!("user {}", user.id),
		)
	}

	fn get(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
		self.read_typed(USERS_COLUMN, id.as_uuid().as_bytes())
	}
}

impl CheckoutSessionRepository for RocksTx<'_> {
	fn create(&mut self, session: &CheckoutSession) -> Result<(), StoreError> {
		self.create_unique(
			SESSIONS_COLUMN,
			session.id.as_bytes(),
			session,
			&format!("session {}", session.id),
		)
	}

	fn get(&mut self, id: &str) -> Result<Option<CheckoutSession>, StoreError> {
		self.read_typed(SESSIONS_COLUMN, id.as_bytes())
	}

	fn get_by_transaction_id(
		&mut self,
		transaction_id: TransactionId,
	) -> Result<Option<CheckoutSession>, StoreError> {
		let sessions: Vec<CheckoutSession> = self.scan_typed(SESSIONS_COLUMN)?;
		Ok(sessions.into_iter().find(|s| s.transaction_id == transaction_id))
	}

	fn update(&mut self, session: &CheckoutSession) -> Result<(), StoreError> {
		self.update_existing(
			SESSIONS_COLUMN,
			session.id.as_bytes(),
			session,
			&format!("session {}", session.id),
		)
	}
}

fn column_handle<'a>(db: &'a DB, column_name: &str) -> &'a ColumnFamily {
	db.cf_handle(column_name)
		.unwrap_or_else(|| panic!("Should get column family handle for {column_name}"))
}

fn put_schema_version_to_batch(db: &DB, batch: &mut WriteBatch, version: u32) {
	batch.put_cf(column_handle(db, METADATA_COLUMN), DB_SCHEMA_VERSION_KEY, version.to_be_bytes());
}

fn read_schema_version(db: &DB) -> Result<u32, StoreError> {
	db.get_cf(column_handle(db, METADATA_COLUMN), DB_SCHEMA_VERSION_KEY)
		.map_err(|e| StoreError::Backend(anyhow!("Failed to read metadata column: {e}")))?
		.map(|version| {
			let version: [u8; 4] = version.try_into().expect("Version should be a u32");
			u32::from_be_bytes(version)
		})
		.ok_or_else(|| StoreError::Backend(anyhow!("Could not find db schema version")))
}

/// Reads the schema version and migrates the db if it is behind.
fn migrate_to_version(db: &DB, target_version: u32) -> Result<(), StoreError> {
	let current_version = read_schema_version(db)?;

	match current_version.cmp(&target_version) {
		std::cmp::Ordering::Equal => Ok(()),
		std::cmp::Ordering::Greater => Err(StoreError::Backend(anyhow!(
			"Database schema version {current_version} is ahead of the supported version \
			 {target_version}. Is the ledger engine up to date?"
		))),
		std::cmp::Ordering::Less => {
			info!("Database requires migration from version {current_version}");
			// No released schema predates version 1; add migration arms here
			// alongside future version bumps.
			Err(StoreError::Backend(anyhow!(
				"No migration path from schema version {current_version}"
			)))
		},
	}
}
