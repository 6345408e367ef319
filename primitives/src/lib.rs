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

//! Leaf value objects shared by every layer of the ledger: currency codes,
//! exact monetary amounts and entity ids. Nothing in this crate performs IO.

pub mod currency;
pub mod ids;
pub mod money;

pub use currency::{Currency, CurrencyCode, CurrencyError, MAX_CURRENCY_DECIMALS};
pub use ids::{AccountId, TransactionId, UserId};
pub use money::{Money, MoneyError};
