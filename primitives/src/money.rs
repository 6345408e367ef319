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

use crate::currency::CurrencyCode;
use bigdecimal::{num_bigint::BigInt, BigDecimal, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
	#[error("currency mismatch: {lhs} vs {rhs}")]
	CurrencyMismatch { lhs: CurrencyCode, rhs: CurrencyCode },

	#[error("amount overflows the minor unit representation")]
	AmountOverflow,

	#[error("amount {0:?} is not representable in {1} minor units")]
	PrecisionLoss(String, CurrencyCode),

	#[error("amount {0:?} is not a valid decimal")]
	InvalidDecimal(String),
}

/// An exact amount of a single currency, held as an integer count of that
/// currency's minor unit. How many minor units make up a main unit is a
/// property of the [crate::Currency], not of the amount.
///
/// All arithmetic is checked: mixing currencies and overflowing i128 are
/// errors, precision is never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
	minor_units: i128,
	currency: CurrencyCode,
}

impl Money {
	pub const fn new(minor_units: i128, currency: CurrencyCode) -> Self {
		Self { minor_units, currency }
	}

	pub const fn zero(currency: CurrencyCode) -> Self {
		Self { minor_units: 0, currency }
	}

	/// Builds an amount from a decimal string denominated in the currency's
	/// main unit, scaling by `10^decimals`. Rejects anything that does not
	/// land exactly on a minor unit: `"10.005"` with two decimals is an
	/// error, not a rounding.
	pub fn from_decimal_str(
		input: &str,
		currency: CurrencyCode,
		decimals: u8,
	) -> Result<Self, MoneyError> {
		let value = BigDecimal::from_str(input.trim())
			.map_err(|_| MoneyError::InvalidDecimal(input.to_string()))?;
		let scaled = &value * BigDecimal::new(BigInt::from(10).pow(u32::from(decimals)), 0);
		if !scaled.is_integer() {
			return Err(MoneyError::PrecisionLoss(input.to_string(), currency));
		}
		let minor_units = scaled.to_i128().ok_or(MoneyError::AmountOverflow)?;
		Ok(Self { minor_units, currency })
	}

	pub const fn minor_units(&self) -> i128 {
		self.minor_units
	}

	pub const fn currency(&self) -> CurrencyCode {
		self.currency
	}

	pub const fn is_positive(&self) -> bool {
		self.minor_units > 0
	}

	pub const fn is_negative(&self) -> bool {
		self.minor_units < 0
	}

	pub const fn is_zero(&self) -> bool {
		self.minor_units == 0
	}

	fn require_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
		if self.currency == other.currency {
			Ok(())
		} else {
			Err(MoneyError::CurrencyMismatch { lhs: self.currency, rhs: other.currency })
		}
	}

	pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
		self.require_same_currency(other)?;
		let minor_units = self
			.minor_units
			.checked_add(other.minor_units)
			.ok_or(MoneyError::AmountOverflow)?;
		Ok(Money { minor_units, currency: self.currency })
	}

	pub fn subtract(&self, other: &Money) -> Result<Money, MoneyError> {
		self.require_same_currency(other)?;
		let minor_units = self
			.minor_units
			.checked_sub(other.minor_units)
			.ok_or(MoneyError::AmountOverflow)?;
		Ok(Money { minor_units, currency: self.currency })
	}

	pub fn negate(&self) -> Result<Money, MoneyError> {
		let minor_units = self.minor_units.checked_neg().ok_or(MoneyError::AmountOverflow)?;
		Ok(Money { minor_units, currency: self.currency })
	}

	pub fn greater_than(&self, other: &Money) -> Result<bool, MoneyError> {
		self.require_same_currency(other)?;
		Ok(self.minor_units > other.minor_units)
	}

	pub fn equals(&self, other: &Money) -> Result<bool, MoneyError> {
		self.require_same_currency(other)?;
		Ok(self.minor_units == other.minor_units)
	}

	/// Renders the amount back into main units, e.g. `12345` with two
	/// decimals becomes `"123.45"`.
	pub fn to_decimal_string(&self, decimals: u8) -> String {
		BigDecimal::new(BigInt::from(self.minor_units), i64::from(decimals)).to_string()
	}
}

impl fmt::Display for Money {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}", self.minor_units, self.currency)
	}
}
