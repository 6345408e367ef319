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

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

/// Upper bound on the number of decimals a currency may declare. Minor units
/// are stored in an i128, which comfortably holds 18 decimals of any
/// realistic main-unit amount.
pub const MAX_CURRENCY_DECIMALS: u8 = 18;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CurrencyError {
	#[error("invalid currency code: {0:?}")]
	InvalidCode(String),

	#[error("currency decimals {0} out of range 0..={MAX_CURRENCY_DECIMALS}")]
	InvalidDecimals(u8),
}

/// An ISO-4217-shaped currency code: exactly three uppercase ASCII letters.
///
/// Copyable and comparison-friendly so it can be used as a map key without
/// allocation. The registry may relax the "ISO-shaped" rule for custom
/// currencies, but the three-uppercase-letters shape is enforced here
/// unconditionally since both cache keys and provider APIs rely on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CurrencyCode([u8; 3]);

impl CurrencyCode {
	pub fn new(code: &str) -> Result<Self, CurrencyError> {
		let bytes = code.as_bytes();
		if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
			return Err(CurrencyError::InvalidCode(code.to_string()));
		}
		Ok(Self([bytes[0], bytes[1], bytes[2]]))
	}

	pub fn as_str(&self) -> &str {
		// Validated on construction.
		std::str::from_utf8(&self.0).expect("currency codes are ASCII")
	}
}

impl fmt::Display for CurrencyCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl fmt::Debug for CurrencyCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "CurrencyCode({})", self.as_str())
	}
}

impl FromStr for CurrencyCode {
	type Err = CurrencyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s)
	}
}

impl Serialize for CurrencyCode {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for CurrencyCode {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let code = String::deserialize(deserializer)?;
		CurrencyCode::new(&code).map_err(de::Error::custom)
	}
}

/// A currency as managed by the registry. `decimals` fixes the scale of the
/// minor unit (2 for USD cents, 0 for JPY, up to [MAX_CURRENCY_DECIMALS]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
	pub code: CurrencyCode,
	pub name: String,
	pub symbol: String,
	pub decimals: u8,
	#[serde(default)]
	pub country: String,
	#[serde(default)]
	pub region: String,
	pub active: bool,
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,
}

impl Currency {
	pub fn new(
		code: CurrencyCode,
		name: &str,
		symbol: &str,
		decimals: u8,
	) -> Result<Self, CurrencyError> {
		if decimals > MAX_CURRENCY_DECIMALS {
			return Err(CurrencyError::InvalidDecimals(decimals));
		}
		Ok(Self {
			code,
			name: name.to_string(),
			symbol: symbol.to_string(),
			decimals,
			country: String::new(),
			region: String::new(),
			active: true,
			metadata: BTreeMap::new(),
		})
	}
}
