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

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

macro_rules! uuid_id {
	($(#[doc = $doc:literal])* $name:ident) => {
		$(#[doc = $doc])*
		#[derive(
			Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
		)]
		#[serde(transparent)]
		pub struct $name(Uuid);

		impl $name {
			pub fn new_random() -> Self {
				Self(Uuid::new_v4())
			}

			pub const fn from_uuid(uuid: Uuid) -> Self {
				Self(uuid)
			}

			pub const fn as_uuid(&self) -> Uuid {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				self.0.fmt(f)
			}
		}

		impl FromStr for $name {
			type Err = uuid::Error;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Ok(Self(Uuid::parse_str(s)?))
			}
		}
	};
}

uuid_id! {
	#[doc = "Identifies a user across accounts and transactions."]
	UserId
}
uuid_id! {
	#[doc = "Identifies an account aggregate."]
	AccountId
}
uuid_id! {
	#[doc = "Identifies a transaction. Doubles as the correlation id of the"]
	#[doc = "flow that produced it."]
	TransactionId
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_are_distinct_types_with_string_roundtrip() {
		let id = TransactionId::new_random();
		let parsed: TransactionId = id.to_string().parse().unwrap();
		assert_eq!(parsed, id);
	}

	#[test]
	fn ids_serialize_transparently() {
		let id = UserId::from_uuid(Uuid::nil());
		assert_eq!(
			serde_json::to_string(&id).unwrap(),
			"\"00000000-0000-0000-0000-000000000000\""
		);
	}
}
