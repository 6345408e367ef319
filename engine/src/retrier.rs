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

//! Retry backoff policy.
//!
//! Delays double per attempt up to a hard cap, with jitter in the upper
//! half of the window so synchronized retries spread out. Used for storage
//! serialization conflicts and provider transport errors; flows never
//! retry anything past the payment-provider stage.

use rand::Rng;
use std::{cmp::min, time::Duration};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub initial_delay: Duration,
	pub max_attempts: u32,
}

impl RetryPolicy {
	pub fn new(initial_delay: Duration, max_attempts: u32) -> Self {
		assert!(!initial_delay.is_zero(), "retry delays require a non-zero base");
		Self { initial_delay, max_attempts }
	}

	/// Upper bound of the delay window for `attempt` (0-based).
	pub fn max_sleep_duration(&self, attempt: u32) -> Duration {
		min(MAX_RETRY_DELAY, self.initial_delay.saturating_mul(2u32.saturating_pow(attempt)))
	}

	/// Jittered delay in `[max/2, max)` for `attempt`.
	pub fn sleep_duration(&self, attempt: u32) -> Duration {
		let half_max = self.max_sleep_duration(attempt) / 2;
		half_max + rand::thread_rng().gen_range(Duration::default()..half_max)
	}

	/// Whether another attempt is allowed after `attempt` attempts failed.
	pub fn allows_retry(&self, attempt: u32) -> bool {
		attempt + 1 < self.max_attempts
	}
}
