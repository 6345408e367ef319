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

use std::time::Duration;

// ======= Exchange rates =======

/// How often the in-memory rate cache sweeps out expired entries.
pub const RATE_SCAVENGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long a provider is skipped after a failed request before it is
/// considered healthy again.
pub const PROVIDER_HEALTH_BACKOFF: Duration = Duration::from_secs(60);

/// Validity of the synthesized identity rate (from == to).
pub const IDENTITY_RATE_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

// ======= Persistence =======

/// How many times a persisting handler re-runs its unit of work after a
/// storage serialization conflict.
pub const PERSIST_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff between persistence attempts.
pub const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

// ======= Settings environment variables =======

pub const AUTH_JWT_SECRET: &str = "AUTH__JWT__SECRET";

pub const STRIPE_API_KEY: &str = "PAYMENT_PROVIDER__STRIPE__API_KEY";
pub const STRIPE_SIGNING_SECRET: &str = "PAYMENT_PROVIDER__STRIPE__SIGNING_SECRET";

pub const EXCHANGE_RATE_API_KEY: &str = "EXCHANGE_RATE_PROVIDER__EXCHANGERATE__API_KEY";

pub const REDIS_URL: &str = "REDIS__URL";
