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

//! Event-driven multi-currency ledger engine.
//!
//! The library wires four subsystems around an in-process event bus:
//! the account domain, the flow handlers that implement deposits,
//! withdrawals and transfers as pipeline stages, the exchange-rate
//! service, and the payment-provider adapter whose webhook state machine
//! feeds terminal events back into the bus. Presentation (HTTP, auth) is
//! expected to live in front of [commands::LedgerCommands] and
//! [payment::StripeWebhook].

pub mod account;
pub mod bus;
pub mod commands;
pub mod constants;
pub mod errors;
pub mod events;
pub mod exchange_rate;
pub mod flows;
pub mod health;
pub mod logging;
pub mod payment;
pub mod queries;
pub mod registry;
pub mod retrier;
pub mod settings;
pub mod store;
pub mod transaction;
