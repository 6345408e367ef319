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

//! The in-process event bus interface and its two realizations.
//!
//! Handlers for one event run in registration order. A handler error is
//! logged and aborts neither its siblings nor queued emits; the bus only
//! surfaces its own dispatch bookkeeping errors.

pub mod broker;
pub mod local;

use crate::{errors::BusError, events::LedgerEvent};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

pub use self::broker::RedisBus;
pub use self::local::LocalBus;

pub type HandlerId = u64;

#[async_trait]
pub trait EventHandler: Send + Sync {
	/// Name that shows up in dispatch logs.
	fn name(&self) -> &'static str;

	async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
	/// Registers a handler for one event type name. Multiple handlers per
	/// type are invoked in registration order.
	async fn subscribe(&self, event_type: &'static str, handler: Arc<dyn EventHandler>)
		-> HandlerId;

	/// Returns whether a registration was removed.
	async fn unsubscribe(&self, event_type: &str, handler_id: HandlerId) -> bool;

	/// Dispatches the event to all handlers registered for its type.
	/// Handlers may re-emit; re-emitted events join a FIFO queue behind the
	/// handlers of the event currently being dispatched.
	async fn emit(&self, event: LedgerEvent) -> Result<(), BusError>;
}

/// Registration table shared by both bus realizations.
#[derive(Default)]
pub(crate) struct Registrations {
	next_id: HandlerId,
	by_type: HashMap<String, Vec<(HandlerId, Arc<dyn EventHandler>)>>,
}

impl Registrations {
	pub fn add(&mut self, event_type: &str, handler: Arc<dyn EventHandler>) -> HandlerId {
		self.next_id += 1;
		self.by_type.entry(event_type.to_string()).or_default().push((self.next_id, handler));
		self.next_id
	}

	pub fn remove(&mut self, event_type: &str, handler_id: HandlerId) -> bool {
		match self.by_type.get_mut(event_type) {
			Some(handlers) => {
				let before = handlers.len();
				handlers.retain(|(id, _)| *id != handler_id);
				handlers.len() != before
			},
			None => false,
		}
	}

	/// Snapshot of the handlers for one event type, in registration order.
	pub fn handlers_for(&self, event_type: &str) -> Vec<(HandlerId, Arc<dyn EventHandler>)> {
		self.by_type.get(event_type).cloned().unwrap_or_default()
	}

	pub fn event_types(&self) -> Vec<String> {
		self.by_type.keys().cloned().collect()
	}
}

/// Runs every handler in order, logging failures without aborting.
pub(crate) async fn dispatch_to_handlers(
	handlers: &[(HandlerId, Arc<dyn EventHandler>)],
	event: &LedgerEvent,
) {
	for (_, handler) in handlers {
		if let Err(error) = handler.handle(event).await {
			tracing::error!(
				handler = handler.name(),
				event = event.event_type(),
				correlation_id = %event.flow().correlation_id,
				"Handler failed: {error:#}"
			);
		}
	}
}
