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

use super::{dispatch_to_handlers, EventBus, EventHandler, HandlerId, Registrations};
use crate::{errors::BusError, events::LedgerEvent};
use async_trait::async_trait;
use std::{
	collections::VecDeque,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
};
use tokio::sync::RwLock;

/// In-memory, single-process bus with no durability.
///
/// Whichever task first calls [EventBus::emit] on an idle bus becomes the
/// dispatcher and drains the FIFO queue, so re-emits from inside a handler
/// are dispatched breadth-first after the handlers of the current event.
/// Emits that arrive while a dispatcher is draining simply enqueue and
/// return, which keeps a root emit deterministic on a single executor.
#[derive(Default)]
pub struct LocalBus {
	registrations: RwLock<Registrations>,
	queue: Mutex<VecDeque<LedgerEvent>>,
	dispatching: AtomicBool,
}

impl LocalBus {
	pub fn new() -> Self {
		Self::default()
	}

	fn try_become_dispatcher(&self) -> bool {
		self.dispatching
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
			.is_ok()
	}

	async fn drain_queue(&self) {
		loop {
			let Some(event) = self.queue.lock().unwrap().pop_front() else {
				self.dispatching.store(false, Ordering::Release);
				// An emit may have enqueued between the failed pop and the
				// flag reset; reclaim the dispatcher role if so.
				if self.queue.lock().unwrap().is_empty() || !self.try_become_dispatcher() {
					return;
				}
				continue;
			};

			let handlers =
				self.registrations.read().await.handlers_for(event.event_type());
			tracing::trace!(
				event = event.event_type(),
				handlers = handlers.len(),
				correlation_id = %event.flow().correlation_id,
				"Dispatching"
			);
			dispatch_to_handlers(&handlers, &event).await;
		}
	}
}

#[async_trait]
impl EventBus for LocalBus {
	async fn subscribe(
		&self,
		event_type: &'static str,
		handler: Arc<dyn EventHandler>,
	) -> HandlerId {
		self.registrations.write().await.add(event_type, handler)
	}

	async fn unsubscribe(&self, event_type: &str, handler_id: HandlerId) -> bool {
		self.registrations.write().await.remove(event_type, handler_id)
	}

	async fn emit(&self, event: LedgerEvent) -> Result<(), BusError> {
		self.queue.lock().unwrap().push_back(event);
		if self.try_become_dispatcher() {
			self.drain_queue().await;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events::{
		event_type, DepositCompleted, DepositRequested, DepositValidated, FlowEvent, FlowType,
	};
	use crate::transaction::MoneySource;
	use ledger_primitives::{AccountId, CurrencyCode, Money, TransactionId, UserId};

	fn requested() -> LedgerEvent {
		DepositRequested {
			flow: FlowEvent::new(
				UserId::new_random(),
				AccountId::new_random(),
				FlowType::Deposit,
				TransactionId::new_random(),
			),
			amount: "1.00".to_string(),
			currency: CurrencyCode::new("USD").unwrap(),
			source: MoneySource::Internal,
		}
		.into()
	}

	/// Appends a label to the shared log on every invocation.
	struct Recorder {
		label: &'static str,
		log: Arc<Mutex<Vec<&'static str>>>,
	}

	#[async_trait]
	impl EventHandler for Recorder {
		fn name(&self) -> &'static str {
			self.label
		}

		async fn handle(&self, _event: &LedgerEvent) -> anyhow::Result<()> {
			self.log.lock().unwrap().push(self.label);
			Ok(())
		}
	}

	/// Re-emits a fixed follow-up event, then records itself.
	struct ReEmitter {
		bus: Arc<LocalBus>,
		follow_up: LedgerEvent,
		log: Arc<Mutex<Vec<&'static str>>>,
	}

	#[async_trait]
	impl EventHandler for ReEmitter {
		fn name(&self) -> &'static str {
			"re-emitter"
		}

		async fn handle(&self, _event: &LedgerEvent) -> anyhow::Result<()> {
			self.bus.emit(self.follow_up.clone()).await?;
			self.log.lock().unwrap().push("re-emitter");
			Ok(())
		}
	}

	struct Failing;

	#[async_trait]
	impl EventHandler for Failing {
		fn name(&self) -> &'static str {
			"failing"
		}

		async fn handle(&self, _event: &LedgerEvent) -> anyhow::Result<()> {
			anyhow::bail!("deliberate")
		}
	}

	#[tokio::test]
	async fn handlers_run_in_registration_order() {
		let bus = Arc::new(LocalBus::new());
		let log = Arc::new(Mutex::new(Vec::new()));

		for label in ["first", "second", "third"] {
			bus.subscribe(
				event_type::DepositRequested,
				Arc::new(Recorder { label, log: log.clone() }),
			)
			.await;
		}

		bus.emit(requested()).await.unwrap();
		assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
	}

	#[tokio::test]
	async fn re_emits_are_dispatched_breadth_first() {
		let bus = Arc::new(LocalBus::new());
		let log = Arc::new(Mutex::new(Vec::new()));

		let flow = FlowEvent::new(
			UserId::new_random(),
			AccountId::new_random(),
			FlowType::Deposit,
			TransactionId::new_random(),
		);
		let usd = CurrencyCode::new("USD").unwrap();
		let follow_up: LedgerEvent = DepositValidated {
			flow,
			amount: Money::new(100, usd),
			source: MoneySource::Internal,
			conversion: None,
		}
		.into();

		bus.subscribe(
			event_type::DepositRequested,
			Arc::new(ReEmitter { bus: bus.clone(), follow_up, log: log.clone() }),
		)
		.await;
		// A sibling registered after the re-emitter must still run before
		// the re-emitted event's handlers.
		bus.subscribe(
			event_type::DepositRequested,
			Arc::new(Recorder { label: "sibling", log: log.clone() }),
		)
		.await;
		bus.subscribe(
			event_type::DepositValidated,
			Arc::new(Recorder { label: "validated", log: log.clone() }),
		)
		.await;

		bus.emit(requested()).await.unwrap();
		assert_eq!(*log.lock().unwrap(), vec!["re-emitter", "sibling", "validated"]);
	}

	#[tokio::test]
	async fn handler_error_does_not_abort_siblings() {
		let bus = Arc::new(LocalBus::new());
		let log = Arc::new(Mutex::new(Vec::new()));

		bus.subscribe(event_type::DepositRequested, Arc::new(Failing)).await;
		bus.subscribe(
			event_type::DepositRequested,
			Arc::new(Recorder { label: "survivor", log: log.clone() }),
		)
		.await;

		bus.emit(requested()).await.unwrap();
		assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
	}

	#[tokio::test]
	async fn unsubscribed_handlers_stop_receiving() {
		let bus = Arc::new(LocalBus::new());
		let log = Arc::new(Mutex::new(Vec::new()));

		let id = bus
			.subscribe(
				event_type::DepositRequested,
				Arc::new(Recorder { label: "gone", log: log.clone() }),
			)
			.await;
		assert!(bus.unsubscribe(event_type::DepositRequested, id).await);
		assert!(!bus.unsubscribe(event_type::DepositRequested, id).await);

		bus.emit(requested()).await.unwrap();
		assert!(log.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn events_without_handlers_are_dropped() {
		let bus = LocalBus::new();
		let flow = FlowEvent::new(
			UserId::new_random(),
			AccountId::new_random(),
			FlowType::Deposit,
			TransactionId::new_random(),
		);
		let usd = CurrencyCode::new("USD").unwrap();
		bus.emit(
			DepositCompleted {
				flow,
				transaction_id: flow.correlation_id,
				balance: Money::new(0, usd),
			}
			.into(),
		)
		.await
		.unwrap();
	}
}
