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
use anyhow::Context;
use async_trait::async_trait;
use redis::{
	aio::MultiplexedConnection,
	streams::{StreamReadOptions, StreamReadReply},
	AsyncCommands,
};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use uuid::Uuid;

const PAYLOAD_FIELD: &str = "payload";
const READ_BLOCK: Duration = Duration::from_millis(1000);
const READ_COUNT: usize = 16;

/// Broker-backed bus over Redis streams.
///
/// Every event type gets its own stream; all handlers of this process are
/// attached to one consumer group per stream, so events survive restarts
/// and are delivered at least once. Handlers therefore MUST be idempotent:
/// a crash between dispatch and ack redelivers the entry. Payloads are the
/// self-describing `{"type", "payload"}` JSON of [LedgerEvent].
pub struct RedisBus {
	publish_conn: MultiplexedConnection,
	client: redis::Client,
	key_prefix: String,
	group: String,
	consumer: String,
	registrations: RwLock<Registrations>,
}

impl RedisBus {
	pub async fn connect(url: &str, key_prefix: &str, group: &str) -> Result<Self, BusError> {
		let client = redis::Client::open(url)
			.with_context(|| format!("Invalid Redis url {url}"))
			.map_err(BusError::Broker)?;
		let publish_conn = client
			.get_multiplexed_async_connection()
			.await
			.context("Could not connect to Redis")
			.map_err(BusError::Broker)?;
		Ok(Self {
			publish_conn,
			client,
			key_prefix: key_prefix.to_string(),
			group: group.to_string(),
			consumer: format!("{group}-{}", Uuid::new_v4()),
			registrations: RwLock::new(Registrations::default()),
		})
	}

	fn stream_key(&self, event_type: &str) -> String {
		format!("{}:events:{event_type}", self.key_prefix)
	}

	async fn ensure_group(
		&self,
		conn: &mut MultiplexedConnection,
		stream: &str,
	) -> Result<(), BusError> {
		let created: Result<(), redis::RedisError> =
			conn.xgroup_create_mkstream(stream, &self.group, "$").await;
		match created {
			Ok(()) => Ok(()),
			// The group surviving from an earlier run is the normal case.
			Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
			Err(e) => Err(BusError::Broker(
				anyhow::Error::new(e).context(format!("Could not create group on {stream}")),
			)),
		}
	}

	fn decode_entry(id: &redis::streams::StreamId) -> Option<LedgerEvent> {
		let payload: String = id.get(PAYLOAD_FIELD)?;
		match serde_json::from_str(&payload) {
			Ok(event) => Some(event),
			Err(error) => {
				tracing::error!("Dropping undecodable stream entry: {error}");
				None
			},
		}
	}

	/// Consumes the subscribed streams until `shutdown` fires. Entries are
	/// acked once all handlers have been dispatched; handler errors are
	/// logged and do not hold the entry back.
	pub async fn run(
		self: Arc<Self>,
		mut shutdown: tokio::sync::watch::Receiver<bool>,
	) -> Result<(), BusError> {
		// Blocking reads get their own connection so they cannot starve
		// publishes on the multiplexed one.
		let mut conn = self
			.client
			.get_multiplexed_async_connection()
			.await
			.context("Could not open Redis consumer connection")
			.map_err(BusError::Broker)?;

		let mut groups_ensured: HashSet<String> = HashSet::new();
		tracing::info!(group = %self.group, consumer = %self.consumer, "Redis bus consuming");

		loop {
			let event_types = self.registrations.read().await.event_types();
			let streams: Vec<String> =
				event_types.iter().map(|t| self.stream_key(t)).collect();
			if streams.is_empty() {
				tokio::select! {
					_ = shutdown.changed() => return Ok(()),
					_ = tokio::time::sleep(READ_BLOCK) => continue,
				}
			}
			for stream in &streams {
				if !groups_ensured.contains(stream) {
					self.ensure_group(&mut conn, stream).await?;
					groups_ensured.insert(stream.clone());
				}
			}

			let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
			let options = StreamReadOptions::default()
				.group(&self.group, &self.consumer)
				.block(READ_BLOCK.as_millis() as usize)
				.count(READ_COUNT);

			let reply: StreamReadReply = tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				reply = conn.xread_options(&streams, &ids, &options) => reply
					.context("Reading from Redis streams")
					.map_err(BusError::Broker)?,
			};

			for stream_key in reply.keys {
				for entry in stream_key.ids {
					if let Some(event) = Self::decode_entry(&entry) {
						let handlers = self
							.registrations
							.read()
							.await
							.handlers_for(event.event_type());
						dispatch_to_handlers(&handlers, &event).await;
					}
					let _: Result<i64, _> = conn
						.xack(&stream_key.key, &self.group, &[&entry.id])
						.await
						.map_err(|e| {
							tracing::warn!("Failed to ack {} on {}: {e}", entry.id, stream_key.key);
							e
						});
				}
			}
		}
	}
}

#[async_trait]
impl EventBus for RedisBus {
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
		let payload = serde_json::to_string(&event)?;
		let mut conn = self.publish_conn.clone();
		let _: String = conn
			.xadd(self.stream_key(event.event_type()), "*", &[(PAYLOAD_FIELD, payload)])
			.await
			.context("Publishing event to Redis")
			.map_err(BusError::Broker)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events::{event_type, DepositRequested, FlowEvent, FlowType};
	use crate::transaction::MoneySource;
	use ledger_primitives::{AccountId, CurrencyCode, TransactionId, UserId};
	use std::sync::Mutex;

	struct Recorder {
		seen: Arc<Mutex<Vec<LedgerEvent>>>,
	}

	#[async_trait]
	impl EventHandler for Recorder {
		fn name(&self) -> &'static str {
			"recorder"
		}

		async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
			self.seen.lock().unwrap().push(event.clone());
			Ok(())
		}
	}

	#[ignore = "Depends on Redis being online"]
	#[tokio::test]
	async fn emit_and_consume_roundtrip() {
		let bus = Arc::new(
			RedisBus::connect("redis://127.0.0.1:6379", "ledger-test", "ledger-test")
				.await
				.unwrap(),
		);

		let seen = Arc::new(Mutex::new(Vec::new()));
		bus.subscribe(event_type::DepositRequested, Arc::new(Recorder { seen: seen.clone() }))
			.await;

		let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
		let consumer = tokio::spawn(bus.clone().run(shutdown_rx));

		// Give the consumer a chance to create the group before publishing.
		tokio::time::sleep(Duration::from_millis(1500)).await;

		let event: LedgerEvent = DepositRequested {
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
		.into();
		bus.emit(event.clone()).await.unwrap();

		tokio::time::sleep(Duration::from_millis(1500)).await;
		shutdown_tx.send(true).unwrap();
		consumer.await.unwrap().unwrap();

		assert_eq!(*seen.lock().unwrap(), vec![event]);
	}
}
