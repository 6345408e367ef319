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

//! Liveness endpoint. Orchestration probes `GET /health` on
//! `{hostname}:{port}` and gets a 200 with an `ok` body while the engine is
//! up; other paths get a 404, unparseable requests a 400. The accept loop
//! runs until the engine's shutdown signal fires.

use crate::settings::HealthCheckSettings;
use anyhow::Context;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
};
use tracing::{error, info, warn};

const HEALTHY_RESPONSE: &str = "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";
const NOT_FOUND_RESPONSE: &str = "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n";
const BAD_REQUEST_RESPONSE: &str = "HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n";

pub struct HealthChecker {
	listener: TcpListener,
}

impl HealthChecker {
	/// Binds eagerly so a taken port fails startup instead of surfacing on
	/// the first probe (and so tests know the listener is live).
	pub async fn new(health_check_settings: &HealthCheckSettings) -> anyhow::Result<Self> {
		let bind_address =
			format!("{}:{}", health_check_settings.hostname, health_check_settings.port);

		info!("Starting health checker on {bind_address}");

		Ok(Self {
			listener: TcpListener::bind(&bind_address)
				.await
				.with_context(|| format!("Could not bind TCP listener to {bind_address}"))?,
		})
	}

	pub async fn run(
		self,
		mut shutdown: tokio::sync::watch::Receiver<bool>,
	) -> anyhow::Result<()> {
		loop {
			let mut stream = tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				accepted = self.listener.accept() => match accepted {
					Ok((stream, _address)) => stream,
					Err(error) => {
						error!("Could not open health check TCP stream: {error}");
						continue;
					},
				},
			};
			if let Err(error) = Self::respond(&mut stream).await {
				warn!("Health check connection failed: {error:#}");
			}
		}
	}

	async fn respond(stream: &mut TcpStream) -> anyhow::Result<()> {
		let mut buffer = [0; 1024];
		let read =
			stream.read(&mut buffer).await.context("Couldn't read stream into buffer")?;

		let mut headers = [httparse::EMPTY_HEADER; 16];
		let mut request = httparse::Request::new(&mut headers);
		let response = match request.parse(&buffer[..read]) {
			Ok(_) if request.path == Some("/health") => HEALTHY_RESPONSE,
			Ok(_) => {
				warn!("Requested health at invalid path: {:?}", request.path);
				NOT_FOUND_RESPONSE
			},
			Err(error) => {
				warn!("Invalid health check request, could not parse: {error}");
				BAD_REQUEST_RESPONSE
			},
		};

		stream
			.write_all(response.as_bytes())
			.await
			.context("Could not write to health check stream")?;
		stream.flush().await.context("Could not flush health check TCP stream")
	}
}
