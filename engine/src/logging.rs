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

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. The filter comes from `RUST_LOG`
/// with an `info` fallback; `json` switches the output to one JSON object
/// per line for log shippers.
pub fn init(json: bool) {
	let builder = tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.with_target(false);

	if json {
		builder.json().init();
	} else {
		builder.init();
	}
}

pub mod test_utils {
	use tracing_subscriber::EnvFilter;

	/// Best-effort subscriber for tests; repeated calls are no-ops.
	pub fn init_test_logger() {
		let _ = tracing_subscriber::FmtSubscriber::builder()
			.with_env_filter(
				EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
			)
			.with_test_writer()
			.try_init();
	}
}
