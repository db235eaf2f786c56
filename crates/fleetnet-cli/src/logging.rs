// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "fleetnet=info";

/// `RUST_LOG` wins over `--log-level`, which wins over the default.
pub fn filter(log_level: Option<&str>) -> EnvFilter {
	EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(log_level.unwrap_or(DEFAULT_FILTER)))
		.unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

pub fn init(log_level: Option<&str>, json: bool) {
	let builder = tracing_subscriber::fmt()
		.with_env_filter(filter(log_level))
		.with_writer(std::io::stderr);

	if json {
		builder.json().init();
	} else {
		builder.compact().init();
	}
}
