// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use fleetnet_common::DEFAULT_ENDPOINT_PORT;
use fleetnet_engine::DEFAULT_MTU;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Tuning for one tunnel. Defaults: MTU 1420, keep-alive disabled, no limit
/// on rendezvous resolution beyond the caller's own deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
	pub mtu: u16,
	/// Persistent keep-alive in seconds; `None` disables it.
	pub keepalive: Option<u16>,
	/// Port used when the control plane hands back port 0.
	pub default_endpoint_port: u16,
	pub endpoint_resolve_timeout: Option<Duration>,
	pub dns_timeout: Duration,
	pub dial_timeout: Duration,
	/// Local UDP address for the engine; ephemeral when unset.
	pub listen_addr: Option<SocketAddr>,
}

impl Default for TunnelConfig {
	fn default() -> Self {
		Self {
			mtu: DEFAULT_MTU,
			keepalive: None,
			default_endpoint_port: DEFAULT_ENDPOINT_PORT,
			endpoint_resolve_timeout: None,
			dns_timeout: DEFAULT_DNS_TIMEOUT,
			dial_timeout: DEFAULT_DIAL_TIMEOUT,
			listen_addr: None,
		}
	}
}

impl TunnelConfig {
	/// Defaults overridden by `FLEETNET_MTU`, `FLEETNET_KEEPALIVE_SECS`,
	/// `FLEETNET_DNS_TIMEOUT_SECS` and `FLEETNET_DIAL_TIMEOUT_SECS`. Values
	/// that do not parse are ignored.
	pub fn from_env() -> Self {
		let defaults = Self::default();

		let mtu = std::env::var("FLEETNET_MTU")
			.ok()
			.and_then(|s| s.parse().ok())
			.unwrap_or(defaults.mtu);

		let keepalive = std::env::var("FLEETNET_KEEPALIVE_SECS")
			.ok()
			.and_then(|s| s.parse::<u16>().ok())
			.filter(|secs| *secs > 0);

		let dns_timeout = std::env::var("FLEETNET_DNS_TIMEOUT_SECS")
			.ok()
			.and_then(|s| s.parse().ok())
			.map(Duration::from_secs)
			.unwrap_or(defaults.dns_timeout);

		let dial_timeout = std::env::var("FLEETNET_DIAL_TIMEOUT_SECS")
			.ok()
			.and_then(|s| s.parse().ok())
			.map(Duration::from_secs)
			.unwrap_or(defaults.dial_timeout);

		Self {
			mtu,
			keepalive,
			dns_timeout,
			dial_timeout,
			..defaults
		}
	}
}
