// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use thiserror::Error;

/// Port the fleet gateways listen on when the control plane hands back a
/// bare host.
pub const DEFAULT_ENDPOINT_PORT: u16 = 51820;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
	#[error("empty rendezvous endpoint")]
	Empty,

	#[error("invalid rendezvous port in {0:?}")]
	InvalidPort(String),
}

/// Public `host:port` the engine sends its UDP datagrams to. `host` is either
/// a literal address or a DNS name resolved at bring-up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RendezvousEndpoint {
	host: String,
	port: u16,
}

impl RendezvousEndpoint {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
		}
	}

	/// Accepts `host`, `host:port`, `[v6]:port`, `[v6]` and bare IPv6
	/// literals. A missing port becomes `default_port`.
	pub fn parse(s: &str, default_port: u16) -> Result<Self, EndpointError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(EndpointError::Empty);
		}

		if let Some(rest) = s.strip_prefix('[') {
			let (host, tail) = rest
				.split_once(']')
				.ok_or_else(|| EndpointError::InvalidPort(s.to_string()))?;
			let port = match tail {
				"" => default_port,
				_ => tail
					.strip_prefix(':')
					.and_then(|p| p.parse().ok())
					.ok_or_else(|| EndpointError::InvalidPort(s.to_string()))?,
			};
			return Ok(Self::new(host, port));
		}

		if s.parse::<Ipv6Addr>().is_ok() {
			return Ok(Self::new(s, default_port));
		}

		match s.rsplit_once(':') {
			Some((host, port)) if !host.is_empty() => {
				let port = port
					.parse()
					.map_err(|_| EndpointError::InvalidPort(s.to_string()))?;
				Ok(Self::new(host, port))
			}
			Some(_) => Err(EndpointError::Empty),
			None => Ok(Self::new(s, default_port)),
		}
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	/// The host as an address when it is a literal rather than a name.
	pub fn literal_ip(&self) -> Option<IpAddr> {
		self.host.parse().ok()
	}
}

impl fmt::Display for RendezvousEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.literal_ip() {
			Some(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
			_ => write!(f, "{}:{}", self.host, self.port),
		}
	}
}

/// The control plane's view of the remote end, as returned by a successful
/// registration. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
	pub public_key: WgPublicKey,
	pub assigned_address: Ipv6Addr,
	pub endpoint: RendezvousEndpoint,
}

/// Identifies the server-side peer record. Releasing it is the teardown's
/// job, so it is neither `Clone` nor `Copy`.
#[must_use = "a registration must be released through teardown"]
#[derive(Debug, PartialEq, Eq)]
pub struct RegistrationHandle {
	org_id: String,
	peer_name: String,
	region: String,
}

impl RegistrationHandle {
	pub fn new(
		org_id: impl Into<String>,
		peer_name: impl Into<String>,
		region: impl Into<String>,
	) -> Self {
		Self {
			org_id: org_id.into(),
			peer_name: peer_name.into(),
			region: region.into(),
		}
	}

	pub fn org_id(&self) -> &str {
		&self.org_id
	}

	pub fn peer_name(&self) -> &str {
		&self.peer_name
	}

	pub fn region(&self) -> &str {
		&self.region
	}
}

impl fmt::Display for RegistrationHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}@{}", self.org_id, self.peer_name, self.region)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_bare_host_uses_default_port() {
		let ep = RendezvousEndpoint::parse("ewr1.gateway.6pn.dev", DEFAULT_ENDPOINT_PORT).unwrap();
		assert_eq!(ep.host(), "ewr1.gateway.6pn.dev");
		assert_eq!(ep.port(), 51820);
		assert!(ep.literal_ip().is_none());
	}

	#[test]
	fn parse_host_and_port() {
		let ep = RendezvousEndpoint::parse("203.0.113.7:4000", DEFAULT_ENDPOINT_PORT).unwrap();
		assert_eq!(ep.host(), "203.0.113.7");
		assert_eq!(ep.port(), 4000);
		assert!(ep.literal_ip().is_some());
		assert_eq!(ep.to_string(), "203.0.113.7:4000");
	}

	#[test]
	fn parse_bracketed_ipv6() {
		let ep = RendezvousEndpoint::parse("[2604:1380::1]:51821", DEFAULT_ENDPOINT_PORT).unwrap();
		assert_eq!(ep.host(), "2604:1380::1");
		assert_eq!(ep.port(), 51821);
		assert_eq!(ep.to_string(), "[2604:1380::1]:51821");

		let ep = RendezvousEndpoint::parse("[2604:1380::1]", DEFAULT_ENDPOINT_PORT).unwrap();
		assert_eq!(ep.port(), DEFAULT_ENDPOINT_PORT);
	}

	#[test]
	fn parse_bare_ipv6_literal() {
		let ep = RendezvousEndpoint::parse("2604:1380::1", DEFAULT_ENDPOINT_PORT).unwrap();
		assert_eq!(ep.host(), "2604:1380::1");
		assert_eq!(ep.port(), DEFAULT_ENDPOINT_PORT);
	}

	#[test]
	fn parse_rejects_bad_input() {
		assert_eq!(
			RendezvousEndpoint::parse("  ", DEFAULT_ENDPOINT_PORT),
			Err(EndpointError::Empty)
		);
		assert!(matches!(
			RendezvousEndpoint::parse("gw.example:notaport", DEFAULT_ENDPOINT_PORT),
			Err(EndpointError::InvalidPort(_))
		));
		assert!(matches!(
			RendezvousEndpoint::parse("[::1]x", DEFAULT_ENDPOINT_PORT),
			Err(EndpointError::InvalidPort(_))
		));
		assert_eq!(
			RendezvousEndpoint::parse(":51820", DEFAULT_ENDPOINT_PORT),
			Err(EndpointError::Empty)
		);
	}

	#[test]
	fn registration_handle_accessors() {
		let handle = RegistrationHandle::new("personal", "fleetnet-tunnel-1", "ewr");
		assert_eq!(handle.org_id(), "personal");
		assert_eq!(handle.peer_name(), "fleetnet-tunnel-1");
		assert_eq!(handle.region(), "ewr");
		assert_eq!(handle.to_string(), "personal/fleetnet-tunnel-1@ewr");
	}
}
