// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::Ipv6Net;
use std::fmt;
use std::net::Ipv6Addr;
use thiserror::Error;

/// Prefix of the client's own interface network.
pub const LOCAL_PREFIX_LEN: u8 = 120;
/// Prefix of the private network reachable through the tunnel.
pub const REMOTE_PREFIX_LEN: u8 = 48;
/// Lowest byte of the resolver address inside the remote network.
pub const RESOLVER_HOST_INDEX: u8 = 3;
pub const DNS_PORT: u16 = 53;

const REMOTE_PREFIX_MASK: u128 = !0u128 << (128 - REMOTE_PREFIX_LEN as u32);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
	#[error("invalid address format: {0}")]
	InvalidAddressFormat(String),
}

pub type Result<T> = std::result::Result<T, AddressError>;

/// Addressing for both tunnel ends, derived from the control plane's assigned
/// address without further round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPlan {
	pub local_network: Ipv6Net,
	pub remote_network: Ipv6Net,
	pub resolver: Ipv6Addr,
}

impl AddressPlan {
	/// Address bound to the virtual interface.
	pub fn local_address(&self) -> Ipv6Addr {
		self.local_network.addr()
	}

	pub fn is_remote(&self, addr: Ipv6Addr) -> bool {
		self.remote_network.contains(&addr)
	}
}

impl fmt::Display for AddressPlan {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"local={} remote={} resolver={}",
			self.local_network, self.remote_network, self.resolver
		)
	}
}

pub struct AddressPlanner;

impl AddressPlanner {
	/// Pure bit manipulation over the assigned address:
	///
	/// - local network: the address inside its own /120
	/// - remote network: everything below the top 48 bits zeroed, as a /48
	/// - resolver: the remote network base with its lowest byte set to 3
	pub fn derive(assigned: Ipv6Addr) -> AddressPlan {
		let bits = u128::from(assigned);
		let remote_base = bits & REMOTE_PREFIX_MASK;
		let resolver = Ipv6Addr::from(remote_base | u128::from(RESOLVER_HOST_INDEX));

		AddressPlan {
			local_network: prefix(assigned, LOCAL_PREFIX_LEN),
			remote_network: prefix(Ipv6Addr::from(remote_base), REMOTE_PREFIX_LEN),
			resolver,
		}
	}

	pub fn derive_str(assigned: &str) -> Result<AddressPlan> {
		Ok(Self::derive(parse_assigned(assigned)?))
	}

	pub fn derive_octets(assigned: &[u8]) -> Result<AddressPlan> {
		let octets: [u8; 16] = assigned.try_into().map_err(|_| {
			AddressError::InvalidAddressFormat(format!(
				"expected 16 address bytes, got {}",
				assigned.len()
			))
		})?;
		Ok(Self::derive(Ipv6Addr::from(octets)))
	}
}

/// Parses the textual assigned address. Surrounding whitespace is ignored;
/// anything that is not a bare IPv6 address is rejected.
pub fn parse_assigned(s: &str) -> Result<Ipv6Addr> {
	s.trim()
		.parse::<Ipv6Addr>()
		.map_err(|_| AddressError::InvalidAddressFormat(s.to_string()))
}

fn prefix(addr: Ipv6Addr, len: u8) -> Ipv6Net {
	match Ipv6Net::new(addr, len) {
		Ok(net) => net,
		Err(_) => unreachable!("prefix length {len} is within 0..=128"),
	}
}
