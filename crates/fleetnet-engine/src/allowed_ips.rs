// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::Ipv6Net;
use std::net::Ipv6Addr;

/// The peer's allowed ranges. Fixed at engine construction; every decrypted
/// source and every outbound destination must fall inside one of them.
#[derive(Debug, Clone)]
pub struct AllowedIps {
	nets: Vec<Ipv6Net>,
}

impl AllowedIps {
	pub fn new(nets: impl IntoIterator<Item = Ipv6Net>) -> Self {
		let mut nets: Vec<Ipv6Net> = nets.into_iter().map(|net| net.trunc()).collect();
		nets.sort();
		nets.dedup();
		Self { nets }
	}

	pub fn contains(&self, addr: Ipv6Addr) -> bool {
		self.nets.iter().any(|net| net.contains(&addr))
	}

	pub fn nets(&self) -> &[Ipv6Net] {
		&self.nets
	}
}
