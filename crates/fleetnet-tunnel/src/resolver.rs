// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! DNS over the tunnel.
//!
//! Queries go over TCP to the fleet resolver at `[resolver]:53`, through the
//! user-space stack, never through the host's resolver. Nothing is cached.

use crate::error::ResolveError;
use crate::session::SessionShared;
use fleetnet_common::DNS_PORT;
use fleetnet_engine::EngineError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use std::net::{IpAddr, Ipv6Addr, SocketAddrV6};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct StackResolver {
	shared: Arc<SessionShared>,
	timeout: Duration,
}

impl StackResolver {
	pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
		let timeout = shared.dns_timeout;
		Self { shared, timeout }
	}

	/// A copy of this resolver with a different per-query deadline.
	pub fn with_timeout(&self, timeout: Duration) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
			timeout,
		}
	}

	pub fn server(&self) -> SocketAddrV6 {
		SocketAddrV6::new(self.shared.plan.resolver, DNS_PORT, 0, 0)
	}

	/// Addresses for `name` of the given record type. Only A and AAAA
	/// answers are returned; a name that does not exist yields no addresses.
	#[instrument(skip(self), fields(server = %self.server()))]
	pub async fn resolve(&self, name: &str, record_type: RecordType) -> Result<Vec<IpAddr>, ResolveError> {
		let query_name = fqdn(name)?;

		let mut request = Message::new();
		request
			.set_id(fastrand::u16(..))
			.set_message_type(MessageType::Query)
			.set_op_code(OpCode::Query)
			.set_recursion_desired(true)
			.add_query(Query::query(query_name, record_type));

		let response = self.query(request).await?;

		match response.response_code() {
			ResponseCode::NoError | ResponseCode::NXDomain => {}
			code => return Err(ResolveError::ServerFailure(code.to_string())),
		}

		let addrs: Vec<IpAddr> = response
			.answers()
			.iter()
			.filter(|record| record.record_type() == record_type)
			.filter_map(|record| match record.data() {
				Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
				Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
				_ => None,
			})
			.collect();

		debug!(count = addrs.len(), "resolved");
		Ok(addrs)
	}

	pub async fn lookup_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, ResolveError> {
		let addrs = self.resolve(name, RecordType::AAAA).await?;
		Ok(addrs
			.into_iter()
			.filter_map(|addr| match addr {
				IpAddr::V6(v6) => Some(v6),
				IpAddr::V4(_) => None,
			})
			.collect())
	}

	/// Sends `request` as-is and returns the raw response.
	pub async fn query(&self, request: Message) -> Result<Message, ResolveError> {
		if self.shared.is_closed() {
			return Err(ResolveError::SessionClosed);
		}

		let timeout = self.timeout;
		let exchange = tokio::time::timeout(timeout, self.exchange(&request));
		match self.shared.until_closed(exchange).await {
			None => Err(ResolveError::SessionClosed),
			Some(Err(_)) => Err(ResolveError::ResolutionTimedOut(timeout)),
			Some(Ok(result)) => result,
		}
	}

	async fn exchange(&self, request: &Message) -> Result<Message, ResolveError> {
		let bytes = request.to_vec()?;
		let len = u16::try_from(bytes.len())
			.map_err(|_| ResolveError::Protocol("query exceeds 65535 bytes".to_string()))?;

		let mut stream = self
			.shared
			.engine
			.tcp_connect(self.server())
			.await
			.map_err(|e| match e {
				EngineError::Closed => ResolveError::SessionClosed,
				other => ResolveError::Dial(other.to_string()),
			})?;

		let io_error = |e: std::io::Error| {
			if self.shared.is_closed() {
				ResolveError::SessionClosed
			} else {
				ResolveError::Protocol(e.to_string())
			}
		};

		// DNS over TCP: two-byte big-endian length, then the message.
		stream.write_all(&len.to_be_bytes()).await.map_err(io_error)?;
		stream.write_all(&bytes).await.map_err(io_error)?;
		stream.flush().await.map_err(io_error)?;

		let mut len_buf = [0u8; 2];
		stream.read_exact(&mut len_buf).await.map_err(io_error)?;
		let mut response = vec![0u8; u16::from_be_bytes(len_buf) as usize];
		stream.read_exact(&mut response).await.map_err(io_error)?;

		let response = Message::from_vec(&response)?;
		if response.id() != request.id() {
			return Err(ResolveError::Protocol(format!(
				"response id {} does not match query id {}",
				response.id(),
				request.id()
			)));
		}
		Ok(response)
	}
}

impl std::fmt::Debug for StackResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StackResolver")
			.field("server", &self.server())
			.field("timeout", &self.timeout)
			.finish()
	}
}

fn fqdn(name: &str) -> Result<Name, ResolveError> {
	let name = name.trim();
	if name.is_empty() {
		return Err(ResolveError::InvalidName(name.to_string()));
	}
	let absolute = if name.ends_with('.') {
		name.to_string()
	} else {
		format!("{name}.")
	};
	Name::from_str(&absolute).map_err(|_| ResolveError::InvalidName(name.to_string()))
}
