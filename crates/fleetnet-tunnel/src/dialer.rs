// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::DialError;
use crate::resolver::StackResolver;
use crate::session::SessionShared;
use fleetnet_engine::VirtualTcpStream;
use http::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV6};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, instrument};

/// Opens TCP connections through the tunnel. Names are resolved with the
/// session's [`StackResolver`], never the host resolver.
#[derive(Clone)]
pub struct StackDialer {
	shared: Arc<SessionShared>,
	resolver: StackResolver,
	timeout: Duration,
}

impl StackDialer {
	pub(crate) fn new(shared: Arc<SessionShared>, resolver: StackResolver) -> Self {
		let timeout = shared.dial_timeout;
		Self {
			shared,
			resolver,
			timeout,
		}
	}

	pub fn with_timeout(&self, timeout: Duration) -> Self {
		Self {
			timeout,
			..self.clone()
		}
	}

	/// Connects to `host:port`. `host` is an IPv6 literal, optionally in
	/// brackets, or a name with an AAAA record inside the fleet.
	#[instrument(skip(self))]
	pub async fn dial(&self, host: &str, port: u16) -> Result<TunnelConnection, DialError> {
		if self.shared.is_closed() {
			return Err(DialError::SessionClosed);
		}

		let ip = self.target_ip(host).await?;
		self.dial_addr(SocketAddrV6::new(ip, port, 0, 0)).await
	}

	pub async fn dial_addr(&self, addr: SocketAddrV6) -> Result<TunnelConnection, DialError> {
		let timeout = self.timeout;
		let connect = tokio::time::timeout(timeout, self.shared.engine.tcp_connect(addr));
		let stream = match self.shared.until_closed(connect).await {
			None => return Err(DialError::SessionClosed),
			Some(Err(_)) => return Err(DialError::TimedOut(timeout)),
			Some(Ok(result)) => result?,
		};

		debug!(%addr, "dialed through tunnel");
		Ok(TunnelConnection::new(stream))
	}

	async fn target_ip(&self, host: &str) -> Result<Ipv6Addr, DialError> {
		let bare = host
			.strip_prefix('[')
			.and_then(|h| h.strip_suffix(']'))
			.unwrap_or(host);

		if let Ok(ip) = bare.parse::<Ipv6Addr>() {
			return Ok(ip);
		}
		if bare.parse::<Ipv4Addr>().is_ok() {
			return Err(DialError::InvalidTarget(format!(
				"{host}: the tunnel carries IPv6 only"
			)));
		}

		self
			.resolver
			.lookup_aaaa(bare)
			.await?
			.first()
			.copied()
			.ok_or_else(|| DialError::Unreachable(format!("{host}: no AAAA records")))
	}

	pub fn resolver(&self) -> &StackResolver {
		&self.resolver
	}
}

impl std::fmt::Debug for StackDialer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StackDialer")
			.field("local", &self.shared.plan.local_address())
			.field("timeout", &self.timeout)
			.finish()
	}
}

/// Lets the dialer act as the connector of a
/// `hyper_util::client::legacy::Client`.
impl tower::Service<Uri> for StackDialer {
	type Response = TunnelConnection;
	type Error = DialError;
	type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		if self.shared.is_closed() {
			return Poll::Ready(Err(DialError::SessionClosed));
		}
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, uri: Uri) -> Self::Future {
		let dialer = self.clone();
		Box::pin(async move {
			let host = uri
				.host()
				.ok_or_else(|| DialError::InvalidTarget(format!("{uri}: missing host")))?;
			let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
				Some("https") => 443,
				_ => 80,
			});
			dialer.dial(host, port).await
		})
	}
}

/// A TCP connection carried by the tunnel. Speaks both tokio's and hyper's
/// I/O traits.
pub struct TunnelConnection {
	io: TokioIo<VirtualTcpStream>,
}

impl TunnelConnection {
	fn new(stream: VirtualTcpStream) -> Self {
		Self {
			io: TokioIo::new(stream),
		}
	}

	pub fn peer_addr(&self) -> SocketAddrV6 {
		self.io.inner().peer_addr()
	}

	pub fn local_addr(&self) -> SocketAddrV6 {
		self.io.inner().local_addr()
	}

	pub fn into_inner(self) -> VirtualTcpStream {
		self.io.into_inner()
	}
}

impl std::fmt::Debug for TunnelConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TunnelConnection")
			.field("local", &self.local_addr())
			.field("peer", &self.peer_addr())
			.finish()
	}
}

impl AsyncRead for TunnelConnection {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(self.io.inner_mut()).poll_read(cx, buf)
	}
}

impl AsyncWrite for TunnelConnection {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		Pin::new(self.io.inner_mut()).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(self.io.inner_mut()).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(self.io.inner_mut()).poll_shutdown(cx)
	}
}

impl hyper::rt::Read for TunnelConnection {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: hyper::rt::ReadBufCursor<'_>,
	) -> Poll<io::Result<()>> {
		hyper::rt::Read::poll_read(Pin::new(&mut self.io), cx, buf)
	}
}

impl hyper::rt::Write for TunnelConnection {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		hyper::rt::Write::poll_write(Pin::new(&mut self.io), cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		hyper::rt::Write::poll_flush(Pin::new(&mut self.io), cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		hyper::rt::Write::poll_shutdown(Pin::new(&mut self.io), cx)
	}
}

impl Connection for TunnelConnection {
	fn connected(&self) -> Connected {
		Connected::new()
	}
}
