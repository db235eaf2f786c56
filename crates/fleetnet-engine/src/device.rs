// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result};
use ipnet::Ipv6Net;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv6Address};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant as StdInstant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, instrument, trace, warn};

const DEFAULT_TCP_RX_BUFFER_SIZE: usize = 65536;
const DEFAULT_TCP_TX_BUFFER_SIZE: usize = 65536;

/// Maximum number of packets in rx/tx queues to prevent memory exhaustion DoS
const MAX_QUEUE_SIZE: usize = 1024;

const EPHEMERAL_PORT_START: u16 = 49152;
const EPHEMERAL_PORT_COUNT: u16 = 16383;
const EPHEMERAL_PORT_ATTEMPTS: usize = 64;
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn smoltcp_now() -> SmoltcpInstant {
	static START: std::sync::OnceLock<StdInstant> = std::sync::OnceLock::new();
	let start = START.get_or_init(StdInstant::now);
	SmoltcpInstant::from_micros(start.elapsed().as_micros() as i64)
}

fn to_smoltcp(addr: Ipv6Addr) -> Ipv6Address {
	Ipv6Address::from_bytes(&addr.octets())
}

fn from_smoltcp(endpoint: IpEndpoint) -> Option<SocketAddrV6> {
	#[allow(unreachable_patterns)]
	match endpoint.addr {
		IpAddress::Ipv6(v6) => Some(SocketAddrV6::new(Ipv6Addr::from(v6.0), endpoint.port, 0, 0)),
		_ => None,
	}
}

fn closed_io_error() -> io::Error {
	io::Error::new(io::ErrorKind::NotConnected, "virtual device closed")
}

struct InternalDevice {
	rx_queue: VecDeque<Vec<u8>>,
	tx_queue: VecDeque<Vec<u8>>,
	mtu: usize,
}

impl InternalDevice {
	fn new(mtu: u16) -> Self {
		Self {
			rx_queue: VecDeque::new(),
			tx_queue: VecDeque::new(),
			mtu: mtu as usize,
		}
	}
}

struct InternalRxToken {
	data: Vec<u8>,
}

impl RxToken for InternalRxToken {
	fn consume<R, F>(mut self, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		f(&mut self.data)
	}
}

struct InternalTxToken<'a> {
	tx_queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxToken for InternalTxToken<'a> {
	fn consume<R, F>(self, len: usize, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		let mut buffer = vec![0u8; len];
		let result = f(&mut buffer);
		if self.tx_queue.len() >= MAX_QUEUE_SIZE {
			warn!(queue = "tx", "packet queue full, dropping oldest packet");
			self.tx_queue.pop_front();
		}
		self.tx_queue.push_back(buffer);
		result
	}
}

impl Device for InternalDevice {
	type RxToken<'a> = InternalRxToken;
	type TxToken<'a> = InternalTxToken<'a>;

	fn receive(
		&mut self,
		_timestamp: SmoltcpInstant,
	) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
		let data = self.rx_queue.pop_front()?;
		Some((
			InternalRxToken { data },
			InternalTxToken {
				tx_queue: &mut self.tx_queue,
			},
		))
	}

	fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
		Some(InternalTxToken {
			tx_queue: &mut self.tx_queue,
		})
	}

	fn capabilities(&self) -> DeviceCapabilities {
		let mut caps = DeviceCapabilities::default();
		caps.max_transmission_unit = self.mtu;
		caps.medium = Medium::Ip;
		caps
	}
}

struct DeviceInner {
	device: InternalDevice,
	iface: Interface,
	sockets: SocketSet<'static>,
	/// Every TCP socket handle currently in `sockets`.
	live: Vec<SocketHandle>,
	/// Sockets whose owner has gone away; removed once fully closed.
	orphans: Vec<SocketHandle>,
	wakers: Vec<Waker>,
	closed: bool,
}

impl DeviceInner {
	fn poll(&mut self) -> bool {
		let timestamp = smoltcp_now();
		let changed = self
			.iface
			.poll(timestamp, &mut self.device, &mut self.sockets);
		self.reap_orphans();
		changed
	}

	fn reap_orphans(&mut self) {
		let sockets = &mut self.sockets;
		let live = &mut self.live;
		self.orphans.retain(|handle| {
			let state = sockets.get::<TcpSocket>(*handle).state();
			if matches!(state, TcpState::Closed | TcpState::TimeWait) {
				sockets.remove(*handle);
				live.retain(|h| h != handle);
				false
			} else {
				true
			}
		});
	}

	/// Picks a random ephemeral port no socket in the set is bound to.
	fn free_ephemeral_port(&self) -> Result<u16> {
		let in_use: Vec<u16> = self
			.live
			.iter()
			.flat_map(|handle| {
				let socket = self.sockets.get::<TcpSocket>(*handle);
				[
					socket.local_endpoint().map(|e| e.port),
					Some(socket.listen_endpoint().port).filter(|port| *port != 0),
				]
			})
			.flatten()
			.collect();

		for _ in 0..EPHEMERAL_PORT_ATTEMPTS {
			let port = EPHEMERAL_PORT_START + (fastrand::u16(..) % EPHEMERAL_PORT_COUNT);
			if !in_use.contains(&port) {
				return Ok(port);
			}
		}
		// Dense table: fall back to a linear scan.
		(EPHEMERAL_PORT_START..EPHEMERAL_PORT_START + EPHEMERAL_PORT_COUNT)
			.find(|port| !in_use.contains(port))
			.ok_or_else(|| EngineError::TcpConnect("no free ephemeral port".to_string()))
	}

	fn wake_all(&mut self) {
		for waker in self.wakers.drain(..) {
			waker.wake();
		}
	}
}

/// The client's virtual interface: a smoltcp stack bound to one IPv6 network,
/// fed and drained by the engine.
pub struct VirtualDevice {
	network: Ipv6Net,
	mtu: u16,
	inner: Arc<Mutex<DeviceInner>>,
}

impl VirtualDevice {
	#[instrument(skip_all, fields(%network, mtu))]
	pub fn new(network: Ipv6Net, mtu: u16) -> Result<Self> {
		let mut device = InternalDevice::new(mtu);

		let mut config = Config::new(HardwareAddress::Ip);
		config.random_seed = fastrand::u64(..);
		let mut iface = Interface::new(config, &mut device, smoltcp_now());

		let address = to_smoltcp(network.addr());
		let mut pushed = false;
		iface.update_ip_addrs(|addrs| {
			pushed = addrs
				.push(IpCidr::new(IpAddress::Ipv6(address), network.prefix_len()))
				.is_ok();
		});
		if !pushed {
			return Err(EngineError::Device(
				"interface address table full".to_string(),
			));
		}

		// Everything off-link goes to the engine, which decides by allowed range.
		iface
			.routes_mut()
			.add_default_ipv6_route(address)
			.map_err(|_| EngineError::Device("route table full".to_string()))?;

		let sockets = SocketSet::new(vec![]);

		debug!("created virtual device");

		Ok(Self {
			network,
			mtu,
			inner: Arc::new(Mutex::new(DeviceInner {
				device,
				iface,
				sockets,
				live: Vec::new(),
				orphans: Vec::new(),
				wakers: Vec::new(),
				closed: false,
			})),
		})
	}

	fn lock(&self) -> Result<MutexGuard<'_, DeviceInner>> {
		self
			.inner
			.lock()
			.map_err(|e| EngineError::Device(format!("lock poisoned: {}", e)))
	}

	fn lock_open(&self) -> Result<MutexGuard<'_, DeviceInner>> {
		let inner = self.lock()?;
		if inner.closed {
			return Err(EngineError::Closed);
		}
		Ok(inner)
	}

	#[instrument(skip(self, data), fields(len = data.len()))]
	pub fn receive_packet(&self, data: &[u8]) -> Result<()> {
		let mut inner = self.lock_open()?;

		if inner.device.rx_queue.len() >= MAX_QUEUE_SIZE {
			warn!(queue = "rx", "packet queue full, dropping oldest packet");
			inner.device.rx_queue.pop_front();
		}
		inner.device.rx_queue.push_back(data.to_vec());

		inner.poll();
		inner.wake_all();

		trace!("received packet into virtual device");
		Ok(())
	}

	pub fn transmit_packet(&self) -> Option<Vec<u8>> {
		let mut inner = self.inner.lock().ok()?;
		if inner.closed {
			return None;
		}

		inner.poll();

		let packet = inner.device.tx_queue.pop_front();
		if packet.is_some() {
			trace!("transmitting packet from virtual device");
		}
		packet
	}

	pub fn poll(&self) -> bool {
		match self.inner.lock() {
			Ok(mut inner) if !inner.closed => inner.poll(),
			_ => false,
		}
	}

	/// Aborts every socket and refuses further use. Pending readers and
	/// writers are woken and observe a closed error. Idempotent.
	#[instrument(skip(self), fields(network = %self.network))]
	pub fn close(&self) {
		let Ok(mut inner) = self.inner.lock() else {
			return;
		};
		if inner.closed {
			return;
		}
		let handles = inner.live.clone();
		for handle in handles {
			inner.sockets.get_mut::<TcpSocket>(handle).abort();
		}
		inner.closed = true;
		inner.device.rx_queue.clear();
		inner.device.tx_queue.clear();
		inner.wake_all();
		debug!("closed virtual device");
	}

	pub fn is_closed(&self) -> bool {
		self.inner.lock().map(|i| i.closed).unwrap_or(true)
	}

	pub fn address(&self) -> Ipv6Addr {
		self.network.addr()
	}

	pub fn network(&self) -> Ipv6Net {
		self.network
	}

	pub fn mtu(&self) -> u16 {
		self.mtu
	}

	fn create_tcp_socket(&self) -> TcpSocket<'static> {
		let rx_buffer = SocketBuffer::new(vec![0u8; DEFAULT_TCP_RX_BUFFER_SIZE]);
		let tx_buffer = SocketBuffer::new(vec![0u8; DEFAULT_TCP_TX_BUFFER_SIZE]);
		TcpSocket::new(rx_buffer, tx_buffer)
	}

	fn add_listen_socket(&self, inner: &mut DeviceInner, port: u16) -> Result<SocketHandle> {
		let mut socket = self.create_tcp_socket();
		socket
			.listen(port)
			.map_err(|e| EngineError::Device(format!("listen failed: {}", e)))?;
		let handle = inner.sockets.add(socket);
		inner.live.push(handle);
		Ok(handle)
	}

	pub fn listen(&self, port: u16) -> Result<VirtualTcpListener> {
		let mut inner = self.lock_open()?;
		let handle = self.add_listen_socket(&mut inner, port)?;
		let local_addr = SocketAddrV6::new(self.address(), port, 0, 0);

		debug!(%port, "listening on port");
		Ok(VirtualTcpListener {
			device: self.clone(),
			handle,
			local_addr,
		})
	}

	/// Starts a TCP handshake towards `addr`. The returned stream is usable
	/// once [`VirtualTcpStream::wait_connected`] resolves.
	pub fn connect(&self, addr: SocketAddrV6) -> Result<VirtualTcpStream> {
		let mut inner = self.lock_open()?;

		let mut socket = self.create_tcp_socket();

		let local_port = inner.free_ephemeral_port()?;
		let local_endpoint = IpEndpoint::new(IpAddress::Ipv6(to_smoltcp(self.address())), local_port);
		let remote_endpoint = IpEndpoint::new(IpAddress::Ipv6(to_smoltcp(*addr.ip())), addr.port());

		socket
			.connect(inner.iface.context(), remote_endpoint, local_endpoint)
			.map_err(|e| EngineError::TcpConnect(format!("connect failed: {}", e)))?;

		let handle = inner.sockets.add(socket);
		inner.live.push(handle);
		inner.poll();

		debug!(%addr, local_port, "connecting to remote");
		Ok(VirtualTcpStream {
			device: self.clone(),
			handle,
			local_port,
			remote: addr,
		})
	}

	fn release(&self, handle: SocketHandle) {
		if let Ok(mut inner) = self.inner.lock() {
			if !inner.closed {
				inner.sockets.get_mut::<TcpSocket>(handle).close();
			}
			inner.orphans.push(handle);
			inner.reap_orphans();
		}
	}
}

impl Clone for VirtualDevice {
	fn clone(&self) -> Self {
		Self {
			network: self.network,
			mtu: self.mtu,
			inner: Arc::clone(&self.inner),
		}
	}
}

pub struct VirtualTcpListener {
	device: VirtualDevice,
	handle: SocketHandle,
	local_addr: SocketAddrV6,
}

impl VirtualTcpListener {
	/// Waits for an established connection. The listening socket is re-armed
	/// so later connections are accepted too.
	pub async fn accept(&mut self) -> Result<(VirtualTcpStream, SocketAddrV6)> {
		loop {
			{
				let mut inner = self.device.lock_open()?;
				let socket = inner.sockets.get::<TcpSocket>(self.handle);
				if socket.state() == TcpState::Established {
					if let Some(remote) = socket.remote_endpoint().and_then(from_smoltcp) {
						let accepted = self.handle;
						self.handle = self
							.device
							.add_listen_socket(&mut inner, self.local_addr.port())?;

						let stream = VirtualTcpStream {
							device: self.device.clone(),
							handle: accepted,
							local_port: self.local_addr.port(),
							remote,
						};
						return Ok((stream, remote));
					}
				}
			}

			tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
			self.device.poll();
		}
	}

	pub fn local_addr(&self) -> SocketAddrV6 {
		self.local_addr
	}
}

impl Drop for VirtualTcpListener {
	fn drop(&mut self) {
		self.device.release(self.handle);
	}
}

pub struct VirtualTcpStream {
	device: VirtualDevice,
	handle: SocketHandle,
	local_port: u16,
	remote: SocketAddrV6,
}

impl VirtualTcpStream {
	pub fn peer_addr(&self) -> SocketAddrV6 {
		self.remote
	}

	pub fn local_addr(&self) -> SocketAddrV6 {
		SocketAddrV6::new(self.device.address(), self.local_port, 0, 0)
	}

	pub async fn wait_connected(&self) -> Result<()> {
		loop {
			let state = {
				let inner = self.device.lock_open()?;
				inner.sockets.get::<TcpSocket>(self.handle).state()
			};

			match state {
				TcpState::Established => return Ok(()),
				// A reset in SYN-SENT drops straight back to CLOSED.
				TcpState::Closed => {
					return Err(EngineError::ConnectionRefused(self.remote.to_string()))
				}
				TcpState::Closing | TcpState::TimeWait => {
					return Err(EngineError::TcpConnect("connection failed".to_string()))
				}
				_ => {
					tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
					self.device.poll();
				}
			}
		}
	}

	fn poll_read_inner(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
		let mut inner = match self.device.inner.lock() {
			Ok(inner) => inner,
			Err(e) => return Poll::Ready(Err(io::Error::other(format!("lock poisoned: {}", e)))),
		};
		if inner.closed {
			return Poll::Ready(Err(closed_io_error()));
		}

		inner.poll();

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		if socket.can_recv() {
			Poll::Ready(
				socket
					.recv_slice(buf)
					.map_err(|e| io::Error::other(format!("{}", e))),
			)
		} else if socket.may_recv() {
			inner.wakers.push(cx.waker().clone());
			Poll::Pending
		} else if socket.state() == TcpState::Closed {
			Poll::Ready(Err(io::Error::new(
				io::ErrorKind::ConnectionReset,
				"connection reset",
			)))
		} else {
			Poll::Ready(Ok(0))
		}
	}

	fn poll_write_inner(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let mut inner = match self.device.inner.lock() {
			Ok(inner) => inner,
			Err(e) => return Poll::Ready(Err(io::Error::other(format!("lock poisoned: {}", e)))),
		};
		if inner.closed {
			return Poll::Ready(Err(closed_io_error()));
		}

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		if socket.can_send() {
			match socket.send_slice(buf) {
				Ok(n) => {
					inner.poll();
					Poll::Ready(Ok(n))
				}
				Err(e) => Poll::Ready(Err(io::Error::other(format!("{}", e)))),
			}
		} else if socket.may_send() {
			inner.wakers.push(cx.waker().clone());
			Poll::Pending
		} else {
			Poll::Ready(Err(io::Error::new(
				io::ErrorKind::NotConnected,
				"not connected",
			)))
		}
	}
}

impl AsyncRead for VirtualTcpStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.poll_read_inner(cx, buf.initialize_unfilled()) {
			Poll::Ready(Ok(n)) => {
				buf.advance(n);
				Poll::Ready(Ok(()))
			}
			Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
			Poll::Pending => Poll::Pending,
		}
	}
}

impl AsyncWrite for VirtualTcpStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		self.poll_write_inner(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		if self.device.is_closed() {
			return Poll::Ready(Err(closed_io_error()));
		}
		self.device.poll();
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let mut inner = self
			.device
			.inner
			.lock()
			.map_err(|e| io::Error::other(format!("lock poisoned: {}", e)))?;
		if inner.closed {
			return Poll::Ready(Ok(()));
		}

		inner.sockets.get_mut::<TcpSocket>(self.handle).close();
		inner.poll();

		Poll::Ready(Ok(()))
	}
}

impl Drop for VirtualTcpStream {
	fn drop(&mut self) {
		self.device.release(self.handle);
	}
}
