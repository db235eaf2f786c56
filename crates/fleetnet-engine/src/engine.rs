// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::allowed_ips::AllowedIps;
use crate::device::{VirtualDevice, VirtualTcpListener, VirtualTcpStream};
use crate::error::{EngineError, Result};
use defguard_boringtun::noise::{Tunn, TunnResult};
use fleetnet_common::{WgPrivateKey, WgPublicKey};
use ipnet::Ipv6Net;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

pub const DEFAULT_MTU: u16 = 1420;
/// Smallest link MTU IPv6 permits.
pub const MIN_MTU: u16 = 1280;

const MAX_PACKET_SIZE: usize = 65536;
const SEND_TICK: Duration = Duration::from_millis(1);
const TIMER_TICK: Duration = Duration::from_millis(250);

pub struct WgEngineConfig {
	pub private_key: WgPrivateKey,
	pub peer_public_key: WgPublicKey,
	/// Rendezvous address the first handshake goes to.
	pub endpoint: SocketAddr,
	/// Destinations routed to the peer, and sources accepted from it.
	pub allowed_ips: Vec<Ipv6Net>,
	/// Address and prefix of the virtual interface.
	pub interface: Ipv6Net,
	pub mtu: u16,
	pub persistent_keepalive: Option<u16>,
	/// Local UDP address; an ephemeral port on the endpoint's family if unset.
	pub listen_addr: Option<SocketAddr>,
}

impl WgEngineConfig {
	pub fn validate(&self) -> Result<()> {
		if !self.private_key.agrees_with(&self.peer_public_key) {
			return Err(EngineError::InvalidConfig(
				"peer public key is a low-order point".to_string(),
			));
		}
		if self.endpoint.port() == 0 || self.endpoint.ip().is_unspecified() {
			return Err(EngineError::InvalidConfig(format!(
				"unusable endpoint {}",
				self.endpoint
			)));
		}
		if self.allowed_ips.is_empty() {
			return Err(EngineError::InvalidConfig(
				"no allowed IPs for peer".to_string(),
			));
		}
		if self.mtu < MIN_MTU {
			return Err(EngineError::InvalidConfig(format!(
				"MTU {} below IPv6 minimum {}",
				self.mtu, MIN_MTU
			)));
		}
		if self.persistent_keepalive == Some(0) {
			return Err(EngineError::InvalidConfig(
				"keep-alive interval must be positive; use None to disable".to_string(),
			));
		}
		Ok(())
	}

	fn bind_addr(&self) -> SocketAddr {
		match (self.listen_addr, self.endpoint) {
			(Some(addr), _) => addr,
			(None, SocketAddr::V4(_)) => SocketAddr::from(([0, 0, 0, 0], 0)),
			(None, SocketAddr::V6(_)) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
		}
	}
}

/// A single-peer WireGuard engine. Encrypted datagrams go over a UDP socket;
/// decrypted IPv6 packets are fed to a [`VirtualDevice`].
pub struct WgEngine {
	public_key: WgPublicKey,
	peer_key: WgPublicKey,
	socket: Arc<UdpSocket>,
	tunn: Mutex<Tunn>,
	endpoint: RwLock<SocketAddr>,
	allowed_ips: AllowedIps,
	device: VirtualDevice,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	running: AtomicBool,
	closed: AtomicBool,
	tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WgEngine {
	#[instrument(skip(config), fields(interface = %config.interface, endpoint = %config.endpoint, mtu = config.mtu))]
	pub async fn new(config: WgEngineConfig) -> Result<Arc<Self>> {
		config.validate()?;

		let socket = UdpSocket::bind(config.bind_addr()).await?;
		let device = VirtualDevice::new(config.interface, config.mtu)?;

		let tunn = Tunn::new(
			defguard_boringtun::x25519::StaticSecret::from(*config.private_key.expose_bytes()),
			defguard_boringtun::x25519::PublicKey::from(*config.peer_public_key.as_bytes()),
			None,
			config.persistent_keepalive,
			fastrand::u32(..) >> 8,
			None,
		);

		let allowed_ips = AllowedIps::new(config.allowed_ips.iter().copied());

		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		info!(local = %socket.local_addr()?, "created WireGuard engine");

		Ok(Arc::new(Self {
			public_key: config.private_key.public_key(),
			peer_key: config.peer_public_key,
			socket: Arc::new(socket),
			tunn: Mutex::new(tunn),
			endpoint: RwLock::new(config.endpoint),
			allowed_ips,
			device,
			shutdown_tx,
			shutdown_rx,
			running: AtomicBool::new(false),
			closed: AtomicBool::new(false),
			tasks: std::sync::Mutex::new(Vec::new()),
		}))
	}

	/// Sends the first handshake initiation and spawns the packet loops.
	#[instrument(skip(self))]
	pub async fn start(self: &Arc<Self>) -> Result<()> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(EngineError::Closed);
		}
		if self.running.swap(true, Ordering::SeqCst) {
			return Err(EngineError::AlreadyRunning);
		}

		let mut buf = vec![0u8; MAX_PACKET_SIZE];
		let initiation = {
			let mut tunn = self.tunn.lock().await;
			match tunn.format_handshake_initiation(&mut buf, false) {
				TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
				TunnResult::Err(e) => return Err(EngineError::WireGuard(format!("{:?}", e))),
				_ => None,
			}
		};
		if let Some(packet) = initiation {
			self.send_to_peer(&packet).await;
		}

		let handles = vec![
			Arc::clone(self).spawn_recv_loop(),
			Arc::clone(self).spawn_send_loop(),
			Arc::clone(self).spawn_timer_loop(),
		];
		match self.tasks.lock() {
			Ok(mut tasks) => tasks.extend(handles),
			Err(_) => handles.iter().for_each(JoinHandle::abort),
		}

		info!("started WireGuard engine");
		Ok(())
	}

	async fn send_to_peer(&self, data: &[u8]) {
		let endpoint = *self.endpoint.read().await;
		if let Err(e) = self.socket.send_to(data, endpoint).await {
			warn!(%endpoint, error = %e, "failed to send datagram");
		}
	}

	/// Feeds one received datagram through the tunnel. The endpoint follows
	/// the peer when an authenticated packet arrives from a new address.
	async fn handle_datagram(&self, from: SocketAddr, datagram: &[u8], dst_buf: &mut [u8]) {
		let mut outbound: Vec<Vec<u8>> = Vec::new();
		let mut inbound: Option<(Vec<u8>, Ipv6Addr)> = None;
		let mut authenticated = false;

		{
			let mut tunn = self.tunn.lock().await;
			match tunn.decapsulate(Some(from.ip()), datagram, dst_buf) {
				TunnResult::Done => {
					authenticated = true;
					trace!("packet processed, no output");
				}
				TunnResult::WriteToNetwork(data) => {
					authenticated = true;
					outbound.push(data.to_vec());
					// Flush packets queued while the handshake was in flight.
					loop {
						match tunn.decapsulate(None, &[], dst_buf) {
							TunnResult::WriteToNetwork(data) => outbound.push(data.to_vec()),
							_ => break,
						}
					}
				}
				TunnResult::WriteToTunnelV6(data, src) => {
					authenticated = true;
					inbound = Some((data.to_vec(), src));
				}
				TunnResult::WriteToTunnelV4(_, src) => {
					authenticated = true;
					debug!(%src, "dropping IPv4 packet on IPv6-only interface");
				}
				TunnResult::Err(e) => {
					debug!(%from, ?e, "tunnel decapsulate error");
				}
			}
		}

		if authenticated {
			let mut endpoint = self.endpoint.write().await;
			if *endpoint != from {
				info!(old = %*endpoint, new = %from, "peer endpoint roamed");
				*endpoint = from;
			}
		}

		for packet in outbound {
			trace!(len = packet.len(), "sending handshake/queued packet");
			self.send_to_peer(&packet).await;
		}

		if let Some((packet, src)) = inbound {
			if !self.allowed_ips.contains(src) {
				debug!(%src, "dropping packet from outside allowed range");
				return;
			}
			trace!(len = packet.len(), "decrypted packet for virtual device");
			if let Err(e) = self.device.receive_packet(&packet) {
				warn!(error = %e, "failed to receive packet into virtual device");
			}
		}
	}

	fn spawn_recv_loop(self: Arc<Self>) -> JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut buf = vec![0u8; MAX_PACKET_SIZE];
			let mut dst_buf = vec![0u8; MAX_PACKET_SIZE];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							debug!("recv loop shutting down");
							break;
						}
					}

					result = self.socket.recv_from(&mut buf) => {
						match result {
							Ok((len, from)) => {
								trace!(%from, len, "received datagram");
								self.handle_datagram(from, &buf[..len], &mut dst_buf).await;
							}
							Err(e) => {
								warn!(error = %e, "UDP recv error");
							}
						}
					}
				}
			}
		})
	}

	fn spawn_send_loop(self: Arc<Self>) -> JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut dst_buf = vec![0u8; MAX_PACKET_SIZE];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							debug!("send loop shutting down");
							break;
						}
					}

					_ = tokio::time::sleep(SEND_TICK) => {
						while let Some(packet) = self.device.transmit_packet() {
							let Some(dst) = extract_ipv6_dst(&packet) else {
								continue;
							};
							if !self.allowed_ips.contains(dst) {
								trace!(%dst, "no route for packet, dropping");
								continue;
							}

							let encrypted = {
								let mut tunn = self.tunn.lock().await;
								match tunn.encapsulate(&packet, &mut dst_buf) {
									TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
									TunnResult::Err(e) => {
										debug!(?e, "tunnel encapsulate error");
										None
									}
									_ => None,
								}
							};
							if let Some(data) = encrypted {
								trace!(len = data.len(), %dst, "sending encrypted packet");
								self.send_to_peer(&data).await;
							}
						}
					}
				}
			}
		})
	}

	fn spawn_timer_loop(self: Arc<Self>) -> JoinHandle<()> {
		let mut shutdown_rx = self.shutdown_rx.clone();

		tokio::spawn(async move {
			let mut dst_buf = vec![0u8; MAX_PACKET_SIZE];

			loop {
				tokio::select! {
					biased;

					_ = shutdown_rx.changed() => {
						if *shutdown_rx.borrow() {
							debug!("timer loop shutting down");
							break;
						}
					}

					_ = tokio::time::sleep(TIMER_TICK) => {
						let packet = {
							let mut tunn = self.tunn.lock().await;
							match tunn.update_timers(&mut dst_buf) {
								TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
								TunnResult::Err(e) => {
									debug!(?e, "timer update error");
									None
								}
								_ => None,
							}
						};
						if let Some(data) = packet {
							trace!(len = data.len(), "sending keepalive/handshake");
							self.send_to_peer(&data).await;
						}
					}
				}
			}
		})
	}

	pub fn public_key(&self) -> WgPublicKey {
		self.public_key
	}

	pub fn peer_public_key(&self) -> WgPublicKey {
		self.peer_key
	}

	pub fn address(&self) -> Ipv6Addr {
		self.device.address()
	}

	pub fn local_udp_addr(&self) -> Result<SocketAddr> {
		Ok(self.socket.local_addr()?)
	}

	pub async fn endpoint(&self) -> SocketAddr {
		*self.endpoint.read().await
	}

	/// Whether `dst` falls in the peer's allowed range.
	pub fn routes(&self, dst: Ipv6Addr) -> bool {
		self.allowed_ips.contains(dst)
	}

	#[instrument(skip(self), fields(port))]
	pub fn tcp_listener(&self, port: u16) -> Result<VirtualTcpListener> {
		self.ensure_open()?;
		self.device.listen(port)
	}

	#[instrument(skip(self), fields(%addr))]
	pub async fn tcp_connect(&self, addr: SocketAddrV6) -> Result<VirtualTcpStream> {
		self.ensure_open()?;
		if !self.routes(*addr.ip()) {
			return Err(EngineError::NoRoute(addr.ip().to_string()));
		}
		let stream = self.device.connect(addr)?;
		stream.wait_connected().await?;
		Ok(stream)
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(EngineError::Closed);
		}
		Ok(())
	}

	/// Stops the packet loops and closes the virtual device. Returns `false`
	/// when the engine was already shut down.
	#[instrument(skip(self))]
	pub fn shutdown(&self) -> bool {
		if self.closed.swap(true, Ordering::SeqCst) {
			return false;
		}
		info!("shutting down WireGuard engine");
		let _ = self.shutdown_tx.send(true);
		self.running.store(false, Ordering::SeqCst);
		self.device.close();

		if let Ok(mut tasks) = self.tasks.lock() {
			for task in tasks.drain(..) {
				task.abort();
			}
		}
		true
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub fn device(&self) -> &VirtualDevice {
		&self.device
	}
}

fn extract_ipv6_dst(packet: &[u8]) -> Option<Ipv6Addr> {
	if packet.len() < 40 {
		return None;
	}

	let version = packet[0] >> 4;
	if version != 6 {
		return None;
	}

	let mut dst_bytes = [0u8; 16];
	dst_bytes.copy_from_slice(&packet[24..40]);
	Some(Ipv6Addr::from(dst_bytes))
}
