// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::TunnelConfig;
use crate::dialer::StackDialer;
use crate::endpoint::EndpointSelector;
use crate::error::{DialError, EstablishError};
use crate::resolver::StackResolver;
use fleetnet_common::{AddressPlan, LocalKeyPair, PeerDescriptor};
use fleetnet_engine::{VirtualDevice, VirtualTcpListener, WgEngine, WgEngineConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// State shared between a session and the dialers and resolvers derived
/// from it.
pub(crate) struct SessionShared {
	pub(crate) engine: Arc<WgEngine>,
	pub(crate) plan: AddressPlan,
	pub(crate) dns_timeout: Duration,
	pub(crate) dial_timeout: Duration,
	closed_tx: watch::Sender<bool>,
}

impl SessionShared {
	pub(crate) fn is_closed(&self) -> bool {
		*self.closed_tx.borrow() || self.engine.is_closed()
	}

	/// Runs `op` unless the session closes first. `None` means it closed.
	pub(crate) async fn until_closed<F, T>(&self, op: F) -> Option<T>
	where
		F: Future<Output = T>,
	{
		let mut closed_rx = self.closed_tx.subscribe();
		if *closed_rx.borrow_and_update() {
			return None;
		}
		tokio::select! {
			biased;

			_ = closed_rx.wait_for(|closed| *closed) => None,
			out = op => Some(out),
		}
	}

	/// Fails new dials and lookups without stopping the engine. Returns
	/// `false` if the session was already marked closed.
	fn mark_closed(&self) -> bool {
		!self.closed_tx.send_replace(true)
	}

	fn close(&self) -> bool {
		let first = self.mark_closed();
		let engine_closed = self.engine.shutdown();
		first || engine_closed
	}
}

/// Owns the engine until bring-up completes; shuts it down on early return.
struct BringUp {
	engine: Option<Arc<WgEngine>>,
}

impl BringUp {
	fn new() -> Self {
		Self { engine: None }
	}

	fn hold(&mut self, engine: Arc<WgEngine>) -> Arc<WgEngine> {
		self.engine = Some(Arc::clone(&engine));
		engine
	}

	/// Bring-up succeeded; the caller keeps the engine.
	fn complete(mut self) {
		self.engine = None;
	}
}

impl Drop for BringUp {
	fn drop(&mut self) {
		if let Some(engine) = self.engine.take() {
			engine.shutdown();
			debug!("released partially constructed engine");
		}
	}
}

/// A live tunnel: the WireGuard engine, its virtual interface and the
/// user-space stack on top. Single owner; the dialer and resolver it hands
/// out may be cloned and used concurrently until the session closes.
pub struct TunnelSession {
	shared: Arc<SessionShared>,
	endpoint: SocketAddr,
}

impl TunnelSession {
	pub async fn establish(
		keys: &LocalKeyPair,
		descriptor: &PeerDescriptor,
		plan: &AddressPlan,
		config: &TunnelConfig,
	) -> Result<Self, EstablishError> {
		Self::establish_with(keys, descriptor, plan, config, &EndpointSelector::new()).await
	}

	#[instrument(skip_all, fields(peer = %descriptor.public_key, endpoint = %descriptor.endpoint, local = %plan.local_network))]
	pub async fn establish_with(
		keys: &LocalKeyPair,
		descriptor: &PeerDescriptor,
		plan: &AddressPlan,
		config: &TunnelConfig,
		selector: &EndpointSelector,
	) -> Result<Self, EstablishError> {
		let mut endpoint = selector
			.resolve(&descriptor.endpoint, config.endpoint_resolve_timeout)
			.await?;
		if endpoint.port() == 0 {
			endpoint.set_port(config.default_endpoint_port);
		}

		let engine_config = WgEngineConfig {
			private_key: keys.private_key().clone(),
			peer_public_key: descriptor.public_key,
			endpoint,
			allowed_ips: vec![plan.remote_network],
			interface: plan.local_network,
			mtu: config.mtu,
			persistent_keepalive: config.keepalive,
			listen_addr: config.listen_addr,
		};

		let mut bring_up = BringUp::new();
		let engine = bring_up.hold(WgEngine::new(engine_config).await?);
		engine.start().await?;
		bring_up.complete();

		let (closed_tx, _) = watch::channel(false);
		let shared = Arc::new(SessionShared {
			engine,
			plan: *plan,
			dns_timeout: config.dns_timeout,
			dial_timeout: config.dial_timeout,
			closed_tx,
		});

		info!(%endpoint, resolver = %plan.resolver, "tunnel session up");
		Ok(Self { shared, endpoint })
	}

	pub fn dialer(&self) -> StackDialer {
		StackDialer::new(Arc::clone(&self.shared), self.resolver())
	}

	pub fn resolver(&self) -> StackResolver {
		StackResolver::new(Arc::clone(&self.shared))
	}

	/// Listens for inbound TCP connections on the tunnel address.
	pub fn listen(&self, port: u16) -> Result<VirtualTcpListener, DialError> {
		if self.shared.is_closed() {
			return Err(DialError::SessionClosed);
		}
		Ok(self.shared.engine.tcp_listener(port)?)
	}

	/// Raw handle on the user-space stack.
	pub fn stack(&self) -> &VirtualDevice {
		self.shared.engine.device()
	}

	pub fn engine(&self) -> &Arc<WgEngine> {
		&self.shared.engine
	}

	pub fn plan(&self) -> &AddressPlan {
		&self.shared.plan
	}

	/// Rendezvous address chosen at bring-up.
	pub fn endpoint(&self) -> SocketAddr {
		self.endpoint
	}

	pub fn is_closed(&self) -> bool {
		self.shared.is_closed()
	}

	/// Stops the engine and releases the interface and stack. Dialers and
	/// resolvers fail with a closed-session error from here on. Returns
	/// `false` if the session was already closed.
	#[instrument(skip(self), fields(local = %self.shared.plan.local_network))]
	pub fn close(&self) -> bool {
		let closed = self.shared.close();
		if closed {
			info!("tunnel session closed");
		}
		closed
	}

	/// Refuses new work through the session while the engine keeps running,
	/// so in-flight traffic such as deregistration can finish first.
	pub(crate) fn begin_close(&self) -> bool {
		self.shared.mark_closed()
	}
}

impl Drop for TunnelSession {
	fn drop(&mut self) {
		if self.shared.close() {
			debug!("tunnel session dropped while open, engine stopped");
		}
	}
}

impl std::fmt::Debug for TunnelSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TunnelSession")
			.field("plan", &self.shared.plan)
			.field("endpoint", &self.endpoint)
			.field("closed", &self.is_closed())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use fleetnet_common::{AddressPlanner, RendezvousEndpoint, WgPublicKey};

	fn descriptor(public_key: WgPublicKey, host: &str) -> PeerDescriptor {
		PeerDescriptor {
			public_key,
			assigned_address: "fdaa:0:1234:a7b:ab:0:a:2".parse().unwrap(),
			endpoint: RendezvousEndpoint::new(host, 51820),
		}
	}

	fn config() -> TunnelConfig {
		TunnelConfig {
			listen_addr: Some("127.0.0.1:0".parse().unwrap()),
			..TunnelConfig::default()
		}
	}

	#[tokio::test]
	async fn low_order_peer_key_is_engine_configuration_error() {
		let keys = LocalKeyPair::generate().unwrap();
		let descriptor = descriptor(WgPublicKey::from_bytes([0u8; 32]), "127.0.0.1");
		let plan = AddressPlanner::derive(descriptor.assigned_address);

		let err = TunnelSession::establish(&keys, &descriptor, &plan, &config())
			.await
			.unwrap_err();
		assert!(matches!(err, EstablishError::EngineConfiguration(_)));
	}

	#[tokio::test]
	async fn unresolvable_endpoint_fails_before_engine() {
		let keys = LocalKeyPair::generate().unwrap();
		let peer = *LocalKeyPair::generate().unwrap().public_key();
		let descriptor = descriptor(peer, "does-not-exist.invalid");
		let plan = AddressPlanner::derive(descriptor.assigned_address);
		let config = TunnelConfig {
			endpoint_resolve_timeout: Some(Duration::from_secs(5)),
			..config()
		};

		let err = TunnelSession::establish(&keys, &descriptor, &plan, &config)
			.await
			.unwrap_err();
		assert!(matches!(err, EstablishError::EndpointUnresolvable { .. }));
	}

	#[tokio::test]
	async fn close_is_idempotent() {
		let keys = LocalKeyPair::generate().unwrap();
		let peer = *LocalKeyPair::generate().unwrap().public_key();
		let descriptor = descriptor(peer, "127.0.0.1");
		let plan = AddressPlanner::derive(descriptor.assigned_address);

		let session = TunnelSession::establish(&keys, &descriptor, &plan, &config())
			.await
			.unwrap();
		assert!(!session.is_closed());
		assert_eq!(session.plan().resolver, plan.resolver);

		assert!(session.close());
		assert!(!session.close());
		assert!(session.is_closed());
		assert!(session.stack().is_closed());
		assert!(matches!(session.listen(8080), Err(DialError::SessionClosed)));
	}

	#[tokio::test]
	async fn begin_close_refuses_new_work_before_engine_stops() {
		let keys = LocalKeyPair::generate().unwrap();
		let peer = *LocalKeyPair::generate().unwrap().public_key();
		let descriptor = descriptor(peer, "127.0.0.1");
		let plan = AddressPlanner::derive(descriptor.assigned_address);

		let session = TunnelSession::establish(&keys, &descriptor, &plan, &config())
			.await
			.unwrap();
		assert!(session.begin_close());
		assert!(!session.begin_close());
		assert!(session.is_closed());
		assert!(!session.engine().is_closed());
		assert!(matches!(session.listen(8080), Err(DialError::SessionClosed)));
		assert!(session.shared.until_closed(async { 1 }).await.is_none());

		assert!(session.close());
		assert!(session.engine().is_closed());
		assert!(!session.close());
	}

	#[tokio::test]
	async fn dropping_session_stops_engine() {
		let keys = LocalKeyPair::generate().unwrap();
		let peer = *LocalKeyPair::generate().unwrap().public_key();
		let descriptor = descriptor(peer, "127.0.0.1");
		let plan = AddressPlanner::derive(descriptor.assigned_address);

		let session = TunnelSession::establish(&keys, &descriptor, &plan, &config())
			.await
			.unwrap();
		let engine = Arc::downgrade(session.engine());
		let local = session.engine().local_udp_addr().unwrap();
		drop(session);
		tokio::time::sleep(Duration::from_millis(200)).await;

		if let Some(engine) = engine.upgrade() {
			assert!(engine.is_closed());
		}
		assert!(engine.upgrade().is_none(), "engine tasks still hold the engine");
		std::net::UdpSocket::bind(local).expect("engine socket released");
	}

	#[test]
	fn bring_up_guard_shuts_down_on_drop() {
		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.unwrap();
		rt.block_on(async {
			let engine = WgEngine::new(WgEngineConfig {
				private_key: fleetnet_common::WgPrivateKey::generate().unwrap(),
				peer_public_key: *LocalKeyPair::generate().unwrap().public_key(),
				endpoint: "127.0.0.1:51820".parse().unwrap(),
				allowed_ips: vec!["fdaa:0:1234::/48".parse().unwrap()],
				interface: "fdaa:0:1234:a7b:ab:0:a:2/120".parse().unwrap(),
				mtu: 1420,
				persistent_keepalive: None,
				listen_addr: Some("127.0.0.1:0".parse().unwrap()),
			})
			.await
			.unwrap();

			{
				let mut guard = BringUp::new();
				guard.hold(Arc::clone(&engine));
			}
			assert!(engine.is_closed());
		});
	}
}
