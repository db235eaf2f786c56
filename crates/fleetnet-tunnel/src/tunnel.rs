// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::TunnelConfig;
use crate::dialer::StackDialer;
use crate::endpoint::EndpointSelector;
use crate::error::{ResolveError, Result};
use crate::http::TunnelHttpClient;
use crate::resolver::StackResolver;
use crate::session::TunnelSession;
use crate::teardown::{TeardownCoordinator, TeardownOutcome};
use fleetnet_common::{AddressPlan, AddressPlanner, LocalKeyPair, PeerDescriptor, WgPublicKey};
use fleetnet_control::{ControlPlane, ControlPlaneConfig, PeerRegistrar, Registration};
use std::net::Ipv6Addr;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A registered peer with a live session: generate keys, register, derive
/// addresses, bring the session up. [`Tunnel::down`] undoes all of it.
pub struct Tunnel {
	session: TunnelSession,
	descriptor: PeerDescriptor,
	public_key: WgPublicKey,
	peer_name: String,
	teardown: TeardownCoordinator,
}

impl Tunnel {
	pub async fn establish(
		control: Arc<dyn ControlPlane>,
		config: &ControlPlaneConfig,
		tunnel_config: &TunnelConfig,
	) -> Result<Self> {
		let registrar = PeerRegistrar::new(control);
		Self::establish_with(
			&registrar,
			&config.org_id,
			&config.region,
			tunnel_config,
			&EndpointSelector::new(),
		)
		.await
	}

	/// Like [`Tunnel::establish`] with an explicit registrar and endpoint
	/// selector, so naming and endpoint choice can be seeded.
	#[instrument(skip(registrar, tunnel_config, selector))]
	pub async fn establish_with(
		registrar: &PeerRegistrar,
		org_id: &str,
		region: &str,
		tunnel_config: &TunnelConfig,
		selector: &EndpointSelector,
	) -> Result<Self> {
		let keys = LocalKeyPair::generate()?;
		let public_key = *keys.public_key();

		let Registration { descriptor, handle } = registrar.register(org_id, region, &public_key).await?;
		let peer_name = handle.peer_name().to_string();
		let teardown = TeardownCoordinator::new(Arc::clone(registrar.control()), handle);

		let plan = AddressPlanner::derive(descriptor.assigned_address);
		let session =
			match TunnelSession::establish_with(&keys, &descriptor, &plan, tunnel_config, selector).await {
				Ok(session) => session,
				Err(e) => {
					warn!(peer = %peer_name, error = %e, "bring-up failed, releasing registration");
					teardown.teardown(None).await;
					return Err(e.into());
				}
			};

		info!(peer = %peer_name, %plan, "tunnel established");
		Ok(Self {
			session,
			descriptor,
			public_key,
			peer_name,
			teardown,
		})
	}

	pub fn session(&self) -> &TunnelSession {
		&self.session
	}

	pub fn dialer(&self) -> StackDialer {
		self.session.dialer()
	}

	pub fn resolver(&self) -> StackResolver {
		self.session.resolver()
	}

	/// HTTP client over the tunnel, optionally authenticated with the
	/// control-plane token.
	pub fn http_client(&self, config: Option<&ControlPlaneConfig>) -> TunnelHttpClient {
		let client = TunnelHttpClient::new(self.dialer());
		match config {
			Some(config) => client
				.with_token(config.token.clone())
				.with_force_trace(config.debug_trace),
			None => client,
		}
	}

	pub async fn lookup_aaaa(&self, name: &str) -> std::result::Result<Vec<Ipv6Addr>, ResolveError> {
		self.resolver().lookup_aaaa(name).await
	}

	pub fn plan(&self) -> &AddressPlan {
		self.session.plan()
	}

	pub fn descriptor(&self) -> &PeerDescriptor {
		&self.descriptor
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public_key
	}

	pub fn peer_name(&self) -> &str {
		&self.peer_name
	}

	pub fn is_down(&self) -> bool {
		self.teardown.is_released() && self.session.is_closed()
	}

	/// Deregisters the peer and closes the session. Safe to call more than
	/// once and concurrently with in-flight dials.
	#[instrument(skip(self), fields(peer = %self.peer_name))]
	pub async fn down(&self) -> TeardownOutcome {
		self.teardown.teardown(Some(&self.session)).await
	}
}

impl Drop for Tunnel {
	fn drop(&mut self) {
		if !self.teardown.is_released() {
			warn!(peer = %self.peer_name, "tunnel dropped without down(), peer record left registered");
		}
		self.session.close();
	}
}

impl std::fmt::Debug for Tunnel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Tunnel")
			.field("peer_name", &self.peer_name)
			.field("public_key", &self.public_key)
			.field("session", &self.session)
			.finish()
	}
}
