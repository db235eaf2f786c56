// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::EstablishError;
use fleetnet_common::RendezvousEndpoint;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument};

/// Turns a rendezvous endpoint into one concrete socket address. When a name
/// resolves to several addresses one is chosen uniformly at random.
pub struct EndpointSelector {
	rng: Mutex<fastrand::Rng>,
}

impl EndpointSelector {
	pub fn new() -> Self {
		Self {
			rng: Mutex::new(fastrand::Rng::new()),
		}
	}

	pub fn with_seed(seed: u64) -> Self {
		Self {
			rng: Mutex::new(fastrand::Rng::with_seed(seed)),
		}
	}

	pub fn pick(&self, candidates: &[SocketAddr]) -> Option<SocketAddr> {
		if candidates.is_empty() {
			return None;
		}
		let index = match self.rng.lock() {
			Ok(mut rng) => rng.usize(..candidates.len()),
			Err(poisoned) => poisoned.into_inner().usize(..candidates.len()),
		};
		Some(candidates[index])
	}

	/// Resolves through the host resolver; the tunnel does not exist yet.
	#[instrument(skip(self), fields(%endpoint))]
	pub async fn resolve(
		&self,
		endpoint: &RendezvousEndpoint,
		timeout: Option<Duration>,
	) -> Result<SocketAddr, EstablishError> {
		if let Some(ip) = endpoint.literal_ip() {
			return Ok(SocketAddr::new(ip, endpoint.port()));
		}

		let unresolvable = |reason: String| EstablishError::EndpointUnresolvable {
			endpoint: endpoint.to_string(),
			reason,
		};

		let lookup = tokio::net::lookup_host((endpoint.host(), endpoint.port()));
		let candidates: Vec<SocketAddr> = match timeout {
			Some(limit) => tokio::time::timeout(limit, lookup)
				.await
				.map_err(|_| unresolvable(format!("lookup timed out after {limit:?}")))?,
			None => lookup.await,
		}
		.map_err(|e| unresolvable(e.to_string()))?
		.collect();

		let chosen = self
			.pick(&candidates)
			.ok_or_else(|| unresolvable("no addresses".to_string()))?;
		debug!(candidates = candidates.len(), %chosen, "resolved rendezvous endpoint");
		Ok(chosen)
	}
}

impl Default for EndpointSelector {
	fn default() -> Self {
		Self::new()
	}
}
