// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::control_plane::{AddPeerRequest, ControlPlane};
use crate::error::{RegistrationError, Result};
use fleetnet_common::{PeerDescriptor, RegistrationHandle, WgPublicKey};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, instrument, warn};

pub const DEFAULT_PEER_PREFIX: &str = "fleetnet-tunnel";

/// Generates peer names of the form `<prefix>-<unix-secs>-<hex>`. The random
/// suffix keeps two bring-ups within the same second from colliding.
pub struct PeerNamer {
	prefix: String,
	rng: Mutex<fastrand::Rng>,
}

impl PeerNamer {
	pub fn new(prefix: impl Into<String>) -> Self {
		Self {
			prefix: prefix.into(),
			rng: Mutex::new(fastrand::Rng::new()),
		}
	}

	pub fn with_seed(prefix: impl Into<String>, seed: u64) -> Self {
		Self {
			prefix: prefix.into(),
			rng: Mutex::new(fastrand::Rng::with_seed(seed)),
		}
	}

	pub fn next_name(&self) -> String {
		let secs = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or_default();
		let suffix = match self.rng.lock() {
			Ok(mut rng) => rng.u32(..),
			Err(poisoned) => poisoned.into_inner().u32(..),
		};
		format!("{}-{}-{:08x}", self.prefix, secs, suffix)
	}
}

impl Default for PeerNamer {
	fn default() -> Self {
		Self::new(DEFAULT_PEER_PREFIX)
	}
}

/// A successful registration: what the authority told us about the remote
/// end, plus the handle that later releases the record.
#[derive(Debug)]
pub struct Registration {
	pub descriptor: PeerDescriptor,
	pub handle: RegistrationHandle,
}

pub struct PeerRegistrar {
	control: Arc<dyn ControlPlane>,
	namer: PeerNamer,
}

impl PeerRegistrar {
	pub fn new(control: Arc<dyn ControlPlane>) -> Self {
		Self {
			control,
			namer: PeerNamer::default(),
		}
	}

	pub fn with_namer(control: Arc<dyn ControlPlane>, namer: PeerNamer) -> Self {
		Self { control, namer }
	}

	pub fn control(&self) -> &Arc<dyn ControlPlane> {
		&self.control
	}

	/// Announces `public_key` to the control plane. No retries: a failure is
	/// surfaced to the caller as-is and nothing is left registered. A reply
	/// that cannot be understood may still have created the record, so that
	/// case releases the name before returning.
	#[instrument(skip(self, public_key), fields(public_key = %public_key))]
	pub async fn register(
		&self,
		org_id: &str,
		region: &str,
		public_key: &WgPublicKey,
	) -> Result<Registration> {
		let name = self.namer.next_name();
		let added = self
			.control
			.add_peer(AddPeerRequest {
				org_id: org_id.to_string(),
				region: region.to_string(),
				name: name.clone(),
				public_key: *public_key,
			})
			.await;
		let descriptor = match added {
			Ok(descriptor) => descriptor,
			Err(e @ RegistrationError::InvalidResponse(_)) => {
				if let Err(remove_err) = self.control.remove_peer(org_id, &name).await {
					warn!(peer = %name, error = %remove_err, "failed to release peer after unusable reply");
				}
				return Err(e);
			}
			Err(e) => return Err(e),
		};

		info!(peer = %name, assigned = %descriptor.assigned_address, "registered tunnel peer");

		Ok(Registration {
			descriptor,
			handle: RegistrationHandle::new(org_id, name, region),
		})
	}
}
