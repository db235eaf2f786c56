// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::session::TunnelSession;
use fleetnet_common::RegistrationHandle;
use fleetnet_control::ControlPlane;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
	/// This call released the registration and closed the session.
	Completed,
	/// An earlier call already did.
	AlreadyClosed,
}

/// Releases a tunnel exactly once. The session stops accepting dials and
/// lookups first, then the server-side peer record is released best effort,
/// then the engine and its stack go down.
pub struct TeardownCoordinator {
	control: Arc<dyn ControlPlane>,
	handle: Mutex<Option<RegistrationHandle>>,
}

impl TeardownCoordinator {
	pub fn new(control: Arc<dyn ControlPlane>, handle: RegistrationHandle) -> Self {
		Self {
			control,
			handle: Mutex::new(Some(handle)),
		}
	}

	/// Peer name of the registration, while it is still held.
	pub fn peer_name(&self) -> Option<String> {
		self.lock().as_ref().map(|h| h.peer_name().to_string())
	}

	pub fn is_released(&self) -> bool {
		self.lock().is_none()
	}

	/// Deregisters the peer and closes `session`. `session` is `None` when
	/// bring-up failed before a session existed. A deregistration failure is
	/// logged and otherwise ignored; the control plane reaps stale peers.
	#[instrument(skip_all)]
	pub async fn teardown(&self, session: Option<&TunnelSession>) -> TeardownOutcome {
		// Under the handle lock so concurrent callers agree on who owns teardown.
		let (began, handle) = {
			let mut guard = self.lock();
			let began = session.is_some_and(|s| s.begin_close());
			(began, guard.take())
		};
		if !began && handle.is_none() {
			return TeardownOutcome::AlreadyClosed;
		}

		if let Some(handle) = handle {
			match self
				.control
				.remove_peer(handle.org_id(), handle.peer_name())
				.await
			{
				Ok(()) => info!(peer = %handle, "deregistered tunnel peer"),
				Err(e) => warn!(peer = %handle, error = %e, "failed to deregister tunnel peer"),
			}
		}

		if let Some(session) = session {
			session.close();
		}
		TeardownOutcome::Completed
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Option<RegistrationHandle>> {
		match self.handle.lock() {
			Ok(guard) => guard,
			Err(poisoned) => poisoned.into_inner(),
		}
	}
}

impl std::fmt::Debug for TeardownCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TeardownCoordinator")
			.field("handle", &*self.lock())
			.finish()
	}
}

/// One-shot form of [`TeardownCoordinator::teardown`].
pub async fn teardown(
	control: Arc<dyn ControlPlane>,
	session: Option<&TunnelSession>,
	handle: RegistrationHandle,
) -> TeardownOutcome {
	TeardownCoordinator::new(control, handle)
		.teardown(session)
		.await
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use fleetnet_common::PeerDescriptor;
	use fleetnet_control::{AddPeerRequest, RegistrationError};
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[derive(Default)]
	struct CountingControlPlane {
		removed: AtomicUsize,
		fail_removal: bool,
	}

	#[async_trait]
	impl ControlPlane for CountingControlPlane {
		async fn add_peer(&self, _request: AddPeerRequest) -> fleetnet_control::Result<PeerDescriptor> {
			Err(RegistrationError::rejected("not used"))
		}

		async fn remove_peer(&self, _org_id: &str, _name: &str) -> fleetnet_control::Result<()> {
			self.removed.fetch_add(1, Ordering::SeqCst);
			if self.fail_removal {
				Err(RegistrationError::ControlPlaneUnreachable("connection refused".to_string()))
			} else {
				Ok(())
			}
		}
	}

	fn handle() -> RegistrationHandle {
		RegistrationHandle::new("personal", "fleetnet-tunnel-1-deadbeef", "ord")
	}

	#[tokio::test]
	async fn second_teardown_is_already_closed() {
		let control = Arc::new(CountingControlPlane::default());
		let coordinator = TeardownCoordinator::new(control.clone(), handle());
		assert_eq!(coordinator.peer_name().as_deref(), Some("fleetnet-tunnel-1-deadbeef"));

		assert_eq!(coordinator.teardown(None).await, TeardownOutcome::Completed);
		assert_eq!(coordinator.teardown(None).await, TeardownOutcome::AlreadyClosed);
		assert_eq!(control.removed.load(Ordering::SeqCst), 1);
		assert!(coordinator.is_released());
	}

	#[test]
	fn deregistration_failure_is_not_fatal() {
		let control = Arc::new(CountingControlPlane {
			fail_removal: true,
			..Default::default()
		});

		let outcome = tokio_test::block_on(teardown(control.clone(), None, handle()));
		assert_eq!(outcome, TeardownOutcome::Completed);
		assert_eq!(control.removed.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn concurrent_teardowns_deregister_once() {
		let control = Arc::new(CountingControlPlane::default());
		let coordinator = Arc::new(TeardownCoordinator::new(control.clone(), handle()));

		let tasks: Vec<_> = (0..8)
			.map(|_| {
				let coordinator = Arc::clone(&coordinator);
				tokio::spawn(async move { coordinator.teardown(None).await })
			})
			.collect();

		let mut completed = 0;
		for task in tasks {
			if task.await.unwrap() == TeardownOutcome::Completed {
				completed += 1;
			}
		}
		assert_eq!(completed, 1);
		assert_eq!(control.removed.load(Ordering::SeqCst), 1);
	}
}
