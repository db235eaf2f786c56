// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane client for fleetnet tunnels.
//!
//! Registers a local public key with the platform authority, receives the
//! remote peer's descriptor, and removes the peer record on teardown.

pub mod config;
pub mod control_plane;
pub mod error;
pub mod http;
pub mod registrar;

pub use config::{ControlPlaneConfig, DEFAULT_API_URL, DEFAULT_ORG, DEFAULT_REQUEST_TIMEOUT};
pub use control_plane::{AddPeerRequest, ControlPlane, GraphqlControlPlane};
pub use error::{ConfigError, RegistrationError, Result};
pub use registrar::{PeerNamer, PeerRegistrar, Registration, DEFAULT_PEER_PREFIX};
