// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod address;
pub mod keys;
pub mod peer;
pub mod secret;

pub use address::{
	parse_assigned, AddressError, AddressPlan, AddressPlanner, DNS_PORT, LOCAL_PREFIX_LEN,
	REMOTE_PREFIX_LEN, RESOLVER_HOST_INDEX,
};
pub use keys::{KeyError, LocalKeyPair, WgPrivateKey, WgPublicKey, KEY_LEN};
pub use peer::{
	EndpointError, PeerDescriptor, RegistrationHandle, RendezvousEndpoint, DEFAULT_ENDPOINT_PORT,
};
pub use secret::{Secret, SecretString, REDACTED};
