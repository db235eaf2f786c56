// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! User-space tunnels into a private fleet network.
//!
//! A [`Tunnel`] registers a fresh WireGuard key with the control plane,
//! derives its addressing from the assigned address and brings up a
//! [`TunnelSession`]: a WireGuard engine feeding a user-space TCP/IP stack.
//! Name resolution ([`StackResolver`]) and TCP dialing ([`StackDialer`]) go
//! through that stack, so nothing touches the host's interfaces or resolver.

pub mod config;
pub mod dialer;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod resolver;
pub mod session;
pub mod teardown;
pub mod tunnel;

pub use config::{TunnelConfig, DEFAULT_DIAL_TIMEOUT, DEFAULT_DNS_TIMEOUT};
pub use dialer::{StackDialer, TunnelConnection};
pub use endpoint::EndpointSelector;
pub use error::{DialError, EstablishError, HttpError, ResolveError, Result, TunnelError};
pub use http::TunnelHttpClient;
pub use resolver::StackResolver;
pub use session::TunnelSession;
pub use teardown::{teardown, TeardownCoordinator, TeardownOutcome};
pub use tunnel::Tunnel;

pub use hickory_proto::rr::RecordType;
