// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use fleetnet_common::KeyError;
use fleetnet_control::RegistrationError;
use fleetnet_engine::EngineError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EstablishError {
	#[error("rendezvous endpoint {endpoint} unresolvable: {reason}")]
	EndpointUnresolvable { endpoint: String, reason: String },

	#[error("engine configuration error: {0}")]
	EngineConfiguration(#[source] EngineError),

	#[error("virtual stack error: {0}")]
	Stack(#[source] EngineError),
}

impl From<EngineError> for EstablishError {
	fn from(e: EngineError) -> Self {
		match e {
			EngineError::InvalidConfig(_) | EngineError::WireGuard(_) => Self::EngineConfiguration(e),
			other => Self::Stack(other),
		}
	}
}

#[derive(Debug, Error)]
pub enum DialError {
	#[error("connection refused by {0}")]
	Refused(String),

	#[error("{0} unreachable through the tunnel")]
	Unreachable(String),

	#[error("dial timed out after {0:?}")]
	TimedOut(Duration),

	#[error("tunnel session closed")]
	SessionClosed,

	#[error("invalid dial target: {0}")]
	InvalidTarget(String),

	#[error("name resolution failed: {0}")]
	Resolve(#[from] ResolveError),

	#[error("virtual stack error: {0}")]
	Stack(String),
}

impl From<EngineError> for DialError {
	fn from(e: EngineError) -> Self {
		match e {
			EngineError::Closed => Self::SessionClosed,
			EngineError::ConnectionRefused(addr) => Self::Refused(addr),
			EngineError::NoRoute(addr) => Self::Unreachable(addr),
			other => Self::Stack(other.to_string()),
		}
	}
}

#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("DNS resolution timed out after {0:?}")]
	ResolutionTimedOut(Duration),

	#[error("tunnel session closed")]
	SessionClosed,

	#[error("could not reach resolver: {0}")]
	Dial(String),

	#[error("DNS protocol error: {0}")]
	Protocol(String),

	#[error("resolver answered {0}")]
	ServerFailure(String),

	#[error("invalid DNS name {0:?}")]
	InvalidName(String),
}

impl From<hickory_proto::error::ProtoError> for ResolveError {
	fn from(e: hickory_proto::error::ProtoError) -> Self {
		Self::Protocol(e.to_string())
	}
}

#[derive(Debug, Error)]
pub enum HttpError {
	#[error("request through the tunnel failed: {0}")]
	Request(#[from] hyper_util::client::legacy::Error),

	#[error("invalid request: {0}")]
	Http(#[from] http::Error),

	#[error("invalid header value: {0}")]
	InvalidHeader(#[from] http::header::InvalidHeaderValue),

	#[error("reading response body failed: {0}")]
	Body(#[from] hyper::Error),
}

/// Errors from the full bring-up: key generation, registration and session
/// establishment.
#[derive(Debug, Error)]
pub enum TunnelError {
	#[error(transparent)]
	Key(#[from] KeyError),

	#[error(transparent)]
	Registration(#[from] RegistrationError),

	#[error(transparent)]
	Establish(#[from] EstablishError),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
