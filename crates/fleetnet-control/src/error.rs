// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistrationError {
	/// The request never produced an answer from the authority: connect
	/// failure, timeout, or a 5xx from the transport.
	#[error("control plane unreachable: {0}")]
	ControlPlaneUnreachable(String),

	/// The authority answered and refused, e.g. unknown organization or
	/// region.
	#[error("registration rejected: {reason}")]
	RegistrationRejected { reason: String },

	/// The authority accepted but the peer descriptor could not be used.
	#[error("invalid peer descriptor from control plane: {0}")]
	InvalidResponse(String),
}

impl RegistrationError {
	pub fn rejected(reason: impl Into<String>) -> Self {
		Self::RegistrationRejected {
			reason: reason.into(),
		}
	}
}

impl From<reqwest::Error> for RegistrationError {
	fn from(e: reqwest::Error) -> Self {
		if e.is_decode() {
			Self::InvalidResponse(e.to_string())
		} else {
			Self::ControlPlaneUnreachable(e.to_string())
		}
	}
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("missing environment variable: {0}")]
	MissingEnv(String),

	#[error("parse error: {0}")]
	Parse(String),

	#[error("failed to build HTTP client: {0}")]
	HttpClient(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, RegistrationError>;
