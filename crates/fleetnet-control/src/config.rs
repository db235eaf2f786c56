// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::ConfigError;
use fleetnet_common::SecretString;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.fly.io/graphql";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ORG: &str = "personal";

fn validate_https_url(url: &Url) -> Result<(), ConfigError> {
	if url.scheme() != "https" {
		return Err(ConfigError::Parse(
			"control plane URL must use https://".to_string(),
		));
	}
	Ok(())
}

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
	pub api_url: Url,
	/// Used only by the control-plane transport and the tunnel HTTP client.
	pub token: SecretString,
	pub org_id: String,
	pub region: String,
	pub debug_trace: bool,
	pub request_timeout: Duration,
}

impl ControlPlaneConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		let api_url: Url = std::env::var("FLEETNET_API_URL")
			.unwrap_or_else(|_| DEFAULT_API_URL.to_string())
			.parse()
			.map_err(|e| ConfigError::Parse(format!("invalid FLEETNET_API_URL: {e}")))?;
		validate_https_url(&api_url)?;

		let token = std::env::var("FLY_API_TOKEN")
			.or_else(|_| std::env::var("FLY_TOKEN"))
			.map_err(|_| ConfigError::MissingEnv("FLY_API_TOKEN".to_string()))?;

		let org_id = std::env::var("FLEETNET_ORG").unwrap_or_else(|_| DEFAULT_ORG.to_string());
		let region = std::env::var("FLEETNET_REGION")
			.map_err(|_| ConfigError::MissingEnv("FLEETNET_REGION".to_string()))?;

		let debug_trace = std::env::var("FLEETNET_DEBUG_TRACE")
			.map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
			.unwrap_or(false);

		let request_timeout = std::env::var("FLEETNET_HTTP_TIMEOUT_SECS")
			.ok()
			.and_then(|s| s.parse().ok())
			.map(Duration::from_secs)
			.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

		Ok(Self {
			api_url,
			token: SecretString::new(token),
			org_id,
			region,
			debug_trace,
			request_timeout,
		})
	}

	pub fn new(
		api_url: Url,
		token: SecretString,
		org_id: impl Into<String>,
		region: impl Into<String>,
	) -> Result<Self, ConfigError> {
		validate_https_url(&api_url)?;
		Ok(Self::new_insecure(api_url, token, org_id, region))
	}

	/// Skips the https check, for pointing at a local mock server.
	pub fn new_insecure(
		api_url: Url,
		token: SecretString,
		org_id: impl Into<String>,
		region: impl Into<String>,
	) -> Self {
		Self {
			api_url,
			token,
			org_id: org_id.into(),
			region: region.into(),
			debug_trace: false,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
		}
	}
}
