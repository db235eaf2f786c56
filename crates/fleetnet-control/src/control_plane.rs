// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane seam and its GraphQL implementation.

use crate::config::ControlPlaneConfig;
use crate::error::{ConfigError, RegistrationError, Result};
use crate::http::{self, FORCE_TRACE_HEADER};
use async_trait::async_trait;
use fleetnet_common::{
	parse_assigned, PeerDescriptor, RendezvousEndpoint, SecretString, WgPublicKey,
	DEFAULT_ENDPOINT_PORT,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPeerRequest {
	pub org_id: String,
	pub region: String,
	pub name: String,
	pub public_key: WgPublicKey,
}

/// The authority that assigns addresses and records peers.
#[async_trait]
pub trait ControlPlane: Send + Sync {
	async fn add_peer(&self, request: AddPeerRequest) -> Result<PeerDescriptor>;

	async fn remove_peer(&self, org_id: &str, name: &str) -> Result<()>;
}

const ADD_PEER_MUTATION: &str = r#"mutation($input: AddWireGuardPeerInput!) {
	addWireGuardPeer(input: $input) {
		endpointip
		pubkey
		peerip
	}
}"#;

const REMOVE_PEER_MUTATION: &str = r#"mutation($input: RemoveWireGuardPeerInput!) {
	removeWireGuardPeer(input: $input) {
		organization {
			id
		}
	}
}"#;

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a, V> {
	query: &'a str,
	variables: V,
}

#[derive(Debug, Serialize)]
struct InputVariables<I> {
	input: I,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddWireGuardPeerInput<'a> {
	organization_id: &'a str,
	region: &'a str,
	name: &'a str,
	pubkey: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoveWireGuardPeerInput<'a> {
	organization_id: &'a str,
	name: &'a str,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<D> {
	data: Option<D>,
	#[serde(default)]
	errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
	message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddPeerData {
	add_wire_guard_peer: Option<WirePeer>,
}

/// Wire shape of a registered peer.
#[derive(Debug, Deserialize)]
struct WirePeer {
	pubkey: String,
	peerip: String,
	endpointip: String,
}

impl WirePeer {
	fn into_descriptor(self) -> Result<PeerDescriptor> {
		let public_key = WgPublicKey::from_base64(&self.pubkey)
			.map_err(|e| RegistrationError::InvalidResponse(format!("pubkey: {e}")))?;
		let assigned_address = parse_assigned(&self.peerip)
			.map_err(|e| RegistrationError::InvalidResponse(format!("peerip: {e}")))?;
		let endpoint = RendezvousEndpoint::parse(&self.endpointip, DEFAULT_ENDPOINT_PORT)
			.map_err(|e| RegistrationError::InvalidResponse(format!("endpointip: {e}")))?;
		Ok(PeerDescriptor {
			public_key,
			assigned_address,
			endpoint,
		})
	}
}

pub struct GraphqlControlPlane {
	http: Client,
	api_url: Url,
	token: SecretString,
	debug_trace: bool,
}

impl GraphqlControlPlane {
	pub fn new(config: &ControlPlaneConfig) -> std::result::Result<Self, ConfigError> {
		let http = http::new_client_with_timeout(config.request_timeout)?;
		Ok(Self {
			http,
			api_url: config.api_url.clone(),
			token: config.token.clone(),
			debug_trace: config.debug_trace,
		})
	}

	async fn execute<V, D>(&self, query: &str, variables: V) -> Result<D>
	where
		V: Serialize + Send,
		D: for<'de> Deserialize<'de>,
	{
		let mut request = self
			.http
			.post(self.api_url.clone())
			.bearer_auth(self.token.expose())
			.json(&GraphqlRequest { query, variables });
		if self.debug_trace {
			request = request.header(FORCE_TRACE_HEADER, "true");
		}

		let response = request.send().await?;
		let status = response.status();
		if status.is_server_error() {
			let message = response.text().await.unwrap_or_default();
			return Err(RegistrationError::ControlPlaneUnreachable(format!(
				"HTTP {}: {}",
				status.as_u16(),
				message
			)));
		}
		if !status.is_success() {
			let message = response.text().await.unwrap_or_default();
			return Err(RegistrationError::rejected(format!(
				"HTTP {}: {}",
				status.as_u16(),
				message
			)));
		}

		let body: GraphqlResponse<D> = response.json().await?;
		if !body.errors.is_empty() {
			let reason = body
				.errors
				.into_iter()
				.map(|e| e.message)
				.collect::<Vec<_>>()
				.join("; ");
			return Err(RegistrationError::rejected(reason));
		}

		body
			.data
			.ok_or_else(|| RegistrationError::InvalidResponse("response carried no data".to_string()))
	}
}

#[async_trait]
impl ControlPlane for GraphqlControlPlane {
	#[instrument(skip(self, request), fields(org = %request.org_id, region = %request.region, name = %request.name))]
	async fn add_peer(&self, request: AddPeerRequest) -> Result<PeerDescriptor> {
		let variables = InputVariables {
			input: AddWireGuardPeerInput {
				organization_id: &request.org_id,
				region: &request.region,
				name: &request.name,
				pubkey: request.public_key.to_base64(),
			},
		};

		let data: AddPeerData = self.execute(ADD_PEER_MUTATION, variables).await?;
		let peer = data.add_wire_guard_peer.ok_or_else(|| {
			RegistrationError::InvalidResponse("addWireGuardPeer returned null".to_string())
		})?;
		let descriptor = peer.into_descriptor()?;

		debug!(
			assigned = %descriptor.assigned_address,
			endpoint = %descriptor.endpoint,
			"peer registered"
		);
		Ok(descriptor)
	}

	#[instrument(skip(self))]
	async fn remove_peer(&self, org_id: &str, name: &str) -> Result<()> {
		let variables = InputVariables {
			input: RemoveWireGuardPeerInput {
				organization_id: org_id,
				name,
			},
		};
		let _: Value = self.execute(REMOVE_PEER_MUTATION, variables).await?;
		debug!("peer removed");
		Ok(())
	}
}
