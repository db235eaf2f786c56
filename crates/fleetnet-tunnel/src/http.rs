// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP client whose transport is the tunnel.

use crate::dialer::StackDialer;
use crate::error::HttpError;
use bytes::Bytes;
use fleetnet_common::SecretString;
use fleetnet_control::http::{user_agent, FORCE_TRACE_HEADER};
use http::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, instrument};

/// Every connection this client opens goes through the session's
/// [`StackDialer`]; the host network is never used.
#[derive(Clone)]
pub struct TunnelHttpClient {
	client: Client<StackDialer, Full<Bytes>>,
	token: Option<SecretString>,
	force_trace: bool,
}

impl TunnelHttpClient {
	pub fn new(dialer: StackDialer) -> Self {
		let client = Client::builder(TokioExecutor::new()).build(dialer);
		Self {
			client,
			token: None,
			force_trace: false,
		}
	}

	/// Sends `Authorization: Bearer <token>` on every request.
	pub fn with_token(mut self, token: SecretString) -> Self {
		self.token = Some(token);
		self
	}

	/// Sends `Fly-Force-Trace: true` on every request.
	pub fn with_force_trace(mut self, enabled: bool) -> Self {
		self.force_trace = enabled;
		self
	}

	#[instrument(skip_all, fields(method = %request.method(), uri = %request.uri()))]
	pub async fn request(&self, mut request: Request<Full<Bytes>>) -> Result<Response<Incoming>, HttpError> {
		let headers = request.headers_mut();
		if !headers.contains_key(USER_AGENT) {
			headers.insert(USER_AGENT, HeaderValue::from_str(&user_agent())?);
		}
		if let Some(token) = &self.token {
			let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))?;
			value.set_sensitive(true);
			headers.insert(AUTHORIZATION, value);
		}
		if self.force_trace {
			headers.insert(FORCE_TRACE_HEADER, HeaderValue::from_static("true"));
		}

		let response = self.client.request(request).await?;
		debug!(status = %response.status(), "tunnel http response");
		Ok(response)
	}

	pub async fn get(&self, uri: Uri) -> Result<Response<Incoming>, HttpError> {
		let request = Request::builder()
			.method(Method::GET)
			.uri(uri)
			.body(Full::new(Bytes::new()))?;
		self.request(request).await
	}

	/// GET `uri` and read the whole body.
	pub async fn get_bytes(&self, uri: Uri) -> Result<(StatusCode, Bytes), HttpError> {
		let response = self.get(uri).await?;
		let status = response.status();
		let body = response.into_body().collect().await?.to_bytes();
		Ok((status, body))
	}
}

impl std::fmt::Debug for TunnelHttpClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TunnelHttpClient")
			.field("authenticated", &self.token.is_some())
			.field("force_trace", &self.force_trace)
			.finish()
	}
}
