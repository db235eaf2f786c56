// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end tests over loopback UDP.
//!
//! The fake control plane answers a registration by bringing up a second
//! session that plays the fleet: it owns the resolver address, serves DNS
//! over TCP on port 53, an echo service on port 7 and a tiny HTTP server on
//! port 80. The tunnel under test then talks WireGuard to it for real.

use async_trait::async_trait;
use fleetnet_common::{
	AddressPlan, LocalKeyPair, PeerDescriptor, RendezvousEndpoint, SecretString,
};
use fleetnet_control::{
	AddPeerRequest, ControlPlane, ControlPlaneConfig, PeerNamer, PeerRegistrar, RegistrationError,
};
use fleetnet_engine::{VirtualTcpListener, VirtualTcpStream};
use fleetnet_tunnel::{
	DialError, EndpointSelector, EstablishError, ResolveError, TeardownOutcome, Tunnel,
	TunnelConfig, TunnelError, TunnelSession,
};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::AAAA;
use hickory_proto::rr::{RData, Record, RecordType};
use ipnet::Ipv6Net;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const CLIENT_ADDR: &str = "fdaa:0:1234:a7b:ab:0:a:2";
const FLEET_ADDR: &str = "fdaa:0:1234::3";
const ECHO_NAME: &str = "echo.internal.";
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
	Serve,
	Reject,
	UnresolvableEndpoint,
}

struct FleetControlPlane {
	mode: Mode,
	removal_delay: Duration,
	added: AtomicUsize,
	removed: AtomicUsize,
	responders: Mutex<Vec<TunnelSession>>,
}

impl FleetControlPlane {
	fn new(mode: Mode) -> Arc<Self> {
		Self::with_removal_delay(mode, Duration::ZERO)
	}

	fn with_removal_delay(mode: Mode, removal_delay: Duration) -> Arc<Self> {
		Arc::new(Self {
			mode,
			removal_delay,
			added: AtomicUsize::new(0),
			removed: AtomicUsize::new(0),
			responders: Mutex::new(Vec::new()),
		})
	}

	fn responder_count(&self) -> usize {
		self.responders.lock().unwrap().len()
	}

	async fn bring_up_fleet(&self, client_key: fleetnet_common::WgPublicKey) -> Result<PeerDescriptor, String> {
		let fleet_addr: Ipv6Addr = FLEET_ADDR.parse().unwrap();
		let client_addr: Ipv6Addr = CLIENT_ADDR.parse().unwrap();
		let keys = LocalKeyPair::generate().map_err(|e| e.to_string())?;

		let plan = AddressPlan {
			local_network: Ipv6Net::new(fleet_addr, 48).unwrap(),
			remote_network: Ipv6Net::new(client_addr, 120).unwrap().trunc(),
			resolver: fleet_addr,
		};
		// The client's real address is learned from its first handshake.
		let placeholder = PeerDescriptor {
			public_key: client_key,
			assigned_address: client_addr,
			endpoint: RendezvousEndpoint::new("127.0.0.1", 9),
		};
		let session = TunnelSession::establish(&keys, &placeholder, &plan, &loopback_config())
			.await
			.map_err(|e| e.to_string())?;

		tokio::spawn(serve_dns(session.listen(53).map_err(|e| e.to_string())?, fleet_addr));
		tokio::spawn(serve_echo(session.listen(7).map_err(|e| e.to_string())?));
		tokio::spawn(serve_http(session.listen(80).map_err(|e| e.to_string())?));

		let port = session
			.engine()
			.local_udp_addr()
			.map_err(|e| e.to_string())?
			.port();
		self.responders.lock().unwrap().push(session);

		Ok(PeerDescriptor {
			public_key: *keys.public_key(),
			assigned_address: client_addr,
			endpoint: RendezvousEndpoint::new("127.0.0.1", port),
		})
	}
}

#[async_trait]
impl ControlPlane for FleetControlPlane {
	async fn add_peer(&self, request: AddPeerRequest) -> fleetnet_control::Result<PeerDescriptor> {
		self.added.fetch_add(1, Ordering::SeqCst);
		match self.mode {
			Mode::Reject => Err(RegistrationError::rejected("unknown region")),
			Mode::UnresolvableEndpoint => Ok(PeerDescriptor {
				public_key: *LocalKeyPair::generate().unwrap().public_key(),
				assigned_address: CLIENT_ADDR.parse().unwrap(),
				endpoint: RendezvousEndpoint::new("does-not-exist.invalid", 51820),
			}),
			Mode::Serve => self
				.bring_up_fleet(request.public_key)
				.await
				.map_err(RegistrationError::ControlPlaneUnreachable),
		}
	}

	async fn remove_peer(&self, _org_id: &str, _name: &str) -> fleetnet_control::Result<()> {
		if !self.removal_delay.is_zero() {
			tokio::time::sleep(self.removal_delay).await;
		}
		self.removed.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

fn loopback_config() -> TunnelConfig {
	TunnelConfig {
		listen_addr: Some("127.0.0.1:0".parse().unwrap()),
		endpoint_resolve_timeout: Some(Duration::from_secs(5)),
		..TunnelConfig::default()
	}
}

fn control_config() -> ControlPlaneConfig {
	ControlPlaneConfig::new_insecure(
		"http://127.0.0.1:1/graphql".parse().unwrap(),
		SecretString::new("test-token".to_string()),
		"personal",
		"ord",
	)
}

async fn establish(control: Arc<FleetControlPlane>) -> Result<Tunnel, TunnelError> {
	let registrar = PeerRegistrar::with_namer(control, PeerNamer::with_seed("fleetnet-test", 7));
	Tunnel::establish_with(
		&registrar,
		"personal",
		"ord",
		&loopback_config(),
		&EndpointSelector::with_seed(7),
	)
	.await
}

fn dns_answer(request: &Message, answer: Ipv6Addr) -> Message {
	let mut response = Message::new();
	response
		.set_id(request.id())
		.set_message_type(MessageType::Response)
		.set_op_code(OpCode::Query)
		.set_recursion_desired(request.recursion_desired())
		.set_recursion_available(true);
	response.add_queries(request.queries().to_vec());

	let known = request
		.queries()
		.iter()
		.find(|q| q.name().to_ascii() == ECHO_NAME && q.query_type() == RecordType::AAAA);
	match known {
		Some(query) => {
			response.add_answer(Record::from_rdata(
				query.name().clone(),
				60,
				RData::AAAA(AAAA(answer)),
			));
		}
		None => {
			response.set_response_code(ResponseCode::NXDomain);
		}
	}
	response
}

async fn serve_dns(mut listener: VirtualTcpListener, answer: Ipv6Addr) {
	while let Ok((mut stream, _)) = listener.accept().await {
		tokio::spawn(async move {
			let mut len = [0u8; 2];
			if stream.read_exact(&mut len).await.is_err() {
				return;
			}
			let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
			if stream.read_exact(&mut buf).await.is_err() {
				return;
			}
			let Ok(request) = Message::from_vec(&buf) else {
				return;
			};
			let bytes = dns_answer(&request, answer).to_vec().unwrap();
			let _ = stream.write_all(&(bytes.len() as u16).to_be_bytes()).await;
			let _ = stream.write_all(&bytes).await;
			let _ = stream.flush().await;
		});
	}
}

async fn serve_echo(mut listener: VirtualTcpListener) {
	while let Ok((mut stream, _)) = listener.accept().await {
		tokio::spawn(async move {
			let mut buf = [0u8; 1024];
			loop {
				match stream.read(&mut buf).await {
					Ok(0) | Err(_) => break,
					Ok(n) => {
						if stream.write_all(&buf[..n]).await.is_err() {
							break;
						}
					}
				}
			}
		});
	}
}

async fn read_request_head(stream: &mut VirtualTcpStream) -> Option<String> {
	let mut head = Vec::new();
	let mut buf = [0u8; 1024];
	while !head.windows(4).any(|w| w == b"\r\n\r\n") {
		match stream.read(&mut buf).await {
			Ok(0) | Err(_) => return None,
			Ok(n) => head.extend_from_slice(&buf[..n]),
		}
	}
	String::from_utf8(head).ok()
}

/// Answers every request with the Authorization header it carried.
async fn serve_http(mut listener: VirtualTcpListener) {
	while let Ok((mut stream, _)) = listener.accept().await {
		tokio::spawn(async move {
			let Some(head) = read_request_head(&mut stream).await else {
				return;
			};
			let auth = head
				.lines()
				.filter_map(|line| line.split_once(':'))
				.find(|(name, _)| name.trim().eq_ignore_ascii_case("authorization"))
				.map(|(_, value)| value.trim().to_string())
				.unwrap_or_else(|| "anonymous".to_string());

			let response = format!(
				"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
				auth.len(),
				auth
			);
			let _ = stream.write_all(response.as_bytes()).await;
			let _ = stream.flush().await;
		});
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolves_fleet_names_through_the_tunnel() {
	let control = FleetControlPlane::new(Mode::Serve);
	let tunnel = establish(control.clone()).await.unwrap();

	assert_eq!(tunnel.plan().resolver, FLEET_ADDR.parse::<Ipv6Addr>().unwrap());
	assert_eq!(tunnel.plan().local_address(), CLIENT_ADDR.parse::<Ipv6Addr>().unwrap());
	assert!(tunnel.peer_name().starts_with("fleetnet-test-"));

	let addrs = tokio::time::timeout(TEST_TIMEOUT, tunnel.lookup_aaaa("echo.internal"))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(addrs, vec![FLEET_ADDR.parse::<Ipv6Addr>().unwrap()]);

	let missing = tokio::time::timeout(TEST_TIMEOUT, tunnel.lookup_aaaa("missing.internal"))
		.await
		.unwrap()
		.unwrap();
	assert!(missing.is_empty());

	tunnel.down().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dials_services_by_name_and_literal() {
	let control = FleetControlPlane::new(Mode::Serve);
	let tunnel = establish(control.clone()).await.unwrap();
	let dialer = tunnel.dialer();

	let mut by_name = tokio::time::timeout(TEST_TIMEOUT, dialer.dial("echo.internal", 7))
		.await
		.unwrap()
		.unwrap();
	by_name.write_all(b"ping").await.unwrap();
	let mut reply = [0u8; 4];
	by_name.read_exact(&mut reply).await.unwrap();
	assert_eq!(&reply, b"ping");

	let mut by_literal = tokio::time::timeout(TEST_TIMEOUT, dialer.dial("[fdaa:0:1234::3]", 7))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(by_literal.peer_addr().port(), 7);
	by_literal.write_all(b"pong").await.unwrap();
	by_literal.read_exact(&mut reply).await.unwrap();
	assert_eq!(&reply, b"pong");

	tunnel.down().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dial_errors_are_surfaced() {
	let control = FleetControlPlane::new(Mode::Serve);
	let tunnel = establish(control.clone()).await.unwrap();
	let dialer = tunnel.dialer();

	let refused = tokio::time::timeout(TEST_TIMEOUT, dialer.dial(FLEET_ADDR, 81))
		.await
		.unwrap();
	assert!(matches!(refused, Err(DialError::Refused(_))), "{refused:?}");

	let outside = dialer.dial("2001:db8::1", 80).await;
	assert!(matches!(outside, Err(DialError::Unreachable(_))), "{outside:?}");

	let v4 = dialer.dial("10.0.0.1", 80).await;
	assert!(matches!(v4, Err(DialError::InvalidTarget(_))), "{v4:?}");

	let unknown = tokio::time::timeout(TEST_TIMEOUT, dialer.dial("missing.internal", 80))
		.await
		.unwrap();
	assert!(matches!(unknown, Err(DialError::Unreachable(_))), "{unknown:?}");

	let silent = dialer.with_timeout(Duration::from_millis(300));
	let timed_out = silent.dial("fdaa:0:1234::99", 80).await;
	assert!(matches!(timed_out, Err(DialError::TimedOut(_))), "{timed_out:?}");

	tunnel.down().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_requests_ride_the_tunnel() {
	let control = FleetControlPlane::new(Mode::Serve);
	let tunnel = establish(control.clone()).await.unwrap();
	let config = control_config();

	let client = tunnel.http_client(Some(&config));
	let (status, body) = tokio::time::timeout(
		TEST_TIMEOUT,
		client.get_bytes("http://echo.internal/".parse().unwrap()),
	)
	.await
	.unwrap()
	.unwrap();
	assert_eq!(status, http::StatusCode::OK);
	assert_eq!(&body[..], b"Bearer test-token");

	let anonymous = tunnel.http_client(None);
	let (_, body) = tokio::time::timeout(
		TEST_TIMEOUT,
		anonymous.get_bytes("http://[fdaa:0:1234::3]:80/".parse().unwrap()),
	)
	.await
	.unwrap()
	.unwrap();
	assert_eq!(&body[..], b"anonymous");

	tunnel.down().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn down_is_idempotent_and_deregisters_once() {
	let control = FleetControlPlane::new(Mode::Serve);
	let tunnel = establish(control.clone()).await.unwrap();

	assert!(!tunnel.is_down());
	assert_eq!(tunnel.down().await, TeardownOutcome::Completed);
	assert_eq!(tunnel.down().await, TeardownOutcome::AlreadyClosed);
	assert!(tunnel.is_down());
	assert_eq!(control.removed.load(Ordering::SeqCst), 1);
	assert!(tunnel.session().stack().is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dial_and_resolve_fail_closed_after_down() {
	let control = FleetControlPlane::new(Mode::Serve);
	let tunnel = establish(control.clone()).await.unwrap();
	let dialer = tunnel.dialer();
	let resolver = tunnel.resolver();

	tunnel.down().await;

	let dial = tokio::time::timeout(Duration::from_secs(2), dialer.dial(FLEET_ADDR, 7))
		.await
		.unwrap();
	assert!(matches!(dial, Err(DialError::SessionClosed)), "{dial:?}");

	let lookup = tokio::time::timeout(Duration::from_secs(2), resolver.lookup_aaaa("echo.internal"))
		.await
		.unwrap();
	assert!(matches!(lookup, Err(ResolveError::SessionClosed)), "{lookup:?}");

	assert!(matches!(
		tunnel.session().listen(8080),
		Err(DialError::SessionClosed)
	));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dial_and_resolve_fail_while_deregistration_is_in_flight() {
	let control = FleetControlPlane::with_removal_delay(Mode::Serve, Duration::from_secs(2));
	let tunnel = establish(control.clone()).await.unwrap();
	let dialer = tunnel.dialer();
	let resolver = tunnel.resolver();

	let (outcome, (dial, lookup)) = tokio::join!(tunnel.down(), async {
		tokio::time::sleep(Duration::from_millis(200)).await;
		assert!(tunnel.session().is_closed());
		assert!(!tunnel.session().engine().is_closed(), "engine stopped before deregistration");
		assert_eq!(control.removed.load(Ordering::SeqCst), 0);
		(
			dialer.dial(FLEET_ADDR, 7).await,
			resolver.lookup_aaaa("echo.internal").await,
		)
	});

	assert_eq!(outcome, TeardownOutcome::Completed);
	assert!(matches!(dial, Err(DialError::SessionClosed)), "{dial:?}");
	assert!(matches!(lookup, Err(ResolveError::SessionClosed)), "{lookup:?}");
	assert_eq!(control.removed.load(Ordering::SeqCst), 1);
	assert!(tunnel.session().engine().is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_dial_during_down_never_hangs() {
	let control = FleetControlPlane::new(Mode::Serve);
	let tunnel = establish(control.clone()).await.unwrap();
	// Nothing answers at this address, so the dials stay in flight.
	let dialer = tunnel.dialer().with_timeout(Duration::from_secs(30));

	let dials: Vec<_> = (0..4)
		.map(|_| {
			let dialer = dialer.clone();
			tokio::spawn(async move { dialer.dial("fdaa:0:1234::99", 80).await })
		})
		.collect();

	tokio::time::sleep(Duration::from_millis(100)).await;
	tunnel.down().await;

	for dial in dials {
		let result = tokio::time::timeout(Duration::from_secs(5), dial)
			.await
			.expect("dial hung across teardown")
			.unwrap();
		assert!(matches!(result, Err(DialError::SessionClosed)), "{result:?}");
	}
}

#[tokio::test]
async fn rejected_registration_creates_no_session() {
	let control = FleetControlPlane::new(Mode::Reject);
	let err = establish(control.clone()).await.unwrap_err();

	assert!(matches!(
		err,
		TunnelError::Registration(RegistrationError::RegistrationRejected { ref reason }) if reason == "unknown region"
	));
	assert_eq!(control.added.load(Ordering::SeqCst), 1);
	assert_eq!(control.removed.load(Ordering::SeqCst), 0);
	assert_eq!(control.responder_count(), 0);
}

#[tokio::test]
async fn failed_bring_up_releases_the_registration() {
	let control = FleetControlPlane::new(Mode::UnresolvableEndpoint);
	let err = establish(control.clone()).await.unwrap_err();

	assert!(matches!(
		err,
		TunnelError::Establish(EstablishError::EndpointUnresolvable { .. })
	));
	assert_eq!(control.removed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_tunnel_closes_its_session() {
	let control = FleetControlPlane::new(Mode::Serve);
	let tunnel = establish(control.clone()).await.unwrap();
	let dialer = tunnel.dialer();

	drop(tunnel);

	let dial = dialer.dial(FLEET_ADDR, 7).await;
	assert!(matches!(dial, Err(DialError::SessionClosed)), "{dial:?}");
	assert_eq!(control.removed.load(Ordering::SeqCst), 0);
}
