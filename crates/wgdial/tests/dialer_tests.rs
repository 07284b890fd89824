// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bootstrap and dialer behaviour against a recording backend.
//!
//! Tests cover:
//! - Address and key validation before any allocation
//! - Exact UAPI text submitted to the device
//! - Teardown when the device rejects its configuration
//! - Resolution results, including empty and multi-address answers
//! - Context cancellation and deadlines

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;
use wgdial::{
	Backend, BootstrapError, Conn, Connection, Context, DialError, Dialer, Interface, LogLevel,
	NetStack, Network, Peer, TunnelConfig, TunnelDevice,
};
use wgdial_engine::{EngineError, StackError};

#[derive(Default)]
struct Calls {
	create_stack: AtomicUsize,
	create_device: AtomicUsize,
	ipc_set: AtomicUsize,
	dial: AtomicUsize,
	lookup: AtomicUsize,
	stack_closed: AtomicBool,
	device_closed: AtomicBool,
	submitted: Mutex<Option<String>>,
	log: Mutex<Option<LogLevel>>,
}

#[derive(Clone, Default)]
struct MockBackend {
	calls: Arc<Calls>,
	answers: Vec<IpAddr>,
	reject_config: bool,
	hang: bool,
}

struct MockStack {
	calls: Arc<Calls>,
	answers: Vec<IpAddr>,
	addresses: Vec<IpAddr>,
	dns_servers: Vec<IpAddr>,
	hang: bool,
}

struct MockDevice {
	calls: Arc<Calls>,
	reject_config: bool,
}

#[derive(Debug)]
struct MockConn {
	peer: SocketAddr,
	io: DuplexStream,
}

impl AsyncRead for MockConn {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut TaskContext<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(&mut self.io).poll_read(cx, buf)
	}
}

impl AsyncWrite for MockConn {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut TaskContext<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.io).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.io).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.io).poll_shutdown(cx)
	}
}

impl Connection for MockConn {
	fn peer_addr(&self) -> Option<SocketAddr> {
		Some(self.peer)
	}
}

#[async_trait]
impl NetStack for MockStack {
	async fn dial(&self, _network: Network, address: &str) -> Result<Conn, StackError> {
		self.calls.dial.fetch_add(1, Ordering::SeqCst);
		if self.hang {
			std::future::pending::<()>().await;
		}
		let peer = address.parse().map_err(|_| StackError::Unreachable(address.to_string()))?;
		let (io, _) = tokio::io::duplex(64);
		Ok(Box::new(MockConn { peer, io }))
	}

	async fn lookup_host(&self, _name: &str) -> Result<Vec<IpAddr>, StackError> {
		self.calls.lookup.fetch_add(1, Ordering::SeqCst);
		if self.hang {
			std::future::pending::<()>().await;
		}
		Ok(self.answers.clone())
	}

	fn local_addresses(&self) -> Vec<IpAddr> {
		self.addresses.clone()
	}

	fn dns_servers(&self) -> Vec<IpAddr> {
		self.dns_servers.clone()
	}

	fn close(&self) {
		self.calls.stack_closed.store(true, Ordering::SeqCst);
	}
}

#[async_trait]
impl TunnelDevice for MockDevice {
	async fn ipc_set(&self, uapi: &str) -> Result<(), EngineError> {
		self.calls.ipc_set.fetch_add(1, Ordering::SeqCst);
		*self.calls.submitted.lock().unwrap() = Some(uapi.to_string());
		if self.reject_config {
			return Err(EngineError::Uapi {
				line: 1,
				reason: "rejected".to_string(),
			});
		}
		Ok(())
	}

	fn close(&self) {
		self.calls.device_closed.store(true, Ordering::SeqCst);
	}
}

#[async_trait]
impl Backend for MockBackend {
	type Transport = ();

	fn create_stack(
		&self,
		addresses: &[IpAddr],
		dns_servers: &[IpAddr],
		mtu: u16,
	) -> Result<(Arc<dyn NetStack>, ()), StackError> {
		assert_eq!(mtu, 1280);
		self.calls.create_stack.fetch_add(1, Ordering::SeqCst);
		let stack: Arc<dyn NetStack> = Arc::new(MockStack {
			calls: Arc::clone(&self.calls),
			answers: self.answers.clone(),
			addresses: addresses.to_vec(),
			dns_servers: dns_servers.to_vec(),
			hang: self.hang,
		});
		Ok((stack, ()))
	}

	async fn create_device(
		&self,
		_transport: (),
		log: LogLevel,
	) -> Result<Box<dyn TunnelDevice>, EngineError> {
		self.calls.create_device.fetch_add(1, Ordering::SeqCst);
		*self.calls.log.lock().unwrap() = Some(log);
		Ok(Box::new(MockDevice {
			calls: Arc::clone(&self.calls),
			reject_config: self.reject_config,
		}))
	}
}

fn key(byte: u8) -> String {
	STANDARD.encode([byte; 32])
}

fn hex_key(byte: u8) -> String {
	hex::encode([byte; 32])
}

fn interface() -> Interface {
	Interface::new("10.8.0.2", key(1)).with_dns("10.8.0.1")
}

fn peers() -> Vec<Peer> {
	vec![Peer::new(key(2), "203.0.113.1:51820", "0.0.0.0/0").with_keep_alive(25)]
}

async fn dialer_with(backend: &MockBackend) -> Dialer {
	Dialer::with_backend(backend, false, interface(), peers())
		.await
		.unwrap()
}

fn ip(s: &str) -> IpAddr {
	s.parse().unwrap()
}

// ============================================================================
// Bootstrap
// ============================================================================

#[tokio::test]
async fn bootstrap_submits_serialized_configuration() {
	let backend = MockBackend::default();
	let dialer = dialer_with(&backend).await;

	let expected = format!(
		"private_key={}\npublic_key={}\nallowed_ip=0.0.0.0/0\nendpoint=203.0.113.1:51820\npersistent_keepalive_interval=25\n",
		hex_key(1),
		hex_key(2)
	);
	assert_eq!(
		backend.calls.submitted.lock().unwrap().as_deref(),
		Some(expected.as_str())
	);
	assert_eq!(backend.calls.ipc_set.load(Ordering::SeqCst), 1);
	assert_eq!(dialer.local_addresses(), vec![ip("10.8.0.2")]);
	assert_eq!(dialer.dns_servers(), vec![ip("10.8.0.1")]);
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedLogs {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.0.lock().unwrap().extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

impl<'a> MakeWriter<'a> for CapturedLogs {
	type Writer = CapturedLogs;

	fn make_writer(&'a self) -> Self::Writer {
		self.clone()
	}
}

#[tokio::test]
async fn bootstrap_never_logs_key_material() {
	let logs = CapturedLogs::default();
	let subscriber = tracing_subscriber::fmt()
		.with_max_level(tracing::Level::TRACE)
		.with_ansi(false)
		.with_writer(logs.clone())
		.finish();
	let _guard = tracing::subscriber::set_default(subscriber);

	let backend = MockBackend::default();
	let peers = vec![Peer::new(key(2), "203.0.113.1:51820", "0.0.0.0/0").with_preshared_key(key(9))];
	let dialer = Dialer::with_backend(&backend, true, interface(), peers)
		.await
		.unwrap();
	drop(dialer);

	let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
	assert!(output.contains("tunnel configured"));
	for secret in [key(1), hex_key(1), key(9), hex_key(9)] {
		assert!(!output.contains(&secret), "secret leaked into logs");
	}
}

#[tokio::test]
async fn bootstrap_from_deserialized_config() {
	let json = serde_json::json!({
		"interface": {"address": "fd00::2", "private_key": key(1), "dns": ["fd00::1"]},
		"peers": [{
			"public_key": key(2),
			"endpoint": "[2001:db8::1]:51820",
			"allowedip": "::/0",
			"keep_alive": 0
		}],
		"debug": true
	});
	let config: TunnelConfig = serde_json::from_value(json).unwrap();
	config.validate().unwrap();

	let TunnelConfig {
		interface,
		peers,
		debug,
	} = config;
	let backend = MockBackend::default();
	let dialer = Dialer::with_backend(&backend, debug, interface, peers)
		.await
		.unwrap();

	let submitted = backend.calls.submitted.lock().unwrap().clone().unwrap();
	assert!(submitted.contains("endpoint=[2001:db8::1]:51820\n"));
	assert!(!submitted.contains("persistent_keepalive_interval"));
	assert!(!submitted.contains("preshared_key"));
	assert_eq!(dialer.log_level(), LogLevel::Verbose);
	assert_eq!(dialer.local_addresses(), vec![ip("fd00::2")]);
	assert_eq!(dialer.dns_servers(), vec![ip("fd00::1")]);
}

#[tokio::test]
async fn bootstrap_threads_log_level() {
	let backend = MockBackend::default();
	let quiet = Dialer::with_backend(&backend, false, interface(), peers())
		.await
		.unwrap();
	assert_eq!(*backend.calls.log.lock().unwrap(), Some(LogLevel::Silent));
	assert_eq!(quiet.log_level(), LogLevel::Silent);

	let verbose = Dialer::with_backend(&backend, true, interface(), peers())
		.await
		.unwrap();
	assert_eq!(*backend.calls.log.lock().unwrap(), Some(LogLevel::Verbose));
	assert_eq!(verbose.log_level(), LogLevel::Verbose);
}

#[tokio::test]
async fn malformed_address_fails_before_allocation() {
	let backend = MockBackend::default();
	let err = Dialer::with_backend(&backend, false, Interface::new("10.8.0.2/24", key(1)), peers())
		.await
		.err()
		.unwrap();

	assert!(matches!(err, BootstrapError::Parse { ref field, .. } if field == "address"));
	assert_eq!(backend.calls.create_stack.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_dns_entry_is_reported_by_index() {
	let backend = MockBackend::default();
	let iface = interface().with_dns("resolver.local");
	let err = Dialer::with_backend(&backend, false, iface, peers())
		.await
		.err()
		.unwrap();

	match err {
		BootstrapError::Parse { field, value, .. } => {
			assert_eq!(field, "dns[1]");
			assert_eq!(value, "resolver.local");
		}
		other => panic!("unexpected error: {other:?}"),
	}
	assert_eq!(backend.calls.create_stack.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_preshared_key_never_reaches_device() {
	let backend = MockBackend::default();
	let peers = vec![
		Peer::new(key(2), "203.0.113.1:51820", "10.0.0.0/24"),
		Peer::new(key(3), "203.0.113.2:51820", "10.0.1.0/24").with_preshared_key("not base64!"),
	];

	let err = Dialer::with_backend(&backend, false, interface(), peers)
		.await
		.err()
		.unwrap();

	assert!(matches!(err, BootstrapError::Decode { ref field, .. } if field == "peers[1].preshared_key"));
	assert_eq!(backend.calls.create_stack.load(Ordering::SeqCst), 0);
	assert_eq!(backend.calls.create_device.load(Ordering::SeqCst), 0);
	assert_eq!(backend.calls.ipc_set.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_private_key_is_a_decode_error() {
	let backend = MockBackend::default();
	let err = Dialer::with_backend(&backend, false, Interface::new("10.8.0.2", "%%%"), peers())
		.await
		.err()
		.unwrap();

	assert!(matches!(err, BootstrapError::Decode { ref field, .. } if field == "private_key"));
	assert_eq!(backend.calls.ipc_set.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_configuration_tears_down() {
	let backend = MockBackend {
		reject_config: true,
		..Default::default()
	};

	let err = Dialer::with_backend(&backend, false, interface(), peers())
		.await
		.err()
		.unwrap();

	assert!(matches!(
		err,
		BootstrapError::ProtocolSubmission(EngineError::Uapi { line: 1, .. })
	));
	assert!(backend.calls.stack_closed.load(Ordering::SeqCst));
	assert!(backend.calls.device_closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn dropping_dialer_closes_backend() {
	let backend = MockBackend::default();
	let dialer = dialer_with(&backend).await;
	assert!(!backend.calls.stack_closed.load(Ordering::SeqCst));

	drop(dialer);
	assert!(backend.calls.stack_closed.load(Ordering::SeqCst));
	assert!(backend.calls.device_closed.load(Ordering::SeqCst));
}

// ============================================================================
// Resolve
// ============================================================================

#[tokio::test]
async fn resolve_without_records_is_not_found() {
	let backend = MockBackend::default();
	let dialer = dialer_with(&backend).await;

	let err = dialer
		.resolve(&Context::background(), "missing.internal")
		.await
		.unwrap_err();
	assert!(matches!(err, DialError::NotFound { ref name } if name == "missing.internal"));
	assert!(!err.is_cancellation());
}

#[tokio::test]
async fn resolve_returns_first_answer() {
	let backend = MockBackend {
		answers: vec![ip("10.1.0.5"), ip("10.1.0.6"), ip("fd00::5")],
		..Default::default()
	};
	let dialer = dialer_with(&backend).await;

	for _ in 0..3 {
		let resolved = dialer
			.resolve(&Context::background(), "db.internal")
			.await
			.unwrap();
		assert_eq!(resolved, ip("10.1.0.5"));
	}
}

#[tokio::test]
async fn concurrent_resolves_share_one_dialer() {
	let backend = MockBackend {
		answers: vec![ip("10.1.0.5")],
		..Default::default()
	};
	let dialer = Arc::new(dialer_with(&backend).await);

	let tasks: Vec<_> = (0..8)
		.map(|_| {
			let dialer = Arc::clone(&dialer);
			tokio::spawn(async move { dialer.resolve(&Context::background(), "db.internal").await })
		})
		.collect();

	for task in tasks {
		assert_eq!(task.await.unwrap().unwrap(), ip("10.1.0.5"));
	}
	assert_eq!(backend.calls.lookup.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn resolve_gives_up_at_deadline() {
	let backend = MockBackend {
		hang: true,
		..Default::default()
	};
	let dialer = dialer_with(&backend).await;

	let err = dialer
		.resolve(&Context::with_timeout(Duration::from_millis(20)), "slow.internal")
		.await
		.unwrap_err();
	assert!(matches!(err, DialError::DeadlineExceeded));
	assert!(err.is_cancellation());
}

// ============================================================================
// Dial
// ============================================================================

#[tokio::test]
async fn dial_returns_stack_connection() {
	let backend = MockBackend::default();
	let dialer = dialer_with(&backend).await;

	let conn = dialer
		.dial(&Context::background(), Network::Tcp, "10.1.0.5:5432")
		.await
		.unwrap();
	assert_eq!(conn.peer_addr(), Some("10.1.0.5:5432".parse().unwrap()));
	assert_eq!(backend.calls.dial.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dial_on_cancelled_context_never_reaches_stack() {
	let backend = MockBackend::default();
	let dialer = dialer_with(&backend).await;

	let token = CancellationToken::new();
	token.cancel();
	let err = dialer
		.dial(&Context::with_cancellation(token), Network::Tcp, "10.1.0.5:5432")
		.await
		.unwrap_err();

	assert!(matches!(err, DialError::Cancelled));
	assert_eq!(backend.calls.dial.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dial_on_expired_deadline_never_reaches_stack() {
	let backend = MockBackend::default();
	let dialer = dialer_with(&backend).await;

	let ctx = Context::with_deadline(tokio::time::Instant::now() - Duration::from_millis(1));
	let err = dialer
		.dial(&ctx, Network::Udp, "10.1.0.5:53")
		.await
		.unwrap_err();

	assert!(matches!(err, DialError::DeadlineExceeded));
	assert_eq!(backend.calls.dial.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancelling_mid_dial_returns_cancelled() {
	let backend = MockBackend {
		hang: true,
		..Default::default()
	};
	let dialer = dialer_with(&backend).await;

	let token = CancellationToken::new();
	let ctx = Context::with_cancellation(token.clone());
	let canceller = tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(20)).await;
		token.cancel();
	});

	let err = dialer
		.dial(&ctx, Network::Tcp, "10.1.0.5:5432")
		.await
		.unwrap_err();
	canceller.await.unwrap();

	assert!(matches!(err, DialError::Cancelled));
	assert_eq!(backend.calls.dial.load(Ordering::SeqCst), 1);
}

#[test]
fn network_names_parse() {
	for (name, network) in [
		("tcp", Network::Tcp),
		("tcp4", Network::Tcp4),
		("tcp6", Network::Tcp6),
		("udp", Network::Udp),
		("udp4", Network::Udp4),
		("udp6", Network::Udp6),
	] {
		assert_eq!(name.parse::<Network>().unwrap(), network);
	}
	assert!("unix".parse::<Network>().is_err());
}
