// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::bind::DefaultBind;
use crate::error::{EngineError, Result};
use crate::netstack::StackTun;
use crate::router::Router;
use crate::uapi::{self, DeviceConfig, PeerConfig, PeerKey, SecretKey};
use defguard_boringtun::noise::{Tunn, TunnResult};
use defguard_boringtun::x25519::{PublicKey, StaticSecret};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use zeroize::Zeroizing;

const BUFFER_SIZE: usize = 65536;
const SEND_INTERVAL: Duration = Duration::from_millis(1);
const TIMER_INTERVAL: Duration = Duration::from_millis(250);

/// Local session indices are 24 bits wide; boringtun uses the low byte.
const INDEX_MASK: u32 = 0x00ff_ffff;

const HANDSHAKE_RESPONSE: u8 = 2;
const COOKIE_REPLY: u8 = 3;
const TRANSPORT_DATA: u8 = 4;

/// How much the device reports about individual packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
	#[default]
	Silent,
	Verbose,
}

impl LogLevel {
	pub fn is_verbose(self) -> bool {
		self == LogLevel::Verbose
	}
}

macro_rules! verbose {
	($level:expr, $($arg:tt)+) => {
		if $level.is_verbose() {
			debug!($($arg)+);
		}
	};
}

struct PeerState {
	key: PeerKey,
	index: u32,
	tunn: Mutex<Tunn>,
	endpoint: std::sync::Mutex<Option<SocketAddr>>,
	preshared_key: Option<SecretKey>,
	persistent_keepalive: Option<u16>,
}

impl PeerState {
	fn endpoint(&self) -> Option<SocketAddr> {
		self.endpoint.lock().ok().and_then(|e| *e)
	}

	fn set_endpoint(&self, addr: SocketAddr) {
		if let Ok(mut endpoint) = self.endpoint.lock() {
			*endpoint = Some(addr);
		}
	}
}

#[derive(Default)]
struct DeviceState {
	private_key: Option<SecretKey>,
	peers: Vec<Arc<PeerState>>,
	router: Router,
	next_index: u32,
	configured: bool,
}

impl DeviceState {
	fn allocate_index(&mut self) -> u32 {
		self.next_index = (self.next_index + 1) & INDEX_MASK;
		self.next_index
	}

	fn peer(&self, key: &PeerKey) -> Option<&Arc<PeerState>> {
		self.peers.iter().find(|p| p.key == *key)
	}

	fn add_peer(&mut self, private_key: &SecretKey, config: PeerConfig) {
		let index = self.allocate_index();
		let tunn = Tunn::new(
			StaticSecret::from(*private_key.expose_bytes()),
			PublicKey::from(*config.public_key.as_bytes()),
			config.preshared_key.as_ref().map(|psk| *psk.expose_bytes()),
			config.persistent_keepalive,
			index,
			None,
		);
		self.peers.push(Arc::new(PeerState {
			key: config.public_key,
			index,
			tunn: Mutex::new(tunn),
			endpoint: std::sync::Mutex::new(config.endpoint),
			preshared_key: config.preshared_key,
			persistent_keepalive: config.persistent_keepalive,
		}));
		for net in config.allowed_ips {
			self.router.add_route(net, config.public_key);
		}
	}

	fn snapshot(&self) -> DeviceConfig {
		DeviceConfig {
			private_key: self.private_key.clone(),
			replace_peers: false,
			peers: self
				.peers
				.iter()
				.map(|peer| PeerConfig {
					public_key: peer.key,
					preshared_key: peer.preshared_key.clone(),
					endpoint: peer.endpoint(),
					allowed_ips: self.router.routes_for_peer(&peer.key),
					persistent_keepalive: peer.persistent_keepalive,
					replace_allowed_ips: false,
				})
				.collect(),
		}
	}
}

struct Shared {
	tun: StackTun,
	bind: DefaultBind,
	log: LogLevel,
	state: RwLock<DeviceState>,
}

/// A userspace WireGuard device moving packets between a virtual stack and UDP.
///
/// Three background tasks run on the ambient tokio runtime until [`WgDevice::close`] is
/// called or the device is dropped.
pub struct WgDevice {
	shared: Arc<Shared>,
	shutdown_tx: watch::Sender<bool>,
	tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
	closed: AtomicBool,
}

impl WgDevice {
	#[instrument(skip_all, fields(mtu = tun.mtu(), log = ?log))]
	pub fn new(tun: StackTun, bind: DefaultBind, log: LogLevel) -> Result<Self> {
		let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

		let shared = Arc::new(Shared {
			tun,
			bind,
			log,
			state: RwLock::new(DeviceState::default()),
		});
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let tasks = vec![
			runtime.spawn(recv_loop(Arc::clone(&shared), shutdown_rx.clone())),
			runtime.spawn(send_loop(Arc::clone(&shared), shutdown_rx.clone())),
			runtime.spawn(timer_loop(Arc::clone(&shared), shutdown_rx)),
		];

		info!("created WireGuard device");

		Ok(Self {
			shared,
			shutdown_tx,
			tasks: std::sync::Mutex::new(tasks),
			closed: AtomicBool::new(false),
		})
	}

	pub fn log_level(&self) -> LogLevel {
		self.shared.log
	}

	/// Applies a UAPI `set` operation. The device accepts exactly one; the text is parsed
	/// in full before anything changes.
	#[instrument(skip_all, fields(lines = text.lines().count()))]
	pub async fn ipc_set(&self, text: &str) -> Result<()> {
		if self.is_closed() {
			return Err(EngineError::Closed);
		}

		let config = uapi::parse(text).await?;
		let mut state = self.shared.state.write().await;
		if state.configured {
			return Err(EngineError::AlreadyConfigured);
		}

		let DeviceConfig {
			private_key,
			peers,
			..
		} = config;
		match &private_key {
			Some(key) => {
				for peer in peers {
					state.add_peer(key, peer);
				}
			}
			None if !peers.is_empty() => return Err(EngineError::MissingPrivateKey),
			None => {}
		}
		state.private_key = private_key;
		state.configured = true;

		debug!(
			peers = state.peers.len(),
			routes = state.router.route_count(),
			"applied configuration"
		);
		Ok(())
	}

	/// Renders the applied configuration in UAPI `get` form.
	pub async fn ipc_get(&self) -> Zeroizing<String> {
		let state = self.shared.state.read().await;
		uapi::render(&state.snapshot())
	}

	pub async fn peer_count(&self) -> usize {
		self.shared.state.read().await.peers.len()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Stops the background tasks. Idempotent.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let _ = self.shutdown_tx.send(true);
		if let Ok(mut tasks) = self.tasks.lock() {
			for task in tasks.drain(..) {
				task.abort();
			}
		}
		info!("closed WireGuard device");
	}
}

impl Drop for WgDevice {
	fn drop(&mut self) {
		self.close();
	}
}

/// Owned copy of a [`TunnResult`], so no borrow of the scratch buffer or tunnel lock
/// outlives the call that produced it.
enum Outcome {
	Done,
	Network(Vec<u8>),
	Tunnel(Vec<u8>, IpAddr),
	Failed(String),
}

impl From<TunnResult<'_>> for Outcome {
	fn from(result: TunnResult<'_>) -> Self {
		match result {
			TunnResult::Done => Outcome::Done,
			TunnResult::WriteToNetwork(data) => Outcome::Network(data.to_vec()),
			TunnResult::WriteToTunnelV4(data, src) => Outcome::Tunnel(data.to_vec(), src.into()),
			TunnResult::WriteToTunnelV6(data, src) => Outcome::Tunnel(data.to_vec(), src.into()),
			TunnResult::Err(e) => Outcome::Failed(format!("{e:?}")),
		}
	}
}

async fn recv_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
	let mut buf = vec![0u8; BUFFER_SIZE];
	let mut dst = vec![0u8; BUFFER_SIZE];

	loop {
		tokio::select! {
			biased;

			_ = shutdown_rx.changed() => {
				if *shutdown_rx.borrow() {
					debug!("recv loop shutting down");
					break;
				}
			}

			result = shared.bind.recv_from(&mut buf) => {
				match result {
					Ok((len, from)) => handle_datagram(&shared, &buf[..len], from, &mut dst).await,
					Err(e) => {
						warn!(error = %e, "UDP receive error");
						tokio::time::sleep(SEND_INTERVAL).await;
					}
				}
			}
		}
	}
}

/// The receiver index a datagram is addressed to. Handshake responses carry the sender's
/// index first, so their receiver field sits four bytes later.
fn receiver_index(datagram: &[u8]) -> Option<u32> {
	let offset = match *datagram.first()? {
		HANDSHAKE_RESPONSE => 8,
		COOKIE_REPLY | TRANSPORT_DATA => 4,
		_ => return None,
	};
	let bytes: [u8; 4] = datagram.get(offset..offset + 4)?.try_into().ok()?;
	Some(u32::from_le_bytes(bytes))
}

/// Picks the peers that may own a datagram: by receiver index for responses, cookies and
/// transport data, otherwise the peer at that endpoint first and then everyone else.
fn candidates(peers: &[Arc<PeerState>], datagram: &[u8], from: SocketAddr) -> Vec<Arc<PeerState>> {
	if let Some(receiver) = receiver_index(datagram) {
		if let Some(peer) = peers.iter().find(|p| p.index == receiver >> 8) {
			return vec![Arc::clone(peer)];
		}
	}

	let mut ordered: Vec<Arc<PeerState>> = peers.to_vec();
	ordered.sort_by_key(|p| p.endpoint() != Some(from));
	ordered
}

async fn handle_datagram(shared: &Shared, datagram: &[u8], from: SocketAddr, dst: &mut [u8]) {
	let peers = shared.state.read().await.peers.clone();
	if peers.is_empty() {
		trace!(%from, "datagram with no peers configured");
		return;
	}

	for peer in candidates(&peers, datagram, from) {
		let outcome: Outcome = {
			let mut tunn = peer.tunn.lock().await;
			tunn.decapsulate(Some(from.ip()), datagram, dst).into()
		};

		match outcome {
			Outcome::Failed(reason) => {
				verbose!(shared.log, peer = %peer.key, %from, %reason, "decapsulate rejected datagram");
				continue;
			}
			Outcome::Done => {}
			Outcome::Network(data) => {
				verbose!(shared.log, peer = %peer.key, len = data.len(), "sending handshake reply");
				send(shared, &peer, &data, Some(from)).await;
				flush_queued(shared, &peer, from, dst).await;
			}
			Outcome::Tunnel(packet, src) => deliver(shared, &peer, &packet, src).await,
		}

		peer.set_endpoint(from);
		return;
	}

	trace!(%from, len = datagram.len(), "no peer accepted datagram");
}

/// After a handshake completes boringtun may hold packets queued while it waited.
async fn flush_queued(shared: &Shared, peer: &PeerState, to: SocketAddr, dst: &mut [u8]) {
	loop {
		let outcome: Outcome = {
			let mut tunn = peer.tunn.lock().await;
			tunn.decapsulate(None, &[], dst).into()
		};
		let Outcome::Network(data) = outcome else {
			break;
		};
		send(shared, peer, &data, Some(to)).await;
	}
}

/// Hands a decrypted packet to the stack if its source is routed to the sending peer.
async fn deliver(shared: &Shared, peer: &PeerState, packet: &[u8], src: IpAddr) {
	let allowed = shared.state.read().await.router.route(src) == Some(&peer.key);
	if !allowed {
		warn!(peer = %peer.key, %src, "dropping packet from source outside allowed IPs");
		return;
	}

	verbose!(shared.log, peer = %peer.key, %src, len = packet.len(), "delivering packet to stack");
	if let Err(e) = shared.tun.inject(packet) {
		warn!(error = %e, "failed to inject packet into virtual stack");
	}
}

async fn send(shared: &Shared, peer: &PeerState, data: &[u8], to: Option<SocketAddr>) {
	let Some(endpoint) = to.or_else(|| peer.endpoint()) else {
		verbose!(shared.log, peer = %peer.key, "no endpoint known, dropping datagram");
		return;
	};
	if let Err(e) = shared.bind.send_to(data, endpoint).await {
		warn!(peer = %peer.key, %endpoint, error = %e, "failed to send datagram");
	}
}

async fn send_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
	let mut dst = vec![0u8; BUFFER_SIZE];

	loop {
		tokio::select! {
			biased;

			_ = shutdown_rx.changed() => {
				if *shutdown_rx.borrow() {
					debug!("send loop shutting down");
					break;
				}
			}

			_ = tokio::time::sleep(SEND_INTERVAL) => {
				while let Some(packet) = shared.tun.next_outbound() {
					encapsulate(&shared, &packet, &mut dst).await;
				}
			}
		}
	}
}

async fn encapsulate(shared: &Shared, packet: &[u8], dst: &mut [u8]) {
	let Some(dst_ip) = extract_destination(packet) else {
		trace!(len = packet.len(), "dropping unparseable outbound packet");
		return;
	};

	let peer = {
		let state = shared.state.read().await;
		state
			.router
			.route(dst_ip)
			.and_then(|key| state.peer(key))
			.cloned()
	};
	let Some(peer) = peer else {
		verbose!(shared.log, %dst_ip, "no route for outbound packet");
		return;
	};

	let outcome: Outcome = {
		let mut tunn = peer.tunn.lock().await;
		tunn.encapsulate(packet, dst).into()
	};

	match outcome {
		Outcome::Network(data) => {
			verbose!(shared.log, peer = %peer.key, %dst_ip, len = data.len(), "sending encrypted packet");
			send(shared, &peer, &data, None).await;
		}
		Outcome::Done => {}
		Outcome::Failed(reason) => {
			debug!(peer = %peer.key, %reason, "encapsulate error");
		}
		Outcome::Tunnel(..) => {}
	}
}

async fn timer_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
	let mut dst = vec![0u8; BUFFER_SIZE];

	loop {
		tokio::select! {
			biased;

			_ = shutdown_rx.changed() => {
				if *shutdown_rx.borrow() {
					debug!("timer loop shutting down");
					break;
				}
			}

			_ = tokio::time::sleep(TIMER_INTERVAL) => {
				let peers = shared.state.read().await.peers.clone();
				for peer in peers {
					let outcome: Outcome = {
						let mut tunn = peer.tunn.lock().await;
						tunn.update_timers(&mut dst).into()
					};

					match outcome {
						Outcome::Network(data) => {
							verbose!(shared.log, peer = %peer.key, len = data.len(), "sending keepalive/handshake");
							send(&shared, &peer, &data, None).await;
						}
						Outcome::Failed(reason) => {
							verbose!(shared.log, peer = %peer.key, %reason, "timer update error");
						}
						Outcome::Done | Outcome::Tunnel(..) => {}
					}
				}
			}
		}
	}
}

/// Destination address of an IPv4 or IPv6 packet.
fn extract_destination(packet: &[u8]) -> Option<IpAddr> {
	match packet.first()? >> 4 {
		4 if packet.len() >= 20 => {
			let octets: [u8; 4] = packet[16..20].try_into().ok()?;
			Some(IpAddr::V4(Ipv4Addr::from(octets)))
		}
		6 if packet.len() >= 40 => {
			let octets: [u8; 16] = packet[24..40].try_into().ok()?;
			Some(IpAddr::V6(Ipv6Addr::from(octets)))
		}
		_ => None,
	}
}
