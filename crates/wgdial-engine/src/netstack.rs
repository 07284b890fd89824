// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process IP stack whose packets are carried by the WireGuard device instead of the
//! host kernel.
//!
//! [`VirtualStack::new`] returns two halves over the same smoltcp interface: the stack
//! itself, which hands out TCP/UDP connections and answers DNS lookups, and a
//! [`StackTun`], which the device uses to inject decrypted packets and drain outbound
//! ones.

use crate::error::{StackError, StackResult};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::dns::{self, DnsQuery, GetQueryResultError, QueryHandle};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::socket::udp::{self, PacketBuffer, PacketMetadata, Socket as UdpSocket};
use smoltcp::socket::Socket;
use smoltcp::time::{Duration as SmoltcpDuration, Instant as SmoltcpInstant};
use smoltcp::wire::{
	DnsQueryType, HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address, Ipv6Address,
};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant as StdInstant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, instrument, trace, warn};

const DEFAULT_TCP_RX_BUFFER_SIZE: usize = 65536;
const DEFAULT_TCP_TX_BUFFER_SIZE: usize = 65536;
const UDP_PACKET_SLOTS: usize = 64;
const UDP_BUFFER_SIZE: usize = 65536;

/// Maximum number of packets in rx/tx queues to prevent memory exhaustion DoS
const MAX_QUEUE_SIZE: usize = 1024;

/// smoltcp is built with room for this many resolvers.
const MAX_DNS_SERVERS: usize = 4;

/// How long smoltcp waits on one resolver before trying the next.
const DNS_SERVER_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const CONNECT_TIMEOUT: SmoltcpDuration = SmoltcpDuration::from_secs(30);
const EPHEMERAL_PORT_START: u16 = 49152;

/// The kind of connection requested from [`VirtualStack::dial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
	Tcp,
	Tcp4,
	Tcp6,
	Udp,
	Udp4,
	Udp6,
}

impl Network {
	pub fn is_tcp(&self) -> bool {
		matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
	}

	/// Whether a remote address of this family may be used.
	pub fn accepts(&self, ip: &IpAddr) -> bool {
		match self {
			Network::Tcp | Network::Udp => true,
			Network::Tcp4 | Network::Udp4 => ip.is_ipv4(),
			Network::Tcp6 | Network::Udp6 => ip.is_ipv6(),
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Network::Tcp => "tcp",
			Network::Tcp4 => "tcp4",
			Network::Tcp6 => "tcp6",
			Network::Udp => "udp",
			Network::Udp4 => "udp4",
			Network::Udp6 => "udp6",
		}
	}
}

impl fmt::Display for Network {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Network {
	type Err = StackError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"tcp" => Ok(Network::Tcp),
			"tcp4" => Ok(Network::Tcp4),
			"tcp6" => Ok(Network::Tcp6),
			"udp" => Ok(Network::Udp),
			"udp4" => Ok(Network::Udp4),
			"udp6" => Ok(Network::Udp6),
			other => Err(StackError::UnknownNetwork(other.to_string())),
		}
	}
}

/// Splits `host:port`, accepting `[v6]:port` for IPv6 literals.
pub fn split_host_port(address: &str) -> StackResult<(&str, u16)> {
	let invalid = |reason: &str| StackError::InvalidAddress {
		address: address.to_string(),
		reason: reason.to_string(),
	};

	let (host, port) = if let Some(rest) = address.strip_prefix('[') {
		let (host, port) = rest.split_once("]:").ok_or_else(|| invalid("missing port"))?;
		(host, port)
	} else {
		let (host, port) = address.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
		if host.contains(':') {
			return Err(invalid("too many colons"));
		}
		(host, port)
	};

	if host.is_empty() {
		return Err(invalid("missing host"));
	}
	let port = port.parse().map_err(|_| invalid("invalid port"))?;
	Ok((host, port))
}

fn to_smoltcp(ip: IpAddr) -> IpAddress {
	match ip {
		IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
		IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
	}
}

fn from_smoltcp(ip: IpAddress) -> IpAddr {
	match ip {
		IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4.0)),
		IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6.0)),
	}
}

fn push_bounded(queue: &mut VecDeque<Vec<u8>>, packet: Vec<u8>, name: &'static str) {
	if queue.len() >= MAX_QUEUE_SIZE {
		warn!(queue = name, "packet queue full, dropping oldest packet");
		queue.pop_front();
	}
	queue.push_back(packet);
}

struct QueueDevice {
	inbound: VecDeque<Vec<u8>>,
	outbound: VecDeque<Vec<u8>>,
	mtu: usize,
}

struct QueueRxToken {
	packet: Vec<u8>,
}

impl RxToken for QueueRxToken {
	fn consume<R, F>(mut self, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		f(&mut self.packet)
	}
}

struct QueueTxToken<'a> {
	outbound: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxToken for QueueTxToken<'a> {
	fn consume<R, F>(self, len: usize, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		let mut packet = vec![0u8; len];
		let result = f(&mut packet);
		push_bounded(self.outbound, packet, "outbound");
		result
	}
}

impl Device for QueueDevice {
	type RxToken<'a> = QueueRxToken;
	type TxToken<'a> = QueueTxToken<'a>;

	fn receive(
		&mut self,
		_timestamp: SmoltcpInstant,
	) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
		let packet = self.inbound.pop_front()?;
		Some((
			QueueRxToken { packet },
			QueueTxToken {
				outbound: &mut self.outbound,
			},
		))
	}

	fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
		Some(QueueTxToken {
			outbound: &mut self.outbound,
		})
	}

	fn capabilities(&self) -> DeviceCapabilities {
		let mut caps = DeviceCapabilities::default();
		caps.max_transmission_unit = self.mtu;
		caps.medium = Medium::Ip;
		caps
	}
}

struct StackInner {
	device: QueueDevice,
	iface: Interface,
	sockets: SocketSet<'static>,
	dns: Option<SocketHandle>,
	wakers: Vec<Waker>,
	/// Closed TCP sockets waiting for their FIN exchange before removal.
	orphans: Vec<SocketHandle>,
	started: StdInstant,
	closed: bool,
}

impl StackInner {
	fn now(&self) -> SmoltcpInstant {
		SmoltcpInstant::from_micros(self.started.elapsed().as_micros() as i64)
	}

	fn poll(&mut self) -> bool {
		let timestamp = self.now();
		let changed = self
			.iface
			.poll(timestamp, &mut self.device, &mut self.sockets);
		self.reap_orphans();
		changed
	}

	fn reap_orphans(&mut self) {
		let sockets = &mut self.sockets;
		self.orphans.retain(|handle| {
			let state = sockets.get::<TcpSocket>(*handle).state();
			if matches!(state, TcpState::Closed | TcpState::TimeWait) {
				sockets.remove(*handle);
				false
			} else {
				true
			}
		});
	}

	fn register_waker(&mut self, waker: &Waker) {
		if !self.wakers.iter().any(|w| w.will_wake(waker)) {
			self.wakers.push(waker.clone());
		}
	}

	fn wake_all(&mut self) {
		for waker in self.wakers.drain(..) {
			waker.wake();
		}
	}
}

type SharedStack = Arc<Mutex<StackInner>>;

fn lock(inner: &SharedStack) -> StackResult<MutexGuard<'_, StackInner>> {
	inner
		.lock()
		.map_err(|e| StackError::Device(format!("lock poisoned: {}", e)))
}

fn lock_io(inner: &SharedStack) -> io::Result<MutexGuard<'_, StackInner>> {
	inner
		.lock()
		.map_err(|e| io::Error::other(format!("lock poisoned: {}", e)))
}

/// Connection-facing half of the virtual network stack.
pub struct VirtualStack {
	addresses: Vec<IpAddr>,
	dns_servers: Vec<IpAddr>,
	mtu: u16,
	inner: SharedStack,
}

/// Packet-facing half of the virtual network stack, consumed by the WireGuard device.
pub struct StackTun {
	mtu: u16,
	inner: SharedStack,
}

impl VirtualStack {
	#[instrument(skip_all, fields(addresses = ?addresses, dns = ?dns_servers, mtu = mtu))]
	pub fn new(
		addresses: &[IpAddr],
		dns_servers: &[IpAddr],
		mtu: u16,
	) -> StackResult<(Self, StackTun)> {
		if addresses.is_empty() {
			return Err(StackError::Device("no local addresses".to_string()));
		}

		let started = StdInstant::now();
		let mut device = QueueDevice {
			inbound: VecDeque::new(),
			outbound: VecDeque::new(),
			mtu: mtu as usize,
		};

		let config = Config::new(HardwareAddress::Ip);
		let mut iface = Interface::new(config, &mut device, SmoltcpInstant::from_micros(0));

		let mut overflow = false;
		iface.update_ip_addrs(|addrs| {
			for addr in addresses {
				let prefix = if addr.is_ipv4() { 32 } else { 128 };
				if addrs.push(IpCidr::new(to_smoltcp(*addr), prefix)).is_err() {
					overflow = true;
				}
			}
		});
		if overflow {
			return Err(StackError::Device("too many local addresses".to_string()));
		}

		// Every destination leaves through the tunnel; the gateway is never resolved on an IP medium.
		for addr in addresses {
			let added = match to_smoltcp(*addr) {
				IpAddress::Ipv4(v4) => iface.routes_mut().add_default_ipv4_route(v4).map(|_| ()),
				IpAddress::Ipv6(v6) => iface.routes_mut().add_default_ipv6_route(v6).map(|_| ()),
			};
			added.map_err(|_| StackError::Device("route table full".to_string()))?;
		}

		let mut sockets = SocketSet::new(vec![]);

		if dns_servers.len() > MAX_DNS_SERVERS {
			return Err(StackError::TooManyDnsServers {
				field: format!("dns[{MAX_DNS_SERVERS}]"),
				max: MAX_DNS_SERVERS,
			});
		}
		let resolvers = dns_servers.to_vec();
		let dns = if resolvers.is_empty() {
			None
		} else {
			let servers: Vec<IpAddress> = resolvers.iter().map(|ip| to_smoltcp(*ip)).collect();
			let socket = dns::Socket::new(&servers, Vec::<Option<DnsQuery>>::new());
			Some(sockets.add(socket))
		};

		let inner = Arc::new(Mutex::new(StackInner {
			device,
			iface,
			sockets,
			dns,
			wakers: Vec::new(),
			orphans: Vec::new(),
			started,
			closed: false,
		}));

		debug!("created virtual stack");

		let stack = Self {
			addresses: addresses.to_vec(),
			dns_servers: resolvers,
			mtu,
			inner: Arc::clone(&inner),
		};
		let tun = StackTun { mtu, inner };
		Ok((stack, tun))
	}

	pub fn addresses(&self) -> &[IpAddr] {
		&self.addresses
	}

	pub fn dns_servers(&self) -> &[IpAddr] {
		&self.dns_servers
	}

	pub fn mtu(&self) -> u16 {
		self.mtu
	}

	fn local_address_for(&self, remote: &IpAddr) -> Option<IpAddr> {
		self.addresses
			.iter()
			.find(|local| local.is_ipv4() == remote.is_ipv4())
			.copied()
	}

	/// Connects to `address` (`host:port`), resolving host names through the tunnel DNS.
	///
	/// Resolved addresses are tried in resolver order until one connects.
	#[instrument(skip(self), fields(%network))]
	pub async fn dial(&self, network: Network, address: &str) -> StackResult<VirtualConn> {
		let (host, port) = split_host_port(address)?;
		let candidates: Vec<IpAddr> = self
			.lookup_host(host)
			.await?
			.into_iter()
			.filter(|ip| network.accepts(ip) && self.local_address_for(ip).is_some())
			.collect();

		let mut last_err = None;
		for ip in candidates {
			let remote = SocketAddr::new(ip, port);
			let result = if network.is_tcp() {
				self.tcp_connect(remote).await.map(VirtualConn::Tcp)
			} else {
				self.udp_connect(remote).map(VirtualConn::Udp)
			};
			match result {
				Ok(conn) => return Ok(conn),
				Err(e) => {
					debug!(%remote, error = %e, "connect attempt failed");
					last_err = Some(e);
				}
			}
		}

		Err(last_err.unwrap_or_else(|| StackError::Unreachable(address.to_string())))
	}

	#[instrument(skip(self), fields(%remote))]
	pub async fn tcp_connect(&self, remote: SocketAddr) -> StackResult<VirtualTcpStream> {
		let local = self
			.local_address_for(&remote.ip())
			.ok_or(StackError::NoLocalAddress(family(&remote.ip())))?;

		let handle = {
			let mut guard = lock(&self.inner)?;
			if guard.closed {
				return Err(StackError::Closed);
			}
			let inner = &mut *guard;

			let rx_buffer = SocketBuffer::new(vec![0u8; DEFAULT_TCP_RX_BUFFER_SIZE]);
			let tx_buffer = SocketBuffer::new(vec![0u8; DEFAULT_TCP_TX_BUFFER_SIZE]);
			let mut socket = TcpSocket::new(rx_buffer, tx_buffer);
			socket.set_timeout(Some(CONNECT_TIMEOUT));

			let local_endpoint = IpEndpoint::new(to_smoltcp(local), ephemeral_port());
			let remote_endpoint = IpEndpoint::new(to_smoltcp(remote.ip()), remote.port());
			socket
				.connect(inner.iface.context(), remote_endpoint, local_endpoint)
				.map_err(|e| StackError::TcpConnect(format!("connect failed: {}", e)))?;

			let handle = inner.sockets.add(socket);
			inner.poll();
			handle
		};

		debug!("connecting to remote");
		let stream = VirtualTcpStream {
			inner: Arc::clone(&self.inner),
			handle,
		};
		stream.wait_connected().await?;
		Ok(stream)
	}

	#[instrument(skip(self), fields(%remote))]
	pub fn udp_connect(&self, remote: SocketAddr) -> StackResult<VirtualUdpSocket> {
		if self.local_address_for(&remote.ip()).is_none() {
			return Err(StackError::NoLocalAddress(family(&remote.ip())));
		}

		let mut inner = lock(&self.inner)?;
		if inner.closed {
			return Err(StackError::Closed);
		}

		let rx_buffer = PacketBuffer::new(
			vec![PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
			vec![0u8; UDP_BUFFER_SIZE],
		);
		let tx_buffer = PacketBuffer::new(
			vec![PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
			vec![0u8; UDP_BUFFER_SIZE],
		);
		let mut socket = UdpSocket::new(rx_buffer, tx_buffer);
		socket
			.bind(ephemeral_port())
			.map_err(|e| StackError::Udp(format!("bind failed: {}", e)))?;

		let handle = inner.sockets.add(socket);
		debug!("opened UDP socket");

		Ok(VirtualUdpSocket {
			inner: Arc::clone(&self.inner),
			handle,
			remote: IpEndpoint::new(to_smoltcp(remote.ip()), remote.port()),
		})
	}

	/// Resolves `name` with the configured DNS servers.
	///
	/// IP literals are returned as-is. A records come first, then AAAA records when an
	/// IPv6 address is configured. A name the servers answer with no records (or
	/// NXDOMAIN) yields an empty list; a query no server answers in time is a
	/// [`StackError::Dns`].
	#[instrument(skip(self))]
	pub async fn lookup_host(&self, name: &str) -> StackResult<Vec<IpAddr>> {
		if let Ok(ip) = name.parse::<IpAddr>() {
			return Ok(vec![ip]);
		}

		let mut addresses = self.query(name, DnsQueryType::A).await?;
		if self.addresses.iter().any(IpAddr::is_ipv6) {
			addresses.extend(self.query(name, DnsQueryType::Aaaa).await?);
		}

		debug!(count = addresses.len(), "resolved host");
		Ok(addresses)
	}

	async fn query(&self, name: &str, query_type: DnsQueryType) -> StackResult<Vec<IpAddr>> {
		let dns_error = |reason: String| StackError::Dns {
			name: name.to_string(),
			reason,
		};

		let query = {
			let mut guard = lock(&self.inner)?;
			if guard.closed {
				return Err(StackError::Closed);
			}
			let inner = &mut *guard;
			let socket_handle = inner.dns.ok_or(StackError::NoDnsServers)?;
			let socket = inner.sockets.get_mut::<dns::Socket>(socket_handle);
			let handle = socket
				.start_query(inner.iface.context(), name, query_type)
				.map_err(|e| dns_error(format!("{:?}", e)))?;
			PendingQuery {
				inner: &self.inner,
				socket: socket_handle,
				handle,
				started: StdInstant::now(),
				servers: self.dns_servers.len(),
				finished: false,
			}
		};

		query.wait().await.map_err(dns_error)
	}

	/// Aborts every open connection and refuses new ones.
	pub fn close(&self) {
		let Ok(mut inner) = self.inner.lock() else {
			return;
		};
		if inner.closed {
			return;
		}
		inner.closed = true;
		for (_, socket) in inner.sockets.iter_mut() {
			match socket {
				Socket::Tcp(tcp) => tcp.abort(),
				Socket::Udp(udp) => udp.close(),
				_ => {}
			}
		}
		inner.poll();
		inner.wake_all();
		debug!("closed virtual stack");
	}
}

fn family(ip: &IpAddr) -> &'static str {
	if ip.is_ipv4() {
		"IPv4"
	} else {
		"IPv6"
	}
}

fn ephemeral_port() -> u16 {
	EPHEMERAL_PORT_START + (fastrand::u16(..) % 16383)
}

/// An in-flight DNS query, cancelled if dropped before it finishes.
struct PendingQuery<'a> {
	inner: &'a SharedStack,
	socket: SocketHandle,
	handle: QueryHandle,
	started: StdInstant,
	servers: usize,
	finished: bool,
}

impl PendingQuery<'_> {
	/// Every resolver was given its full timeout, so nobody answered.
	fn timed_out(&self) -> bool {
		let budget = DNS_SERVER_TIMEOUT.saturating_mul(self.servers.max(1) as u32);
		self.started.elapsed() >= budget
	}

	async fn wait(mut self) -> Result<Vec<IpAddr>, String> {
		loop {
			{
				let mut inner = lock(self.inner).map_err(|e| e.to_string())?;
				if inner.closed {
					return Err("stack closed".to_string());
				}
				inner.poll();
				let socket = inner.sockets.get_mut::<dns::Socket>(self.socket);
				match socket.get_query_result(self.handle) {
					Ok(addrs) => {
						self.finished = true;
						return Ok(addrs.iter().map(|a| from_smoltcp(*a)).collect());
					}
					// smoltcp reports an empty answer and exhausted resolvers alike.
					Err(GetQueryResultError::Failed) => {
						self.finished = true;
						if self.timed_out() {
							return Err("no answer from any DNS server".to_string());
						}
						trace!("query returned no records");
						return Ok(Vec::new());
					}
					Err(GetQueryResultError::Pending) => {}
				}
			}

			tokio::time::sleep(POLL_INTERVAL).await;
		}
	}
}

impl Drop for PendingQuery<'_> {
	fn drop(&mut self) {
		if self.finished {
			return;
		}
		if let Ok(mut inner) = self.inner.lock() {
			inner
				.sockets
				.get_mut::<dns::Socket>(self.socket)
				.cancel_query(self.handle);
		}
	}
}

impl StackTun {
	pub fn mtu(&self) -> u16 {
		self.mtu
	}

	/// Feeds a decrypted IP packet into the stack.
	pub fn inject(&self, packet: &[u8]) -> StackResult<()> {
		let mut inner = lock(&self.inner)?;
		push_bounded(&mut inner.device.inbound, packet.to_vec(), "inbound");
		inner.poll();
		inner.wake_all();
		trace!(len = packet.len(), "injected packet into virtual stack");
		Ok(())
	}

	/// Next IP packet the stack wants to send, if any.
	pub fn next_outbound(&self) -> Option<Vec<u8>> {
		let mut inner = self.inner.lock().ok()?;
		inner.poll();
		inner.device.outbound.pop_front()
	}
}

pub struct VirtualTcpStream {
	inner: SharedStack,
	handle: SocketHandle,
}

impl VirtualTcpStream {
	async fn wait_connected(&self) -> StackResult<()> {
		loop {
			{
				let mut inner = lock(&self.inner)?;
				inner.poll();
				let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);
				match socket.state() {
					TcpState::Established => {
						socket.set_timeout(None);
						return Ok(());
					}
					TcpState::Closed | TcpState::Closing | TcpState::TimeWait => {
						return Err(StackError::TcpConnect("connection failed".to_string()));
					}
					_ => {}
				}
			}

			tokio::time::sleep(POLL_INTERVAL).await;
		}
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		let inner = self.inner.lock().ok()?;
		let remote = inner.sockets.get::<TcpSocket>(self.handle).remote_endpoint()?;
		Some(SocketAddr::new(from_smoltcp(remote.addr), remote.port))
	}

	fn read_inner(&self, buf: &mut [u8], waker: &Waker) -> io::Result<usize> {
		let mut inner = lock_io(&self.inner)?;
		inner.poll();

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);
		if socket.can_recv() {
			let n = socket
				.recv_slice(buf)
				.map_err(|e| io::Error::other(format!("{e}")))?;
			inner.poll();
			Ok(n)
		} else if socket.may_recv() {
			inner.register_waker(waker);
			Err(io::ErrorKind::WouldBlock.into())
		} else {
			Ok(0)
		}
	}

	fn write_inner(&self, buf: &[u8], waker: &Waker) -> io::Result<usize> {
		let mut inner = lock_io(&self.inner)?;

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);
		if socket.can_send() {
			let n = socket
				.send_slice(buf)
				.map_err(|e| io::Error::other(format!("{e}")))?;
			inner.poll();
			Ok(n)
		} else if socket.may_send() {
			inner.register_waker(waker);
			Err(io::ErrorKind::WouldBlock.into())
		} else {
			Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
		}
	}
}

impl AsyncRead for VirtualTcpStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.read_inner(buf.initialize_unfilled(), cx.waker()) {
			Ok(n) => {
				buf.advance(n);
				Poll::Ready(Ok(()))
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
			Err(e) => Poll::Ready(Err(e)),
		}
	}
}

impl AsyncWrite for VirtualTcpStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.write_inner(buf, cx.waker()) {
			Ok(n) => Poll::Ready(Ok(n)),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
			Err(e) => Poll::Ready(Err(e)),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let mut inner = lock_io(&self.inner)?;
		inner.poll();
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let mut inner = lock_io(&self.inner)?;
		inner.sockets.get_mut::<TcpSocket>(self.handle).close();
		inner.poll();
		Poll::Ready(Ok(()))
	}
}

impl Drop for VirtualTcpStream {
	fn drop(&mut self) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.sockets.get_mut::<TcpSocket>(self.handle).close();
			inner.orphans.push(self.handle);
			inner.poll();
		}
	}
}

/// A UDP socket bound to an ephemeral port and connected to one remote endpoint.
///
/// Each write sends one datagram and each read returns one datagram; datagrams from
/// other sources are discarded.
pub struct VirtualUdpSocket {
	inner: SharedStack,
	handle: SocketHandle,
	remote: IpEndpoint,
}

impl VirtualUdpSocket {
	pub fn peer_addr(&self) -> SocketAddr {
		SocketAddr::new(from_smoltcp(self.remote.addr), self.remote.port)
	}

	fn recv_inner(&self, buf: &mut [u8], waker: &Waker) -> io::Result<usize> {
		let mut inner = lock_io(&self.inner)?;
		inner.poll();
		if inner.closed {
			return Ok(0);
		}

		let socket = inner.sockets.get_mut::<UdpSocket>(self.handle);
		loop {
			match socket.recv_slice(buf) {
				Ok((n, meta)) if meta.endpoint == self.remote => return Ok(n),
				Ok((_, meta)) => {
					trace!(from = %meta.endpoint, "dropping datagram from unexpected source");
				}
				Err(udp::RecvError::Exhausted) => {
					inner.register_waker(waker);
					return Err(io::ErrorKind::WouldBlock.into());
				}
				Err(e) => return Err(io::Error::other(format!("{e}"))),
			}
		}
	}

	fn send_inner(&self, buf: &[u8], waker: &Waker) -> io::Result<usize> {
		let mut inner = lock_io(&self.inner)?;
		if inner.closed {
			return Err(io::Error::new(io::ErrorKind::NotConnected, "stack closed"));
		}

		let socket = inner.sockets.get_mut::<UdpSocket>(self.handle);
		match socket.send_slice(buf, self.remote) {
			Ok(()) => {
				inner.poll();
				Ok(buf.len())
			}
			Err(udp::SendError::BufferFull) => {
				inner.register_waker(waker);
				Err(io::ErrorKind::WouldBlock.into())
			}
			Err(e) => Err(io::Error::other(format!("{e}"))),
		}
	}
}

impl AsyncRead for VirtualUdpSocket {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.recv_inner(buf.initialize_unfilled(), cx.waker()) {
			Ok(n) => {
				buf.advance(n);
				Poll::Ready(Ok(()))
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
			Err(e) => Poll::Ready(Err(e)),
		}
	}
}

impl AsyncWrite for VirtualUdpSocket {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.send_inner(buf, cx.waker()) {
			Ok(n) => Poll::Ready(Ok(n)),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
			Err(e) => Poll::Ready(Err(e)),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}
}

impl Drop for VirtualUdpSocket {
	fn drop(&mut self) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.sockets.remove(self.handle);
		}
	}
}

/// A connection opened through the virtual stack.
pub enum VirtualConn {
	Tcp(VirtualTcpStream),
	Udp(VirtualUdpSocket),
}

impl VirtualConn {
	pub fn peer_addr(&self) -> Option<SocketAddr> {
		match self {
			VirtualConn::Tcp(stream) => stream.peer_addr(),
			VirtualConn::Udp(socket) => Some(socket.peer_addr()),
		}
	}
}

impl fmt::Debug for VirtualConn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let kind = match self {
			VirtualConn::Tcp(_) => "tcp",
			VirtualConn::Udp(_) => "udp",
		};
		f.debug_struct("VirtualConn")
			.field("kind", &kind)
			.field("peer", &self.peer_addr())
			.finish()
	}
}

impl AsyncRead for VirtualConn {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.get_mut() {
			VirtualConn::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
			VirtualConn::Udp(socket) => Pin::new(socket).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for VirtualConn {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			VirtualConn::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
			VirtualConn::Udp(socket) => Pin::new(socket).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			VirtualConn::Tcp(stream) => Pin::new(stream).poll_flush(cx),
			VirtualConn::Udp(socket) => Pin::new(socket).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			VirtualConn::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
			VirtualConn::Udp(socket) => Pin::new(socket).poll_shutdown(cx),
		}
	}
}
