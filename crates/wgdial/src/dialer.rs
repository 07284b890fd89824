// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::backend::{Backend, Conn, NetStack, TunnelDevice, Userspace};
use crate::context::Context;
use crate::error::{BootstrapError, DialError, Result};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use wgdial_common::{uapi, Interface, Peer, DEFAULT_MTU};
use wgdial_engine::{LogLevel, Network};

/// Dials and resolves through a WireGuard tunnel it owns.
///
/// The tunnel is configured once, when the dialer is built. Closing or dropping the dialer
/// stops the device and aborts every connection opened through it.
pub struct Dialer {
	stack: Arc<dyn NetStack>,
	device: Box<dyn TunnelDevice>,
	log: LogLevel,
}

impl Dialer {
	/// Builds a dialer on the in-process userspace stack and device.
	pub async fn new(
		debug: bool,
		interface: Interface,
		peers: Vec<Peer>,
	) -> std::result::Result<Self, BootstrapError> {
		Self::with_backend(&Userspace, debug, interface, peers).await
	}

	/// Builds a dialer on `backend`.
	///
	/// Every address and key is checked before the backend allocates anything.
	#[instrument(skip_all, fields(address = %interface.address, peers = peers.len(), debug = debug_enabled))]
	pub async fn with_backend<B: Backend>(
		backend: &B,
		debug_enabled: bool,
		interface: Interface,
		peers: Vec<Peer>,
	) -> std::result::Result<Self, BootstrapError> {
		let address = interface.parse_address()?;
		let dns_servers = interface.parse_dns()?;
		let config = uapi::serialize(&interface, &peers)?;
		drop(interface);

		let log = if debug_enabled {
			LogLevel::Verbose
		} else {
			LogLevel::Silent
		};

		let (stack, transport) = backend
			.create_stack(&[address], &dns_servers, DEFAULT_MTU)
			.map_err(BootstrapError::Stack)?;

		let device = match backend.create_device(transport, log).await {
			Ok(device) => device,
			Err(e) => {
				stack.close();
				return Err(BootstrapError::Device(e));
			}
		};

		if let Err(e) = device.ipc_set(&config).await {
			warn!(error = %e, "tunnel device rejected configuration");
			device.close();
			stack.close();
			return Err(BootstrapError::ProtocolSubmission(e));
		}

		info!(
			%address,
			dns_servers = dns_servers.len(),
			lines = config.lines().count(),
			"tunnel configured"
		);

		Ok(Self { stack, device, log })
	}

	/// Opens a connection to `address` (`host:port`) through the tunnel.
	#[instrument(skip(self, ctx), fields(%network))]
	pub async fn dial(&self, ctx: &Context, network: Network, address: &str) -> Result<Conn> {
		let conn = ctx
			.run(async {
				self.stack
					.dial(network, address)
					.await
					.map_err(DialError::from)
			})
			.await?;
		debug!(peer = ?conn.peer_addr(), "dialed");
		Ok(conn)
	}

	/// Resolves `name` with the tunnel's DNS servers, returning the first address.
	#[instrument(skip(self, ctx))]
	pub async fn resolve(&self, ctx: &Context, name: &str) -> Result<IpAddr> {
		let addresses = ctx
			.run(async {
				self.stack
					.lookup_host(name)
					.await
					.map_err(DialError::from)
			})
			.await?;

		let first = addresses.first().copied().ok_or_else(|| DialError::NotFound {
			name: name.to_string(),
		})?;
		debug!(%first, candidates = addresses.len(), "resolved");
		Ok(first)
	}

	pub fn local_addresses(&self) -> Vec<IpAddr> {
		self.stack.local_addresses()
	}

	pub fn dns_servers(&self) -> Vec<IpAddr> {
		self.stack.dns_servers()
	}

	pub fn log_level(&self) -> LogLevel {
		self.log
	}

	/// Stops the device and aborts open connections. Idempotent.
	pub fn close(&self) {
		self.device.close();
		self.stack.close();
	}
}

impl Drop for Dialer {
	fn drop(&mut self) {
		self.close();
	}
}
