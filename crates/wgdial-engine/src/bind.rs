// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, instrument, warn};

/// UDP transport for encrypted WireGuard datagrams: one IPv4 and one IPv6 socket, each on
/// an ephemeral port.
pub struct DefaultBind {
	v4: Option<UdpSocket>,
	v6: Option<UdpSocket>,
}

impl DefaultBind {
	/// Binds both families. Fails only when neither socket can be bound.
	#[instrument]
	pub async fn bind() -> Result<Self> {
		let v4 = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
			Ok(socket) => Some(socket),
			Err(e) => {
				warn!(error = %e, "failed to bind IPv4 UDP socket");
				None
			}
		};
		let v6 = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await {
			Ok(socket) => Some(socket),
			Err(e) => {
				warn!(error = %e, "failed to bind IPv6 UDP socket");
				None
			}
		};

		if v4.is_none() && v6.is_none() {
			return Err(EngineError::NoBind);
		}

		let bind = Self { v4, v6 };
		debug!(v4 = ?bind.local_v4(), v6 = ?bind.local_v6(), "bound UDP sockets");
		Ok(bind)
	}

	pub fn local_v4(&self) -> Option<SocketAddr> {
		self.v4.as_ref().and_then(|s| s.local_addr().ok())
	}

	pub fn local_v6(&self) -> Option<SocketAddr> {
		self.v6.as_ref().and_then(|s| s.local_addr().ok())
	}

	pub async fn send_to(&self, data: &[u8], endpoint: SocketAddr) -> io::Result<()> {
		let socket = match endpoint {
			SocketAddr::V4(_) => self.v4.as_ref(),
			SocketAddr::V6(_) => self.v6.as_ref(),
		};
		let socket = socket.ok_or_else(|| {
			io::Error::new(
				io::ErrorKind::AddrNotAvailable,
				format!("no socket bound for {endpoint}"),
			)
		})?;
		socket.send_to(data, endpoint).await?;
		Ok(())
	}

	/// Receives from whichever socket is readable first. The source address is
	/// canonicalized so that v4-mapped senders compare equal to their IPv4 endpoint.
	pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		let (len, from) = match (&self.v4, &self.v6) {
			(Some(v4), Some(v6)) => loop {
				let socket = tokio::select! {
					ready = v4.readable() => { ready?; v4 }
					ready = v6.readable() => { ready?; v6 }
				};
				match socket.try_recv_from(buf) {
					Ok(received) => break received,
					Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
					Err(e) => return Err(e),
				}
			},
			(Some(socket), None) | (None, Some(socket)) => socket.recv_from(buf).await?,
			(None, None) => return Err(io::Error::from(io::ErrorKind::NotConnected)),
		};
		Ok((len, canonical(from)))
	}
}

pub(crate) fn canonical(addr: SocketAddr) -> SocketAddr {
	SocketAddr::new(addr.ip().to_canonical(), addr.port())
}
