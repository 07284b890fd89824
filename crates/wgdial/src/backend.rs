// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The seams between the dialer and the tunnel implementation.

use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use wgdial_engine::{
	DefaultBind, EngineError, LogLevel, Network, StackError, StackTun, VirtualConn, VirtualStack,
	WgDevice,
};

/// A byte stream or connected datagram socket opened through the tunnel.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {
	fn peer_addr(&self) -> Option<SocketAddr>;
}

pub type Conn = Box<dyn Connection>;

impl Connection for VirtualConn {
	fn peer_addr(&self) -> Option<SocketAddr> {
		VirtualConn::peer_addr(self)
	}
}

/// Connection-facing side of a virtual network stack.
#[async_trait]
pub trait NetStack: Send + Sync {
	async fn dial(&self, network: Network, address: &str) -> Result<Conn, StackError>;

	/// Addresses for `name` in resolver order. An empty list means the name has no records.
	async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>, StackError>;

	fn local_addresses(&self) -> Vec<IpAddr>;

	fn dns_servers(&self) -> Vec<IpAddr>;

	fn close(&self);
}

/// The encrypting half of the tunnel, configured once through UAPI text.
#[async_trait]
pub trait TunnelDevice: Send + Sync {
	async fn ipc_set(&self, uapi: &str) -> Result<(), EngineError>;

	fn close(&self);
}

/// Builds the stack and the device bound to it.
#[async_trait]
pub trait Backend: Send + Sync {
	/// Packet path from the stack to the device.
	type Transport: Send;

	fn create_stack(
		&self,
		addresses: &[IpAddr],
		dns_servers: &[IpAddr],
		mtu: u16,
	) -> Result<(Arc<dyn NetStack>, Self::Transport), StackError>;

	async fn create_device(
		&self,
		transport: Self::Transport,
		log: LogLevel,
	) -> Result<Box<dyn TunnelDevice>, EngineError>;
}

/// smoltcp stack plus boringtun device, all in process.
#[derive(Debug, Clone, Copy, Default)]
pub struct Userspace;

#[async_trait]
impl Backend for Userspace {
	type Transport = StackTun;

	fn create_stack(
		&self,
		addresses: &[IpAddr],
		dns_servers: &[IpAddr],
		mtu: u16,
	) -> Result<(Arc<dyn NetStack>, StackTun), StackError> {
		let (stack, tun) = VirtualStack::new(addresses, dns_servers, mtu)?;
		let stack: Arc<dyn NetStack> = Arc::new(stack);
		Ok((stack, tun))
	}

	async fn create_device(
		&self,
		transport: StackTun,
		log: LogLevel,
	) -> Result<Box<dyn TunnelDevice>, EngineError> {
		let bind = DefaultBind::bind().await?;
		let device = WgDevice::new(transport, bind, log)?;
		Ok(Box::new(device))
	}
}

#[async_trait]
impl NetStack for VirtualStack {
	async fn dial(&self, network: Network, address: &str) -> Result<Conn, StackError> {
		let conn = VirtualStack::dial(self, network, address).await?;
		Ok(Box::new(conn))
	}

	async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>, StackError> {
		VirtualStack::lookup_host(self, name).await
	}

	fn local_addresses(&self) -> Vec<IpAddr> {
		self.addresses().to_vec()
	}

	fn dns_servers(&self) -> Vec<IpAddr> {
		VirtualStack::dns_servers(self).to_vec()
	}

	fn close(&self) {
		VirtualStack::close(self)
	}
}

#[async_trait]
impl TunnelDevice for WgDevice {
	async fn ipc_set(&self, uapi: &str) -> Result<(), EngineError> {
		WgDevice::ipc_set(self, uapi).await
	}

	fn close(&self) {
		WgDevice::close(self)
	}
}
