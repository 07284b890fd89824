// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Userspace WireGuard engine: a smoltcp virtual stack joined to boringtun tunnels and
//! configured through UAPI text.

pub mod bind;
pub mod device;
pub mod error;
pub mod netstack;
pub mod router;
pub mod uapi;

pub use bind::DefaultBind;
pub use device::{LogLevel, WgDevice};
pub use error::{EngineError, Result, StackError, StackResult};
pub use netstack::{
	split_host_port, Network, StackTun, VirtualConn, VirtualStack, VirtualTcpStream,
	VirtualUdpSocket,
};
pub use router::Router;
pub use uapi::{DeviceConfig, PeerConfig, PeerKey, SecretKey};
