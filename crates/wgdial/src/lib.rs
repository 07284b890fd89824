// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Open connections and resolve names through an in-process WireGuard tunnel.
//!
//! ```no_run
//! use wgdial::{Context, Dialer, Interface, Network, Peer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let interface = Interface::new("10.8.0.2", "<base64 private key>").with_dns("10.8.0.1");
//! let peer = Peer::new("<base64 public key>", "vpn.example.com:51820", "0.0.0.0/0");
//!
//! let dialer = Dialer::new(false, interface, vec![peer]).await?;
//! let conn = dialer
//! 	.dial(&Context::background(), Network::Tcp, "internal.example:443")
//! 	.await?;
//! # drop(conn);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod context;
pub mod dialer;
pub mod error;

pub use backend::{Backend, Conn, Connection, NetStack, TunnelDevice, Userspace};
pub use context::Context;
pub use dialer::Dialer;
pub use error::{BootstrapError, DialError, Result};
pub use tokio_util::sync::CancellationToken;
pub use wgdial_common::{Interface, Peer, TunnelConfig};
pub use wgdial_engine::{LogLevel, Network};
