// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod config;
pub mod keys;
pub mod uapi;

pub use config::{ConfigError, Interface, Peer, TunnelConfig};
pub use keys::{decode_key, KeyError};

/// MTU of the virtual interface. Leaves room for WireGuard overhead on IPv4 and IPv6 paths.
pub const DEFAULT_MTU: u16 = 1280;
