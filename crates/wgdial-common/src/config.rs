// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{decode_key, KeyError};
use serde::Deserialize;
use std::fmt;
use std::net::{AddrParseError, IpAddr};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("invalid IP address in {field}: {value:?}")]
	Parse {
		field: String,
		value: String,
		#[source]
		source: AddrParseError,
	},

	#[error("invalid key in {field}")]
	Decode {
		field: String,
		#[source]
		source: KeyError,
	},
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// The local end of the tunnel.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Interface {
	#[zeroize(skip)]
	pub address: String,
	pub private_key: String,
	#[serde(default)]
	#[zeroize(skip)]
	pub dns: Vec<String>,
}

impl Interface {
	pub fn new(address: impl Into<String>, private_key: impl Into<String>) -> Self {
		Self {
			address: address.into(),
			private_key: private_key.into(),
			dns: Vec::new(),
		}
	}

	pub fn with_dns(mut self, server: impl Into<String>) -> Self {
		self.dns.push(server.into());
		self
	}

	pub fn parse_address(&self) -> Result<IpAddr> {
		self.address.parse().map_err(|source| ConfigError::Parse {
			field: "address".to_string(),
			value: self.address.clone(),
			source,
		})
	}

	/// Parses the DNS servers in order, failing on the first malformed entry.
	pub fn parse_dns(&self) -> Result<Vec<IpAddr>> {
		self.dns
			.iter()
			.enumerate()
			.map(|(i, raw)| {
				raw.parse().map_err(|source| ConfigError::Parse {
					field: format!("dns[{i}]"),
					value: raw.clone(),
					source,
				})
			})
			.collect()
	}

	pub(crate) fn private_key_hex(&self) -> Result<String> {
		decode_key(&self.private_key).map_err(|source| ConfigError::Decode {
			field: "private_key".to_string(),
			source,
		})
	}
}

impl fmt::Debug for Interface {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Interface")
			.field("address", &self.address)
			.field("private_key", &"[REDACTED]")
			.field("dns", &self.dns)
			.finish()
	}
}

/// A remote tunnel endpoint.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Peer {
	#[zeroize(skip)]
	pub public_key: String,
	#[serde(default)]
	pub preshared_key: String,
	#[zeroize(skip)]
	pub endpoint: String,
	#[serde(rename = "allowedip")]
	#[zeroize(skip)]
	pub allowed_ip: String,
	/// Persistent keepalive in seconds; zero or negative disables it.
	#[serde(default)]
	#[zeroize(skip)]
	pub keep_alive: i64,
}

impl Peer {
	pub fn new(
		public_key: impl Into<String>,
		endpoint: impl Into<String>,
		allowed_ip: impl Into<String>,
	) -> Self {
		Self {
			public_key: public_key.into(),
			preshared_key: String::new(),
			endpoint: endpoint.into(),
			allowed_ip: allowed_ip.into(),
			keep_alive: 0,
		}
	}

	pub fn with_preshared_key(mut self, key: impl Into<String>) -> Self {
		self.preshared_key = key.into();
		self
	}

	pub fn with_keep_alive(mut self, seconds: i64) -> Self {
		self.keep_alive = seconds;
		self
	}

	pub fn has_preshared_key(&self) -> bool {
		!self.preshared_key.is_empty()
	}

	pub(crate) fn public_key_hex(&self, index: usize) -> Result<String> {
		decode_key(&self.public_key).map_err(|source| ConfigError::Decode {
			field: format!("peers[{index}].public_key"),
			source,
		})
	}

	pub(crate) fn preshared_key_hex(&self, index: usize) -> Result<Option<String>> {
		if !self.has_preshared_key() {
			return Ok(None);
		}
		decode_key(&self.preshared_key)
			.map(Some)
			.map_err(|source| ConfigError::Decode {
				field: format!("peers[{index}].preshared_key"),
				source,
			})
	}
}

impl fmt::Debug for Peer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let preshared = if self.has_preshared_key() {
			"[REDACTED]"
		} else {
			""
		};
		f.debug_struct("Peer")
			.field("public_key", &self.public_key)
			.field("preshared_key", &preshared)
			.field("endpoint", &self.endpoint)
			.field("allowed_ip", &self.allowed_ip)
			.field("keep_alive", &self.keep_alive)
			.finish()
	}
}

/// One interface and its peers, as handed over by an external loader.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
	pub interface: Interface,
	#[serde(default)]
	pub peers: Vec<Peer>,
	#[serde(default)]
	pub debug: bool,
}

impl TunnelConfig {
	/// Runs every address and key check that bootstrapping would, without building anything.
	pub fn validate(&self) -> Result<()> {
		self.interface.parse_address()?;
		self.interface.parse_dns()?;
		crate::uapi::serialize(&self.interface, &self.peers)?;
		Ok(())
	}
}
