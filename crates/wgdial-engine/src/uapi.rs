// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Parsing and rendering of the WireGuard UAPI `set`/`get` text.

use crate::error::{EngineError, Result};
use ipnet::IpNet;
use std::fmt::{self, Write};
use std::net::SocketAddr;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey([u8; 32]);

impl PeerKey {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}
}

impl fmt::Debug for PeerKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "PeerKey({self})")
	}
}

impl fmt::Display for PeerKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}...", &self.to_hex()[..8])
	}
}

/// 32 bytes of key material that must not be printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self(bytes)
	}

	pub fn expose_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl fmt::Debug for SecretKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
	pub public_key: PeerKey,
	pub preshared_key: Option<SecretKey>,
	pub endpoint: Option<SocketAddr>,
	pub allowed_ips: Vec<IpNet>,
	pub persistent_keepalive: Option<u16>,
	pub replace_allowed_ips: bool,
}

impl PeerConfig {
	pub fn new(public_key: PeerKey) -> Self {
		Self {
			public_key,
			preshared_key: None,
			endpoint: None,
			allowed_ips: Vec::new(),
			persistent_keepalive: None,
			replace_allowed_ips: false,
		}
	}
}

/// One parsed `set` operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
	pub private_key: Option<SecretKey>,
	pub replace_peers: bool,
	pub peers: Vec<PeerConfig>,
}

/// Parses a `set` operation.
///
/// Device keys must come before the first `public_key`; every later line applies to the
/// most recent peer. A blank line ends the operation. Nothing is applied here, so a
/// failure anywhere rejects the whole text. Host name endpoints are resolved with the
/// runtime's resolver, so this never blocks a worker thread.
pub async fn parse(text: &str) -> Result<DeviceConfig> {
	let mut config = DeviceConfig::default();

	for (index, line) in text.lines().enumerate() {
		let lineno = index + 1;
		if line.is_empty() {
			break;
		}

		let (key, value) = line
			.split_once('=')
			.ok_or_else(|| EngineError::uapi(lineno, "expected key=value"))?;

		let Some(peer) = config.peers.last_mut() else {
			match key {
				"private_key" => config.private_key = Some(parse_secret(lineno, value)?),
				"replace_peers" => config.replace_peers = parse_true(lineno, key, value)?,
				"public_key" => push_peer(&mut config, lineno, value)?,
				_ => return Err(EngineError::uapi(lineno, format!("invalid device key {key:?}"))),
			}
			continue;
		};

		match key {
			"public_key" => push_peer(&mut config, lineno, value)?,
			"preshared_key" => peer.preshared_key = Some(parse_secret(lineno, value)?),
			"endpoint" => peer.endpoint = Some(parse_endpoint(lineno, value).await?),
			"allowed_ip" => {
				let net: IpNet = value
					.parse()
					.map_err(|_| EngineError::uapi(lineno, format!("invalid allowed_ip {value:?}")))?;
				peer.allowed_ips.push(net.trunc());
			}
			"persistent_keepalive_interval" => {
				let seconds: u16 = value.parse().map_err(|_| {
					EngineError::uapi(lineno, format!("invalid persistent_keepalive_interval {value:?}"))
				})?;
				peer.persistent_keepalive = (seconds > 0).then_some(seconds);
			}
			"replace_allowed_ips" => {
				peer.replace_allowed_ips = parse_true(lineno, key, value)?;
				if peer.replace_allowed_ips {
					peer.allowed_ips.clear();
				}
			}
			"protocol_version" => {
				if value != "1" {
					return Err(EngineError::uapi(
						lineno,
						format!("unsupported protocol_version {value:?}"),
					));
				}
			}
			_ => return Err(EngineError::uapi(lineno, format!("invalid peer key {key:?}"))),
		}
	}

	Ok(config)
}

/// Each peer is configured by exactly one block.
fn push_peer(config: &mut DeviceConfig, lineno: usize, value: &str) -> Result<()> {
	let key = parse_public(lineno, value)?;
	if config.peers.iter().any(|peer| peer.public_key == key) {
		return Err(EngineError::uapi(lineno, format!("duplicate public_key {key}")));
	}
	config.peers.push(PeerConfig::new(key));
	Ok(())
}

fn parse_key_bytes(lineno: usize, value: &str) -> Result<Zeroizing<[u8; 32]>> {
	let mut bytes = Zeroizing::new([0u8; 32]);
	hex::decode_to_slice(value, bytes.as_mut_slice())
		.map_err(|e| EngineError::uapi(lineno, format!("invalid key: {e}")))?;
	Ok(bytes)
}

fn parse_secret(lineno: usize, value: &str) -> Result<SecretKey> {
	parse_key_bytes(lineno, value).map(|bytes| SecretKey(*bytes))
}

fn parse_public(lineno: usize, value: &str) -> Result<PeerKey> {
	parse_key_bytes(lineno, value).map(|bytes| PeerKey(*bytes))
}

fn parse_true(lineno: usize, key: &str, value: &str) -> Result<bool> {
	match value {
		"true" => Ok(true),
		"false" => Ok(false),
		_ => Err(EngineError::uapi(lineno, format!("invalid {key} value {value:?}"))),
	}
}

/// Endpoints may name a host; it is resolved once, here.
async fn parse_endpoint(lineno: usize, value: &str) -> Result<SocketAddr> {
	if let Ok(addr) = value.parse() {
		return Ok(addr);
	}
	tokio::net::lookup_host(value)
		.await
		.ok()
		.and_then(|mut addrs| addrs.next())
		.ok_or_else(|| EngineError::uapi(lineno, format!("failed to resolve endpoint {value:?}")))
}

/// Renders a configuration in `get` form.
pub fn render(config: &DeviceConfig) -> Zeroizing<String> {
	let mut out = Zeroizing::new(String::new());

	// Writing into a String cannot fail.
	if let Some(key) = &config.private_key {
		let _ = writeln!(out, "private_key={}", Zeroizing::new(hex::encode(key.0)).as_str());
	}
	for peer in &config.peers {
		let _ = writeln!(out, "public_key={}", peer.public_key.to_hex());
		if let Some(psk) = &peer.preshared_key {
			let _ = writeln!(out, "preshared_key={}", Zeroizing::new(hex::encode(psk.0)).as_str());
		}
		if let Some(endpoint) = peer.endpoint {
			let _ = writeln!(out, "endpoint={endpoint}");
		}
		let _ = writeln!(
			out,
			"persistent_keepalive_interval={}",
			peer.persistent_keepalive.unwrap_or(0)
		);
		for net in &peer.allowed_ips {
			let _ = writeln!(out, "allowed_ip={net}");
		}
	}

	out
}
