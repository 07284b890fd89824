// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Rendering of the configuration model into the WireGuard UAPI `set` text.
//!
//! The output is one `private_key` line followed by one block per peer, in the order the
//! peers were given:
//!
//! ```text
//! private_key=<hex>
//! public_key=<hex>
//! allowed_ip=<cidr>
//! endpoint=<host:port>
//! preshared_key=<hex>
//! persistent_keepalive_interval=<seconds>
//! ```
//!
//! `preshared_key` is only written when the peer has one and
//! `persistent_keepalive_interval` only when the keepalive is positive.

use crate::config::{Interface, Peer, Result};
use std::fmt::Write;
use tracing::instrument;
use zeroize::Zeroizing;

/// Renders `interface` and `peers` as UAPI text.
///
/// Any key that fails to decode aborts the whole call; no partial text is returned.
#[instrument(skip_all, fields(peers = peers.len()))]
pub fn serialize(interface: &Interface, peers: &[Peer]) -> Result<Zeroizing<String>> {
	let mut out = Zeroizing::new(String::new());

	let private_key = Zeroizing::new(interface.private_key_hex()?);
	push_line(&mut out, "private_key", private_key.as_str());

	for (index, peer) in peers.iter().enumerate() {
		write_peer(&mut out, index, peer)?;
	}

	Ok(out)
}

fn write_peer(out: &mut String, index: usize, peer: &Peer) -> Result<()> {
	let public_key = peer.public_key_hex(index)?;
	push_line(out, "public_key", &public_key);
	push_line(out, "allowed_ip", &peer.allowed_ip);
	push_line(out, "endpoint", &peer.endpoint);

	if let Some(psk) = peer.preshared_key_hex(index)? {
		let psk = Zeroizing::new(psk);
		push_line(out, "preshared_key", psk.as_str());
	}

	if peer.keep_alive > 0 {
		push_line(out, "persistent_keepalive_interval", peer.keep_alive);
	}

	Ok(())
}

fn push_line(out: &mut String, key: &str, value: impl std::fmt::Display) {
	// Writing into a String cannot fail.
	let _ = writeln!(out, "{key}={value}");
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConfigError;
	use base64::engine::general_purpose::STANDARD;
	use base64::Engine;

	fn key(byte: u8) -> String {
		STANDARD.encode([byte; 32])
	}

	fn hex_of(byte: u8) -> String {
		hex::encode([byte; 32])
	}

	#[test]
	fn single_peer_exact_output() {
		let interface = Interface::new("10.0.0.2", key(1));
		let peer = Peer::new(key(2), "1.2.3.4:51820", "10.0.0.0/24");

		let text = serialize(&interface, &[peer]).unwrap();
		let expected = format!(
			"private_key={}\npublic_key={}\nallowed_ip=10.0.0.0/24\nendpoint=1.2.3.4:51820\n",
			hex_of(1),
			hex_of(2)
		);
		assert_eq!(text.as_str(), expected);
	}

	#[test]
	fn no_peers_only_private_key() {
		let interface = Interface::new("10.0.0.2", key(7));
		let text = serialize(&interface, &[]).unwrap();
		assert_eq!(text.as_str(), format!("private_key={}\n", hex_of(7)));
	}

	#[test]
	fn optional_lines_follow_endpoint() {
		let interface = Interface::new("10.0.0.2", key(1));
		let peer = Peer::new(key(2), "vpn.example.com:51820", "0.0.0.0/0")
			.with_preshared_key(key(3))
			.with_keep_alive(25);

		let text = serialize(&interface, &[peer]).unwrap();
		let lines: Vec<String> = text.lines().map(str::to_string).collect();
		let expected = vec![
			format!("private_key={}", hex_of(1)),
			format!("public_key={}", hex_of(2)),
			"allowed_ip=0.0.0.0/0".to_string(),
			"endpoint=vpn.example.com:51820".to_string(),
			format!("preshared_key={}", hex_of(3)),
			"persistent_keepalive_interval=25".to_string(),
		];
		assert_eq!(lines, expected);
	}

	#[test]
	fn keepalive_omitted_when_not_positive() {
		let interface = Interface::new("10.0.0.2", key(1));
		for keep_alive in [0, -1, -300] {
			let peer = Peer::new(key(2), "1.2.3.4:51820", "10.0.0.0/24").with_keep_alive(keep_alive);
			let text = serialize(&interface, &[peer]).unwrap();
			assert!(!text.contains("persistent_keepalive_interval="));
			assert!(!text.contains("preshared_key="));
		}
	}

	#[test]
	fn peer_blocks_keep_input_order() {
		let interface = Interface::new("10.0.0.2", key(1));
		let first = Peer::new(key(0xaa), "1.1.1.1:1", "10.1.0.0/16").with_keep_alive(5);
		let second = Peer::new(key(0xbb), "2.2.2.2:2", "10.2.0.0/16");

		let text = serialize(&interface, &[first, second]).unwrap();
		let first_start = text.find(&hex_of(0xaa)).unwrap();
		let first_end = text.find("persistent_keepalive_interval=5").unwrap();
		let second_start = text.find(&hex_of(0xbb)).unwrap();

		assert!(first_start < first_end);
		assert!(first_end < second_start);
		assert!(!text.contains("\n\n"));
		assert!(text.ends_with("endpoint=2.2.2.2:2\n"));
	}

	#[test]
	fn invalid_private_key_aborts() {
		let interface = Interface::new("10.0.0.2", "***");
		let peer = Peer::new(key(2), "1.2.3.4:51820", "10.0.0.0/24");

		let err = serialize(&interface, &[peer]).unwrap_err();
		assert!(matches!(err, ConfigError::Decode { ref field, .. } if field == "private_key"));
	}

	#[test]
	fn invalid_public_key_in_later_peer_aborts() {
		let interface = Interface::new("10.0.0.2", key(1));
		let peers = [
			Peer::new(key(2), "1.2.3.4:51820", "10.0.0.0/24"),
			Peer::new("not-a-key", "1.2.3.5:51820", "10.0.1.0/24"),
		];

		let err = serialize(&interface, &peers).unwrap_err();
		assert!(matches!(err, ConfigError::Decode { ref field, .. } if field == "peers[1].public_key"));
	}

	#[test]
	fn invalid_preshared_key_aborts() {
		let interface = Interface::new("10.0.0.2", key(1));
		let peer = Peer::new(key(2), "1.2.3.4:51820", "10.0.0.0/24").with_preshared_key("bad psk");

		let err = serialize(&interface, &[peer]).unwrap_err();
		match err {
			ConfigError::Decode { field, source } => {
				assert_eq!(field, "peers[0].preshared_key");
				assert!(source.to_string().contains("bad psk"));
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}
