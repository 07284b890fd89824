// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::uapi::PeerKey;
use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::{debug, instrument, warn};

/// Maps allowed-IP prefixes to the peer that may send and receive for them.
///
/// Lookups pick the longest matching prefix.
pub struct Router {
	table: IpNetworkTable<PeerKey>,
}

impl Router {
	pub fn new() -> Self {
		Self {
			table: IpNetworkTable::new(),
		}
	}

	#[instrument(skip(self), fields(%net, %peer))]
	pub fn add_route(&mut self, net: IpNet, peer: PeerKey) {
		let network = match IpNetwork::new_truncate(net.addr(), net.prefix_len()) {
			Ok(network) => network,
			Err(e) => {
				warn!(error = %e, "skipping unrepresentable allowed IP");
				return;
			}
		};

		match self.table.insert(network, peer) {
			Some(previous) if previous != peer => warn!(
				old_peer = %previous,
				new_peer = %peer,
				"allowed IP reassigned to different peer"
			),
			Some(_) => {}
			None => debug!("added route"),
		}
	}

	pub fn route(&self, dst: IpAddr) -> Option<&PeerKey> {
		self.table.longest_match(dst).map(|(_, peer)| peer)
	}

	pub fn route_count(&self) -> usize {
		let (v4, v6) = self.table.len();
		v4 + v6
	}

	/// Prefixes owned by `peer`, in address order.
	pub fn routes_for_peer(&self, peer: &PeerKey) -> Vec<IpNet> {
		let mut routes: Vec<IpNet> = self
			.table
			.iter()
			.filter(|(_, owner)| *owner == peer)
			.filter_map(|(network, _)| IpNet::new(network.network_address(), network.netmask()).ok())
			.collect();
		routes.sort();
		routes
	}
}

impl Default for Router {
	fn default() -> Self {
		Self::new()
	}
}
