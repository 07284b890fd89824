// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("UAPI line {line}: {reason}")]
	Uapi { line: usize, reason: String },

	#[error("peers configured without a private key")]
	MissingPrivateKey,

	#[error("no UDP socket could be bound")]
	NoBind,

	#[error("a tokio runtime is required to run the device")]
	NoRuntime,

	#[error("device already configured")]
	AlreadyConfigured,

	#[error("device closed")]
	Closed,
}

impl EngineError {
	pub(crate) fn uapi(line: usize, reason: impl Into<String>) -> Self {
		Self::Uapi {
			line,
			reason: reason.into(),
		}
	}
}

#[derive(Debug, Error)]
pub enum StackError {
	#[error("virtual stack error: {0}")]
	Device(String),

	#[error("no local {0} address configured")]
	NoLocalAddress(&'static str),

	#[error("invalid address {address:?}: {reason}")]
	InvalidAddress { address: String, reason: String },

	#[error("TCP connection failed: {0}")]
	TcpConnect(String),

	#[error("UDP socket error: {0}")]
	Udp(String),

	#[error("no DNS servers configured")]
	NoDnsServers,

	#[error("{field}: at most {max} DNS servers are supported")]
	TooManyDnsServers { field: String, max: usize },

	#[error("DNS query for {name} failed: {reason}")]
	Dns { name: String, reason: String },

	#[error("no usable address for {0}")]
	Unreachable(String),

	#[error("unknown network {0:?}")]
	UnknownNetwork(String),

	#[error("virtual stack closed")]
	Closed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
pub type StackResult<T> = std::result::Result<T, StackError>;
