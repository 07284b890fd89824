// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::AddrParseError;
use thiserror::Error;
use wgdial_common::{ConfigError, KeyError};
use wgdial_engine::{EngineError, StackError};

/// Failure while turning a configuration into a running tunnel.
#[derive(Debug, Error)]
pub enum BootstrapError {
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

	#[error("failed to create virtual network stack")]
	Stack(#[source] StackError),

	#[error("failed to create tunnel device")]
	Device(#[source] EngineError),

	#[error("tunnel device rejected configuration")]
	ProtocolSubmission(#[source] EngineError),
}

impl From<ConfigError> for BootstrapError {
	fn from(err: ConfigError) -> Self {
		match err {
			ConfigError::Parse {
				field,
				value,
				source,
			} => Self::Parse {
				field,
				value,
				source,
			},
			ConfigError::Decode { field, source } => Self::Decode { field, source },
		}
	}
}

#[derive(Debug, Error)]
pub enum DialError {
	#[error("no addresses found for {name}")]
	NotFound { name: String },

	#[error("operation cancelled")]
	Cancelled,

	#[error("deadline exceeded")]
	DeadlineExceeded,

	#[error(transparent)]
	Network(#[from] StackError),
}

impl DialError {
	/// True when the caller's context ended the operation.
	pub fn is_cancellation(&self) -> bool {
		matches!(self, DialError::Cancelled | DialError::DeadlineExceeded)
	}
}

pub type Result<T> = std::result::Result<T, DialError>;
