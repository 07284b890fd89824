// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid base64: {input}")]
	InvalidBase64 {
		input: String,
		#[source]
		source: base64::DecodeError,
	},
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// Decodes base64 key text (standard alphabet, padded) into lowercase hex.
///
/// The decoded length is not checked; the tunnel engine rejects keys of the wrong size.
pub fn decode_key(input: &str) -> Result<String> {
	let bytes = Zeroizing::new(STANDARD.decode(input).map_err(|source| KeyError::InvalidBase64 {
		input: input.to_string(),
		source,
	})?);
	Ok(hex::encode(bytes.as_slice()))
}
