// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{DialError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline for one dial or resolve call.
#[derive(Debug, Clone)]
pub struct Context {
	token: CancellationToken,
	deadline: Option<Instant>,
}

impl Context {
	/// Never cancelled, no deadline.
	pub fn background() -> Self {
		Self {
			token: CancellationToken::new(),
			deadline: None,
		}
	}

	pub fn with_cancellation(token: CancellationToken) -> Self {
		Self {
			token,
			deadline: None,
		}
	}

	pub fn with_timeout(timeout: Duration) -> Self {
		Self::with_deadline(Instant::now() + timeout)
	}

	pub fn with_deadline(deadline: Instant) -> Self {
		Self {
			token: CancellationToken::new(),
			deadline: Some(deadline),
		}
	}

	/// Adds or tightens the deadline.
	pub fn deadline(mut self, deadline: Instant) -> Self {
		self.deadline = Some(match self.deadline {
			Some(current) => current.min(deadline),
			None => deadline,
		});
		self
	}

	pub fn token(&self) -> &CancellationToken {
		&self.token
	}

	pub fn cancel(&self) {
		self.token.cancel();
	}

	pub fn is_done(&self) -> bool {
		self.err().is_some()
	}

	/// Why the context is done, or `None` while it is still live.
	pub fn err(&self) -> Option<DialError> {
		if self.token.is_cancelled() {
			return Some(DialError::Cancelled);
		}
		match self.deadline {
			Some(deadline) if Instant::now() >= deadline => Some(DialError::DeadlineExceeded),
			_ => None,
		}
	}

	/// Resolves once the context is cancelled or its deadline passes.
	pub async fn done(&self) -> DialError {
		let deadline = async {
			match self.deadline {
				Some(deadline) => tokio::time::sleep_until(deadline).await,
				None => std::future::pending().await,
			}
		};

		tokio::select! {
			biased;
			_ = self.token.cancelled() => DialError::Cancelled,
			_ = deadline => DialError::DeadlineExceeded,
		}
	}

	/// Runs `operation` unless the context is already done, abandoning it if the context
	/// finishes first.
	pub async fn run<T, F>(&self, operation: F) -> Result<T>
	where
		F: Future<Output = Result<T>>,
	{
		if let Some(err) = self.err() {
			return Err(err);
		}

		tokio::select! {
			biased;
			err = self.done() => Err(err),
			result = operation => result,
		}
	}
}

impl Default for Context {
	fn default() -> Self {
		Self::background()
	}
}
