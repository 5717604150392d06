//! Cooperative cancellation shared between the race coordinator and workers.
//!
//! A root token is created per race; every worker receives a child token with
//! its own deadline. Cancelling a token cancels all of its descendants.
//! Backends poll [`CancelToken::should_stop`]; the worker awaits
//! [`CancelToken::stopped`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a token stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
	/// A certified optimum was found by another worker.
	EarlyStop,
	/// The request's global deadline passed.
	GlobalDeadline,
	/// The token's own deadline passed.
	Deadline,
	/// Stopped from outside the race.
	Shutdown,
}

struct Inner {
	flag: AtomicBool,
	reason: watch::Sender<Option<StopReason>>,
	children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
	fn new() -> Arc<Self> {
		let (reason, _) = watch::channel(None);
		Arc::new(Self {
			flag: AtomicBool::new(false),
			reason,
			children: Mutex::new(Vec::new()),
		})
	}

	fn cancel(&self, reason: StopReason) {
		let first = self.reason.send_if_modified(|current| {
			if current.is_some() {
				return false;
			}
			*current = Some(reason);
			true
		});
		if !first {
			return;
		}
		self.flag.store(true, Ordering::Release);

		let children = std::mem::take(
			&mut *self
				.children
				.lock()
				.unwrap_or_else(|poisoned| poisoned.into_inner()),
		);
		for child in children.iter().filter_map(Weak::upgrade) {
			child.cancel(reason);
		}
	}
}

#[derive(Clone)]
pub struct CancelToken {
	inner: Arc<Inner>,
	deadline: Option<Instant>,
}

impl CancelToken {
	pub fn new() -> Self {
		Self {
			inner: Inner::new(),
			deadline: None,
		}
	}

	pub fn with_deadline(deadline: Instant) -> Self {
		Self {
			inner: Inner::new(),
			deadline: Some(deadline),
		}
	}

	/// A token cancelled together with `self`, with a deadline no later than
	/// `self`'s.
	pub fn child(&self, deadline: Instant) -> Self {
		let deadline = match self.deadline {
			Some(parent) => parent.min(deadline),
			None => deadline,
		};
		let child = Self {
			inner: Inner::new(),
			deadline: Some(deadline),
		};

		{
			let mut children = self
				.inner
				.children
				.lock()
				.unwrap_or_else(|poisoned| poisoned.into_inner());
			children.retain(|c| c.strong_count() > 0);
			children.push(Arc::downgrade(&child.inner));
		}
		// Parent may have been cancelled before the child was registered.
		if let Some(reason) = self.cancel_reason() {
			child.cancel(reason);
		}
		child
	}

	pub fn cancel(&self, reason: StopReason) {
		self.inner.cancel(reason);
	}

	/// Explicitly cancelled (not merely past the deadline).
	pub fn is_cancelled(&self) -> bool {
		self.inner.flag.load(Ordering::Acquire)
	}

	pub fn cancel_reason(&self) -> Option<StopReason> {
		*self.inner.reason.borrow()
	}

	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	pub fn is_expired(&self) -> bool {
		self.deadline.is_some_and(|d| Instant::now() >= d)
	}

	/// Cheap check for cooperative backends: cancelled or out of time.
	pub fn should_stop(&self) -> bool {
		self.is_cancelled() || self.is_expired()
	}

	/// The reason to report right now, if the token has stopped.
	pub fn stop_reason(&self) -> Option<StopReason> {
		self.cancel_reason().or_else(|| {
			if self.is_expired() {
				Some(StopReason::Deadline)
			} else {
				None
			}
		})
	}

	/// Resolves once the token is cancelled or its deadline passes.
	pub async fn stopped(&self) -> StopReason {
		let mut rx = self.inner.reason.subscribe();
		let cancelled = async move {
			match rx.wait_for(|r| r.is_some()).await {
				Ok(reason) => (*reason).unwrap_or(StopReason::Shutdown),
				Err(_) => StopReason::Shutdown,
			}
		};

		match self.deadline {
			Some(deadline) => tokio::select! {
				reason = cancelled => reason,
				_ = tokio::time::sleep_until(deadline) => {
					self.cancel_reason().unwrap_or(StopReason::Deadline)
				}
			},
			None => cancelled.await,
		}
	}
}

impl Default for CancelToken {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for CancelToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CancelToken")
			.field("cancelled", &self.is_cancelled())
			.field("reason", &self.cancel_reason())
			.field("deadline", &self.deadline)
			.finish()
	}
}
