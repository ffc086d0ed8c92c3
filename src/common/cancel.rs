//! Cancellation tokens threaded through every suspension point.
//!
//! A token carries a user-cancel flag and an optional deadline. Deadlines are
//! always expressed as a linked child token so the transport can tell a fired
//! timer apart from an explicit cancel: the former maps to `Timeout`, the
//! latter to `Canceled`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Error;

/// Why a [`CancelToken`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called on this token or an ancestor.
    User,
    /// A linked deadline elapsed.
    Deadline,
}

struct Inner {
    canceled: AtomicBool,
    notify: Notify,
    deadline: Option<Instant>,
    parent: Option<Arc<Inner>>,
}

/// A cloneable cancellation handle.
///
/// Cancelling a token cancels every child linked from it. Tokens are cheap to
/// clone and safe to share across tasks.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a token that only fires on an explicit `cancel()`.
    pub fn new() -> CancelToken {
        CancelToken {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                notify: Notify::new(),
                deadline: None,
                parent: None,
            }),
        }
    }

    /// Signals cancellation to this token and all linked children.
    pub fn cancel(&self) {
        if !self.inner.canceled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns true once this token or any ancestor was canceled or timed out.
    pub fn is_canceled(&self) -> bool {
        self.check().is_some()
    }

    /// Links a child token that additionally fires at `deadline`.
    pub(crate) fn with_deadline(&self, deadline: Instant) -> CancelToken {
        CancelToken {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                notify: Notify::new(),
                deadline: Some(deadline),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    fn check(&self) -> Option<CancelReason> {
        let mut node = Some(&self.inner);
        while let Some(inner) = node {
            if inner.canceled.load(Ordering::SeqCst) {
                return Some(CancelReason::User);
            }
            node = inner.parent.as_ref();
        }
        let mut node = Some(&self.inner);
        while let Some(inner) = node {
            if let Some(deadline) = inner.deadline {
                if Instant::now() >= deadline {
                    return Some(CancelReason::Deadline);
                }
            }
            node = inner.parent.as_ref();
        }
        None
    }

    /// Resolves once the token fires, reporting why.
    pub async fn canceled(&self) -> CancelReason {
        loop {
            if let Some(reason) = self.check() {
                return reason;
            }

            // Arm every notify in the chain before re-checking, so a cancel
            // between check() and await cannot be missed.
            let mut notified = Vec::new();
            let mut nearest_deadline: Option<Instant> = None;
            let mut node = Some(&self.inner);
            while let Some(inner) = node {
                notified.push(Box::pin(inner.notify.notified()));
                if let Some(deadline) = inner.deadline {
                    nearest_deadline = Some(match nearest_deadline {
                        Some(cur) => cur.min(deadline),
                        None => deadline,
                    });
                }
                node = inner.parent.as_ref();
            }

            if let Some(reason) = self.check() {
                return reason;
            }

            let any_notified = futures_util::future::select_all(notified);
            match nearest_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = any_notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    let _ = any_notified.await;
                }
            }
        }
    }

    /// Maps the fired token to the taxonomy.
    pub(crate) fn error(&self) -> Error {
        match self.check() {
            Some(CancelReason::Deadline) => Error::new_timeout(),
            _ => Error::new_canceled(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn explicit_cancel_is_user() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.canceled().await });
        tokio::task::yield_now().await;
        token.cancel();
        assert_eq!(handle.await.unwrap(), CancelReason::User);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_maps_to_timeout() {
        let parent = CancelToken::new();
        let child = parent.with_deadline(Instant::now() + Duration::from_millis(50));
        assert_eq!(child.canceled().await, CancelReason::Deadline);
        assert!(child.error().is_timeout());
        assert!(!parent.is_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancel_reaches_child() {
        let parent = CancelToken::new();
        let child = parent.with_deadline(Instant::now() + Duration::from_secs(60));
        parent.cancel();
        assert_eq!(child.canceled().await, CancelReason::User);
        assert!(child.error().is_canceled());
    }
}
