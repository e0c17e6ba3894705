//! Per-call context: cooperative cancellation, deadlines and request values.
//!
//! A [`CallContext`] travels with every call through the middleware chain.
//! Only the retry executor suspends, so it is the only layer that waits on
//! [`CallContext::done`]; the other layers read [`CallContext::value`] for
//! keys and log fields.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Context key holding the request path, used as a log field.
pub const PATH_KEY: &str = "path";
/// Context key holding the caller address, used as the default rate-limit key.
pub const CLIENT_IP_KEY: &str = "client_ip";

/// Reasons for call cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Client went away (disconnected, closed connection, etc.)
    ClientDisconnected,
    /// Deadline expired.
    DeadlineExceeded,
    /// Process is shutting down.
    ServerShutdown,
    /// Explicit user cancellation.
    #[default]
    UserRequested,
    /// Newer request supersedes this one.
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::ClientDisconnected => write!(f, "ClientDisconnected"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::ServerShutdown => write!(f, "ServerShutdown"),
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::Superseded => write!(f, "Superseded"),
        }
    }
}

struct CancelInner {
    tx: watch::Sender<Option<CancelReason>>,
    // Derived tokens; entries die with the last clone of the child.
    children: Mutex<Vec<Weak<CancelInner>>>,
}

impl CancelInner {
    fn new(initial: Option<CancelReason>) -> Arc<Self> {
        let (tx, _rx) = watch::channel(initial);
        Arc::new(Self {
            tx,
            children: Mutex::new(Vec::new()),
        })
    }

    fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, Vec<Weak<CancelInner>>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel(&self, reason: CancelReason) {
        // The reason is set under the children lock so a concurrent `child()`
        // either lands in the list taken here or sees the reason.
        let children = {
            let mut children = self.lock_children();
            // First reason wins.
            self.tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(reason);
                    true
                } else {
                    false
                }
            });
            std::mem::take(&mut *children)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
    }

    fn add_child(&self) -> Arc<CancelInner> {
        let mut children = self.lock_children();
        let inner = CancelInner::new(self.reason());
        if inner.reason().is_none() {
            if children.len() == children.capacity() {
                children.retain(|c| c.strong_count() > 0);
            }
            children.push(Arc::downgrade(&inner));
        }
        inner
    }

    #[cfg(test)]
    fn child_count(&self) -> usize {
        self.lock_children().len()
    }
}

/// A cloneable, awaitable cancellation token.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.inner.reason())
            .finish()
    }
}

impl CancelToken {
    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.reason().is_some()
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        self.inner.reason()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.inner.tx.subscribe();
        let seen = rx.wait_for(|reason| reason.is_some()).await.map(|r| *r);
        match seen {
            Ok(reason) => reason.unwrap_or_default(),
            // The sender lives in `inner`, which we hold.
            Err(_) => std::future::pending().await,
        }
    }

    /// Create a child token that is cancelled when the parent is cancelled,
    /// but can also be cancelled independently.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let inner = self.inner.add_child();
        (
            CancelToken {
                inner: Arc::clone(&inner),
            },
            CancelHandle { inner },
        )
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    /// Trigger cancellation with the given reason.
    pub fn cancel(&self, reason: CancelReason) {
        self.inner.cancel(reason);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.inner.reason().is_some()
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let inner = CancelInner::new(None);
    (
        CancelToken {
            inner: Arc::clone(&inner),
        },
        CancelHandle { inner },
    )
}

/// Context carried by a single outbound call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: Option<CancelToken>,
    deadline: Option<Instant>,
    values: Arc<HashMap<String, String>>,
}

impl CallContext {
    /// An empty context that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context with its own cancel handle.
    ///
    /// Cancelling the parent also cancels the derived context.
    pub fn with_cancel(&self) -> (CallContext, CancelHandle) {
        let (token, handle) = match &self.token {
            Some(parent) => parent.child(),
            None => new_cancel_pair(),
        };
        let ctx = CallContext {
            token: Some(token),
            deadline: self.deadline,
            values: Arc::clone(&self.values),
        };
        (ctx, handle)
    }

    /// Derives a context that expires at `deadline`, or earlier if the parent already does.
    pub fn with_deadline(&self, deadline: Instant) -> CallContext {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        CallContext {
            token: self.token.clone(),
            deadline: Some(deadline),
            values: Arc::clone(&self.values),
        }
    }

    /// Derives a context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> CallContext {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context carrying an extra value.
    pub fn with_value(&self, key: &str, value: &str) -> CallContext {
        let mut values = Arc::clone(&self.values);
        Arc::make_mut(&mut values).insert(key.to_string(), value.to_string());
        CallContext {
            token: self.token.clone(),
            deadline: self.deadline,
            values,
        }
    }

    /// Looks up a value.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Request path for log fields, `"unknown"` when unset.
    pub fn path(&self) -> &str {
        self.value(PATH_KEY).unwrap_or("unknown")
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason if the context is already cancelled or expired.
    pub fn err(&self) -> Option<CancelReason> {
        if let Some(reason) = self.token.as_ref().and_then(CancelToken::cancelled_reason) {
            return Some(reason);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    ///
    /// Never resolves for a context with neither a token nor a deadline.
    pub async fn done(&self) -> CancelReason {
        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(deadline).await;
                    CancelReason::DeadlineExceeded
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            reason = cancelled => reason,
            reason = expired => reason,
        }
    }
}
