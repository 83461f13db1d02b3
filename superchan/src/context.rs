//! Cancellable execution scopes.
//!
//! A [`Context`] records at most one [`Cause`]. The first `cancel` wins; every
//! later call is a no-op. Cancelling a scope cancels all of its descendants
//! with the very same cause value.

use crate::errors::Cause;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Inner {
    /// Write-once cancellation cause.
    cause: OnceLock<Cause>,
    /// Fires once the cause is recorded.
    done: CancellationToken,
    /// Live child scopes.
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            cause: OnceLock::new(),
            done: CancellationToken::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self, cause: Cause) {
        let won = self.cause.set(cause).is_ok();
        // The cause is visible before any waiter wakes up.
        self.done.cancel();
        if !won {
            return;
        }

        let Some(cause) = self.cause.get() else {
            return;
        };
        debug!(cause = %cause, "context cancelled");

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(cause.clone());
        }
    }
}

/// A cancellable scope.
///
/// Cloning yields another handle to the same scope.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Creates a new root scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Derives a child scope that is cancelled whenever this one is.
    ///
    /// A child of an already cancelled scope starts out cancelled with the
    /// parent's cause.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Arc::new(Inner::new());
        {
            let mut children = self.inner.children.lock();
            if self.inner.cause.get().is_none() {
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(&child));
            }
        }
        if let Some(cause) = self.inner.cause.get() {
            child.cancel(cause.clone());
        }
        Self { inner: child }
    }

    /// Records `cause` if no cause is recorded yet and signals done.
    ///
    /// Calling this again after a cause is set is a no-op.
    pub fn cancel(&self, cause: impl Into<Cause>) {
        self.inner.cancel(cause.into());
    }

    /// Cancels with [`Cause::cancelled`].
    pub fn cancel_default(&self) {
        self.inner.cancel(Cause::cancelled());
    }

    /// Returns whether a cause has been recorded.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cause.get().is_some()
    }

    /// Returns the recorded cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<Cause> {
        self.inner.cause.get().cloned()
    }

    /// Completes once the scope is cancelled.
    pub fn done(&self) -> impl Future<Output = ()> + Send + '_ {
        self.inner.done.cancelled()
    }

    /// Owned variant of [`Context::done`], usable from spawned tasks.
    pub fn done_owned(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.done.clone().cancelled_owned()
    }

    /// Waits until the scope is cancelled and returns the cause.
    pub async fn wait(&self) -> Cause {
        self.done().await;
        self.cause().unwrap_or_else(Cause::cancelled)
    }

    /// Returns true if both handles refer to the same scope.
    #[must_use]
    pub fn same_scope(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish()
    }
}
