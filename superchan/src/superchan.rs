//! Cancellable channels with ordered deferred cleanup.
//!
//! A [`Superchan`] owns a [`Channel`] (and through it a [`Context`]) plus a
//! registry of deferred hooks. When the scope ends, the hooks run exactly
//! once in three phases: `defer_first`, then every `defer` hook (most recent
//! first), then `defer_last`. After that the instance is dead.
//!
//! ```rust,ignore
//! let chan = Superchan::new(&Context::new(), |_ctx, line: String| async move {
//!     println!("{line}");
//!     Ok(())
//! }, false);
//! chan.defer(|| println!("flushed"));
//! chan.sender().send("hello".into()).await?;
//! chan.cancel(Cause::msg("done"));
//! let cause = chan.wait().await;
//! ```

use crate::channel::{Channel, Sender};
use crate::config::SuperchanConfig;
use crate::context::Context;
use crate::errors::{panic_message, Cause, ContractViolation};
use crate::pipeline::ForwardMetrics;
use crate::registry::{run_hooks, CleanupReport, DeferredRegistry, Hook, RegistryStatus};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Observable lifecycle of a [`Superchan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Hooks may be registered.
    Running,
    /// The cause is set; cleanup has not started yet.
    Cancelling,
    /// Hooks are executing.
    Draining,
    /// Cleanup finished. Terminal.
    Dead,
}

struct Inner<T> {
    chan: Channel<T>,
    registry: DeferredRegistry,
    config: SuperchanConfig,
    forward_metrics: Option<Arc<ForwardMetrics>>,
}

/// A [`Channel`] with deferred cleanup hooks.
///
/// Cloning yields another handle to the same instance.
pub struct Superchan<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Superchan<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Superchan<T> {
    /// Creates an instance without a worker, for manual driving.
    ///
    /// The caller is responsible for calling [`Superchan::run_deferred`].
    #[must_use]
    pub fn raw(parent: &Context) -> Self {
        SuperchanConfig::default().raw(parent)
    }

    /// Creates an instance whose worker calls `handler` for every received
    /// item until the scope is cancelled.
    ///
    /// A handler returning `Err(cause)` cancels the scope with that cause.
    /// With `parallel`, every item is handled on its own task; otherwise the
    /// worker awaits each call before receiving the next item.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut>(parent: &Context, handler: F, parallel: bool) -> Self
    where
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Cause>> + Send + 'static,
    {
        SuperchanConfig::default().spawn(parent, handler, parallel)
    }

    pub(crate) fn build(
        parent: &Context,
        config: SuperchanConfig,
        forward_metrics: Option<Arc<ForwardMetrics>>,
    ) -> Self {
        if let Err(err) = config.validate() {
            panic!("superchan: {err}");
        }
        Self {
            inner: Arc::new(Inner {
                chan: Channel::new(parent, config.buffer_size),
                registry: DeferredRegistry::new(),
                config,
                forward_metrics,
            }),
        }
    }
}

impl<T> Superchan<T> {
    /// Returns the scope.
    #[must_use]
    pub fn context(&self) -> &Context {
        self.inner.chan.context()
    }

    /// Returns the underlying channel.
    #[must_use]
    pub fn channel(&self) -> &Channel<T> {
        &self.inner.chan
    }

    /// Returns this instance's configuration.
    #[must_use]
    pub fn config(&self) -> &SuperchanConfig {
        &self.inner.config
    }

    /// Pipeline forwarding counters; only set on a pipeline's outbound stage.
    #[must_use]
    pub fn forward_metrics(&self) -> Option<&ForwardMetrics> {
        self.inner.forward_metrics.as_deref()
    }

    /// Records `cause` unless a cause is already set.
    pub fn cancel(&self, cause: impl Into<Cause>) {
        self.context().cancel(cause);
    }

    /// Cancels with [`Cause::cancelled`].
    pub fn cancel_default(&self) {
        self.context().cancel_default();
    }

    /// Returns the recorded cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<Cause> {
        self.context().cause()
    }

    /// Returns whether the scope has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.context().is_cancelled()
    }

    /// Completes once the scope is cancelled.
    pub fn done(&self) -> impl Future<Output = ()> + Send + '_ {
        self.context().done()
    }

    /// Returns a send-only handle.
    #[must_use]
    pub fn sender(&self) -> Sender<T> {
        self.inner.chan.sender()
    }

    /// Receives the next item.
    pub async fn recv(&self) -> Option<T> {
        self.inner.chan.recv().await
    }

    /// Pops every item queued at the time of the call.
    pub async fn drain(&self) -> Vec<T> {
        self.inner.chan.drain().await
    }

    /// Pops whatever is queued without waiting; `None` if nothing is.
    #[must_use]
    pub fn try_drain(&self) -> Option<Vec<T>> {
        self.inner.chan.try_drain()
    }

    /// Closes the channel.
    ///
    /// # Panics
    ///
    /// Panics if the channel is already closed.
    pub fn close(&self) {
        self.inner.chan.close();
    }

    /// Closes the channel, reporting a second close instead of panicking.
    pub fn try_close(&self) -> Result<(), ContractViolation> {
        self.inner.chan.try_close()
    }

    /// Returns whether the channel is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.chan.is_closed()
    }

    /// Registers a hook. Hooks registered later run earlier.
    ///
    /// # Panics
    ///
    /// Panics if the scope is already cancelled or cleanup has started.
    pub fn defer<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(violation) = self.try_defer(hook) {
            violation.raise();
        }
    }

    /// Registers several hooks, as if `defer` were called for each in turn.
    ///
    /// # Panics
    ///
    /// Panics if the scope is already cancelled or cleanup has started.
    pub fn defer_many(&self, hooks: impl IntoIterator<Item = Hook>) {
        let result = self
            .check_open()
            .and_then(|()| self.inner.registry.defer(hooks.into_iter().collect()));
        if let Err(violation) = result {
            violation.raise();
        }
    }

    /// Fallible form of [`Superchan::defer`].
    pub fn try_defer<F>(&self, hook: F) -> Result<(), ContractViolation>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_open()?;
        let hook: Hook = Box::new(hook);
        self.inner.registry.defer(vec![hook])
    }

    /// Sets the hook that runs before every other hook.
    ///
    /// # Panics
    ///
    /// Panics if already set, if the scope is cancelled or cleanup started.
    pub fn defer_first<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(violation) = self.try_defer_first(hook) {
            violation.raise();
        }
    }

    /// Fallible form of [`Superchan::defer_first`].
    pub fn try_defer_first<F>(&self, hook: F) -> Result<(), ContractViolation>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_open()?;
        self.inner.registry.defer_first(Box::new(hook))
    }

    /// Sets the hook that runs after every other hook.
    ///
    /// # Panics
    ///
    /// Panics if already set, if the scope is cancelled or cleanup started.
    pub fn defer_last<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(violation) = self.try_defer_last(hook) {
            violation.raise();
        }
    }

    /// Fallible form of [`Superchan::defer_last`].
    pub fn try_defer_last<F>(&self, hook: F) -> Result<(), ContractViolation>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_open()?;
        self.inner.registry.defer_last(Box::new(hook))
    }

    fn check_open(&self) -> Result<(), ContractViolation> {
        if self.is_cancelled() {
            return Err(ContractViolation::RegisterAfterCancel);
        }
        Ok(())
    }

    /// Number of registered hooks still waiting to run.
    #[must_use]
    pub fn pending_hooks(&self) -> usize {
        self.inner.registry.pending()
    }

    /// Runs the deferred hooks. Workers call this once the scope ends; raw
    /// instances call it themselves.
    ///
    /// # Panics
    ///
    /// Panics when called a second time.
    pub async fn run_deferred(&self) -> CleanupReport {
        match self.try_run_deferred().await {
            Ok(report) => report,
            Err(violation) => violation.raise(),
        }
    }

    /// Fallible form of [`Superchan::run_deferred`].
    pub async fn try_run_deferred(&self) -> Result<CleanupReport, ContractViolation> {
        let hooks = self.inner.registry.take()?;
        let report = run_hooks(hooks, self.inner.config.cleanup_mode).await;
        self.inner.registry.finish();
        Ok(report)
    }

    /// Returns true once cleanup has finished.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.inner.registry.status() == RegistryStatus::Dead
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        match self.inner.registry.status() {
            RegistryStatus::Dead => State::Dead,
            RegistryStatus::Draining => State::Draining,
            RegistryStatus::Open if self.is_cancelled() => State::Cancelling,
            RegistryStatus::Open => State::Running,
        }
    }

    /// Waits for the scope to end, then for cleanup to finish.
    ///
    /// Cleanup is awaited for at most `max_wait`; on timeout a warning is
    /// logged and the cause is returned while hooks may still be running.
    pub async fn wait(&self) -> Cause {
        let cause = self.context().wait().await;
        let started = Instant::now();
        let deadline = started + self.inner.config.max_wait;

        loop {
            if self.is_dead() {
                return cause;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }

        warn!(elapsed = ?started.elapsed(), "shutdown timed out");
        cause
    }
}

impl<T> std::fmt::Debug for Superchan<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Superchan")
            .field("state", &self.state())
            .field("cause", &self.cause())
            .field("pending_hooks", &self.pending_hooks())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SuperchanConfig {
    /// Builds an instance without a worker. See [`Superchan::raw`].
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    #[must_use]
    pub fn raw<T: Send + 'static>(&self, parent: &Context) -> Superchan<T> {
        Superchan::build(parent, self.clone(), None)
    }

    /// Builds an instance with a handler worker. See [`Superchan::new`].
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn spawn<T, F, Fut>(&self, parent: &Context, handler: F, parallel: bool) -> Superchan<T>
    where
        T: Send + 'static,
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Cause>> + Send + 'static,
    {
        let chan = self.raw(parent);
        tokio::spawn(handler_loop(chan.clone(), Arc::new(handler), parallel));
        chan
    }
}

async fn handler_loop<T, F, Fut>(chan: Superchan<T>, handler: Arc<F>, parallel: bool)
where
    T: Send + 'static,
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Cause>> + Send + 'static,
{
    while !chan.is_cancelled() {
        tokio::select! {
            () = chan.done() => {}
            item = chan.recv() => match item {
                Some(item) if parallel => {
                    tokio::spawn(dispatch(chan.clone(), Arc::clone(&handler), item));
                }
                Some(item) => dispatch(chan.clone(), Arc::clone(&handler), item).await,
                None => chan.cancel(Cause::msg("superchan: channel closed")),
            },
        }
    }

    chan.run_deferred().await;
    // The owner may have closed the channel already.
    let _ = chan.try_close();
}

/// Calls the handler for one item; an error or a panic ends the scope.
async fn dispatch<T, F, Fut>(chan: Superchan<T>, handler: Arc<F>, item: T)
where
    F: Fn(Context, T) -> Fut,
    Fut: Future<Output = Result<(), Cause>>,
{
    let ctx = chan.context().clone();
    if let Err(cause) = guarded(async move { (*handler)(ctx, item).await }).await {
        debug!(cause = %cause, "handler failed, cancelling");
        chan.cancel(cause);
    }
}

/// Awaits a handler call, turning a panic into a cause.
pub(crate) async fn guarded<R>(call: impl Future<Output = Result<R, Cause>>) -> Result<R, Cause> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!("handler panicked: {}", message);
            Err(Cause::msg(format!("handler panicked: {message}")))
        }
    }
}
