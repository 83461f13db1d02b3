//! OS signals as cancellation.
//!
//! A signal bridge is a `Superchan<Signal>` fed by the OS. The first caught
//! signal cancels the scope (with a cause naming the signal) and runs the
//! deferred hooks; cancelling the scope some other way runs them too.
//!
//! ```rust,ignore
//! let main = new_signal_bridge(&Context::new(), &[Signal::SIGINT, Signal::SIGTERM])?;
//! main.defer_first(|| server_handle.shutdown());
//! let cause = main.wait().await;
//! tracing::info!(%cause, "exiting");
//! ```

use crate::config::SuperchanConfig;
use crate::context::Context;
use crate::errors::{Cause, ContractViolation, SuperchanError};
use crate::superchan::Superchan;
use std::fmt;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub use nix::sys::signal::Signal;

/// A superchan driven by OS signals.
pub type Main = Superchan<Signal>;

type CauseFn = dyn Fn(Signal) -> Cause + Send + Sync;

/// Maps a caught signal to the cause recorded on the scope.
///
/// The default produces [`SuperchanError::Signal`].
#[derive(Clone, Default)]
pub struct SignalCause(Option<Arc<CauseFn>>);

impl SignalCause {
    /// Uses `f` instead of the default mapping.
    pub fn new(f: impl Fn(Signal) -> Cause + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(f)))
    }

    /// Builds the cause for `sig`.
    #[must_use]
    pub fn cause(&self, sig: Signal) -> Cause {
        match &self.0 {
            Some(f) => f(sig),
            None => Cause::from(SuperchanError::Signal(sig)),
        }
    }
}

impl fmt::Debug for SignalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("SignalCause(custom)"),
            None => f.write_str("SignalCause(default)"),
        }
    }
}

impl PartialEq for SignalCause {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for SignalCause {}

/// Builds a signal bridge with the default configuration.
///
/// Must be called from within a tokio runtime.
///
/// # Panics
///
/// Panics if `signals` is empty.
pub fn new_signal_bridge(parent: &Context, signals: &[Signal]) -> Result<Main, SuperchanError> {
    SuperchanConfig::default().signal_bridge(parent, signals)
}

impl SuperchanConfig {
    /// Builds a signal bridge. See [`new_signal_bridge`].
    ///
    /// `cancel_before_defer` decides whether hooks observe the scope as
    /// cancelled while they run; `signal_cause` builds the recorded cause.
    /// Must be called from within a tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if `signals` is empty or the configuration is invalid.
    pub fn signal_bridge(&self, parent: &Context, signals: &[Signal]) -> Result<Main, SuperchanError> {
        if signals.is_empty() {
            ContractViolation::NoSignals.raise();
        }

        let chan: Main = Superchan::build(parent, self.clone(), None);
        let mut forwarders = JoinSet::new();

        for &sig in signals {
            let mut stream = match signal(SignalKind::from_raw(sig as i32)) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(signal = %sig, error = %err, "failed to register signal");
                    forwarders.abort_all();
                    chan.cancel(Cause::msg(format!("failed to register {sig}: {err}")));
                    let _ = chan.try_close();
                    return Err(SuperchanError::Io(err));
                }
            };

            let tx = chan.sender();
            forwarders.spawn(async move {
                while stream.recv().await.is_some() {
                    match tx.try_send(sig) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            });
        }

        tokio::spawn(signal_loop(chan.clone(), forwarders));
        Ok(chan)
    }
}

async fn signal_loop(chan: Main, mut forwarders: JoinSet<()>) {
    tokio::select! {
        () = chan.done() => {
            chan.run_deferred().await;
        }
        caught = chan.recv() => {
            let cause = match caught {
                Some(sig) => {
                    debug!(signal = %sig, "caught signal");
                    chan.config().signal_cause.cause(sig)
                }
                None => Cause::msg("superchan: channel closed"),
            };
            if chan.config().cancel_before_defer {
                chan.cancel(cause);
                chan.run_deferred().await;
            } else {
                chan.run_deferred().await;
                chan.cancel(cause);
            }
        }
    }

    forwarders.abort_all();
    let _ = chan.try_close();
}
