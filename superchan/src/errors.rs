//! Error types for superchan.
//!
//! Two categories are kept apart:
//!
//! - [`Cause`] / [`SuperchanError`]: runtime failures. A handler error, a
//!   caught signal or an explicit cancel request ends a scope; this is the
//!   normal way a worker loop stops.
//! - [`ContractViolation`]: misuse of the API (registering a hook after
//!   cancellation, closing a channel twice, ...). The panicking entry points
//!   panic with the violation's message; the `try_` entry points return it.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Runtime failures that end a scope.
#[derive(Debug, Error)]
pub enum SuperchanError {
    /// An OS signal was delivered to a signal bridge.
    #[cfg(unix)]
    #[error("caught signal: {0}")]
    Signal(nix::sys::signal::Signal),

    /// A free-form cancellation message.
    #[error("{0}")]
    Message(String),

    /// Cancellation requested without a specific cause.
    #[error("context cancelled")]
    Cancelled,

    /// Registering with the OS failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Misuse of the API. These are bugs in the caller, never expected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// A hook was registered after the scope was cancelled.
    #[error("superchan: cannot defer after cancel")]
    RegisterAfterCancel,

    /// A hook was registered after the cleanup runner had started.
    #[error("superchan: cannot defer after deferred funcs started")]
    RegisterAfterCleanup,

    /// `defer_first` was called twice.
    #[error("superchan: deferfirst already set")]
    FirstAlreadySet,

    /// `defer_last` was called twice.
    #[error("superchan: deferlast already set")]
    LastAlreadySet,

    /// The cleanup runner was invoked a second time.
    #[error("superchan: rundeferred called twice")]
    CleanupAlreadyRun,

    /// A channel was closed twice.
    #[error("superchan: close of closed channel")]
    ChannelAlreadyClosed,

    /// A signal bridge was built without any signal.
    #[error("superchan: no signals provided")]
    NoSignals,
}

impl ContractViolation {
    /// Halts the caller. Contract violations are never recovered from inside
    /// the library.
    #[track_caller]
    pub(crate) fn raise(self) -> ! {
        panic!("{self}")
    }
}

/// The error recorded when a scope ends.
///
/// Cheap to clone; every clone refers to the same underlying error, so all
/// observers of one scope see an identical value (see [`Cause::ptr_eq`]).
#[derive(Clone)]
pub struct Cause(Arc<dyn StdError + Send + Sync + 'static>);

impl Cause {
    /// Creates a message-only cause.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::from(SuperchanError::Message(message.into()))
    }

    /// The cause used when a scope is cancelled without a specific error.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::from(SuperchanError::Cancelled)
    }

    /// Wraps an `anyhow` error.
    #[must_use]
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let boxed: Box<dyn StdError + Send + Sync + 'static> = err.into();
        Self(Arc::from(boxed))
    }

    /// Returns true if both causes are the very same recorded value.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Attempts to view the cause as a concrete error type.
    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Returns the inner error.
    #[must_use]
    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }
}

impl<E> From<E> for Cause
where
    E: StdError + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cause").field(&self.0).finish()
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
