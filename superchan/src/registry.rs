//! Deferred cleanup hooks.
//!
//! Hooks run in three phases: the `first` hook, then the ordered hooks
//! (most recently registered first), then the `last` hook. The registry is
//! consumed exactly once; afterwards it is dead.

use crate::config::CleanupMode;
use crate::errors::{panic_message, ContractViolation};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// A deferred cleanup function.
pub type Hook = Box<dyn FnOnce() + Send + 'static>;

/// The three execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// The `defer_first` hook.
    First,
    /// Hooks registered with `defer`.
    Ordered,
    /// The `defer_last` hook.
    Last,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Ordered => write!(f, "ordered"),
            Self::Last => write!(f, "last"),
        }
    }
}

/// A hook that panicked while running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookFailure {
    /// Phase the hook belonged to.
    pub phase: Phase,
    /// Position within the phase, in execution order.
    pub index: usize,
    /// Panic message.
    pub message: String,
}

/// Outcome of one cleanup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Number of hooks started.
    pub hooks_run: usize,
    /// Hooks that panicked (fan-out mode only).
    pub failures: Vec<HookFailure>,
}

impl CleanupReport {
    /// Returns true if no hook panicked.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct Hooks {
    first: Option<Hook>,
    /// Registration order; executed in reverse.
    ordered: Vec<Hook>,
    last: Option<Hook>,
}

impl Hooks {
    fn len(&self) -> usize {
        usize::from(self.first.is_some()) + self.ordered.len() + usize::from(self.last.is_some())
    }

    fn into_phases(self) -> [(Phase, Vec<Hook>); 3] {
        [
            (Phase::First, self.first.into_iter().collect()),
            (Phase::Ordered, self.ordered.into_iter().rev().collect()),
            (Phase::Last, self.last.into_iter().collect()),
        ]
    }
}

enum RegistryState {
    Open(Hooks),
    Draining,
    Dead,
}

/// Lifecycle of a registry, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegistryStatus {
    Open,
    Draining,
    Dead,
}

/// Holds the hooks of one superchan until cleanup.
pub(crate) struct DeferredRegistry {
    state: Mutex<RegistryState>,
}

impl DeferredRegistry {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::Open(Hooks::default())),
        }
    }

    fn with_open<R>(
        &self,
        f: impl FnOnce(&mut Hooks) -> Result<R, ContractViolation>,
    ) -> Result<R, ContractViolation> {
        match &mut *self.state.lock() {
            RegistryState::Open(hooks) => f(hooks),
            RegistryState::Draining | RegistryState::Dead => {
                Err(ContractViolation::RegisterAfterCleanup)
            }
        }
    }

    pub(crate) fn defer(&self, hooks: Vec<Hook>) -> Result<(), ContractViolation> {
        self.with_open(|registered| {
            registered.ordered.extend(hooks);
            Ok(())
        })
    }

    pub(crate) fn defer_first(&self, hook: Hook) -> Result<(), ContractViolation> {
        self.with_open(|registered| {
            if registered.first.is_some() {
                return Err(ContractViolation::FirstAlreadySet);
            }
            registered.first = Some(hook);
            Ok(())
        })
    }

    pub(crate) fn defer_last(&self, hook: Hook) -> Result<(), ContractViolation> {
        self.with_open(|registered| {
            if registered.last.is_some() {
                return Err(ContractViolation::LastAlreadySet);
            }
            registered.last = Some(hook);
            Ok(())
        })
    }

    /// Moves the hooks out and marks the registry as draining.
    pub(crate) fn take(&self) -> Result<Hooks, ContractViolation> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, RegistryState::Draining) {
            RegistryState::Open(hooks) => Ok(hooks),
            other => {
                *state = other;
                Err(ContractViolation::CleanupAlreadyRun)
            }
        }
    }

    pub(crate) fn finish(&self) {
        *self.state.lock() = RegistryState::Dead;
    }

    pub(crate) fn status(&self) -> RegistryStatus {
        match &*self.state.lock() {
            RegistryState::Open(_) => RegistryStatus::Open,
            RegistryState::Draining => RegistryStatus::Draining,
            RegistryState::Dead => RegistryStatus::Dead,
        }
    }

    pub(crate) fn pending(&self) -> usize {
        match &*self.state.lock() {
            RegistryState::Open(hooks) => hooks.len(),
            RegistryState::Draining | RegistryState::Dead => 0,
        }
    }
}

impl fmt::Debug for DeferredRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredRegistry")
            .field("status", &self.status())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Runs every phase in order, waiting for a phase to finish before the next.
pub(crate) async fn run_hooks(hooks: Hooks, mode: CleanupMode) -> CleanupReport {
    let mut report = CleanupReport::default();
    debug!(hooks = hooks.len(), mode = ?mode, "running deferred funcs");

    for (phase, phase_hooks) in hooks.into_phases() {
        report.hooks_run += phase_hooks.len();
        match mode {
            CleanupMode::Sequential => {
                for hook in phase_hooks {
                    hook();
                }
            }
            CleanupMode::FanOut => {
                let handles = phase_hooks.into_iter().map(tokio::task::spawn_blocking);
                for (index, result) in join_all(handles).await.into_iter().enumerate() {
                    let Err(join_err) = result else {
                        continue;
                    };
                    let message = if join_err.is_panic() {
                        panic_message(join_err.into_panic().as_ref())
                    } else {
                        join_err.to_string()
                    };
                    warn!(phase = %phase, index, "error in deferred func (panic): {}", message);
                    report.failures.push(HookFailure {
                        phase,
                        index,
                        message,
                    });
                }
            }
        }
    }

    debug!(hooks_run = report.hooks_run, failures = report.failures.len(), "deferred funcs finished");
    report
}
