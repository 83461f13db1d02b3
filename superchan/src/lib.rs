//! # Superchan
//!
//! Cancellable channels with ordered deferred cleanup.
//!
//! Superchan provides:
//!
//! - **Cancellable scopes**: a [`Context`] records at most one cause and
//!   cancels its whole subtree
//! - **Channels**: bounded queues tied to a scope, with streaming and
//!   snapshot consumption
//! - **Deferred cleanup**: hooks that run exactly once, in a fixed
//!   first / ordered / last sequence, optionally fanned out across tasks
//! - **Signal bridging**: OS signals turned into cancellation (unix)
//! - **Pipelines**: two chained stages with drop-on-full forwarding
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use superchan::prelude::*;
//!
//! let main = new_signal_bridge(&Context::new(), &[Signal::SIGINT, Signal::SIGTERM])?;
//! main.defer_first(|| println!("stop accepting connections"));
//! main.defer_last(|| println!("bye"));
//!
//! let cause = main.wait().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod channel;
pub mod config;
pub mod context;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod registry;
#[cfg(unix)]
pub mod signal;
pub mod superchan;


pub use channel::{Channel, Sender};
pub use config::{CleanupMode, SuperchanConfig};
pub use context::Context;
pub use errors::{Cause, ContractViolation, SuperchanError};
pub use pipeline::{new_pipeline, ForwardMetrics, Slot};
pub use registry::{CleanupReport, Hook, HookFailure, Phase};
pub use superchan::{State, Superchan};
#[cfg(unix)]
pub use signal::SignalCause;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::{Channel, Sender};
    pub use crate::config::{CleanupMode, SuperchanConfig};
    pub use crate::context::Context;
    pub use crate::errors::{Cause, ContractViolation, SuperchanError};
    pub use crate::pipeline::{new_pipeline, Slot};
    pub use crate::registry::CleanupReport;
    #[cfg(unix)]
    pub use crate::signal::{new_signal_bridge, Main, Signal, SignalCause};
    pub use crate::superchan::{State, Superchan};
}
