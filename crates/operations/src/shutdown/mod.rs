//! Cooperative shutdown:
//! - Signal handling for SIGTERM/SIGINT
//! - A cancellable worker group with first-error semantics

mod group;
mod signals;

pub use group::{ShutdownSignal, WorkerError, WorkerGroup, WorkerSpawner};
pub use signals::wait_for_signal;
