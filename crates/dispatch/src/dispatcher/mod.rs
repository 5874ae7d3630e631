//! Dispatcher -- the single loop that selects, preempts, runs and classifies.
//!
//! Split into focused submodules:
//! - `core`: Dispatcher struct, constructor, state and accessor methods
//! - `execution`: main loop, preemption and classification

mod core;
mod execution;

pub use self::core::{CurrentTask, Dispatcher, DispatcherState};
