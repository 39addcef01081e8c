//! Test fixtures for the edgemesh control plane.
//!
//! Provides a manually advanced clock, a deterministic id minter, and
//! builders for nodes and task specs so scheduler tests can drive time
//! explicitly instead of sleeping.

pub mod clock;
pub mod fixtures;

pub use clock::{ManualClock, SequentialMinter};
pub use fixtures::{node, task, NodeBuilder, TaskBuilder};
