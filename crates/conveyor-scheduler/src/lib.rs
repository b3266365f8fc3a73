//! Build scheduling for the Conveyor CI engine.
//!
//! Decides which build to run next for each job: manual triggers and
//! resource changes queue pending builds, serial jobs dispatch strictly
//! one at a time in build order, and started builds are handed off to
//! the execution engine.

pub mod scheduler;

pub use scheduler::{BuildEngine, BuildScheduler, TriggerCause};
