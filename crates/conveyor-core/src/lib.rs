//! Core domain types for the Conveyor CI execution engine.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Build lifecycle types and job configuration
//! - Resource versions and their content-addressed identity
//! - Container identity, stages, and reserved properties
//! - Task configuration
//! - The error type shared across the engine

pub mod build;
pub mod container;
pub mod error;
pub mod id;
pub mod task;
pub mod version;

pub use build::{Build, BuildInput, BuildOutput, BuildStatus, JobConfig, JobInput};
pub use container::{ContainerIdentifier, ContainerOwner, ContainerStage};
pub use error::{Error, Result};
pub use id::{BuildId, PlanId, TeamId};
pub use version::{ResourceConfig, ResourceVersion, Version};
