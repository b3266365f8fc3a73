//! Step executors for the Conveyor CI engine.
//!
//! A build's plan is a tree of steps; this crate executes the leaves:
//! task steps (run a script in a container), get steps (fetch a resource
//! version), and put steps (publish one). Steps fan artifacts between
//! each other through the per-build [`repository::SourceRepository`] and
//! survive engine restarts by re-attaching to their containers.

pub mod cancel;
pub mod delegate;
pub mod get;
pub mod image;
pub mod put;
pub mod repository;
pub mod resource;
pub mod task;

#[cfg(test)]
pub(crate) mod testkit;

pub use cancel::with_cancel;
pub use delegate::{NoopDelegate, StepDelegate};
pub use get::GetStep;
pub use image::{FetchedImage, ImageFetcher};
pub use put::PutStep;
pub use repository::SourceRepository;
pub use task::TaskStep;
