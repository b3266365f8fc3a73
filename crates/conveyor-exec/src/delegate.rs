//! Step delegates: how the engine's driver observes a running step.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Callbacks and output plumbing handed to a step by its driver. The
/// default implementations observe nothing and discard output.
pub trait StepDelegate: Send + Sync {
    /// The step has its configuration and is about to select a worker.
    fn initializing(&self) {}

    /// The step's process has been started.
    fn started(&self) {}

    /// The step's process exited with the given status.
    fn finished(&self, _exit_status: i32) {}

    fn stdout(&self) -> Option<mpsc::Sender<Bytes>> {
        None
    }

    fn stderr(&self) -> Option<mpsc::Sender<Bytes>> {
        None
    }
}

/// Discards everything.
pub struct NoopDelegate;

impl StepDelegate for NoopDelegate {}
