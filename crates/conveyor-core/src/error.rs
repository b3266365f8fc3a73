//! Error types for the Conveyor execution engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The worker directory is empty.
    #[error("no workers")]
    NoWorkers,

    /// Workers exist but none satisfies the spec. Carries descriptions of
    /// the spec and every live worker so the user can see why.
    #[error("no workers satisfying: {spec}; available workers: {}", .workers.join(", "))]
    NoCompatibleWorkers { spec: String, workers: Vec<String> },

    /// One or more declared inputs were absent from the source repository
    /// at step start.
    #[error("missing inputs: {}", .0.join(", "))]
    MissingInputs(Vec<String>),

    /// The image resource produced zero versions.
    #[error("no versions of image available")]
    ImageUnavailable,

    /// The image get succeeded but no cacheable volume emerged.
    #[error("getting the image for task '{task}' did not produce a volume")]
    ImageGetDidNotProduceVolume { task: String },

    /// A `stream_file` targeted a path not present in the output archive.
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    /// Cancellation was observed.
    #[error("interrupted")]
    Interrupted,

    /// Every compatible worker failed container creation.
    #[error("failed to create container on all compatible workers")]
    ContainerCreationExhausted,

    /// The worker already has the maximum number of active containers.
    #[error("worker already has the maximum number of active containers")]
    MaxContainersReached,

    /// Optimistic compare-and-swap mismatch on configuration save.
    #[error("comparison with existing config failed during save")]
    ConfigComparisonFailed,

    /// The job is configured to refuse manual triggers.
    #[error("manual triggering of job '{job}' is disabled")]
    ManualTriggerDisabled { job: String },

    /// A found container carries no process property; it did not shut
    /// down cleanly and cannot be resumed.
    #[error("container '{handle}' has no process recorded")]
    MissingTaskProcess { handle: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
