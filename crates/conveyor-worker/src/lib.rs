//! Worker pool, container runtime client, and volume management.
//!
//! A worker is a remote host exposing a container runtime plus a volume
//! manager. The pool filters live workers for compatibility and places
//! containers with volume affinity; the runtime trait is the seam every
//! remote operation goes through, with a docker-backed implementation
//! for production.

pub mod archive;
pub mod artifact;
pub mod directory;
pub mod docker;
pub mod pool;
pub mod runtime;
pub mod volume;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use artifact::{
    partition_inputs, release_mounts, ArtifactDestination, ArtifactSource, ContainerDestination,
    InputSource,
};
pub use directory::{InMemoryDirectory, WorkerDirectory};
pub use docker::{DockerRuntime, DockerVolumes};
pub use pool::{ContainerSpec, Pool};
pub use runtime::{
    Container, ContainerRuntime, ImageSpec, Process, ProcessIo, ProcessSpec, RuntimeContainerSpec,
    TarStream, VolumeMount,
};
pub use volume::{Volume, VolumeManager, VolumeSpec};
pub use worker::{Worker, WorkerInfo, WorkerSpec};
