//! Container runtime client.
//!
//! One implementation per remote worker. Every operation is an await
//! point the caller may race against cancellation; implementations must
//! not leak the underlying resource when the caller gives up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use conveyor_core::container::{ContainerIdentifier, ContainerMetadata};
use conveyor_core::Result;

use crate::volume::Volume;

/// An uncompressed ustar archive as a byte stream.
pub type TarStream = BoxStream<'static, std::io::Result<Bytes>>;

/// The rootfs for a container: a literal image reference, or an
/// immutable image volume fetched by the image resource machinery.
#[derive(Clone)]
pub enum ImageSpec {
    Name(String),
    Volume(Volume),
}

impl std::fmt::Debug for ImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSpec::Name(name) => write!(f, "image {:?}", name),
            ImageSpec::Volume(volume) => write!(f, "image volume {:?}", volume.handle()),
        }
    }
}

/// A volume attached to a container at a path.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub volume: Volume,
    pub mount_path: String,
}

/// What the runtime needs to create one container.
#[derive(Debug, Clone)]
pub struct RuntimeContainerSpec {
    pub image: ImageSpec,
    pub privileged: bool,
    pub env: Vec<String>,
    pub mounts: Vec<VolumeMount>,
}

/// Specification of a process to run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    /// Payload written to the process's stdin, then closed.
    pub stdin: Option<Bytes>,
}

/// Output plumbing for a process. Chunks are forwarded as they arrive;
/// a `None` sink discards that stream.
#[derive(Clone, Default)]
pub struct ProcessIo {
    pub stdout: Option<mpsc::Sender<Bytes>>,
    pub stderr: Option<mpsc::Sender<Bytes>>,
}

/// A process running (or once running) inside a container.
#[async_trait]
pub trait Process: Send {
    /// Identifier stable across engine restarts, recorded in the
    /// container's process property for re-attachment.
    fn id(&self) -> String;

    /// Blocks until the process exits, yielding its exit status. Fails
    /// if the container died underneath it.
    async fn wait(&mut self) -> Result<i32>;
}

/// Operations on a single worker's container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates and starts a container, returning its handle. Fails with
    /// `MaxContainersReached` when the worker is saturated.
    async fn create_container(
        &self,
        id: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        spec: RuntimeContainerSpec,
    ) -> Result<String>;

    /// Finds a live container previously created for the identifier.
    async fn find_container(&self, id: &ContainerIdentifier) -> Result<Option<String>>;

    async fn run(
        &self,
        handle: &str,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>>;

    /// Re-attaches to a process recorded in the container's process
    /// property after an engine restart.
    async fn attach(
        &self,
        handle: &str,
        process_id: &str,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>>;

    /// Extracts a tar archive into the container at `path`, creating the
    /// directory if needed.
    async fn stream_in(&self, handle: &str, path: &str, tar: Bytes) -> Result<()>;

    /// Streams `path` out of the container as a tar archive.
    async fn stream_out(&self, handle: &str, path: &str) -> Result<TarStream>;

    async fn property(&self, handle: &str, name: &str) -> Result<Option<String>>;

    /// Sets a property. The exit-status property is write-once:
    /// implementations preserve its first value.
    async fn set_property(&self, handle: &str, name: &str, value: &str) -> Result<()>;

    /// Signals the container's processes to terminate; `kill` escalates
    /// to SIGKILL.
    async fn stop(&self, handle: &str, kill: bool) -> Result<()>;

    /// Schedules the container for destruction after `ttl`.
    async fn release(&self, handle: &str, ttl: Duration) -> Result<()>;
}

/// Client-side handle to a container on a specific worker.
///
/// Carries the worker by address, not by reference; lookups go through
/// the directory. Mounts reflect creation time and are empty on
/// containers recovered after a restart.
#[derive(Clone)]
pub struct Container {
    handle: String,
    worker_addr: String,
    runtime: Arc<dyn ContainerRuntime>,
    mounts: Vec<VolumeMount>,
}

impl Container {
    pub fn new(
        handle: impl Into<String>,
        worker_addr: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        mounts: Vec<VolumeMount>,
    ) -> Self {
        Self {
            handle: handle.into(),
            worker_addr: worker_addr.into(),
            runtime,
            mounts,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn worker_addr(&self) -> &str {
        &self.worker_addr
    }

    pub fn mounts(&self) -> &[VolumeMount] {
        &self.mounts
    }

    pub async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Box<dyn Process>> {
        self.runtime.run(&self.handle, spec, io).await
    }

    pub async fn attach(&self, process_id: &str, io: ProcessIo) -> Result<Box<dyn Process>> {
        self.runtime.attach(&self.handle, process_id, io).await
    }

    pub async fn stream_in(&self, path: &str, tar: Bytes) -> Result<()> {
        self.runtime.stream_in(&self.handle, path, tar).await
    }

    pub async fn stream_out(&self, path: &str) -> Result<TarStream> {
        self.runtime.stream_out(&self.handle, path).await
    }

    pub async fn property(&self, name: &str) -> Result<Option<String>> {
        self.runtime.property(&self.handle, name).await
    }

    pub async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.runtime.set_property(&self.handle, name, value).await
    }

    pub async fn stop(&self, kill: bool) -> Result<()> {
        self.runtime.stop(&self.handle, kill).await
    }

    pub async fn release(&self, ttl: Duration) -> Result<()> {
        self.runtime.release(&self.handle, ttl).await
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("handle", &self.handle)
            .field("worker_addr", &self.worker_addr)
            .finish()
    }
}
