//! Artifact sources: how data produced by one step reaches another.
//!
//! A source carries three capabilities: stream everything out, stream a
//! single file out, and report whether it is volume-resident on a given
//! worker. Concrete kinds are a closed set, so this is a tagged union
//! rather than a trait hierarchy.

use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use conveyor_core::Result;

use crate::archive;
use crate::runtime::{Container, VolumeMount};
use crate::volume::Volume;
use crate::worker::Worker;

/// Receiving end of an artifact transfer. `dest_path` is relative to
/// the destination's root; `.` means the root itself.
#[async_trait::async_trait]
pub trait ArtifactDestination: Send + Sync {
    async fn stream_in(&self, dest_path: &str, tar: Bytes) -> Result<()>;
}

/// A registered artifact and where its bytes live.
#[derive(Clone, Debug)]
pub enum ArtifactSource {
    /// A task's entire working directory, registered when the task
    /// declares no outputs.
    TaskWorkingDir {
        container: Container,
        artifacts_root: String,
    },
    /// A declared task output backed by a worker-local volume.
    TaskOutputVolume {
        container: Container,
        path: String,
        volume_handle: String,
    },
    /// A declared task output reachable only by streaming out of its
    /// container.
    TaskOutputStream { container: Container, path: String },
    /// A directory produced by a resource get.
    ResourceGet {
        container: Container,
        path: String,
        volume_handle: Option<String>,
    },
}

impl ArtifactSource {
    pub fn task_output(
        container: Container,
        path: impl Into<String>,
        volume_handle: Option<String>,
    ) -> Self {
        let path = path.into();
        match volume_handle {
            Some(volume_handle) => ArtifactSource::TaskOutputVolume {
                container,
                path,
                volume_handle,
            },
            None => ArtifactSource::TaskOutputStream { container, path },
        }
    }

    fn container(&self) -> &Container {
        match self {
            ArtifactSource::TaskWorkingDir { container, .. }
            | ArtifactSource::TaskOutputVolume { container, .. }
            | ArtifactSource::TaskOutputStream { container, .. }
            | ArtifactSource::ResourceGet { container, .. } => container,
        }
    }

    fn root_path(&self) -> &str {
        match self {
            ArtifactSource::TaskWorkingDir { artifacts_root, .. } => artifacts_root,
            ArtifactSource::TaskOutputVolume { path, .. }
            | ArtifactSource::TaskOutputStream { path, .. }
            | ArtifactSource::ResourceGet { path, .. } => path,
        }
    }

    fn volume_handle(&self) -> Option<&str> {
        match self {
            ArtifactSource::TaskWorkingDir { .. } | ArtifactSource::TaskOutputStream { .. } => None,
            ArtifactSource::TaskOutputVolume { volume_handle, .. } => Some(volume_handle),
            ArtifactSource::ResourceGet { volume_handle, .. } => volume_handle.as_deref(),
        }
    }

    /// Streams the source's whole directory into the destination root.
    pub async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<()> {
        let dir = format!("{}/", self.root_path().trim_end_matches('/'));
        let out = self.container().stream_out(&dir).await?;
        let tar = archive::collect(out).await?;
        destination.stream_in(".", tar).await
    }

    /// Streams a single file out of the source.
    pub async fn stream_file(&self, name: &str) -> Result<Bytes> {
        let path = format!("{}/{}", self.root_path().trim_end_matches('/'), name);
        let out = self.container().stream_out(&path).await?;
        let tar = archive::collect(out).await?;
        archive::first_entry(&tar, name)
    }

    /// The source's volume on the given worker, if it has one there.
    pub async fn volume_on(&self, worker: &Worker) -> Result<Option<Volume>> {
        match self.volume_handle() {
            Some(handle) => worker.lookup_volume(handle).await,
            None => Ok(None),
        }
    }
}

/// Destination that lands artifacts inside a container under a base
/// directory.
pub struct ContainerDestination {
    container: Container,
    base: String,
}

impl ContainerDestination {
    pub fn new(container: Container, base: impl Into<String>) -> Self {
        Self {
            container,
            base: base.into(),
        }
    }
}

#[async_trait::async_trait]
impl ArtifactDestination for ContainerDestination {
    async fn stream_in(&self, dest_path: &str, tar: Bytes) -> Result<()> {
        let path = if dest_path == "." {
            self.base.clone()
        } else {
            format!("{}/{}", self.base.trim_end_matches('/'), dest_path)
        };
        self.container.stream_in(&path, tar).await
    }
}

/// One declared input of a step, resolved to its source and the path it
/// must appear at inside the container.
#[derive(Clone, Debug)]
pub struct InputSource {
    pub name: String,
    pub source: ArtifactSource,
    pub mount_path: String,
}

/// Splits inputs into those volume-resident on the worker (held until
/// the container adopts them) and those that must be streamed.
pub async fn partition_inputs(
    inputs: &[InputSource],
    worker: &Worker,
) -> Result<(Vec<VolumeMount>, Vec<InputSource>)> {
    let mut mounts = Vec::new();
    let mut to_stream = Vec::new();

    for input in inputs {
        match input.source.volume_on(worker).await? {
            Some(volume) => {
                volume.hold().await?;
                mounts.push(VolumeMount {
                    volume,
                    mount_path: input.mount_path.clone(),
                });
            }
            None => to_stream.push(input.clone()),
        }
    }

    Ok((mounts, to_stream))
}

/// Drops references held during placement. Passing a TTL rewrites the
/// volumes' expiry, used when a container has adopted them. Failures
/// are logged, not surfaced; the worker reaps regardless.
pub async fn release_mounts(mounts: &[VolumeMount], ttl: Option<Duration>) {
    for mount in mounts {
        if let Err(err) = mount.volume.release(ttl).await {
            warn!(
                volume = %mount.volume.handle(),
                error = %err,
                "failed to release volume reference",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::single_file_tar;
    use crate::test_support::{worker_info, FakeRuntime, FakeVolumes};
    use conveyor_core::Error;
    use std::sync::Arc;

    fn container_on(runtime: &Arc<FakeRuntime>, addr: &str) -> Container {
        Container::new("c-1", addr, Arc::clone(runtime) as _, vec![])
    }

    fn worker_with_volumes(addr: &str, volumes: Arc<FakeVolumes>) -> Worker {
        Worker::new(
            worker_info(addr),
            Arc::new(FakeRuntime::new(addr)) as _,
            volumes as _,
        )
    }

    #[tokio::test]
    async fn volume_backed_output_resolves_only_where_the_volume_lives() {
        let runtime = Arc::new(FakeRuntime::new("w1"));
        let source = ArtifactSource::task_output(
            container_on(&runtime, "w1"),
            "/tmp/build/abc/out",
            Some("vol-out".to_string()),
        );

        let here = Arc::new(FakeVolumes::new());
        here.seed("vol-out");
        let elsewhere = Arc::new(FakeVolumes::new());

        let on_here = source
            .volume_on(&worker_with_volumes("w1", here))
            .await
            .unwrap();
        assert_eq!(on_here.map(|v| v.handle().to_string()), Some("vol-out".to_string()));

        let on_elsewhere = source
            .volume_on(&worker_with_volumes("w2", elsewhere))
            .await
            .unwrap();
        assert!(on_elsewhere.is_none());
    }

    #[tokio::test]
    async fn streaming_output_has_no_volume_anywhere() {
        let runtime = Arc::new(FakeRuntime::new("w1"));
        let source =
            ArtifactSource::task_output(container_on(&runtime, "w1"), "/tmp/build/abc/out", None);

        let volumes = Arc::new(FakeVolumes::new());
        volumes.seed("vol-out");
        let worker = worker_with_volumes("w1", volumes);

        assert!(source.volume_on(&worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_file_surfaces_missing_paths() {
        let runtime = Arc::new(FakeRuntime::new("w1"));
        runtime.serve_stream_out(
            "/tmp/build/abc/out/version",
            single_file_tar("version", b"1.2.3").unwrap(),
        );

        let source = ArtifactSource::task_output(
            container_on(&runtime, "w1"),
            "/tmp/build/abc/out",
            None,
        );

        let found = source.stream_file("version").await.unwrap();
        assert_eq!(found.as_ref(), b"1.2.3");

        let missing = source.stream_file("nope").await.unwrap_err();
        assert!(matches!(missing, Error::FileNotFound { path } if path == "nope"));
    }

    #[tokio::test]
    async fn partition_holds_resident_volumes_and_streams_the_rest() {
        let runtime = Arc::new(FakeRuntime::new("w1"));
        let volumes = Arc::new(FakeVolumes::new());
        volumes.seed("vol-a");
        let worker = worker_with_volumes("w1", Arc::clone(&volumes));

        let inputs = vec![
            InputSource {
                name: "a".to_string(),
                source: ArtifactSource::task_output(
                    container_on(&runtime, "w0"),
                    "/tmp/build/abc/a",
                    Some("vol-a".to_string()),
                ),
                mount_path: "/tmp/build/abc/a".to_string(),
            },
            InputSource {
                name: "b".to_string(),
                source: ArtifactSource::task_output(
                    container_on(&runtime, "w0"),
                    "/tmp/build/abc/b",
                    None,
                ),
                mount_path: "/tmp/build/abc/b".to_string(),
            },
        ];

        let (mounts, to_stream) = partition_inputs(&inputs, &worker).await.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].volume.handle(), "vol-a");
        assert_eq!(volumes.ref_count("vol-a"), Some(1));
        assert_eq!(to_stream.len(), 1);
        assert_eq!(to_stream[0].name, "b");

        release_mounts(&mounts, None).await;
        assert_eq!(volumes.ref_count("vol-a"), Some(0));
    }
}
