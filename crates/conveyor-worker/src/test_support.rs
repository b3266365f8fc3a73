//! Shared fakes for this crate's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;

use conveyor_core::container::{ContainerIdentifier, ContainerMetadata};
use conveyor_core::{Error, Result};

use crate::runtime::{
    ContainerRuntime, Process, ProcessIo, ProcessSpec, RuntimeContainerSpec, TarStream,
};
use crate::volume::{VolumeManager, VolumeSpec};
use crate::worker::WorkerInfo;

pub fn worker_info(addr: &str) -> WorkerInfo {
    WorkerInfo {
        addr: addr.to_string(),
        platform: "linux".to_string(),
        tags: vec![],
        resource_types: vec!["git".to_string()],
        active_containers: 0,
        max_containers: 10,
        team_id: None,
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum CreateBehavior {
    Succeed,
    MaxContainers,
    Fail,
}

/// Records runtime calls; containers are names only, processes are
/// unsupported (the pool never runs them).
pub struct FakeRuntime {
    worker_addr: String,
    create_behavior: Mutex<CreateBehavior>,
    counter: AtomicUsize,
    pub containers: Mutex<HashMap<ContainerIdentifier, String>>,
    pub created_mount_paths: Mutex<Vec<Vec<String>>>,
    pub properties: Mutex<HashMap<(String, String), String>>,
    pub stream_out_contents: Mutex<HashMap<String, Bytes>>,
}

impl FakeRuntime {
    pub fn new(worker_addr: &str) -> Self {
        Self {
            worker_addr: worker_addr.to_string(),
            create_behavior: Mutex::new(CreateBehavior::Succeed),
            counter: AtomicUsize::new(0),
            containers: Mutex::new(HashMap::new()),
            created_mount_paths: Mutex::new(Vec::new()),
            properties: Mutex::new(HashMap::new()),
            stream_out_contents: Mutex::new(HashMap::new()),
        }
    }

    /// Scripts the archive returned for a `stream_out` of `path`.
    pub fn serve_stream_out(&self, path: &str, tar: Bytes) {
        self.stream_out_contents.lock().insert(path.to_string(), tar);
    }

    pub fn fail_creates_with(&self, behavior: CreateBehavior) {
        *self.create_behavior.lock() = behavior;
    }

    pub fn created_count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(
        &self,
        id: &ContainerIdentifier,
        _metadata: &ContainerMetadata,
        spec: RuntimeContainerSpec,
    ) -> Result<String> {
        match *self.create_behavior.lock() {
            CreateBehavior::MaxContainers => return Err(Error::MaxContainersReached),
            CreateBehavior::Fail => {
                return Err(Error::Runtime("container creation failed".to_string()))
            }
            CreateBehavior::Succeed => {}
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = format!("{}-container-{}", self.worker_addr, n);
        self.containers.lock().insert(id.clone(), handle.clone());
        self.created_mount_paths
            .lock()
            .push(spec.mounts.iter().map(|m| m.mount_path.clone()).collect());
        Ok(handle)
    }

    async fn find_container(&self, id: &ContainerIdentifier) -> Result<Option<String>> {
        Ok(self.containers.lock().get(id).cloned())
    }

    async fn run(
        &self,
        _handle: &str,
        _spec: ProcessSpec,
        _io: ProcessIo,
    ) -> Result<Box<dyn Process>> {
        Err(Error::Runtime("fake runtime does not run processes".to_string()))
    }

    async fn attach(
        &self,
        _handle: &str,
        _process_id: &str,
        _io: ProcessIo,
    ) -> Result<Box<dyn Process>> {
        Err(Error::Runtime("fake runtime does not run processes".to_string()))
    }

    async fn stream_in(&self, _handle: &str, _path: &str, _tar: Bytes) -> Result<()> {
        Ok(())
    }

    async fn stream_out(&self, _handle: &str, path: &str) -> Result<TarStream> {
        match self.stream_out_contents.lock().get(path).cloned() {
            Some(tar) => Ok(Box::pin(stream::once(async move { Ok(tar) }))),
            None => Ok(Box::pin(stream::empty())),
        }
    }

    async fn property(&self, handle: &str, name: &str) -> Result<Option<String>> {
        Ok(self
            .properties
            .lock()
            .get(&(handle.to_string(), name.to_string()))
            .cloned())
    }

    async fn set_property(&self, handle: &str, name: &str, value: &str) -> Result<()> {
        self.properties
            .lock()
            .insert((handle.to_string(), name.to_string()), value.to_string());
        Ok(())
    }

    async fn stop(&self, _handle: &str, _kill: bool) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _handle: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }
}

/// Tracks volume handles and client-side reference counts.
#[derive(Default)]
pub struct FakeVolumes {
    counter: AtomicUsize,
    pub volumes: Mutex<HashMap<String, usize>>,
}

impl FakeVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preloads a volume, as if a prior step had produced it here.
    pub fn seed(&self, handle: &str) {
        self.volumes.lock().insert(handle.to_string(), 0);
    }

    pub fn ref_count(&self, handle: &str) -> Option<usize> {
        self.volumes.lock().get(handle).copied()
    }
}

#[async_trait]
impl VolumeManager for FakeVolumes {
    async fn create(&self, _spec: VolumeSpec) -> Result<String> {
        let handle = format!("vol-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.volumes.lock().insert(handle.clone(), 1);
        Ok(handle)
    }

    async fn lookup(&self, handle: &str) -> Result<bool> {
        Ok(self.volumes.lock().contains_key(handle))
    }

    async fn hold(&self, handle: &str) -> Result<()> {
        let mut volumes = self.volumes.lock();
        let count = volumes
            .get_mut(handle)
            .ok_or_else(|| Error::NotFound(format!("volume {}", handle)))?;
        *count += 1;
        Ok(())
    }

    async fn release(&self, handle: &str, _ttl: Option<Duration>) -> Result<()> {
        let mut volumes = self.volumes.lock();
        if let Some(count) = volumes.get_mut(handle) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }
}

pub fn fake_runtime() -> Arc<FakeRuntime> {
    Arc::new(FakeRuntime::new("fake"))
}

pub fn fake_volumes() -> Arc<FakeVolumes> {
    Arc::new(FakeVolumes::new())
}
