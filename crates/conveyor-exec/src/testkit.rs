//! Shared fakes for this crate's tests: a scriptable runtime, a volume
//! manager with reference counting, and a pool rig wiring them into an
//! in-memory directory and store.

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
use conveyor_db::InMemoryStore;
use conveyor_worker::{
    ArtifactDestination, ArtifactSource, Container, ContainerRuntime, InMemoryDirectory, Pool,
    Process, ProcessIo, ProcessSpec, RuntimeContainerSpec, TarStream, VolumeManager, VolumeSpec,
    Worker, WorkerInfo,
};

use crate::delegate::StepDelegate;

/// How a scripted process behaves once started.
#[derive(Clone)]
pub enum ProcessBehavior {
    Exit { status: i32, stdout: Option<Bytes> },
    Never,
}

#[derive(Clone, Copy, PartialEq)]
pub enum CreateBehavior {
    Succeed,
    MaxContainers,
    Fail,
}

struct FakeProcess {
    id: String,
    behavior: ProcessBehavior,
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn wait(&mut self) -> Result<i32> {
        match &self.behavior {
            ProcessBehavior::Exit { status, .. } => Ok(*status),
            ProcessBehavior::Never => std::future::pending().await,
        }
    }
}

/// A worker-local runtime whose processes are scripted by executable
/// path. Records every call the executors make.
pub struct FakeRuntime {
    worker_addr: String,
    counter: AtomicUsize,
    process_counter: AtomicUsize,
    create_behavior: Mutex<CreateBehavior>,
    scripts: Mutex<HashMap<String, ProcessBehavior>>,
    /// process id -> behavior, for attach after "restart"
    pub processes: Mutex<HashMap<String, ProcessBehavior>>,
    pub containers: Mutex<HashMap<ContainerIdentifier, String>>,
    pub created_mount_paths: Mutex<Vec<Vec<String>>>,
    pub properties: Mutex<HashMap<(String, String), String>>,
    pub run_calls: Mutex<Vec<ProcessSpec>>,
    pub attach_calls: Mutex<Vec<String>>,
    pub stream_ins: Mutex<Vec<String>>,
    pub stream_out_contents: Mutex<HashMap<String, Bytes>>,
    pub stops: Mutex<Vec<(String, bool)>>,
    pub releases: Mutex<Vec<(String, Duration)>>,
}

impl FakeRuntime {
    pub fn new(worker_addr: &str) -> Self {
        Self {
            worker_addr: worker_addr.to_string(),
            counter: AtomicUsize::new(0),
            process_counter: AtomicUsize::new(0),
            create_behavior: Mutex::new(CreateBehavior::Succeed),
            scripts: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
            created_mount_paths: Mutex::new(Vec::new()),
            properties: Mutex::new(HashMap::new()),
            run_calls: Mutex::new(Vec::new()),
            attach_calls: Mutex::new(Vec::new()),
            stream_ins: Mutex::new(Vec::new()),
            stream_out_contents: Mutex::new(HashMap::new()),
            stops: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_creates_with(&self, behavior: CreateBehavior) {
        *self.create_behavior.lock() = behavior;
    }

    /// Scripts what happens when a process with the given path runs.
    pub fn script(&self, path: &str, behavior: ProcessBehavior) {
        self.scripts.lock().insert(path.to_string(), behavior);
    }

    /// Registers a process as already running, for attach scenarios.
    pub fn register_process(&self, process_id: &str, behavior: ProcessBehavior) {
        self.processes
            .lock()
            .insert(process_id.to_string(), behavior);
    }

    /// Plants a container as if created in a previous engine life.
    pub fn plant_container(&self, id: &ContainerIdentifier, handle: &str) {
        self.containers.lock().insert(id.clone(), handle.to_string());
    }

    pub fn set_raw_property(&self, handle: &str, name: &str, value: &str) {
        self.properties
            .lock()
            .insert((handle.to_string(), name.to_string()), value.to_string());
    }

    pub fn property_of(&self, handle: &str, name: &str) -> Option<String> {
        self.properties
            .lock()
            .get(&(handle.to_string(), name.to_string()))
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn run_paths(&self) -> Vec<String> {
        self.run_calls.lock().iter().map(|s| s.path.clone()).collect()
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
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>> {
        let behavior = self
            .scripts
            .lock()
            .get(&spec.path)
            .cloned()
            .unwrap_or(ProcessBehavior::Exit {
                status: 0,
                stdout: None,
            });

        self.run_calls.lock().push(spec);

        let n = self.process_counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("p-{}", n);
        self.processes.lock().insert(id.clone(), behavior.clone());

        if let ProcessBehavior::Exit {
            stdout: Some(stdout),
            ..
        } = &behavior
        {
            if let Some(sender) = &io.stdout {
                let _ = sender.send(stdout.clone()).await;
            }
        }

        Ok(Box::new(FakeProcess { id, behavior }))
    }

    async fn attach(
        &self,
        _handle: &str,
        process_id: &str,
        _io: ProcessIo,
    ) -> Result<Box<dyn Process>> {
        self.attach_calls.lock().push(process_id.to_string());
        let behavior = self
            .processes
            .lock()
            .get(process_id)
            .cloned()
            .ok_or_else(|| Error::Runtime(format!("no process {}", process_id)))?;
        Ok(Box::new(FakeProcess {
            id: process_id.to_string(),
            behavior,
        }))
    }

    async fn stream_in(&self, _handle: &str, path: &str, _tar: Bytes) -> Result<()> {
        self.stream_ins.lock().push(path.to_string());
        Ok(())
    }

    async fn stream_out(&self, _handle: &str, path: &str) -> Result<TarStream> {
        match self.stream_out_contents.lock().get(path).cloned() {
            Some(tar) => Ok(Box::pin(stream::once(async move { Ok(tar) }))),
            None => Ok(Box::pin(stream::empty())),
        }
    }

    async fn property(&self, handle: &str, name: &str) -> Result<Option<String>> {
        Ok(self.property_of(handle, name))
    }

    async fn set_property(&self, handle: &str, name: &str, value: &str) -> Result<()> {
        use conveyor_core::container::EXIT_STATUS_PROPERTY;
        let key = (handle.to_string(), name.to_string());
        let mut properties = self.properties.lock();
        if name == EXIT_STATUS_PROPERTY && properties.contains_key(&key) {
            // exit status is write-once
            return Ok(());
        }
        properties.insert(key, value.to_string());
        Ok(())
    }

    async fn stop(&self, handle: &str, kill: bool) -> Result<()> {
        self.stops.lock().push((handle.to_string(), kill));
        Ok(())
    }

    async fn release(&self, handle: &str, ttl: Duration) -> Result<()> {
        self.releases.lock().push((handle.to_string(), ttl));
        Ok(())
    }
}

/// Volume manager tracking handles and client-side reference counts.
#[derive(Default)]
pub struct FakeVolumes {
    counter: AtomicUsize,
    pub volumes: Mutex<HashMap<String, usize>>,
}

impl FakeVolumes {
    pub fn new() -> Self {
        Self::default()
    }

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

pub struct Host {
    pub addr: String,
    pub runtime: Arc<FakeRuntime>,
    pub volumes: Arc<FakeVolumes>,
}

pub struct Rig {
    pub store: Arc<InMemoryStore>,
    pub pool: Arc<Pool>,
    pub hosts: Vec<Host>,
}

impl Rig {
    pub fn host(&self, addr: &str) -> &Host {
        self.hosts
            .iter()
            .find(|host| host.addr == addr)
            .expect("host registered in rig")
    }
}

/// Builds a pool over fake hosts. Each entry is `(addr, resident volume
/// handles)`.
pub fn rig(hosts: &[(&str, &[&str])]) -> Rig {
    let directory = InMemoryDirectory::new();
    let store = Arc::new(InMemoryStore::new());
    let mut built = Vec::new();

    for (addr, resident) in hosts {
        let runtime = Arc::new(FakeRuntime::new(addr));
        let volumes = Arc::new(FakeVolumes::new());
        for handle in *resident {
            volumes.seed(handle);
        }

        let info = WorkerInfo {
            addr: addr.to_string(),
            platform: "linux".to_string(),
            tags: vec![],
            resource_types: vec!["git".to_string(), "docker".to_string()],
            active_containers: 0,
            max_containers: 10,
            team_id: None,
        };
        directory.register(
            Worker::new(info, Arc::clone(&runtime) as _, Arc::clone(&volumes) as _),
            Duration::from_secs(3600),
        );

        built.push(Host {
            addr: addr.to_string(),
            runtime,
            volumes,
        });
    }

    let pool = Arc::new(Pool::with_seed(
        Arc::new(directory),
        Arc::clone(&store) as _,
        7,
    ));

    Rig {
        store,
        pool,
        hosts: built,
    }
}

/// A task-output artifact source whose container lives on a detached
/// origin runtime; useful for seeding repositories.
pub fn task_output_source(
    worker_addr: &str,
    path: &str,
    volume_handle: Option<&str>,
) -> ArtifactSource {
    let runtime = Arc::new(FakeRuntime::new(worker_addr));
    let container = Container::new(
        format!("{}-origin", worker_addr),
        worker_addr,
        runtime as _,
        vec![],
    );
    ArtifactSource::task_output(container, path, volume_handle.map(String::from))
}

/// Destination recording the paths streamed into it.
#[derive(Default)]
pub struct RecordingDestination {
    paths: Mutex<Vec<String>>,
}

impl RecordingDestination {
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }
}

#[async_trait]
impl ArtifactDestination for RecordingDestination {
    async fn stream_in(&self, dest_path: &str, _tar: Bytes) -> Result<()> {
        self.paths.lock().push(dest_path.to_string());
        Ok(())
    }
}

/// Delegate recording lifecycle callbacks.
#[derive(Default)]
pub struct RecordingDelegate {
    pub events: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl StepDelegate for RecordingDelegate {
    fn initializing(&self) {
        self.events.lock().push("initializing".to_string());
    }

    fn started(&self) {
        self.events.lock().push("started".to_string());
    }

    fn finished(&self, exit_status: i32) {
        self.events.lock().push(format!("finished:{}", exit_status));
    }
}
