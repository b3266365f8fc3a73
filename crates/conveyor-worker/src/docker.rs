//! Docker-backed container runtime and volume manager.
//!
//! The production adapter for workers that expose a docker daemon.
//! Containers are created around a long sleep and processes run as
//! execs, whose ids double as the restart-durable process property.
//! Properties live as files under a reserved directory inside the
//! container so they survive engine restarts. Docker has no native TTL
//! on containers or volumes; expiry deadlines are tracked client-side
//! and applied by `reap_expired`.
//!
//! Limitations: an exec re-attached after a restart reports its exit
//! status but cannot replay output, and image volumes require a
//! rootfs-from-volume capable backend, which docker is not.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conveyor_core::container::{
    ContainerIdentifier, ContainerMetadata, EXIT_STATUS_PROPERTY,
};
use conveyor_core::version::source_digest;
use conveyor_core::{Error, Result};

use crate::archive::{first_entry, single_file_tar};
use crate::runtime::{
    ContainerRuntime, ImageSpec, Process, ProcessIo, ProcessSpec, RuntimeContainerSpec, TarStream,
};
use crate::volume::{VolumeManager, VolumeSpec};

const PROPERTY_DIR: &str = "/tmp/.conveyor.d";

fn runtime_err(err: bollard::errors::Error) -> Error {
    Error::Runtime(err.to_string())
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Container runtime over a single worker's docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    worker_addr: String,
    deadlines: Mutex<HashMap<String, Instant>>,
}

impl DockerRuntime {
    /// Connects to the local docker daemon.
    pub fn new(worker_addr: impl Into<String>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(runtime_err)?;
        Ok(Self::with_client(docker, worker_addr))
    }

    pub fn with_client(docker: Docker, worker_addr: impl Into<String>) -> Self {
        Self {
            docker,
            worker_addr: worker_addr.into(),
            deadlines: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic container name for an identifier, so restarts find
    /// the same container by inspection.
    fn container_name(id: &ContainerIdentifier) -> String {
        let identity = serde_json::to_value(id).unwrap_or_default();
        let digest = source_digest(&identity);
        format!("conveyor-{}", &digest[..12])
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(err) => warn!(error = %err, "pull warning"),
            }
        }
        Ok(())
    }

    async fn exec_and_wait(&self, handle: &str, cmd: Vec<String>) -> Result<i32> {
        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(runtime_err)?;

        self.docker
            .start_exec(&exec.id, Some(StartExecOptions { detach: true, ..Default::default() }))
            .await
            .map_err(runtime_err)?;

        wait_for_exec(&self.docker, &exec.id).await
    }

    fn labels_for(metadata: &ContainerMetadata) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert("conveyor".to_string(), "true".to_string());
        if let Some(team) = metadata.team {
            labels.insert("conveyor.team".to_string(), team.to_string());
        }
        if let Some(pipeline) = &metadata.pipeline {
            labels.insert("conveyor.pipeline".to_string(), pipeline.clone());
        }
        if let Some(job) = &metadata.job {
            labels.insert("conveyor.job".to_string(), job.clone());
        }
        if let Some(build_name) = &metadata.build_name {
            labels.insert("conveyor.build".to_string(), build_name.clone());
        }
        labels
    }

    /// Removes containers whose release TTL has lapsed.
    pub async fn reap_expired(&self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut deadlines = self.deadlines.lock();
            let expired = deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(handle, _)| handle.clone())
                .collect::<Vec<_>>();
            for handle in &expired {
                deadlines.remove(handle);
            }
            expired
        };

        for handle in expired {
            debug!(container = %handle, "reaping expired container");
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(err) = self.docker.remove_container(&handle, Some(options)).await {
                warn!(container = %handle, error = %err, "failed to remove container");
            }
        }
        Ok(())
    }
}

async fn wait_for_exec(docker: &Docker, exec_id: &str) -> Result<i32> {
    loop {
        let inspect = docker.inspect_exec(exec_id).await.map_err(runtime_err)?;
        if inspect.running != Some(true) {
            let code = inspect
                .exit_code
                .ok_or_else(|| Error::Runtime(format!("exec {} has no exit code", exec_id)))?;
            return Ok(code as i32);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

struct DockerProcess {
    docker: Docker,
    exec_id: String,
    forwarder: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl Process for DockerProcess {
    fn id(&self) -> String {
        self.exec_id.clone()
    }

    async fn wait(&mut self) -> Result<i32> {
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.await;
        }
        wait_for_exec(&self.docker, &self.exec_id).await
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(
        &self,
        id: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        spec: RuntimeContainerSpec,
    ) -> Result<String> {
        let image = match &spec.image {
            ImageSpec::Name(name) => name.clone(),
            ImageSpec::Volume(volume) => {
                return Err(Error::Runtime(format!(
                    "docker workers cannot boot from image volume {}",
                    volume.handle()
                )))
            }
        };

        self.pull_image(&image).await?;

        let name = Self::container_name(id);
        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|mount| Mount {
                target: Some(mount.mount_path.clone()),
                source: Some(mount.volume.handle().to_string()),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(false),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            mounts: Some(mounts),
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        let config = Config {
            image: Some(image),
            entrypoint: Some(vec!["/bin/sh".to_string()]),
            cmd: Some(vec!["-c".to_string(), "sleep infinity".to_string()]),
            env: Some(spec.env.clone()),
            labels: Some(Self::labels_for(metadata)),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        info!(container = %name, worker = %self.worker_addr, "creating container");
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(runtime_err)?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)?;

        Ok(name)
    }

    async fn find_container(&self, id: &ContainerIdentifier) -> Result<Option<String>> {
        let name = Self::container_name(id);
        match self.docker.inspect_container(&name, None).await {
            Ok(_) => Ok(Some(name)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(runtime_err(err)),
        }
    }

    async fn run(
        &self,
        handle: &str,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>> {
        let mut cmd = vec![spec.path.clone()];
        cmd.extend(spec.args.iter().cloned());

        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(spec.env.clone()),
                    working_dir: spec.dir.clone(),
                    user: spec.user.clone(),
                    tty: Some(spec.tty),
                    attach_stdin: Some(spec.stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(runtime_err)?;

        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(runtime_err)?;

        let forwarder = match started {
            StartExecResults::Attached { mut output, mut input } => {
                let stdin = spec.stdin.clone();
                Some(tokio::spawn(async move {
                    if let Some(payload) = stdin {
                        if let Err(err) = input.write_all(&payload).await {
                            warn!(error = %err, "failed to write process stdin");
                        }
                        let _ = input.shutdown().await;
                    }

                    while let Some(chunk) = output.next().await {
                        match chunk {
                            Ok(LogOutput::StdOut { message })
                            | Ok(LogOutput::Console { message }) => {
                                if let Some(sender) = &io.stdout {
                                    let _ = sender.send(message).await;
                                }
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                if let Some(sender) = &io.stderr {
                                    let _ = sender.send(message).await;
                                }
                            }
                            Ok(LogOutput::StdIn { .. }) => {}
                            Err(err) => {
                                warn!(error = %err, "process output stream error");
                                break;
                            }
                        }
                    }
                }))
            }
            StartExecResults::Detached => None,
        };

        Ok(Box::new(DockerProcess {
            docker: self.docker.clone(),
            exec_id: exec.id,
            forwarder,
        }))
    }

    async fn attach(
        &self,
        _handle: &str,
        process_id: &str,
        _io: ProcessIo,
    ) -> Result<Box<dyn Process>> {
        // the exec is already running; output replay is not possible,
        // only its exit status can be recovered
        let inspect = self
            .docker
            .inspect_exec(process_id)
            .await
            .map_err(runtime_err)?;
        debug!(
            process = %process_id,
            running = ?inspect.running,
            "re-attached to process"
        );

        Ok(Box::new(DockerProcess {
            docker: self.docker.clone(),
            exec_id: process_id.to_string(),
            forwarder: None,
        }))
    }

    async fn stream_in(&self, handle: &str, path: &str, tar: Bytes) -> Result<()> {
        self.exec_and_wait(handle, vec!["mkdir".to_string(), "-p".to_string(), path.to_string()])
            .await?;

        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(handle, Some(options), tar)
            .await
            .map_err(runtime_err)
    }

    async fn stream_out(&self, handle: &str, path: &str) -> Result<TarStream> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let stream = self
            .docker
            .download_from_container(handle, Some(options))
            .map(|chunk| {
                chunk.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
            });
        Ok(Box::pin(stream))
    }

    async fn property(&self, handle: &str, name: &str) -> Result<Option<String>> {
        let options = DownloadFromContainerOptions {
            path: format!("{}/{}", PROPERTY_DIR, name),
        };
        let mut stream = self.docker.download_from_container(handle, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(err) if is_not_found(&err) => return Ok(None),
                Err(err) => return Err(runtime_err(err)),
            }
        }

        match first_entry(&data, name) {
            Ok(contents) => Ok(Some(String::from_utf8_lossy(&contents).into_owned())),
            Err(Error::FileNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set_property(&self, handle: &str, name: &str, value: &str) -> Result<()> {
        if name == EXIT_STATUS_PROPERTY && self.property(handle, name).await?.is_some() {
            // exit status is write-once
            return Ok(());
        }

        let tar = single_file_tar(name, value.as_bytes())?;
        self.stream_in(handle, PROPERTY_DIR, tar).await
    }

    async fn stop(&self, handle: &str, kill: bool) -> Result<()> {
        if kill {
            self.docker
                .kill_container(handle, Some(KillContainerOptions { signal: "SIGKILL" }))
                .await
                .map_err(runtime_err)
        } else {
            self.docker
                .stop_container(handle, Some(StopContainerOptions { t: 10 }))
                .await
                .map_err(runtime_err)
        }
    }

    async fn release(&self, handle: &str, ttl: Duration) -> Result<()> {
        debug!(container = %handle, ttl = ?ttl, "scheduling container expiry");
        self.deadlines
            .lock()
            .insert(handle.to_string(), Instant::now() + ttl);
        Ok(())
    }
}

/// Volume manager over docker named volumes. Reference counts and TTL
/// deadlines are client-side; docker itself never expires volumes.
pub struct DockerVolumes {
    docker: Docker,
    worker_addr: String,
    state: Mutex<HashMap<String, VolumeState>>,
}

struct VolumeState {
    refs: usize,
    deadline: Option<Instant>,
}

impl DockerVolumes {
    pub fn new(worker_addr: impl Into<String>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(runtime_err)?;
        Ok(Self::with_client(docker, worker_addr))
    }

    pub fn with_client(docker: Docker, worker_addr: impl Into<String>) -> Self {
        Self {
            docker,
            worker_addr: worker_addr.into(),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Removes volumes whose deadline lapsed with no references held.
    pub async fn reap_expired(&self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut state = self.state.lock();
            let expired = state
                .iter()
                .filter(|(_, v)| v.refs == 0 && v.deadline.map(|d| d <= now).unwrap_or(false))
                .map(|(handle, _)| handle.clone())
                .collect::<Vec<_>>();
            for handle in &expired {
                state.remove(handle);
            }
            expired
        };

        for handle in expired {
            debug!(volume = %handle, worker = %self.worker_addr, "reaping expired volume");
            let options = RemoveVolumeOptions { force: true };
            if let Err(err) = self.docker.remove_volume(&handle, Some(options)).await {
                warn!(volume = %handle, error = %err, "failed to remove volume");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeManager for DockerVolumes {
    async fn create(&self, spec: VolumeSpec) -> Result<String> {
        let handle = format!("conveyor-vol-{}", Uuid::now_v7().simple());

        let mut labels: HashMap<String, String> = spec.properties.clone().into_iter().collect();
        labels.insert("conveyor".to_string(), "true".to_string());
        labels.insert(
            "conveyor.privileged".to_string(),
            spec.privileged.to_string(),
        );

        let options = CreateVolumeOptions {
            name: handle.clone(),
            driver: "local".to_string(),
            driver_opts: HashMap::new(),
            labels,
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(runtime_err)?;

        self.state.lock().insert(
            handle.clone(),
            VolumeState {
                refs: 1,
                deadline: spec.ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(handle)
    }

    async fn lookup(&self, handle: &str) -> Result<bool> {
        match self.docker.inspect_volume(handle).await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(runtime_err(err)),
        }
    }

    async fn hold(&self, handle: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.entry(handle.to_string()).or_insert(VolumeState {
            refs: 0,
            deadline: None,
        });
        entry.refs += 1;
        entry.deadline = None;
        Ok(())
    }

    async fn release(&self, handle: &str, ttl: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(handle) {
            entry.refs = entry.refs.saturating_sub(1);
            if let Some(ttl) = ttl {
                entry.deadline = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }
}
