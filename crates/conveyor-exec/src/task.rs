//! The task step executor.
//!
//! Runs one task config inside a container: pick the worker holding the
//! most of the task's inputs, mount what is co-located and stream the
//! rest, run the script, and register outputs back into the source
//! repository. The step is idempotent under engine restarts: a container
//! found for the step's identifier either already carries an exit status
//! (recover the result) or a process id (re-attach and keep waiting).

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conveyor_core::container::{
    ContainerIdentifier, ContainerMetadata, EXIT_STATUS_PROPERTY, FAILED_STEP_TTL,
    SUCCESSFUL_STEP_TTL, TASK_PROCESS_PROPERTY, VOLUME_BOOTSTRAP_TTL,
};
use conveyor_core::task::TaskConfig;
use conveyor_core::{Error, Result, TeamId};
use conveyor_worker::{
    partition_inputs, release_mounts, ArtifactSource, Container, ContainerDestination, ImageSpec,
    InputSource, Pool, Process, ProcessIo, ProcessSpec, RuntimeContainerSpec, VolumeMount,
    VolumeSpec, Worker, WorkerSpec,
};

use crate::cancel::with_cancel;
use crate::delegate::StepDelegate;
use crate::image::ImageFetcher;
use crate::repository::SourceRepository;

/// Executes one task config against the worker pool.
pub struct TaskStep {
    source_name: String,
    id: ContainerIdentifier,
    metadata: ContainerMetadata,
    tags: Vec<String>,
    team_id: Option<TeamId>,
    privileged: bool,
    config: TaskConfig,
    artifacts_root: String,
    pool: Arc<Pool>,
    image_fetcher: Arc<ImageFetcher>,
    repo: Arc<SourceRepository>,
    delegate: Arc<dyn StepDelegate>,

    container: Option<Container>,
    exit_status: Option<i32>,
}

impl TaskStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_name: impl Into<String>,
        id: ContainerIdentifier,
        metadata: ContainerMetadata,
        tags: Vec<String>,
        team_id: Option<TeamId>,
        privileged: bool,
        config: TaskConfig,
        artifacts_root: impl Into<String>,
        pool: Arc<Pool>,
        image_fetcher: Arc<ImageFetcher>,
        repo: Arc<SourceRepository>,
        delegate: Arc<dyn StepDelegate>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            id,
            metadata,
            tags,
            team_id,
            privileged,
            config,
            artifacts_root: artifacts_root.into(),
            pool,
            image_fetcher,
            repo,
            delegate,
            container: None,
            exit_status: None,
        }
    }

    /// Runs the task to completion. `ready` fires once the process is
    /// running and its id has been persisted; cancellation registers
    /// whatever outputs exist, stops the container gracefully, and
    /// surfaces `Interrupted`.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        ready: oneshot::Sender<()>,
    ) -> Result<()> {
        self.metadata.environment = self.config.env();
        self.metadata.working_directory = Some(self.artifacts_root.clone());

        let io = ProcessIo {
            stdout: self.delegate.stdout(),
            stderr: self.delegate.stderr(),
        };

        // recovery probe
        if let Some(container) = with_cancel(cancel, self.pool.find_container(&self.id)).await?? {
            if let Some(status) = container.property(EXIT_STATUS_PROPERTY).await? {
                info!(container = %container.handle(), status = %status, "already exited");
                let status: i32 = status
                    .parse()
                    .map_err(|_| Error::Runtime(format!("bad exit status '{}'", status)))?;

                self.container = Some(container);
                self.exit_status = Some(status);
                self.register_outputs();
                return Ok(());
            }

            let process_id = container
                .property(TASK_PROCESS_PROPERTY)
                .await?
                .ok_or_else(|| Error::MissingTaskProcess {
                    handle: container.handle().to_string(),
                })?;

            info!(container = %container.handle(), process = %process_id, "already running");
            let process = container.attach(&process_id, io).await?;
            self.container = Some(container);

            let _ = ready.send(());
            return self.wait_for(process, cancel).await;
        }

        // new session
        self.delegate.initializing();

        let spec = WorkerSpec {
            platform: self.config.platform.clone(),
            tags: self.tags.clone(),
            resource_type: self
                .config
                .image_resource
                .as_ref()
                .map(|r| r.resource_type.clone()),
            team_id: self.team_id,
        };

        let compatible = with_cancel(cancel, self.pool.all_satisfying(&spec)).await??;
        let inputs = self.resolve_inputs()?;

        let (container, to_stream) = self.create_container(compatible, &inputs, cancel).await?;

        with_cancel(
            cancel,
            container.stream_in(&self.artifacts_root, conveyor_worker::archive::empty_tar()),
        )
        .await??;

        self.stream_inputs(&container, &to_stream, cancel).await?;
        self.setup_outputs(&container, cancel).await?;

        self.delegate.started();

        let process = with_cancel(
            cancel,
            container.run(
                ProcessSpec {
                    path: self.config.run.path.clone(),
                    args: self.config.run.args.clone(),
                    env: self.config.env(),
                    dir: Some(self.artifacts_root.clone()),
                    user: Some("root".to_string()),
                    tty: true,
                    stdin: None,
                },
                io,
            ),
        )
        .await??;

        // persist the process id before declaring readiness, so a
        // restart can re-attach
        with_cancel(
            cancel,
            container.set_property(TASK_PROCESS_PROPERTY, &process.id()),
        )
        .await??;

        self.container = Some(container);
        let _ = ready.send(());

        self.wait_for(process, cancel).await
    }

    /// Exit status of the task's script, once it has one.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Releases the step's container for the status-dependent TTL.
    pub async fn release(&self) {
        let Some(container) = &self.container else {
            return;
        };

        let ttl = if self.exit_status == Some(0) {
            SUCCESSFUL_STEP_TTL
        } else {
            FAILED_STEP_TTL
        };

        if let Err(err) = container.release(ttl).await {
            warn!(container = %container.handle(), error = %err, "failed to release container");
        }
    }

    async fn wait_for(
        &mut self,
        mut process: Box<dyn Process>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match with_cancel(cancel, process.wait()).await {
            Err(Error::Interrupted) => {
                // best-effort: partially written outputs stay readable
                // for downstream cleanup, consume at your own risk
                self.register_outputs();
                if let Some(container) = &self.container {
                    if let Err(err) = container.stop(false).await {
                        warn!(error = %err, "failed to stop container");
                    }
                }
                Err(Error::Interrupted)
            }
            Err(err) => Err(err),
            Ok(Err(err)) => Err(err),
            Ok(Ok(status)) => {
                self.register_outputs();
                self.exit_status = Some(status);

                let container = self
                    .container
                    .as_ref()
                    .ok_or_else(|| Error::Runtime("task has no container".to_string()))?;
                container
                    .set_property(EXIT_STATUS_PROPERTY, &status.to_string())
                    .await?;

                self.delegate.finished(status);
                Ok(())
            }
        }
    }

    /// Creates the task's container on the compatible worker holding the
    /// most of its inputs, dropping to the next-best worker when
    /// creation fails, until none remain.
    async fn create_container(
        &mut self,
        mut compatible: Vec<Worker>,
        inputs: &[InputSource],
        cancel: &CancellationToken,
    ) -> Result<(Container, Vec<InputSource>)> {
        loop {
            let mut best: Option<(usize, usize)> = None;
            for (index, worker) in compatible.iter().enumerate() {
                let mut resident = 0;
                for input in inputs {
                    if input.source.volume_on(worker).await?.is_some() {
                        resident += 1;
                    }
                }
                if best.map(|(_, count)| resident > count).unwrap_or(true) {
                    best = Some((index, resident));
                }
            }

            let Some((index, resident)) = best else {
                return Err(Error::ContainerCreationExhausted);
            };
            let worker = compatible.remove(index);
            debug!(worker = %worker.addr(), resident, "chose worker for task");

            let (input_mounts, to_stream) = partition_inputs(inputs, &worker).await?;

            let mut output_mounts = Vec::new();
            for output in &self.config.outputs {
                let volume = with_cancel(
                    cancel,
                    worker.create_volume(VolumeSpec {
                        privileged: self.privileged,
                        ttl: Some(VOLUME_BOOTSTRAP_TTL),
                        properties: Default::default(),
                    }),
                )
                .await??;
                output_mounts.push(VolumeMount {
                    volume,
                    mount_path: self.artifacts_path(output.subdir()),
                });
            }

            let (image, image_volume) = match &self.config.image_resource {
                Some(image_resource) => {
                    let fetched = self
                        .image_fetcher
                        .fetch(
                            &self.source_name,
                            &self.id,
                            &self.metadata,
                            image_resource,
                            &worker,
                            self.team_id,
                            self.tags.clone(),
                            cancel,
                            self.delegate.as_ref(),
                        )
                        .await?;
                    (
                        ImageSpec::Volume(fetched.volume.clone()),
                        Some(fetched.volume),
                    )
                }
                None => (
                    ImageSpec::Name(self.config.image.clone().unwrap_or_default()),
                    None,
                ),
            };

            let mut mounts = input_mounts.clone();
            mounts.extend(output_mounts.iter().cloned());
            let runtime_spec = RuntimeContainerSpec {
                image,
                privileged: self.privileged,
                env: vec![],
                mounts,
            };

            let created = with_cancel(
                cancel,
                self.pool
                    .create_container_on(&worker, &self.id, &self.metadata, runtime_spec),
            )
            .await?;

            match created {
                Ok(container) => {
                    // the container owns the volumes now
                    release_mounts(&input_mounts, None).await;
                    release_mounts(&output_mounts, None).await;
                    if let Some(volume) = image_volume {
                        if let Err(err) = volume.release(None).await {
                            warn!(error = %err, "failed to release image volume");
                        }
                    }
                    return Ok((container, to_stream));
                }
                Err(err) => {
                    release_mounts(&input_mounts, None).await;
                    release_mounts(&output_mounts, None).await;
                    if let Some(volume) = image_volume {
                        let _ = volume.release(None).await;
                    }

                    if compatible.is_empty() {
                        warn!(worker = %worker.addr(), error = %err, "creation failed; no workers remain");
                        return Err(Error::ContainerCreationExhausted);
                    }
                    warn!(worker = %worker.addr(), error = %err, "creation failed; trying the next worker");
                }
            }
        }
    }

    fn resolve_inputs(&self) -> Result<Vec<InputSource>> {
        let mut resolved = Vec::with_capacity(self.config.inputs.len());
        let mut missing = Vec::new();

        for input in &self.config.inputs {
            match self.repo.source_for(&input.name) {
                Some(source) => resolved.push(InputSource {
                    name: input.name.clone(),
                    source,
                    mount_path: self.artifacts_path(input.subdir()),
                }),
                None => missing.push(input.name.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(Error::MissingInputs(missing));
        }
        Ok(resolved)
    }

    async fn stream_inputs(
        &self,
        container: &Container,
        to_stream: &[InputSource],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for input in to_stream {
            debug!(input = %input.name, "streaming input into container");
            let destination = ContainerDestination::new(container.clone(), &input.mount_path);
            with_cancel(cancel, input.source.stream_to(&destination)).await??;
        }
        Ok(())
    }

    async fn setup_outputs(
        &self,
        container: &Container,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for output in &self.config.outputs {
            let path = self.artifacts_path(output.subdir());
            with_cancel(
                cancel,
                container.stream_in(&path, conveyor_worker::archive::empty_tar()),
            )
            .await??;
        }
        Ok(())
    }

    /// Registers the task's outputs into the source repository. Safe to
    /// call repeatedly; runs on success, on recovery, and on
    /// cancellation.
    fn register_outputs(&self) {
        let Some(container) = &self.container else {
            return;
        };

        if self.config.outputs.is_empty() {
            self.repo.register(
                &self.source_name,
                ArtifactSource::TaskWorkingDir {
                    container: container.clone(),
                    artifacts_root: self.artifacts_root.clone(),
                },
            );
            return;
        }

        for output in &self.config.outputs {
            let path = self.artifacts_path(output.subdir());
            let volume_handle = container
                .mounts()
                .iter()
                .find(|mount| mount.mount_path == path)
                .map(|mount| mount.volume.handle().to_string());

            self.repo.register(
                &output.name,
                ArtifactSource::task_output(container.clone(), path, volume_handle),
            );
        }
    }

    fn artifacts_path(&self, subdir: &str) -> String {
        format!("{}/{}", self.artifacts_root.trim_end_matches('/'), subdir)
    }
}
