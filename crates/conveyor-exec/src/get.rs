//! The get step: fetch one resource version into the build.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use conveyor_core::container::{
    ContainerIdentifier, ContainerMetadata, EXIT_STATUS_PROPERTY, FAILED_STEP_TTL,
    SUCCESSFUL_STEP_TTL, TASK_PROCESS_PROPERTY,
};
use conveyor_core::{Error, Result, ResourceConfig, TeamId, Version};
use conveyor_worker::{
    ArtifactSource, Container, ContainerSpec, ImageSpec, Pool, Process, ProcessIo, ProcessSpec,
};

use crate::cancel::with_cancel;
use crate::delegate::StepDelegate;
use crate::repository::SourceRepository;
use crate::resource::{
    parse_version_result, resource_image, VersionResult, IN_SCRIPT, RESOURCE_RESULT_PATH,
};

/// Fetches a version of a resource and registers the result as an
/// artifact under the step's name. Shares the task step's skeleton:
/// recovery probe, container, run, wait, release.
pub struct GetStep {
    name: String,
    id: ContainerIdentifier,
    metadata: ContainerMetadata,
    tags: Vec<String>,
    team_id: Option<TeamId>,
    resource: ResourceConfig,
    params: serde_json::Value,
    version: Version,
    pool: Arc<Pool>,
    repo: Arc<SourceRepository>,
    delegate: Arc<dyn StepDelegate>,

    container: Option<Container>,
    exit_status: Option<i32>,
    fetched: Option<VersionResult>,
}

impl GetStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        id: ContainerIdentifier,
        metadata: ContainerMetadata,
        tags: Vec<String>,
        team_id: Option<TeamId>,
        resource: ResourceConfig,
        params: serde_json::Value,
        version: Version,
        pool: Arc<Pool>,
        repo: Arc<SourceRepository>,
        delegate: Arc<dyn StepDelegate>,
    ) -> Self {
        Self {
            name: name.into(),
            id,
            metadata,
            tags,
            team_id,
            resource,
            params,
            version,
            pool,
            repo,
            delegate,
            container: None,
            exit_status: None,
            fetched: None,
        }
    }

    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        ready: oneshot::Sender<()>,
    ) -> Result<()> {
        // recovery probe
        if let Some(container) = with_cancel(cancel, self.pool.find_container(&self.id)).await?? {
            if let Some(status) = container.property(EXIT_STATUS_PROPERTY).await? {
                info!(container = %container.handle(), status = %status, "get already exited");
                let status: i32 = status
                    .parse()
                    .map_err(|_| Error::Runtime(format!("bad exit status '{}'", status)))?;

                self.container = Some(container);
                self.exit_status = Some(status);
                if status == 0 {
                    self.register_source();
                }
                return Ok(());
            }

            let process_id = container
                .property(TASK_PROCESS_PROPERTY)
                .await?
                .ok_or_else(|| Error::MissingTaskProcess {
                    handle: container.handle().to_string(),
                })?;

            let process = container
                .attach(
                    &process_id,
                    ProcessIo {
                        stdout: None,
                        stderr: self.delegate.stderr(),
                    },
                )
                .await?;
            self.container = Some(container);

            let _ = ready.send(());
            return self.wait_for(process, None, cancel).await;
        }

        self.delegate.initializing();

        let spec = ContainerSpec {
            platform: None,
            tags: self.tags.clone(),
            team_id: self.team_id,
            resource_type: Some(self.resource.resource_type.clone()),
            image: ImageSpec::Name(resource_image(&self.resource.resource_type)),
            privileged: false,
            env: vec![],
            inputs: vec![],
            outputs: vec![],
        };

        let container = with_cancel(
            cancel,
            self.pool.create_resource_get_container(
                &self.id,
                &self.metadata,
                spec,
                RESOURCE_RESULT_PATH,
            ),
        )
        .await??;

        self.delegate.started();

        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(16);
        let request = serde_json::json!({
            "source": self.resource.source,
            "version": self.version,
            "params": self.params,
        });

        let process = with_cancel(
            cancel,
            container.run(
                ProcessSpec {
                    path: IN_SCRIPT.to_string(),
                    args: vec![RESOURCE_RESULT_PATH.to_string()],
                    env: vec![],
                    dir: None,
                    user: Some("root".to_string()),
                    tty: false,
                    stdin: Some(Bytes::from(serde_json::to_vec(&request)?)),
                },
                ProcessIo {
                    stdout: Some(stdout_tx),
                    stderr: self.delegate.stderr(),
                },
            ),
        )
        .await??;

        with_cancel(
            cancel,
            container.set_property(TASK_PROCESS_PROPERTY, &process.id()),
        )
        .await??;

        self.container = Some(container);
        let _ = ready.send(());

        self.wait_for(process, Some(stdout_rx), cancel).await
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Version and metadata the resource reported, when the fetch ran to
    /// completion in this session. Absent after restart recovery, where
    /// the script's reply is gone.
    pub fn fetched_version(&self) -> Option<&VersionResult> {
        self.fetched.as_ref()
    }

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
        stdout: Option<mpsc::Receiver<Bytes>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let collector = stdout.map(|mut rx| {
            tokio::spawn(async move {
                let mut data = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    data.extend_from_slice(&chunk);
                }
                data
            })
        });

        match with_cancel(cancel, process.wait()).await {
            Err(Error::Interrupted) => {
                self.register_source();
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
                self.exit_status = Some(status);

                let container = self
                    .container
                    .as_ref()
                    .ok_or_else(|| Error::Runtime("get has no container".to_string()))?;
                container
                    .set_property(EXIT_STATUS_PROPERTY, &status.to_string())
                    .await?;

                if status == 0 {
                    if let Some(collector) = collector {
                        let reply = collector.await.unwrap_or_default();
                        self.fetched = Some(parse_version_result(&reply)?);
                    }
                    self.register_source();
                }

                self.delegate.finished(status);
                Ok(())
            }
        }
    }

    fn register_source(&self) {
        let Some(container) = &self.container else {
            return;
        };

        let volume_handle = container
            .mounts()
            .iter()
            .find(|mount| mount.mount_path == RESOURCE_RESULT_PATH)
            .map(|mount| mount.volume.handle().to_string());

        self.repo.register(
            &self.name,
            ArtifactSource::ResourceGet {
                container: container.clone(),
                path: RESOURCE_RESULT_PATH.to_string(),
                volume_handle,
            },
        );
    }
}
