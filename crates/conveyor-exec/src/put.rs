//! The put step: publish a new version of a resource.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conveyor_core::container::{
    ContainerIdentifier, ContainerMetadata, EXIT_STATUS_PROPERTY, FAILED_STEP_TTL,
    SUCCESSFUL_STEP_TTL, TASK_PROCESS_PROPERTY,
};
use conveyor_core::{BuildId, Error, Result, ResourceConfig, ResourceVersion, TeamId};
use conveyor_db::BuildStore;
use conveyor_worker::{
    ContainerDestination, Container, ContainerSpec, ImageSpec, InputSource, Pool, Process,
    ProcessIo, ProcessSpec,
};

use crate::cancel::with_cancel;
use crate::delegate::StepDelegate;
use crate::repository::SourceRepository;
use crate::resource::{
    parse_version_result, resource_image, VersionResult, OUT_SCRIPT, RESOURCE_PUT_PATH,
};

/// Publishes a resource version from the build's artifacts. Every
/// registered source is made available to the script; placement prefers
/// the worker already holding their volumes. Puts register no artifact;
/// they emit a new resource version record.
pub struct PutStep {
    id: ContainerIdentifier,
    metadata: ContainerMetadata,
    tags: Vec<String>,
    team_id: Option<TeamId>,
    resource: ResourceConfig,
    params: serde_json::Value,
    build_id: BuildId,
    pool: Arc<Pool>,
    repo: Arc<SourceRepository>,
    store: Arc<dyn BuildStore>,
    delegate: Arc<dyn StepDelegate>,

    container: Option<Container>,
    exit_status: Option<i32>,
    created: Option<ResourceVersion>,
}

impl PutStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ContainerIdentifier,
        metadata: ContainerMetadata,
        tags: Vec<String>,
        team_id: Option<TeamId>,
        resource: ResourceConfig,
        params: serde_json::Value,
        build_id: BuildId,
        pool: Arc<Pool>,
        repo: Arc<SourceRepository>,
        store: Arc<dyn BuildStore>,
        delegate: Arc<dyn StepDelegate>,
    ) -> Self {
        Self {
            id,
            metadata,
            tags,
            team_id,
            resource,
            params,
            build_id,
            pool,
            repo,
            store,
            delegate,
            container: None,
            exit_status: None,
            created: None,
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
                info!(container = %container.handle(), status = %status, "put already exited");
                let status: i32 = status
                    .parse()
                    .map_err(|_| Error::Runtime(format!("bad exit status '{}'", status)))?;

                self.container = Some(container);
                self.exit_status = Some(status);
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

        // every artifact the build has produced so far goes to the put
        let inputs: Vec<InputSource> = self
            .repo
            .sources()
            .into_iter()
            .map(|(name, source)| InputSource {
                mount_path: format!("{}/{}", RESOURCE_PUT_PATH, name),
                name,
                source,
            })
            .collect();

        let spec = ContainerSpec {
            platform: None,
            tags: self.tags.clone(),
            team_id: self.team_id,
            resource_type: Some(self.resource.resource_type.clone()),
            image: ImageSpec::Name(resource_image(&self.resource.resource_type)),
            privileged: false,
            env: vec![],
            inputs,
            outputs: vec![],
        };

        let (container, to_stream) = with_cancel(
            cancel,
            self.pool
                .find_or_create_build_container(&self.id, &self.metadata, spec),
        )
        .await??;

        with_cancel(
            cancel,
            container.stream_in(RESOURCE_PUT_PATH, conveyor_worker::archive::empty_tar()),
        )
        .await??;

        for input in &to_stream {
            debug!(input = %input.name, "streaming artifact to put container");
            let destination = ContainerDestination::new(container.clone(), &input.mount_path);
            with_cancel(cancel, input.source.stream_to(&destination)).await??;
        }

        self.delegate.started();

        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(16);
        let request = serde_json::json!({
            "source": self.resource.source,
            "params": self.params,
        });

        let process = with_cancel(
            cancel,
            container.run(
                ProcessSpec {
                    path: OUT_SCRIPT.to_string(),
                    args: vec![RESOURCE_PUT_PATH.to_string()],
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

    /// The version record this put emitted, if it succeeded.
    pub fn created_version(&self) -> Option<&ResourceVersion> {
        self.created.as_ref()
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
                    .ok_or_else(|| Error::Runtime("put has no container".to_string()))?;
                container
                    .set_property(EXIT_STATUS_PROPERTY, &status.to_string())
                    .await?;

                if status == 0 {
                    if let Some(collector) = collector {
                        let reply = collector.await.unwrap_or_default();
                        let result: VersionResult = parse_version_result(&reply)?;
                        self.record_version(result).await?;
                    }
                }

                self.delegate.finished(status);
                Ok(())
            }
        }
    }

    async fn record_version(&mut self, result: VersionResult) -> Result<()> {
        self.store
            .save_resource_versions(&self.resource, vec![result.version.clone()])
            .await
            .map_err(Error::from)?;

        let version = ResourceVersion {
            resource: self.resource.name.clone(),
            resource_type: self.resource.resource_type.clone(),
            version: result.version,
            metadata: result.metadata,
            enabled: true,
        };
        self.store
            .save_build_output(self.build_id, version.clone())
            .await
            .map_err(Error::from)?;

        self.created = Some(version);
        Ok(())
    }
}
