//! The image resource fetcher.
//!
//! Resolves a task's `image_resource` (a type plus source) to an
//! immutable on-worker image volume: check for the newest version, fetch
//! it through a get container, and cache the resulting volume. The cache
//! key is `(type, source, version)`; the cached volume is worker-local,
//! so the cache holds one volume handle per worker under each key. A
//! per-key async lock makes concurrent fetches at-most-once.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use conveyor_core::container::{
    ContainerIdentifier, ContainerMetadata, ContainerStage, SUCCESSFUL_STEP_TTL,
};
use conveyor_core::task::ImageResource;
use conveyor_core::version::{source_digest, version_digest};
use conveyor_core::{Error, Result, TeamId, Version};
use conveyor_worker::{ContainerSpec, ImageSpec, Pool, Volume};

use crate::cancel::with_cancel;
use crate::delegate::StepDelegate;
use crate::resource::{
    self, parse_version_result, parse_versions, CHECK_SCRIPT, IN_SCRIPT, RESOURCE_RESULT_PATH,
};

type CacheKey = (String, String, String);

#[derive(Default)]
struct CacheSlot {
    /// Volume handle per worker address once a get has completed there.
    volumes: HashMap<String, String>,
}

/// A fetched image: the volume to mount read-only as the container's
/// rootfs, and the version it corresponds to.
#[derive(Debug)]
pub struct FetchedImage {
    pub volume: Volume,
    pub version: Version,
}

pub struct ImageFetcher {
    pool: Arc<Pool>,
    cache: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<CacheSlot>>>>,
}

impl ImageFetcher {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<CacheSlot>> {
        let mut cache = self.cache.lock();
        Arc::clone(cache.entry(key.clone()).or_default())
    }

    /// Fetches the image for a task step onto the chosen worker.
    ///
    /// `task_name` labels the misbehaving-resource error; `step_id` is
    /// the step's container identifier, whose check/get sessions share
    /// its owner under their own stages.
    #[allow(clippy::too_many_arguments)]
    pub async fn fetch(
        &self,
        task_name: &str,
        step_id: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        image_resource: &ImageResource,
        worker: &conveyor_worker::Worker,
        team_id: Option<TeamId>,
        tags: Vec<String>,
        cancel: &CancellationToken,
        delegate: &dyn StepDelegate,
    ) -> Result<FetchedImage> {
        let versions = self
            .check(step_id, metadata, image_resource, worker, team_id, &tags, cancel, delegate)
            .await?;

        let version = versions.into_iter().next().ok_or(Error::ImageUnavailable)?;

        let key: CacheKey = (
            image_resource.resource_type.clone(),
            source_digest(&image_resource.source),
            version_digest(&version),
        );
        let slot = self.slot(&key);
        let mut slot = slot.lock().await;

        if let Some(handle) = slot.volumes.get(worker.addr()) {
            if let Some(volume) = worker.lookup_volume(handle).await? {
                debug!(volume = %handle, worker = %worker.addr(), "image cache hit");
                volume.hold().await?;
                return Ok(FetchedImage { volume, version });
            }
            // the worker reaped it; fall through and fetch again
            slot.volumes.remove(worker.addr());
        }

        info!(
            resource_type = %image_resource.resource_type,
            worker = %worker.addr(),
            "fetching image",
        );
        let volume = self
            .get(
                task_name,
                step_id,
                metadata,
                image_resource,
                &version,
                team_id,
                &tags,
                cancel,
                delegate,
            )
            .await?;

        slot.volumes
            .insert(worker.addr().to_string(), volume.handle().to_string());
        Ok(FetchedImage { volume, version })
    }

    #[allow(clippy::too_many_arguments)]
    async fn check(
        &self,
        step_id: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        image_resource: &ImageResource,
        worker: &conveyor_worker::Worker,
        team_id: Option<TeamId>,
        tags: &[String],
        cancel: &CancellationToken,
        delegate: &dyn StepDelegate,
    ) -> Result<Vec<Version>> {
        let check_id = step_id.with_stage(ContainerStage::Check);

        let container = match with_cancel(cancel, self.pool.find_container(&check_id)).await?? {
            Some(container) => container,
            None => {
                let spec = self.resource_spec(image_resource, team_id, tags);
                with_cancel(
                    cancel,
                    self.pool.create_container_on(
                        worker,
                        &check_id,
                        metadata,
                        spec.runtime_spec_for_check(),
                    ),
                )
                .await??
            }
        };

        let request = serde_json::json!({
            "source": image_resource.source,
            "version": null,
        });
        let result = resource::run_script(
            &container,
            cancel,
            CHECK_SCRIPT,
            vec![],
            &request,
            delegate.stderr(),
        )
        .await?;

        let _ = container.release(SUCCESSFUL_STEP_TTL).await;

        if result.exit_status != 0 {
            return Err(Error::Runtime(format!(
                "image check exited {}",
                result.exit_status
            )));
        }

        parse_versions(&result.stdout)
    }

    #[allow(clippy::too_many_arguments)]
    async fn get(
        &self,
        task_name: &str,
        step_id: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        image_resource: &ImageResource,
        version: &Version,
        team_id: Option<TeamId>,
        tags: &[String],
        cancel: &CancellationToken,
        delegate: &dyn StepDelegate,
    ) -> Result<Volume> {
        let get_id = step_id.with_stage(ContainerStage::Get);
        let spec = self.resource_spec(image_resource, team_id, tags);

        let container = with_cancel(
            cancel,
            self.pool.create_resource_get_container(
                &get_id,
                metadata,
                spec.into_container_spec(),
                RESOURCE_RESULT_PATH,
            ),
        )
        .await??;

        let cache_volume = container
            .mounts()
            .iter()
            .find(|mount| mount.mount_path == RESOURCE_RESULT_PATH)
            .map(|mount| mount.volume.clone());

        let request = serde_json::json!({
            "source": image_resource.source,
            "version": version,
            "params": null,
        });
        let result = resource::run_script(
            &container,
            cancel,
            IN_SCRIPT,
            vec![RESOURCE_RESULT_PATH.to_string()],
            &request,
            delegate.stderr(),
        )
        .await?;

        let _ = container.release(SUCCESSFUL_STEP_TTL).await;

        if result.exit_status != 0 {
            return Err(Error::Runtime(format!(
                "image get exited {}",
                result.exit_status
            )));
        }

        // misbehaving resource type or a worker without volume support
        let volume = cache_volume.ok_or_else(|| Error::ImageGetDidNotProduceVolume {
            task: task_name.to_string(),
        })?;

        parse_version_result(&result.stdout)?;
        volume.hold().await?;
        Ok(volume)
    }

    fn resource_spec(
        &self,
        image_resource: &ImageResource,
        team_id: Option<TeamId>,
        tags: &[String],
    ) -> ResourceSpec {
        ResourceSpec {
            resource_type: image_resource.resource_type.clone(),
            team_id,
            tags: tags.to_vec(),
        }
    }
}

struct ResourceSpec {
    resource_type: String,
    team_id: Option<TeamId>,
    tags: Vec<String>,
}

impl ResourceSpec {
    fn into_container_spec(self) -> ContainerSpec {
        ContainerSpec {
            platform: None,
            tags: self.tags,
            team_id: self.team_id,
            resource_type: Some(self.resource_type.clone()),
            image: ImageSpec::Name(resource::resource_image(&self.resource_type)),
            privileged: false,
            env: vec![],
            inputs: vec![],
            outputs: vec![],
        }
    }

    fn runtime_spec_for_check(&self) -> conveyor_worker::RuntimeContainerSpec {
        conveyor_worker::RuntimeContainerSpec {
            image: ImageSpec::Name(resource::resource_image(&self.resource_type)),
            privileged: false,
            env: vec![],
            mounts: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::NoopDelegate;
    use crate::testkit::{rig, ProcessBehavior};
    use bytes::Bytes;
    use conveyor_core::{BuildId, PlanId};
    use conveyor_worker::WorkerSpec;

    fn image_resource() -> ImageResource {
        ImageResource {
            resource_type: "docker".to_string(),
            source: serde_json::json!({"repository": "busybox"}),
        }
    }

    fn step_id() -> ContainerIdentifier {
        ContainerIdentifier::for_build(BuildId::new(), PlanId::new(), ContainerStage::Run)
    }

    #[tokio::test]
    async fn fetches_once_and_caches_the_volume_per_worker() {
        let rig = rig(&[("w1", &[])]);
        let host = rig.host("w1");
        host.runtime.script(
            CHECK_SCRIPT,
            ProcessBehavior::Exit {
                status: 0,
                stdout: Some(Bytes::from_static(br#"[{"ref": "v1"}]"#)),
            },
        );
        host.runtime.script(
            IN_SCRIPT,
            ProcessBehavior::Exit {
                status: 0,
                stdout: Some(Bytes::from_static(br#"{"version": {"ref": "v1"}}"#)),
            },
        );

        let fetcher = ImageFetcher::new(Arc::clone(&rig.pool));
        let worker = rig.pool.satisfying(&WorkerSpec::default()).await.unwrap();
        let cancel = CancellationToken::new();
        let id = step_id();
        let resource = image_resource();

        let first = fetcher
            .fetch(
                "build",
                &id,
                &ContainerMetadata::default(),
                &resource,
                &worker,
                None,
                vec![],
                &cancel,
                &NoopDelegate,
            )
            .await
            .unwrap();
        assert_eq!(first.version.get("ref").map(String::as_str), Some("v1"));

        let second = fetcher
            .fetch(
                "build",
                &id,
                &ContainerMetadata::default(),
                &resource,
                &worker,
                None,
                vec![],
                &cancel,
                &NoopDelegate,
            )
            .await
            .unwrap();

        assert_eq!(first.volume.handle(), second.volume.handle());

        // check runs each time; the get ran exactly once
        let runs = host.runtime.run_paths();
        assert_eq!(
            runs.iter().filter(|path| path.as_str() == IN_SCRIPT).count(),
            1
        );
        assert_eq!(
            runs.iter().filter(|path| path.as_str() == CHECK_SCRIPT).count(),
            2
        );
    }

    #[tokio::test]
    async fn empty_version_list_is_image_unavailable() {
        let rig = rig(&[("w1", &[])]);
        rig.host("w1").runtime.script(
            CHECK_SCRIPT,
            ProcessBehavior::Exit {
                status: 0,
                stdout: Some(Bytes::from_static(b"[]")),
            },
        );

        let fetcher = ImageFetcher::new(Arc::clone(&rig.pool));
        let worker = rig.pool.satisfying(&WorkerSpec::default()).await.unwrap();
        let cancel = CancellationToken::new();

        let err = fetcher
            .fetch(
                "build",
                &step_id(),
                &ContainerMetadata::default(),
                &image_resource(),
                &worker,
                None,
                vec![],
                &cancel,
                &NoopDelegate,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageUnavailable));

        // no get container was opened
        assert!(!rig
            .host("w1")
            .runtime
            .run_paths()
            .contains(&IN_SCRIPT.to_string()));
    }
}
