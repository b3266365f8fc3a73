//! The worker pool: compatibility filtering and container placement.
//!
//! Placement is stateless across calls; live worker state is re-read
//! from the directory every time and there is no admission queue.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use conveyor_core::container::{
    ContainerIdentifier, ContainerMetadata, ContainerOwner, VOLUME_BOOTSTRAP_TTL,
};
use conveyor_core::{Error, Result, TeamId};
use conveyor_db::{ContainerRecord, ContainerStore};

use crate::artifact::{partition_inputs, release_mounts, InputSource};
use crate::directory::WorkerDirectory;
use crate::runtime::{Container, ImageSpec, RuntimeContainerSpec, VolumeMount};
use crate::volume::VolumeSpec;
use crate::worker::{Worker, WorkerSpec};

/// Everything needed to place and create one container.
#[derive(Clone)]
pub struct ContainerSpec {
    pub platform: Option<String>,
    pub tags: Vec<String>,
    pub team_id: Option<TeamId>,
    /// Resource type the worker must advertise, for check and get
    /// containers.
    pub resource_type: Option<String>,
    pub image: ImageSpec,
    pub privileged: bool,
    pub env: Vec<String>,
    pub inputs: Vec<InputSource>,
    pub outputs: Vec<VolumeMount>,
}

impl ContainerSpec {
    pub fn worker_spec(&self) -> WorkerSpec {
        WorkerSpec {
            platform: self.platform.clone(),
            tags: self.tags.clone(),
            resource_type: self.resource_type.clone(),
            team_id: self.team_id,
        }
    }

    fn runtime_spec(&self, input_mounts: Vec<VolumeMount>) -> RuntimeContainerSpec {
        let mut mounts = input_mounts;
        mounts.extend(self.outputs.iter().cloned());
        RuntimeContainerSpec {
            image: self.image.clone(),
            privileged: self.privileged,
            env: self.env.clone(),
            mounts,
        }
    }
}

/// Placement policy over the set of live workers.
pub struct Pool {
    directory: Arc<dyn WorkerDirectory>,
    containers: Arc<dyn ContainerStore>,
    rng: Mutex<StdRng>,
}

impl Pool {
    pub fn new(directory: Arc<dyn WorkerDirectory>, containers: Arc<dyn ContainerStore>) -> Self {
        Self {
            directory,
            containers,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(
        directory: Arc<dyn WorkerDirectory>,
        containers: Arc<dyn ContainerStore>,
        seed: u64,
    ) -> Self {
        Self {
            directory,
            containers,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// All live workers satisfying the spec. When any team-owned worker
    /// matches, only team-owned workers are returned; a tenant's own
    /// hardware takes its work.
    pub async fn all_satisfying(&self, spec: &WorkerSpec) -> Result<Vec<Worker>> {
        let workers = self.directory.running_workers().await?;
        if workers.is_empty() {
            return Err(Error::NoWorkers);
        }

        let mut team_owned = Vec::new();
        let mut general = Vec::new();
        for worker in &workers {
            if worker.satisfies(spec) {
                if worker.is_team_owned() {
                    team_owned.push(worker.clone());
                } else {
                    general.push(worker.clone());
                }
            }
        }

        if !team_owned.is_empty() {
            return Ok(team_owned);
        }
        if !general.is_empty() {
            return Ok(general);
        }

        Err(Error::NoCompatibleWorkers {
            spec: spec.describe(),
            workers: workers.iter().map(Worker::describe).collect(),
        })
    }

    /// One satisfying worker, picked at random to spread load.
    pub async fn satisfying(&self, spec: &WorkerSpec) -> Result<Worker> {
        let compatible = self.all_satisfying(spec).await?;
        let index = self.rng.lock().gen_range(0..compatible.len());
        Ok(compatible[index].clone())
    }

    /// A live container previously created for the identifier, located
    /// through the placement records.
    pub async fn find_container(&self, id: &ContainerIdentifier) -> Result<Option<Container>> {
        let record = match self.containers.find_container(id).await.map_err(Error::from)? {
            Some(record) => record,
            None => return Ok(None),
        };

        let worker = match self.directory.worker(&record.worker_addr).await? {
            Some(worker) => worker,
            None => {
                debug!(worker = %record.worker_addr, "worker for recorded container is gone");
                return Ok(None);
            }
        };

        match worker.runtime().find_container(id).await? {
            Some(handle) => Ok(Some(Container::new(
                handle,
                worker.addr(),
                worker.runtime(),
                vec![],
            ))),
            None => {
                // stale record; the worker reaped the container
                self.containers
                    .container_destroyed(id)
                    .await
                    .map_err(Error::from)?;
                Ok(None)
            }
        }
    }

    /// Creates a container on the given worker and records its
    /// placement.
    pub async fn create_container_on(
        &self,
        worker: &Worker,
        id: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        spec: RuntimeContainerSpec,
    ) -> Result<Container> {
        let mounts = spec.mounts.clone();
        let handle = worker.runtime().create_container(id, metadata, spec).await?;

        self.containers
            .container_created(ContainerRecord {
                identifier: id.clone(),
                worker_addr: worker.addr().to_string(),
                handle: handle.clone(),
            })
            .await
            .map_err(Error::from)?;

        info!(worker = %worker.addr(), container = %handle, "created container");
        Ok(Container::new(handle, worker.addr(), worker.runtime(), mounts))
    }

    /// Finds or creates the container for a build plan node.
    ///
    /// If persistence knows a worker already hosting this `(build,
    /// plan)`, the call sticks to that worker. Otherwise workers are
    /// tried in descending order of how many of the spec's inputs are
    /// already volume-resident on them; a saturated worker is skipped,
    /// any other creation error is fatal.
    ///
    /// Returns the container plus the inputs that still need streaming.
    pub async fn find_or_create_build_container(
        &self,
        id: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        spec: ContainerSpec,
    ) -> Result<(Container, Vec<InputSource>)> {
        let (build_id, plan_id) = match &id.owner {
            ContainerOwner::Build { build_id, plan_id } => (*build_id, *plan_id),
            ContainerOwner::Resource { .. } => {
                return Err(Error::Runtime(
                    "build container requires a build owner".to_string(),
                ))
            }
        };

        if let Some(addr) = self
            .containers
            .find_worker_for_build_container(build_id, plan_id)
            .await
            .map_err(Error::from)?
        {
            if let Some(worker) = self.directory.worker(&addr).await? {
                if let Some(handle) = worker.runtime().find_container(id).await? {
                    debug!(worker = %addr, container = %handle, "reusing existing container");
                    return Ok((
                        Container::new(handle, worker.addr(), worker.runtime(), vec![]),
                        vec![],
                    ));
                }

                return self.create_with_affinity(vec![worker], id, metadata, &spec).await;
            }

            debug!(worker = %addr, "recorded worker expired; replacing");
        }

        let compatible = self.all_satisfying(&spec.worker_spec()).await?;

        // order by how many inputs already live there
        let mut ranked = Vec::with_capacity(compatible.len());
        for worker in compatible {
            let mut resident = 0;
            for input in &spec.inputs {
                if input.source.volume_on(&worker).await?.is_some() {
                    resident += 1;
                }
            }
            ranked.push((resident, worker));
        }
        ranked.sort_by_key(|(resident, _)| std::cmp::Reverse(*resident));
        let ordered = ranked.into_iter().map(|(_, w)| w).collect();

        self.create_with_affinity(ordered, id, metadata, &spec).await
    }

    async fn create_with_affinity(
        &self,
        workers: Vec<Worker>,
        id: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<(Container, Vec<InputSource>)> {
        for worker in workers {
            let (mounts, to_stream) = partition_inputs(&spec.inputs, &worker).await?;

            match self
                .create_container_on(&worker, id, metadata, spec.runtime_spec(mounts.clone()))
                .await
            {
                Ok(container) => {
                    // ownership transferred to the container
                    release_mounts(&mounts, None).await;
                    release_mounts(&spec.outputs, None).await;
                    return Ok((container, to_stream));
                }
                Err(Error::MaxContainersReached) => {
                    warn!(worker = %worker.addr(), "worker is saturated; trying the next");
                    release_mounts(&mounts, None).await;
                }
                Err(err) => {
                    release_mounts(&mounts, None).await;
                    return Err(err);
                }
            }
        }

        Err(Error::ContainerCreationExhausted)
    }

    /// Finds or creates the container checking a resource, deduplicated
    /// by the resource-user identity.
    pub async fn find_or_create_resource_check_container(
        &self,
        id: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        spec: ContainerSpec,
    ) -> Result<Container> {
        let user = match &id.owner {
            ContainerOwner::Resource { user } => user.clone(),
            ContainerOwner::Build { .. } => {
                return Err(Error::Runtime(
                    "resource check container requires a resource owner".to_string(),
                ))
            }
        };

        if let Some(addr) = self
            .containers
            .find_worker_for_resource_container(&user)
            .await
            .map_err(Error::from)?
        {
            if let Some(worker) = self.directory.worker(&addr).await? {
                if let Some(handle) = worker.runtime().find_container(id).await? {
                    debug!(worker = %addr, container = %handle, "reusing check container");
                    return Ok(Container::new(handle, worker.addr(), worker.runtime(), vec![]));
                }

                let runtime_spec = spec.runtime_spec(vec![]);
                return self.create_container_on(&worker, id, metadata, runtime_spec).await;
            }
        }

        let worker = self.satisfying(&spec.worker_spec()).await?;
        let runtime_spec = spec.runtime_spec(vec![]);
        self.create_container_on(&worker, id, metadata, runtime_spec).await
    }

    /// Creates the container fetching a resource version on a randomly
    /// chosen satisfying worker, with a fresh volume mounted at
    /// `cache_path` to catch what the fetch produces.
    pub async fn create_resource_get_container(
        &self,
        id: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        spec: ContainerSpec,
        cache_path: &str,
    ) -> Result<Container> {
        let worker = self.satisfying(&spec.worker_spec()).await?;

        let volume = worker
            .create_volume(VolumeSpec {
                privileged: spec.privileged,
                ttl: Some(VOLUME_BOOTSTRAP_TTL),
                properties: Default::default(),
            })
            .await?;
        let cache_mount = VolumeMount {
            volume,
            mount_path: cache_path.to_string(),
        };

        let runtime_spec = spec.runtime_spec(vec![cache_mount.clone()]);
        let container = self.create_container_on(&worker, id, metadata, runtime_spec).await?;

        release_mounts(&[cache_mount], None).await;
        release_mounts(&spec.outputs, None).await;
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactSource;
    use crate::directory::InMemoryDirectory;
    use crate::test_support::{worker_info, CreateBehavior, FakeRuntime, FakeVolumes};
    use conveyor_core::{BuildId, ContainerStage, PlanId};
    use conveyor_db::InMemoryStore;

    struct Host {
        runtime: Arc<FakeRuntime>,
        volumes: Arc<FakeVolumes>,
    }

    fn host(addr: &str, resident: &[&str]) -> (Host, Worker) {
        let runtime = Arc::new(FakeRuntime::new(addr));
        let volumes = Arc::new(FakeVolumes::new());
        for handle in resident {
            volumes.seed(handle);
        }
        let worker = Worker::new(
            worker_info(addr),
            Arc::clone(&runtime) as _,
            Arc::clone(&volumes) as _,
        );
        (Host { runtime, volumes }, worker)
    }

    fn pool_of(workers: Vec<Worker>) -> Pool {
        let directory = InMemoryDirectory::new();
        for worker in workers {
            directory.register(worker, std::time::Duration::from_secs(3600));
        }
        Pool::with_seed(Arc::new(directory), Arc::new(InMemoryStore::new()), 7)
    }

    fn input(name: &str, volume_handle: Option<&str>) -> InputSource {
        let runtime = Arc::new(FakeRuntime::new("origin"));
        let container = Container::new("c-origin", "origin", runtime as _, vec![]);
        InputSource {
            name: name.to_string(),
            source: ArtifactSource::task_output(
                container,
                format!("/tmp/build/abc/{}", name),
                volume_handle.map(String::from),
            ),
            mount_path: format!("/tmp/build/abc/{}", name),
        }
    }

    fn build_spec(inputs: Vec<InputSource>) -> ContainerSpec {
        ContainerSpec {
            platform: Some("linux".to_string()),
            tags: vec![],
            team_id: None,
            resource_type: None,
            image: ImageSpec::Name("alpine".to_string()),
            privileged: false,
            env: vec![],
            inputs,
            outputs: vec![],
        }
    }

    fn build_identifier() -> ContainerIdentifier {
        ContainerIdentifier::for_build(BuildId::new(), PlanId::new(), ContainerStage::Run)
    }

    #[tokio::test]
    async fn empty_directory_is_no_workers() {
        let pool = pool_of(vec![]);
        let err = pool.all_satisfying(&WorkerSpec::default()).await.unwrap_err();
        assert!(matches!(err, Error::NoWorkers));
    }

    #[tokio::test]
    async fn incompatible_workers_are_reported_with_the_spec() {
        let (_, w) = host("w1", &[]);
        let pool = pool_of(vec![w]);

        let err = pool
            .all_satisfying(&WorkerSpec {
                platform: Some("darwin".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();

        match err {
            Error::NoCompatibleWorkers { spec, workers } => {
                assert!(spec.contains("darwin"));
                assert_eq!(workers.len(), 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn team_owned_matches_shadow_general_workers() {
        let team = TeamId::new();
        let (_h1, general) = host("general", &[]);
        let (_h2, base) = host("owned", &[]);
        let mut info = base.info().clone();
        info.team_id = Some(team);
        let owned = Worker::new(info, base.runtime(), base.volume_manager());

        let pool = pool_of(vec![general, owned]);
        let spec = WorkerSpec {
            team_id: Some(team),
            ..Default::default()
        };

        let matched = pool.all_satisfying(&spec).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].addr(), "owned");
    }

    #[tokio::test]
    async fn satisfying_picks_a_member_of_the_compatible_set() {
        let (_, w1) = host("w1", &[]);
        let (_, w2) = host("w2", &[]);
        let pool = pool_of(vec![w1, w2]);

        let chosen = pool.satisfying(&WorkerSpec::default()).await.unwrap();
        assert!(chosen.addr() == "w1" || chosen.addr() == "w2");
    }

    #[tokio::test]
    async fn placement_prefers_the_worker_with_most_resident_inputs() {
        let (_h1, w1) = host("w1", &["vol-a"]);
        let (h2, w2) = host("w2", &["vol-a", "vol-b"]);
        let (_h3, w3) = host("w3", &[]);
        let pool = pool_of(vec![w1, w2, w3]);

        let spec = build_spec(vec![input("a", Some("vol-a")), input("b", Some("vol-b"))]);
        let (container, to_stream) = pool
            .find_or_create_build_container(&build_identifier(), &Default::default(), spec)
            .await
            .unwrap();

        assert_eq!(container.worker_addr(), "w2");
        assert!(to_stream.is_empty());

        let mounted = h2.runtime.created_mount_paths.lock()[0].clone();
        assert!(mounted.contains(&"/tmp/build/abc/a".to_string()));
        assert!(mounted.contains(&"/tmp/build/abc/b".to_string()));

        // references released once the container adopted the volumes
        assert_eq!(h2.volumes.ref_count("vol-a"), Some(0));
        assert_eq!(h2.volumes.ref_count("vol-b"), Some(0));
    }

    #[tokio::test]
    async fn saturated_best_worker_falls_back_to_the_next_candidate() {
        let (h1, w1) = host("w1", &["vol-a"]);
        let (h2, w2) = host("w2", &["vol-a", "vol-b"]);
        let (_h3, w3) = host("w3", &[]);
        h2.runtime.fail_creates_with(CreateBehavior::MaxContainers);
        let pool = pool_of(vec![w1, w2, w3]);

        let spec = build_spec(vec![input("a", Some("vol-a")), input("b", Some("vol-b"))]);
        let (container, to_stream) = pool
            .find_or_create_build_container(&build_identifier(), &Default::default(), spec)
            .await
            .unwrap();

        assert_eq!(container.worker_addr(), "w1");
        assert_eq!(to_stream.len(), 1);
        assert_eq!(to_stream[0].name, "b");

        // the saturated worker's held references were dropped again
        assert_eq!(h2.volumes.ref_count("vol-a"), Some(0));
        assert_eq!(h1.volumes.ref_count("vol-a"), Some(0));
    }

    #[tokio::test]
    async fn non_saturation_errors_are_fatal() {
        let (h2, w2) = host("w2", &[]);
        h2.runtime.fail_creates_with(CreateBehavior::Fail);
        let pool = pool_of(vec![w2]);

        let err = pool
            .find_or_create_build_container(
                &build_identifier(),
                &Default::default(),
                build_spec(vec![]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[tokio::test]
    async fn exhausting_every_candidate_is_its_own_error() {
        let (h1, w1) = host("w1", &[]);
        let (h2, w2) = host("w2", &[]);
        h1.runtime.fail_creates_with(CreateBehavior::MaxContainers);
        h2.runtime.fail_creates_with(CreateBehavior::MaxContainers);
        let pool = pool_of(vec![w1, w2]);

        let err = pool
            .find_or_create_build_container(
                &build_identifier(),
                &Default::default(),
                build_spec(vec![]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContainerCreationExhausted));
    }

    #[tokio::test]
    async fn placement_sticks_to_the_worker_already_hosting_the_build() {
        let (h1, w1) = host("w1", &[]);
        let (_h2, w2) = host("w2", &[]);
        let pool = pool_of(vec![w1, w2]);
        let id = build_identifier();

        let (first, _) = pool
            .find_or_create_build_container(&id, &Default::default(), build_spec(vec![]))
            .await
            .unwrap();

        let (second, _) = pool
            .find_or_create_build_container(&id, &Default::default(), build_spec(vec![]))
            .await
            .unwrap();

        assert_eq!(first.worker_addr(), second.worker_addr());
        assert_eq!(first.handle(), second.handle());
        assert_eq!(h1.runtime.created_count(), 1);
    }

    #[tokio::test]
    async fn check_containers_deduplicate_by_resource_user() {
        let (h1, w1) = host("w1", &[]);
        let pool = pool_of(vec![w1]);
        let id = ContainerIdentifier::for_resource("check:main/repo", ContainerStage::Check);

        let spec = build_spec(vec![]);
        let first = pool
            .find_or_create_resource_check_container(&id, &Default::default(), spec.clone())
            .await
            .unwrap();
        let second = pool
            .find_or_create_resource_check_container(&id, &Default::default(), spec)
            .await
            .unwrap();

        assert_eq!(first.handle(), second.handle());
        assert_eq!(h1.runtime.created_count(), 1);
    }
}
