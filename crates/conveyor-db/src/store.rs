//! Store traits.

use async_trait::async_trait;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use conveyor_core::{
    Build, BuildId, BuildInput, BuildStatus, ContainerIdentifier, JobConfig, PlanId, ResourceConfig,
    ResourceVersion, TeamId, Version,
};

use crate::error::StoreResult;

/// Build and resource-version records.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn get_build(&self, id: BuildId) -> StoreResult<Option<Build>>;

    /// Creates a pending build of the job.
    async fn create_job_build(
        &self,
        pipeline: &str,
        job: &JobConfig,
        team: Option<TeamId>,
    ) -> StoreResult<Build>;

    /// Transitions a pending build to started, claiming it for the named
    /// engine. Returns false if the build is no longer pending (someone
    /// else claimed or aborted it).
    async fn start_build(&self, id: BuildId, engine: &str, metadata: &str) -> StoreResult<bool>;

    /// Records a terminal status. A no-op if the build is already
    /// terminal; terminal states are absorbing.
    async fn finish_build(&self, id: BuildId, status: BuildStatus) -> StoreResult<()>;

    async fn abort_build(&self, id: BuildId) -> StoreResult<()>;

    /// A one-shot notifier that fires when abort is requested for the
    /// build, including aborts requested before this call.
    async fn abort_notifier(&self, id: BuildId) -> StoreResult<AbortNotifier>;

    async fn save_build_input(&self, id: BuildId, input: BuildInput) -> StoreResult<()>;

    async fn save_build_output(&self, id: BuildId, version: ResourceVersion) -> StoreResult<()>;

    async fn build_inputs(&self, id: BuildId) -> StoreResult<Vec<BuildInput>>;

    /// Appends newly discovered versions for a resource, oldest first.
    /// Versions already saved (by identity) are skipped, never mutated.
    async fn save_resource_versions(
        &self,
        config: &ResourceConfig,
        versions: Vec<Version>,
    ) -> StoreResult<()>;

    /// Moves the soft `enabled` flag on a saved version.
    async fn set_resource_version_enabled(
        &self,
        resource: &str,
        version: &Version,
        enabled: bool,
    ) -> StoreResult<()>;

    /// Resolves each of the job's declared inputs to the latest enabled
    /// version satisfying its `passed` constraints, with
    /// `first_occurrence` computed against the job's input history.
    /// `None` when any input is unsatisfiable.
    async fn get_latest_input_versions(
        &self,
        job: &JobConfig,
    ) -> StoreResult<Option<Vec<BuildInput>>>;

    async fn get_next_pending_build(&self, job: &str) -> StoreResult<Option<Build>>;

    /// The job's most recently finished build and its next queued
    /// (non-terminal) build, either of which may be absent.
    async fn get_job_finished_and_next_build(
        &self,
        job: &str,
    ) -> StoreResult<(Option<Build>, Option<Build>)>;

    /// Inputs of the job's most recently created build, if any.
    async fn latest_build_inputs(&self, job: &str) -> StoreResult<Option<Vec<BuildInput>>>;
}

/// Record of a live container, keyed by its identity tuple.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub identifier: ContainerIdentifier,
    pub worker_addr: String,
    pub handle: String,
}

/// Container placement records. The pool consults these before creating
/// anything so that restarts land back on the worker already hosting the
/// step's container.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Records a created container. Fails with `Duplicate` if a live
    /// container already holds the identifier.
    async fn container_created(&self, record: ContainerRecord) -> StoreResult<()>;

    async fn find_container(
        &self,
        id: &ContainerIdentifier,
    ) -> StoreResult<Option<ContainerRecord>>;

    async fn container_destroyed(&self, id: &ContainerIdentifier) -> StoreResult<()>;

    /// Which worker already hosts a container for this build plan node,
    /// regardless of stage.
    async fn find_worker_for_build_container(
        &self,
        build_id: BuildId,
        plan_id: PlanId,
    ) -> StoreResult<Option<String>>;

    /// Which worker already hosts a container for this resource user.
    async fn find_worker_for_resource_container(&self, user: &str) -> StoreResult<Option<String>>;
}

/// Advisory locks keyed by string names, used to serialise placement and
/// scheduling decisions.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn acquire_write_lock(&self, names: Vec<String>) -> StoreResult<Lock>;
    async fn acquire_read_lock(&self, names: Vec<String>) -> StoreResult<Lock>;
}

enum LockGuard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// A held advisory lock. Released on drop; `release` is idempotent.
pub struct Lock {
    guards: Vec<LockGuard>,
}

impl Lock {
    pub(crate) fn read(guards: Vec<OwnedRwLockReadGuard<()>>) -> Self {
        Self {
            guards: guards.into_iter().map(LockGuard::Read).collect(),
        }
    }

    pub(crate) fn write(guards: Vec<OwnedRwLockWriteGuard<()>>) -> Self {
        Self {
            guards: guards.into_iter().map(LockGuard::Write).collect(),
        }
    }

    pub fn release(&mut self) {
        self.guards.clear();
    }
}

/// Sequence identifier used for compare-and-swap on configuration saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfigVersion(pub u64);

/// Pipeline configuration with optimistic concurrency.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(
        &self,
        team: TeamId,
        pipeline: &str,
    ) -> StoreResult<Option<(serde_json::Value, ConfigVersion, bool)>>;

    /// Saves a pipeline configuration. `expected` must match the stored
    /// version (or be `None` for a fresh pipeline) or the save fails
    /// with `ConfigComparisonFailed`. `paused` updates the paused flag
    /// when present.
    async fn save_config(
        &self,
        team: TeamId,
        pipeline: &str,
        config: serde_json::Value,
        expected: Option<ConfigVersion>,
        paused: Option<bool>,
    ) -> StoreResult<ConfigVersion>;
}

/// One-shot abort signal for a build.
#[derive(Clone)]
pub struct AbortNotifier {
    token: CancellationToken,
}

impl AbortNotifier {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Resolves when abort has been requested.
    pub async fn notified(&self) {
        self.token.cancelled().await
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The underlying token, for wiring into step cancellation.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
