//! In-memory store implementation.
//!
//! Backs the test-suite and single-node deployments. All four store
//! traits are implemented over one mutex-guarded state map; advisory
//! locks are real `tokio` rwlocks so writer exclusivity holds across
//! tasks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use conveyor_core::version::version_digest;
use conveyor_core::{
    Build, BuildId, BuildInput, BuildStatus, ContainerIdentifier, ContainerOwner, JobConfig,
    PlanId, ResourceConfig, ResourceVersion, TeamId, Version,
};

use crate::error::{StoreError, StoreResult};
use crate::store::{
    AbortNotifier, BuildStore, ConfigStore, ConfigVersion, ContainerRecord, ContainerStore, Lock,
    LockStore,
};

#[derive(Default)]
struct State {
    builds: HashMap<BuildId, Build>,
    builds_by_job: HashMap<String, Vec<BuildId>>,
    inputs: HashMap<BuildId, Vec<BuildInput>>,
    outputs: HashMap<BuildId, Vec<ResourceVersion>>,
    versions: HashMap<String, Vec<ResourceVersion>>,
    /// `(job, resource, digest)` triples that have ever been a build
    /// input, for first-occurrence detection.
    input_history: HashSet<(String, String, String)>,
    /// Version identities that flowed through a successful build of each
    /// job, for `passed` constraint resolution.
    passed_index: HashMap<String, HashSet<(String, String)>>,
    abort_tokens: HashMap<BuildId, CancellationToken>,
    containers: HashMap<ContainerIdentifier, ContainerRecord>,
    configs: HashMap<(TeamId, String), (serde_json::Value, u64, bool)>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_handles(&self, names: &[String]) -> Vec<Arc<RwLock<()>>> {
        let mut map = self.locks.lock();
        names
            .iter()
            .map(|name| Arc::clone(map.entry(name.clone()).or_default()))
            .collect()
    }
}

#[async_trait]
impl BuildStore for InMemoryStore {
    async fn get_build(&self, id: BuildId) -> StoreResult<Option<Build>> {
        Ok(self.state.lock().builds.get(&id).cloned())
    }

    async fn create_job_build(
        &self,
        pipeline: &str,
        job: &JobConfig,
        team: Option<TeamId>,
    ) -> StoreResult<Build> {
        let build = Build {
            id: BuildId::new(),
            job: job.name.clone(),
            pipeline: pipeline.to_string(),
            team,
            status: BuildStatus::Pending,
            engine_metadata: None,
            created_at: chrono::Utc::now(),
        };

        let mut state = self.state.lock();
        state.builds.insert(build.id, build.clone());
        state
            .builds_by_job
            .entry(job.name.clone())
            .or_default()
            .push(build.id);
        state
            .abort_tokens
            .entry(build.id)
            .or_insert_with(CancellationToken::new);
        Ok(build)
    }

    async fn start_build(&self, id: BuildId, engine: &str, metadata: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let aborted = state
            .abort_tokens
            .get(&id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false);
        let build = state
            .builds
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("build {}", id)))?;

        if build.status != BuildStatus::Pending || aborted {
            return Ok(false);
        }

        build.status = BuildStatus::Started;
        build.engine_metadata = Some(format!("{}:{}", engine, metadata));
        Ok(true)
    }

    async fn finish_build(&self, id: BuildId, status: BuildStatus) -> StoreResult<()> {
        let mut state = self.state.lock();
        let build = state
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("build {}", id)))?;

        if build.status.is_terminal() {
            return Ok(());
        }

        if status == BuildStatus::Succeeded {
            let mut through: HashSet<(String, String)> = HashSet::new();
            for input in state.inputs.get(&id).into_iter().flatten() {
                through.insert(input.version.identity());
            }
            for output in state.outputs.get(&id).into_iter().flatten() {
                through.insert(output.identity());
            }
            state
                .passed_index
                .entry(build.job.clone())
                .or_default()
                .extend(through);
        }

        if let Some(build) = state.builds.get_mut(&id) {
            build.status = status;
        }
        Ok(())
    }

    async fn abort_build(&self, id: BuildId) -> StoreResult<()> {
        let mut state = self.state.lock();
        let build = state
            .builds
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("build {}", id)))?;

        if build.status == BuildStatus::Pending {
            build.status = BuildStatus::Aborted;
        }

        state
            .abort_tokens
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .cancel();
        Ok(())
    }

    async fn abort_notifier(&self, id: BuildId) -> StoreResult<AbortNotifier> {
        let mut state = self.state.lock();
        if !state.builds.contains_key(&id) {
            return Err(StoreError::NotFound(format!("build {}", id)));
        }
        let token = state
            .abort_tokens
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone();
        Ok(AbortNotifier::new(token))
    }

    async fn save_build_input(&self, id: BuildId, input: BuildInput) -> StoreResult<()> {
        let mut state = self.state.lock();
        let job = state
            .builds
            .get(&id)
            .map(|b| b.job.clone())
            .ok_or_else(|| StoreError::NotFound(format!("build {}", id)))?;

        let (resource, digest) = input.version.identity();
        state.input_history.insert((job, resource, digest));
        state.inputs.entry(id).or_default().push(input);
        Ok(())
    }

    async fn save_build_output(&self, id: BuildId, version: ResourceVersion) -> StoreResult<()> {
        let mut state = self.state.lock();
        if !state.builds.contains_key(&id) {
            return Err(StoreError::NotFound(format!("build {}", id)));
        }
        state.outputs.entry(id).or_default().push(version);
        Ok(())
    }

    async fn build_inputs(&self, id: BuildId) -> StoreResult<Vec<BuildInput>> {
        Ok(self.state.lock().inputs.get(&id).cloned().unwrap_or_default())
    }

    async fn save_resource_versions(
        &self,
        config: &ResourceConfig,
        versions: Vec<Version>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let saved = state.versions.entry(config.name.clone()).or_default();
        for version in versions {
            let digest = version_digest(&version);
            if saved.iter().any(|v| version_digest(&v.version) == digest) {
                continue;
            }
            saved.push(ResourceVersion {
                resource: config.name.clone(),
                resource_type: config.resource_type.clone(),
                version,
                metadata: vec![],
                enabled: true,
            });
        }
        Ok(())
    }

    async fn set_resource_version_enabled(
        &self,
        resource: &str,
        version: &Version,
        enabled: bool,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let digest = version_digest(version);
        let saved = state
            .versions
            .get_mut(resource)
            .and_then(|vs| vs.iter_mut().find(|v| version_digest(&v.version) == digest))
            .ok_or_else(|| StoreError::NotFound(format!("version of {}", resource)))?;
        saved.enabled = enabled;
        Ok(())
    }

    async fn get_latest_input_versions(
        &self,
        job: &JobConfig,
    ) -> StoreResult<Option<Vec<BuildInput>>> {
        let state = self.state.lock();
        let mut resolved = Vec::with_capacity(job.inputs.len());

        for input in &job.inputs {
            let candidate = state
                .versions
                .get(&input.resource)
                .into_iter()
                .flatten()
                .rev()
                .filter(|v| v.enabled)
                .find(|v| {
                    input.passed.iter().all(|upstream| {
                        state
                            .passed_index
                            .get(upstream)
                            .map(|through| through.contains(&v.identity()))
                            .unwrap_or(false)
                    })
                });

            let version = match candidate {
                Some(v) => v.clone(),
                None => return Ok(None),
            };

            let (resource, digest) = version.identity();
            let first_occurrence =
                !state
                    .input_history
                    .contains(&(job.name.clone(), resource, digest));

            resolved.push(BuildInput {
                name: input.name.clone(),
                version,
                first_occurrence,
            });
        }

        Ok(Some(resolved))
    }

    async fn get_next_pending_build(&self, job: &str) -> StoreResult<Option<Build>> {
        let state = self.state.lock();
        Ok(state
            .builds_by_job
            .get(job)
            .into_iter()
            .flatten()
            .filter_map(|id| state.builds.get(id))
            .find(|b| b.status == BuildStatus::Pending)
            .cloned())
    }

    async fn get_job_finished_and_next_build(
        &self,
        job: &str,
    ) -> StoreResult<(Option<Build>, Option<Build>)> {
        let state = self.state.lock();
        let builds: Vec<&Build> = state
            .builds_by_job
            .get(job)
            .into_iter()
            .flatten()
            .filter_map(|id| state.builds.get(id))
            .collect();

        let finished = builds
            .iter()
            .rev()
            .find(|b| b.status.is_terminal())
            .map(|b| (*b).clone());
        let next = builds.iter().find(|b| b.is_running()).map(|b| (*b).clone());
        Ok((finished, next))
    }

    async fn latest_build_inputs(&self, job: &str) -> StoreResult<Option<Vec<BuildInput>>> {
        let state = self.state.lock();
        let last = state.builds_by_job.get(job).and_then(|ids| ids.last());
        Ok(last.map(|id| state.inputs.get(id).cloned().unwrap_or_default()))
    }
}

#[async_trait]
impl ContainerStore for InMemoryStore {
    async fn container_created(&self, record: ContainerRecord) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.containers.contains_key(&record.identifier) {
            return Err(StoreError::Duplicate(format!(
                "container for {:?}",
                record.identifier
            )));
        }
        state.containers.insert(record.identifier.clone(), record);
        Ok(())
    }

    async fn find_container(
        &self,
        id: &ContainerIdentifier,
    ) -> StoreResult<Option<ContainerRecord>> {
        Ok(self.state.lock().containers.get(id).cloned())
    }

    async fn container_destroyed(&self, id: &ContainerIdentifier) -> StoreResult<()> {
        self.state.lock().containers.remove(id);
        Ok(())
    }

    async fn find_worker_for_build_container(
        &self,
        build_id: BuildId,
        plan_id: PlanId,
    ) -> StoreResult<Option<String>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .find(|(id, _)| {
                matches!(
                    id.owner,
                    ContainerOwner::Build {
                        build_id: b,
                        plan_id: p,
                    } if b == build_id && p == plan_id
                )
            })
            .map(|(_, record)| record.worker_addr.clone()))
    }

    async fn find_worker_for_resource_container(&self, user: &str) -> StoreResult<Option<String>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .find(|(id, _)| matches!(&id.owner, ContainerOwner::Resource { user: u } if u == user))
            .map(|(_, record)| record.worker_addr.clone()))
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    async fn acquire_write_lock(&self, mut names: Vec<String>) -> StoreResult<Lock> {
        names.sort();
        names.dedup();
        let handles = self.lock_handles(&names);
        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.write_owned().await);
        }
        Ok(Lock::write(guards))
    }

    async fn acquire_read_lock(&self, mut names: Vec<String>) -> StoreResult<Lock> {
        names.sort();
        names.dedup();
        let handles = self.lock_handles(&names);
        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.read_owned().await);
        }
        Ok(Lock::read(guards))
    }
}

#[async_trait]
impl ConfigStore for InMemoryStore {
    async fn get_config(
        &self,
        team: TeamId,
        pipeline: &str,
    ) -> StoreResult<Option<(serde_json::Value, ConfigVersion, bool)>> {
        let state = self.state.lock();
        Ok(state
            .configs
            .get(&(team, pipeline.to_string()))
            .map(|(config, version, paused)| (config.clone(), ConfigVersion(*version), *paused)))
    }

    async fn save_config(
        &self,
        team: TeamId,
        pipeline: &str,
        config: serde_json::Value,
        expected: Option<ConfigVersion>,
        paused: Option<bool>,
    ) -> StoreResult<ConfigVersion> {
        let mut state = self.state.lock();
        let key = (team, pipeline.to_string());

        match (state.configs.get(&key), expected) {
            (Some((_, version, was_paused)), Some(ConfigVersion(expected))) => {
                if *version != expected {
                    return Err(StoreError::ConfigComparisonFailed);
                }
                let next = version + 1;
                let paused = paused.unwrap_or(*was_paused);
                state.configs.insert(key, (config, next, paused));
                Ok(ConfigVersion(next))
            }
            (Some(_), None) | (None, Some(_)) => Err(StoreError::ConfigComparisonFailed),
            (None, None) => {
                let paused = paused.unwrap_or(false);
                state.configs.insert(key, (config, 1, paused));
                Ok(ConfigVersion(1))
            }
        }
    }
}
