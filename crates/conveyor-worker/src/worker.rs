//! The worker model: one entry per remote container host.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use conveyor_core::{Result, TeamId};

use crate::runtime::ContainerRuntime;
use crate::volume::{Volume, VolumeManager, VolumeSpec};

/// What a step requires of a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpec {
    pub platform: Option<String>,
    pub tags: Vec<String>,
    pub resource_type: Option<String>,
    pub team_id: Option<TeamId>,
}

impl WorkerSpec {
    /// Human-readable rendering for compatibility errors.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(platform) = &self.platform {
            parts.push(format!("platform '{}'", platform));
        }
        if !self.tags.is_empty() {
            parts.push(format!("tags [{}]", self.tags.join(", ")));
        }
        if let Some(resource_type) = &self.resource_type {
            parts.push(format!("resource type '{}'", resource_type));
        }
        if let Some(team) = &self.team_id {
            parts.push(format!("team {}", team));
        }
        if parts.is_empty() {
            parts.push("anything".to_string());
        }
        parts.join(", ")
    }
}

/// Registration payload a worker advertises to the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub addr: String,
    pub platform: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub active_containers: usize,
    pub max_containers: usize,
    pub team_id: Option<TeamId>,
}

/// A live worker: advertised capabilities plus handles to its container
/// runtime and volume manager.
#[derive(Clone)]
pub struct Worker {
    info: WorkerInfo,
    runtime: Arc<dyn ContainerRuntime>,
    volumes: Arc<dyn VolumeManager>,
}

impl Worker {
    pub fn new(
        info: WorkerInfo,
        runtime: Arc<dyn ContainerRuntime>,
        volumes: Arc<dyn VolumeManager>,
    ) -> Self {
        Self {
            info,
            runtime,
            volumes,
        }
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn addr(&self) -> &str {
        &self.info.addr
    }

    pub fn is_team_owned(&self) -> bool {
        self.info.team_id.is_some()
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        Arc::clone(&self.runtime)
    }

    pub fn volume_manager(&self) -> Arc<dyn VolumeManager> {
        Arc::clone(&self.volumes)
    }

    /// Whether this worker can host a step with the given requirements:
    /// platform matches (or the spec names none), every requested tag is
    /// offered, the requested resource type is advertised, the worker
    /// has container headroom, and team ownership lines up.
    pub fn satisfies(&self, spec: &WorkerSpec) -> bool {
        if let Some(platform) = &spec.platform {
            if *platform != self.info.platform {
                return false;
            }
        }

        if !spec.tags.iter().all(|tag| self.info.tags.contains(tag)) {
            return false;
        }

        if let Some(resource_type) = &spec.resource_type {
            if !self.info.resource_types.contains(resource_type) {
                return false;
            }
        }

        if self.info.active_containers >= self.info.max_containers {
            return false;
        }

        if let Some(owner) = self.info.team_id {
            if spec.team_id != Some(owner) {
                return false;
            }
        }

        true
    }

    /// Human-readable rendering for compatibility errors.
    pub fn describe(&self) -> String {
        format!(
            "{} (platform '{}', tags [{}], {}/{} containers)",
            self.info.addr,
            self.info.platform,
            self.info.tags.join(", "),
            self.info.active_containers,
            self.info.max_containers,
        )
    }

    pub async fn create_volume(&self, spec: VolumeSpec) -> Result<Volume> {
        let handle = self.volumes.create(spec).await?;
        Ok(Volume::new(handle, &self.info.addr, Arc::clone(&self.volumes)))
    }

    pub async fn lookup_volume(&self, handle: &str) -> Result<Option<Volume>> {
        if self.volumes.lookup(handle).await? {
            Ok(Some(Volume::new(
                handle,
                &self.info.addr,
                Arc::clone(&self.volumes),
            )))
        } else {
            Ok(None)
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("info", &self.info).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_runtime, fake_volumes};

    fn worker(info: WorkerInfo) -> Worker {
        Worker::new(info, fake_runtime(), fake_volumes())
    }

    fn linux_worker(addr: &str) -> WorkerInfo {
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

    #[test]
    fn platform_must_match_when_requested() {
        let w = worker(linux_worker("w1"));

        assert!(w.satisfies(&WorkerSpec {
            platform: Some("linux".to_string()),
            ..Default::default()
        }));
        assert!(w.satisfies(&WorkerSpec::default()));
        assert!(!w.satisfies(&WorkerSpec {
            platform: Some("darwin".to_string()),
            ..Default::default()
        }));
    }

    #[test]
    fn all_requested_tags_must_be_offered() {
        let mut info = linux_worker("w1");
        info.tags = vec!["gpu".to_string(), "fast".to_string()];
        let w = worker(info);

        assert!(w.satisfies(&WorkerSpec {
            tags: vec!["gpu".to_string()],
            ..Default::default()
        }));
        assert!(!w.satisfies(&WorkerSpec {
            tags: vec!["gpu".to_string(), "windows".to_string()],
            ..Default::default()
        }));
    }

    #[test]
    fn resource_type_must_be_advertised() {
        let w = worker(linux_worker("w1"));

        assert!(w.satisfies(&WorkerSpec {
            resource_type: Some("git".to_string()),
            ..Default::default()
        }));
        assert!(!w.satisfies(&WorkerSpec {
            resource_type: Some("s3".to_string()),
            ..Default::default()
        }));
    }

    #[test]
    fn saturated_worker_does_not_satisfy() {
        let mut info = linux_worker("w1");
        info.active_containers = 10;
        let w = worker(info);

        assert!(!w.satisfies(&WorkerSpec::default()));
    }

    #[test]
    fn team_owned_worker_requires_matching_team() {
        let team = TeamId::new();
        let mut info = linux_worker("w1");
        info.team_id = Some(team);
        let w = worker(info);

        assert!(w.satisfies(&WorkerSpec {
            team_id: Some(team),
            ..Default::default()
        }));
        assert!(!w.satisfies(&WorkerSpec::default()));
        assert!(!w.satisfies(&WorkerSpec {
            team_id: Some(TeamId::new()),
            ..Default::default()
        }));
    }
}
