//! Container identity, stages, and reserved properties.
//!
//! The engine communicates with orphaned containers across restarts
//! through exactly two container properties: the in-container process id
//! and, once the process has terminated, its exit status. Both are
//! decimal strings. Anything richer must be reconstructible from the
//! plan plus these two keys.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::{BuildId, PlanId, TeamId};

/// Property holding the in-container process id, set before the step
/// signals readiness.
pub const TASK_PROCESS_PROPERTY: &str = "conveyor:task-process";

/// Property holding the process exit status in decimal. Immutable once
/// set.
pub const EXIT_STATUS_PROPERTY: &str = "conveyor:exit-status";

/// TTL applied to a step's container when its process exited 0.
pub const SUCCESSFUL_STEP_TTL: Duration = Duration::from_secs(5 * 60);

/// TTL applied to a step's container on any non-zero exit, leaving it
/// around long enough to intervene.
pub const FAILED_STEP_TTL: Duration = Duration::from_secs(60 * 60);

/// TTL on freshly created volumes until the container adopts them.
pub const VOLUME_BOOTSTRAP_TTL: Duration = Duration::from_secs(5 * 60);

/// Disambiguates containers belonging to the same owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStage {
    Check,
    Get,
    Put,
    Run,
}

impl std::fmt::Display for ContainerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStage::Check => "check",
            ContainerStage::Get => "get",
            ContainerStage::Put => "put",
            ContainerStage::Run => "run",
        };
        f.write_str(s)
    }
}

/// Why a container exists: on behalf of a build plan node, or on behalf
/// of a resource (its user string uniquely names the purpose, e.g. a
/// pipeline-scoped resource check).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerOwner {
    Build { build_id: BuildId, plan_id: PlanId },
    Resource { user: String },
}

/// Identity of a container. At most one container exists per identifier
/// at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerIdentifier {
    pub owner: ContainerOwner,
    pub stage: ContainerStage,
}

impl ContainerIdentifier {
    pub fn for_build(build_id: BuildId, plan_id: PlanId, stage: ContainerStage) -> Self {
        Self {
            owner: ContainerOwner::Build { build_id, plan_id },
            stage,
        }
    }

    pub fn for_resource(user: impl Into<String>, stage: ContainerStage) -> Self {
        Self {
            owner: ContainerOwner::Resource { user: user.into() },
            stage,
        }
    }

    /// Same owner, different stage. Check and get sessions for a step's
    /// image share the step's owner.
    pub fn with_stage(&self, stage: ContainerStage) -> Self {
        Self {
            owner: self.owner.clone(),
            stage,
        }
    }
}

/// Descriptive metadata attached to a container at creation, surfaced to
/// operators when listing containers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub team: Option<TeamId>,
    pub pipeline: Option<String>,
    pub job: Option<String>,
    pub build_name: Option<String>,
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment: Vec<String>,
}
