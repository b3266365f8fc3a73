//! Build lifecycle types and job configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{BuildId, TeamId};
use crate::version::ResourceVersion;

/// Status of a build. Transitions form a DAG rooted at `Pending`;
/// terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded
                | BuildStatus::Failed
                | BuildStatus::Errored
                | BuildStatus::Aborted
        )
    }
}

/// One execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub job: String,
    pub pipeline: String,
    pub team: Option<TeamId>,
    pub status: BuildStatus,
    /// Engine-specific resume state, opaque to the store.
    pub engine_metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Build {
    pub fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// A resolved input to a build. Fixed at build creation and immutable
/// thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInput {
    pub name: String,
    pub version: ResourceVersion,
    /// True iff this version has never been an input to this job before.
    pub first_occurrence: bool,
}

/// A resource version emitted during a build's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub version: ResourceVersion,
}

/// Static configuration of a job, as handed down by the pipeline layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub serial: bool,
    #[serde(default)]
    pub disable_manual_trigger: bool,
    #[serde(default)]
    pub inputs: Vec<JobInput>,
}

/// A declared input of a job: which resource feeds it and which upstream
/// jobs a candidate version must have passed through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    pub name: String,
    pub resource: String,
    #[serde(default)]
    pub passed: Vec<String>,
    #[serde(default)]
    pub trigger: bool,
}
