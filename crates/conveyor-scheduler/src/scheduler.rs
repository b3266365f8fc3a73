//! The build scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use conveyor_core::{Build, BuildInput, BuildStatus, Error, JobConfig, Result, TeamId};
use conveyor_db::{BuildStore, LockStore};

/// The engine a started build is handed off to. Walks the build's plan,
/// runs its steps, and returns the build's terminal status; errors map
/// to `Errored` and interruption to `Aborted` on the build record.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    async fn run(&self, build: Build, inputs: Vec<BuildInput>) -> Result<BuildStatus>;
}

/// Why a build is being scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCause {
    Manual,
    ResourceChange,
}

/// Schedules builds for one pipeline's jobs.
pub struct BuildScheduler {
    pipeline: String,
    team: Option<TeamId>,
    builds: Arc<dyn BuildStore>,
    locks: Arc<dyn LockStore>,
    engine: Arc<dyn BuildEngine>,
}

impl BuildScheduler {
    pub fn new(
        pipeline: impl Into<String>,
        team: Option<TeamId>,
        builds: Arc<dyn BuildStore>,
        locks: Arc<dyn LockStore>,
        engine: Arc<dyn BuildEngine>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            team,
            builds,
            locks,
            engine,
        }
    }

    /// Queues a build of the job right now, as an operator asks. Jobs
    /// can opt out; serial jobs refuse while another build is in
    /// flight, which the API surfaces as a conflict.
    pub async fn trigger_immediately(&self, job: &JobConfig) -> Result<Build> {
        if job.disable_manual_trigger {
            return Err(Error::ManualTriggerDisabled {
                job: job.name.clone(),
            });
        }

        let mut lock = self
            .locks
            .acquire_write_lock(vec![self.scheduling_lock(job)])
            .await
            .map_err(Error::from)?;

        if job.serial {
            let (_, next) = self
                .builds
                .get_job_finished_and_next_build(&job.name)
                .await
                .map_err(Error::from)?;
            if let Some(next) = next {
                lock.release();
                return Err(Error::Conflict(format!(
                    "job '{}' already has build {} in flight",
                    job.name, next.id
                )));
            }
        }

        let inputs = self
            .builds
            .get_latest_input_versions(job)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| {
                Error::NotFound(format!("satisfiable input versions for job '{}'", job.name))
            })?;

        let build = self.create_build(job, inputs).await?;
        lock.release();

        info!(job = %job.name, build = %build.id, "manually triggered build");
        self.try_dispatch(job).await?;
        Ok(build)
    }

    /// Queues a build because resource versions changed. No build is
    /// queued when the resolved input set matches the previous build's;
    /// the job has already run with these versions.
    pub async fn schedule_resource_change(&self, job: &JobConfig) -> Result<Option<Build>> {
        let mut lock = self
            .locks
            .acquire_write_lock(vec![self.scheduling_lock(job)])
            .await
            .map_err(Error::from)?;

        let Some(inputs) = self
            .builds
            .get_latest_input_versions(job)
            .await
            .map_err(Error::from)?
        else {
            debug!(job = %job.name, "inputs not yet satisfiable");
            lock.release();
            return Ok(None);
        };

        if let Some(previous) = self
            .builds
            .latest_build_inputs(&job.name)
            .await
            .map_err(Error::from)?
        {
            if same_input_set(&previous, &inputs) {
                debug!(job = %job.name, "input set unchanged; nothing to schedule");
                lock.release();
                return Ok(None);
            }
        }

        let build = self.create_build(job, inputs).await?;
        lock.release();

        info!(job = %job.name, build = %build.id, "scheduled build for new inputs");
        self.try_dispatch(job).await?;
        Ok(Some(build))
    }

    /// Starts the job's next pending build if its serial rules allow,
    /// handing it to the engine on a separate task. Serial jobs observe
    /// strict FIFO by build id and at most one non-terminal build runs
    /// at a time.
    pub async fn try_dispatch(&self, job: &JobConfig) -> Result<Option<Build>> {
        let mut lock = self
            .locks
            .acquire_write_lock(vec![self.scheduling_lock(job)])
            .await
            .map_err(Error::from)?;

        let Some(pending) = self
            .builds
            .get_next_pending_build(&job.name)
            .await
            .map_err(Error::from)?
        else {
            lock.release();
            return Ok(None);
        };

        if job.serial {
            let (_, next) = self
                .builds
                .get_job_finished_and_next_build(&job.name)
                .await
                .map_err(Error::from)?;
            if let Some(next) = next {
                if next.id != pending.id {
                    debug!(job = %job.name, running = %next.id, "serial job is busy");
                    lock.release();
                    return Ok(None);
                }
            }
        }

        let started = self
            .builds
            .start_build(pending.id, "exec", "{}")
            .await
            .map_err(Error::from)?;
        if !started {
            debug!(build = %pending.id, "build was claimed or aborted elsewhere");
            lock.release();
            return Ok(None);
        }

        let inputs = self
            .builds
            .build_inputs(pending.id)
            .await
            .map_err(Error::from)?;
        lock.release();

        let mut build = pending;
        build.status = BuildStatus::Started;
        self.hand_off(build.clone(), inputs);
        Ok(Some(build))
    }

    fn hand_off(&self, build: Build, inputs: Vec<BuildInput>) {
        let engine = Arc::clone(&self.engine);
        let builds = Arc::clone(&self.builds);
        let build_id = build.id;

        tokio::spawn(async move {
            let status = match engine.run(build, inputs).await {
                Ok(status) => status,
                Err(Error::Interrupted) => BuildStatus::Aborted,
                Err(err) => {
                    warn!(build = %build_id, error = %err, "build errored");
                    BuildStatus::Errored
                }
            };

            if let Err(err) = builds.finish_build(build_id, status).await {
                warn!(build = %build_id, error = %err, "failed to record build status");
            }
        });
    }

    async fn create_build(&self, job: &JobConfig, inputs: Vec<BuildInput>) -> Result<Build> {
        let build = self
            .builds
            .create_job_build(&self.pipeline, job, self.team)
            .await
            .map_err(Error::from)?;

        for input in inputs {
            self.builds
                .save_build_input(build.id, input)
                .await
                .map_err(Error::from)?;
        }

        Ok(build)
    }

    fn scheduling_lock(&self, job: &JobConfig) -> String {
        format!("scheduling:{}:{}", self.pipeline, job.name)
    }
}

/// Input sets match when every name resolves to the same version
/// identity; first-occurrence flags don't matter.
fn same_input_set(previous: &[BuildInput], next: &[BuildInput]) -> bool {
    if previous.len() != next.len() {
        return false;
    }

    next.iter().all(|input| {
        previous
            .iter()
            .any(|p| p.name == input.name && p.version.identity() == input.version.identity())
    })
}
