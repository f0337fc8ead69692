//! Pipeline runs: generating them for admitted jobs and reflecting their
//! progress back onto the job status.

use std::collections::BTreeMap;

use chrono::Utc;
use kube::{Resource, ResourceExt};

use crate::crd::{
    JobState, Param, PipelineJob, PipelineRef, PipelineRun, PipelineRunSpec, RepoConfig,
};
use crate::error::{Error, Result};

/// Label carrying the owning job's name on every generated run.
pub const JOB_LABEL: &str = "prflow.dev/job";

pub const PARAM_GIT_SHA: &str = "git-sha";
pub const PARAM_GIT_REF: &str = "git-ref";
pub const PARAM_PR_NUMBER: &str = "pr-number";

/// Reasons Tekton reports for a cancelled run.
const CANCELLED_REASONS: &[&str] = &["PipelineRunCancelled", "Cancelled"];

#[derive(Debug, Clone, Default)]
pub struct PipelineManager;

impl PipelineManager {
    pub fn new() -> Self {
        Self
    }

    /// Runs are named after their job.
    pub fn run_name(&self, job: &PipelineJob) -> String {
        job.name_any()
    }

    /// Build the run that executes `job`, owned by it so it goes away with
    /// the job.
    pub fn generate_run(&self, job: &PipelineJob, config: &RepoConfig) -> Result<PipelineRun> {
        let owner = job
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
        let refs = &job.spec.refs;

        let mut params = vec![
            Param::new(PARAM_GIT_SHA, &refs.sha),
            Param::new(PARAM_GIT_REF, &refs.r#ref),
        ];
        if let Some(pr) = refs.pull_request {
            params.push(Param::new(PARAM_PR_NUMBER, pr.to_string()));
        }

        let mut run = PipelineRun::new(
            &self.run_name(job),
            PipelineRunSpec {
                pipeline_ref: PipelineRef {
                    name: config.spec.pipeline_ref.clone(),
                },
                params,
                service_account_name: config.spec.service_account.clone(),
                status: None,
            },
        );
        run.metadata.namespace = job.namespace();
        run.metadata.owner_references = Some(vec![owner]);
        run.metadata.labels = Some(BTreeMap::from([(JOB_LABEL.to_string(), job.name_any())]));
        Ok(run)
    }

    /// Compute the job status from its run. `run` is `None` until the job is
    /// admitted. Writes only to `job`; persisting is left to the caller.
    pub fn reflect_status(
        &self,
        run: Option<&PipelineRun>,
        job: &mut PipelineJob,
        config: &RepoConfig,
    ) -> Result<()> {
        if let Some(run) = run {
            let owned = job.uid().is_some_and(|uid| {
                run.owner_references()
                    .iter()
                    .any(|owner| owner.uid == uid)
            });
            if !owned {
                return Err(Error::Conflict(format!(
                    "pipeline run {} is not owned by job {}",
                    run.name_any(),
                    job.name_any()
                )));
            }
        }

        let status = job.status.get_or_insert_with(Default::default);
        let now = Utc::now();

        let Some(run) = run else {
            match status.state {
                JobState::Running => {
                    status.state = JobState::Failed;
                    status.message = "pipeline run was deleted".to_string();
                    status.completion_time = Some(now);
                }
                JobState::Pending => {
                    status.message = format!(
                        "waiting for a free slot to run pipeline {}",
                        config.spec.pipeline_ref
                    );
                }
                _ => {}
            }
            return Ok(());
        };

        let run_status = run.status.clone().unwrap_or_default();
        if status.start_time.is_none() {
            status.start_time = Some(run_status.start_time.unwrap_or(now));
        }

        match run_status.succeeded() {
            Some(cond) if cond.status == "True" => {
                status.state = JobState::Completed;
                status.message = if cond.message.is_empty() {
                    "pipeline run succeeded".to_string()
                } else {
                    cond.message.clone()
                };
                status.completion_time = Some(run_status.completion_time.unwrap_or(now));
            }
            Some(cond) if cond.status == "False" => {
                status.state = if CANCELLED_REASONS.contains(&cond.reason.as_str()) {
                    JobState::Canceled
                } else {
                    JobState::Failed
                };
                status.message = cond.message.clone();
                status.completion_time = Some(run_status.completion_time.unwrap_or(now));
            }
            Some(cond) => {
                status.state = JobState::Running;
                status.message = cond.message.clone();
            }
            None => {
                status.state = JobState::Running;
                status.message = "pipeline run started".to_string();
            }
        }

        Ok(())
    }
}
