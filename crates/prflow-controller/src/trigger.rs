//! Creating PipelineJobs from inbound webhooks.

use kube::ResourceExt;
use prflow_core::git::PullRequestAction;
use prflow_core::{EventType, Webhook};
use tracing::info;

use crate::crd::{ConfigRef, JobRefs, PipelineJob, PipelineJobSpec, RepoConfig};
use crate::error::Result;
use crate::store::{ResourceStore, namespace_of};

/// Label naming the config a job was triggered for.
pub const CONFIG_LABEL: &str = "prflow.dev/config";

/// Sha pushed when a branch is deleted.
const NULL_SHA: &str = "0000000000000000000000000000000000000000";

/// What a webhook asks to build, if anything. Pushes build the pushed ref;
/// pull requests build their head when opened, reopened or updated.
pub fn job_refs(webhook: &Webhook, repository: &str) -> Option<JobRefs> {
    match webhook.event_type {
        EventType::Push => {
            let push = webhook.push.as_ref()?;
            if push.sha.is_empty() || push.sha == NULL_SHA {
                return None;
            }
            Some(JobRefs {
                repository: repository.to_string(),
                r#ref: push.r#ref.clone(),
                sha: push.sha.clone(),
                pull_request: None,
            })
        }
        EventType::PullRequestChanged => {
            let pr = webhook.pull_request.as_ref()?;
            let builds = matches!(
                pr.action,
                PullRequestAction::Open | PullRequestAction::Reopen | PullRequestAction::Synchronize
            );
            if !builds || !pr.is_open() {
                return None;
            }
            Some(JobRefs {
                repository: repository.to_string(),
                r#ref: pr.head.r#ref.clone(),
                sha: pr.head.sha.clone(),
                pull_request: Some(pr.id),
            })
        }
        _ => None,
    }
}

/// Create the job `webhook` asks for. Returns `None` for events that build
/// nothing.
pub async fn trigger_job(
    store: &dyn ResourceStore,
    config: &RepoConfig,
    webhook: &Webhook,
) -> Result<Option<PipelineJob>> {
    let Some(refs) = job_refs(webhook, &config.spec.git.repository) else {
        return Ok(None);
    };

    let config_name = config.name_any();
    let mut job = PipelineJob::new(
        "",
        PipelineJobSpec {
            config_ref: ConfigRef {
                name: config_name.clone(),
            },
            refs,
        },
    );
    job.metadata.name = None;
    job.metadata.generate_name = Some(format!("{}-", config_name));
    job.metadata.namespace = Some(namespace_of(config)?);
    job.labels_mut()
        .insert(CONFIG_LABEL.to_string(), config_name);

    let created = store.create_job(&job).await?;
    info!(
        job = %created.name_any(),
        sha = %created.spec.refs.sha,
        "created pipeline job"
    );
    Ok(Some(created))
}
