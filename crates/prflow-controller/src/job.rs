//! PipelineJob reconciler.
//!
//! Each pass runs the finalizer protocol first. A job that survives it has
//! its status recomputed from its pipeline run and persisted in one patch,
//! and the admission scheduler is told about the result on every way out of
//! the pass.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use prflow_config::Settings;
use prflow_core::git::{CommitStatus, CommitStatusState};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{JobState, PipelineJob, PipelineRun, RepoConfig};
use crate::error::{Error, Result};
use crate::git::GitClients;
use crate::pipeline::PipelineManager;
use crate::scheduler::Scheduler;
use crate::store::{ResourceStore, namespace_of};

pub const JOB_FINALIZER: &str = "prflow.dev/job-finalizer";

/// Context prefix of the commit statuses jobs report.
pub const STATUS_CONTEXT_PREFIX: &str = "prflow";

pub struct JobContext {
    pub store: Arc<dyn ResourceStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub pipelines: PipelineManager,
    pub git: GitClients,
    pub settings: Settings,
}

/// Notifies the scheduler with the job's latest state when dropped.
struct ScopedNotify<'a> {
    job: PipelineJob,
    scheduler: &'a dyn Scheduler,
}

impl<'a> ScopedNotify<'a> {
    fn new(job: PipelineJob, scheduler: &'a dyn Scheduler) -> Self {
        Self { job, scheduler }
    }
}

impl Deref for ScopedNotify<'_> {
    type Target = PipelineJob;

    fn deref(&self) -> &PipelineJob {
        &self.job
    }
}

impl DerefMut for ScopedNotify<'_> {
    fn deref_mut(&mut self) -> &mut PipelineJob {
        &mut self.job
    }
}

impl Drop for ScopedNotify<'_> {
    fn drop(&mut self) {
        self.scheduler.notify(&self.job);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FinalizerFlow {
    Continue,
    Exit,
}

#[instrument(skip(job, ctx), fields(job = %job.name_any()))]
pub async fn reconcile_job(job: Arc<PipelineJob>, ctx: Arc<JobContext>) -> Result<Action> {
    match handle_finalizer(&job, &ctx).await {
        Ok(FinalizerFlow::Continue) => {}
        Ok(FinalizerFlow::Exit) => return Ok(Action::await_change()),
        Err(e) => {
            let mut failed = (*job).clone();
            patch_failed(&mut failed, &ctx, &e).await;
            return Ok(Action::await_change());
        }
    }

    if job.is_completed() {
        debug!("job already completed");
        return Ok(Action::await_change());
    }

    let mut job = ScopedNotify::new((*job).clone(), ctx.scheduler.as_ref());
    let previous = job.state();

    let config = match reflect(&mut job, &ctx).await {
        Ok(config) => config,
        Err(e) => {
            patch_failed(&mut job, &ctx, &e).await;
            return Ok(Action::await_change());
        }
    };

    let status = job.status.clone().unwrap_or_default();
    ctx.store.patch_job_status(&job, &status).await?;

    if status.state != previous {
        info!(from = %previous, to = %status.state, "job state changed");
        report_commit_status(&job, &config, &ctx).await;
    }

    Ok(Action::await_change())
}

pub fn error_policy(job: Arc<PipelineJob>, err: &Error, ctx: Arc<JobContext>) -> Action {
    warn!(job = %job.name_any(), error = %err, "job reconciliation failed");
    Action::requeue(Duration::from_secs(ctx.settings.requeue_seconds))
}

/// Add the finalizer to new jobs, and on deletion release the job's slot and
/// remove it again.
async fn handle_finalizer(job: &PipelineJob, ctx: &JobContext) -> Result<FinalizerFlow> {
    let finalizers = job.finalizers();
    let position = finalizers.iter().position(|f| f == JOB_FINALIZER);
    let deleting = job.metadata.deletion_timestamp.is_some();

    match (deleting, position) {
        (false, None) => {
            let mut updated = finalizers.to_vec();
            updated.push(JOB_FINALIZER.to_string());
            ctx.store.patch_job_finalizers(job, &updated).await?;
            debug!("added finalizer");
            Ok(FinalizerFlow::Exit)
        }
        (true, Some(index)) => {
            ctx.scheduler.notify(job);
            let mut updated = finalizers.to_vec();
            updated.remove(index);
            ctx.store.patch_job_finalizers(job, &updated).await?;
            debug!("removed finalizer");
            Ok(FinalizerFlow::Exit)
        }
        (true, None) => Ok(FinalizerFlow::Exit),
        (false, Some(_)) => Ok(FinalizerFlow::Continue),
    }
}

async fn reflect(job: &mut PipelineJob, ctx: &JobContext) -> Result<RepoConfig> {
    let namespace = namespace_of(job)?;
    let config_name = job.spec.config_ref.name.clone();
    let config = ctx
        .store
        .get_config(&namespace, &config_name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("repo config {}", config_name)))?;

    let run = ctx
        .store
        .get_run(&namespace, &ctx.pipelines.run_name(job))
        .await?;

    ctx.pipelines.reflect_status(run.as_ref(), job, &config)?;
    Ok(config)
}

/// Mark the job failed with `err` as the message. The completion time is left
/// unset. A failing patch is only logged.
async fn patch_failed(job: &mut PipelineJob, ctx: &JobContext, err: &Error) {
    warn!(job = %job.name_any(), error = %err, "marking job failed");
    let status = job.status.get_or_insert_with(Default::default);
    status.state = JobState::Failed;
    status.message = err.to_string();
    let status = status.clone();
    if let Err(e) = ctx.store.patch_job_status(job, &status).await {
        error!(job = %job.name_any(), error = %e, "failed to patch job status");
    }
}

fn commit_state(state: JobState) -> CommitStatusState {
    match state {
        JobState::Pending | JobState::Running => CommitStatusState::Pending,
        JobState::Completed => CommitStatusState::Success,
        JobState::Failed => CommitStatusState::Failure,
        JobState::Canceled => CommitStatusState::Error,
    }
}

async fn report_commit_status(job: &PipelineJob, config: &RepoConfig, ctx: &JobContext) {
    let sha = &job.spec.refs.sha;
    if sha.is_empty() {
        return;
    }

    let git = match ctx.git.for_config(config, ctx.store.as_ref()).await {
        Ok(Some(git)) => git,
        Ok(None) => {
            debug!("no git token, skipping commit status");
            return;
        }
        Err(e) => {
            warn!(error = %e, "cannot build git client for commit status");
            return;
        }
    };

    let state = job.state();
    let message = job
        .status
        .as_ref()
        .map(|s| s.message.clone())
        .unwrap_or_default();
    let status = CommitStatus {
        context: format!("{}/{}", STATUS_CONTEXT_PREFIX, job.name_any()),
        state: commit_state(state),
        description: if message.is_empty() {
            state.to_string()
        } else {
            message
        },
        target_url: None,
    };

    if let Err(e) = git.set_commit_status(sha, status).await {
        warn!(sha = %sha, error = %e, "failed to set commit status");
    }
}

/// Watch PipelineJobs and the runs they own until shutdown.
pub async fn run_job_controller(client: Client, ctx: Arc<JobContext>) {
    let (jobs, runs): (Api<PipelineJob>, Api<PipelineRun>) = match &ctx.settings.namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client, ns),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    info!("starting PipelineJob controller");
    Controller::new(jobs, watcher::Config::default().any_semantic())
        .owns(runs, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_job, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((job, _)) => debug!(job = %job.name, "reconciled"),
                Err(e) => warn!(error = %e, "PipelineJob reconcile error"),
            }
        })
        .await;
    info!("PipelineJob controller shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PipelineJobStatus;
    use crate::fixtures::{NAMESPACE, REPOSITORY, job, seeded_store};
    use crate::store::memory::MemoryStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use prflow_git::FakeStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingScheduler {
        notified: Mutex<Vec<(String, JobState, bool)>>,
    }

    impl RecordingScheduler {
        fn calls(&self) -> Vec<(String, JobState, bool)> {
            self.notified.lock().unwrap().clone()
        }
    }

    impl Scheduler for RecordingScheduler {
        fn notify(&self, job: &PipelineJob) {
            self.notified.lock().unwrap().push((
                job.name_any(),
                job.state(),
                job.metadata.deletion_timestamp.is_some(),
            ));
        }
    }

    fn context(
        store: Arc<MemoryStore>,
        scheduler: Arc<RecordingScheduler>,
        git: FakeStore,
    ) -> Arc<JobContext> {
        Arc::new(JobContext {
            store,
            scheduler,
            pipelines: PipelineManager::new(),
            git: GitClients::with_fake_store(git),
            settings: Settings::default(),
        })
    }

    fn finalized(name: &str) -> PipelineJob {
        let mut job = job(name);
        job.metadata.finalizers = Some(vec![JOB_FINALIZER.to_string()]);
        job
    }

    #[tokio::test]
    async fn test_first_pass_adds_finalizer_only() {
        let store = Arc::new(seeded_store());
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = context(store.clone(), scheduler.clone(), FakeStore::new());

        reconcile_job(Arc::new(job("build-1")), ctx).await.unwrap();

        let stored = store.job(NAMESPACE, "build-1").unwrap();
        assert_eq!(stored.finalizers(), [JOB_FINALIZER.to_string()]);
        assert!(stored.status.is_none());
        assert!(scheduler.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deletion_removes_finalizer_and_notifies_once() {
        let store = Arc::new(seeded_store());
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = context(store.clone(), scheduler.clone(), FakeStore::new());

        let mut job = job("build-1");
        job.metadata.finalizers = Some(vec![
            "other/before".to_string(),
            JOB_FINALIZER.to_string(),
            "other/after".to_string(),
        ]);
        job.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        reconcile_job(Arc::new(job), ctx).await.unwrap();

        let stored = store.job(NAMESPACE, "build-1").unwrap();
        assert_eq!(stored.finalizers(), ["other/before", "other/after"]);
        assert!(stored.status.is_none());
        assert_eq!(
            scheduler.calls(),
            vec![("build-1".to_string(), JobState::Pending, true)]
        );
    }

    #[tokio::test]
    async fn test_deleted_without_finalizer_is_ignored() {
        let store = Arc::new(seeded_store());
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = context(store.clone(), scheduler.clone(), FakeStore::new());

        let mut job = job("build-1");
        job.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        reconcile_job(Arc::new(job), ctx).await.unwrap();

        assert!(store.job(NAMESPACE, "build-1").is_none());
        assert!(scheduler.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pending_job_is_reflected_and_notified() {
        let store = Arc::new(seeded_store());
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = context(store.clone(), scheduler.clone(), FakeStore::new());

        reconcile_job(Arc::new(finalized("build-1")), ctx)
            .await
            .unwrap();

        let status = store.job(NAMESPACE, "build-1").unwrap().status.unwrap();
        assert_eq!(status.state, JobState::Pending);
        assert!(status.message.contains("build"));
        assert_eq!(
            scheduler.calls(),
            vec![("build-1".to_string(), JobState::Pending, false)]
        );
    }

    #[tokio::test]
    async fn test_completed_job_is_skipped() {
        let store = Arc::new(seeded_store());
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = context(store.clone(), scheduler.clone(), FakeStore::new());

        let mut job = finalized("build-1");
        job.status = Some(PipelineJobStatus {
            state: JobState::Completed,
            completion_time: Some(chrono::Utc::now()),
            ..Default::default()
        });
        reconcile_job(Arc::new(job), ctx).await.unwrap();

        assert!(store.job(NAMESPACE, "build-1").is_none());
        assert!(scheduler.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_config_marks_failed_without_error() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = context(store.clone(), scheduler.clone(), FakeStore::new());

        let action = reconcile_job(Arc::new(finalized("build-1")), ctx).await;
        assert!(action.is_ok());

        let status = store.job(NAMESPACE, "build-1").unwrap().status.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.message, "repo config test-ic not found");
        assert!(status.completion_time.is_none());
        assert_eq!(
            scheduler.calls(),
            vec![("build-1".to_string(), JobState::Failed, false)]
        );
    }

    #[tokio::test]
    async fn test_store_error_marks_failed_with_message() {
        let store = Arc::new(seeded_store());
        store.fail_config_lookups();
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = context(store.clone(), scheduler.clone(), FakeStore::new());

        reconcile_job(Arc::new(finalized("build-1")), ctx)
            .await
            .unwrap();

        let status = store.job(NAMESPACE, "build-1").unwrap().status.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.message, "store error: connection refused");
        assert_eq!(scheduler.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_status_persist_failure_propagates() {
        let store = Arc::new(seeded_store());
        store.fail_status_patches();
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = context(store.clone(), scheduler.clone(), FakeStore::new());

        let err = reconcile_job(Arc::new(finalized("build-1")), ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Store(_)));
        assert_eq!(scheduler.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_run_reports_commit_status() {
        let store = Arc::new(seeded_store());
        let scheduler = Arc::new(RecordingScheduler::default());
        let git = FakeStore::new();
        git.add_repository(REPOSITORY);
        let ctx = context(store.clone(), scheduler.clone(), git.clone());

        let job = finalized("build-1");
        let mut run = PipelineManager::new()
            .generate_run(&job, &crate::fixtures::repo_config())
            .unwrap();
        run.status = Some(crate::crd::PipelineRunStatus {
            conditions: vec![crate::crd::RunCondition {
                type_: "Succeeded".to_string(),
                status: "True".to_string(),
                reason: "Succeeded".to_string(),
                message: "All Tasks have completed executing".to_string(),
            }],
            ..Default::default()
        });
        store.add_run(run);

        reconcile_job(Arc::new(job), ctx).await.unwrap();

        let status = store.job(NAMESPACE, "build-1").unwrap().status.unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert!(status.completion_time.is_some());

        let statuses = git.repository(REPOSITORY).unwrap().commit_statuses["abc123"].clone();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].context, "prflow/build-1");
        assert_eq!(statuses[0].state, CommitStatusState::Success);
        assert_eq!(
            scheduler.calls(),
            vec![("build-1".to_string(), JobState::Completed, false)]
        );
    }

    #[tokio::test]
    async fn test_commit_status_failure_does_not_fail_pass() {
        let store = Arc::new(seeded_store());
        let scheduler = Arc::new(RecordingScheduler::default());
        // the fake git store has no such repository
        let ctx = context(store.clone(), scheduler, FakeStore::new());

        let mut job = finalized("build-1");
        job.status = Some(PipelineJobStatus {
            state: JobState::Running,
            ..Default::default()
        });
        reconcile_job(Arc::new(job), ctx).await.unwrap();

        let status = store.job(NAMESPACE, "build-1").unwrap().status.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.message, "pipeline run was deleted");
    }
}
