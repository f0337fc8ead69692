//! Admission scheduler.
//!
//! Reconcilers hand every job they touch to [`Scheduler::notify`]. The
//! [`QueueScheduler`] forwards it to an [`AdmissionQueue`] running on its own
//! task, which keeps pending jobs in arrival order and creates pipeline runs
//! while fewer than `max-concurrent-jobs` slots are taken.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::crd::{JobState, PipelineJob};
use crate::error::{Error, Result};
use crate::pipeline::PipelineManager;
use crate::store::{ResourceStore, namespace_of};

pub trait Scheduler: Send + Sync {
    /// Re-evaluate admission for `job`. Safe for deleted and terminal jobs,
    /// and never blocks on admission work.
    fn notify(&self, job: &PipelineJob);
}

/// [`Scheduler`] feeding an [`AdmissionQueue`] worker over a channel.
pub struct QueueScheduler {
    tx: mpsc::UnboundedSender<PipelineJob>,
}

impl QueueScheduler {
    pub fn spawn(
        store: Arc<dyn ResourceStore>,
        pipelines: PipelineManager,
        max_concurrent: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = AdmissionQueue::new(store, pipelines, max_concurrent);
        let handle = tokio::spawn(queue.run(rx));
        (Self { tx }, handle)
    }
}

impl Scheduler for QueueScheduler {
    fn notify(&self, job: &PipelineJob) {
        if self.tx.send(job.clone()).is_err() {
            error!(job = %job.name_any(), "admission worker has stopped");
        }
    }
}

fn job_key(job: &PipelineJob) -> String {
    format!("{}/{}", job.namespace().unwrap_or_default(), job.name_any())
}

fn is_terminal(job: &PipelineJob) -> bool {
    job.is_completed()
        || matches!(
            job.state(),
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
}

pub struct AdmissionQueue {
    store: Arc<dyn ResourceStore>,
    pipelines: PipelineManager,
    max_concurrent: usize,
    pending: VecDeque<PipelineJob>,
    /// Jobs holding a slot. Release is a set removal, so repeated
    /// notifications for a deleted job free its slot once.
    running: HashSet<String>,
}

impl AdmissionQueue {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        pipelines: PipelineManager,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            pipelines,
            max_concurrent,
            pending: VecDeque::new(),
            running: HashSet::new(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PipelineJob>) {
        info!(max_concurrent = self.max_concurrent, "admission worker started");
        while let Some(job) = rx.recv().await {
            self.handle(job).await;
        }
        info!("admission worker stopped");
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub async fn handle(&mut self, job: PipelineJob) {
        let key = job_key(&job);

        if job.metadata.deletion_timestamp.is_some() || is_terminal(&job) {
            self.pending.retain(|p| job_key(p) != key);
            if self.running.remove(&key) {
                debug!(job = %key, "released slot");
            }
        } else if job.state() == JobState::Running {
            self.pending.retain(|p| job_key(p) != key);
            self.running.insert(key);
        } else if !self.running.contains(&key) {
            match self.pending.iter_mut().find(|p| job_key(p) == key) {
                Some(queued) => *queued = job,
                None => {
                    debug!(job = %key, "queued");
                    self.pending.push_back(job);
                }
            }
        }

        self.admit().await;
    }

    async fn admit(&mut self) {
        while self.running.len() < self.max_concurrent {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            let key = job_key(&job);
            match self.start(&job).await {
                Ok(()) => {
                    info!(job = %key, "admitted");
                    self.running.insert(key);
                }
                Err(e) => {
                    warn!(job = %key, error = %e, "failed to admit job");
                    self.fail(&job, &e).await;
                }
            }
        }
    }

    async fn start(&self, job: &PipelineJob) -> Result<()> {
        let namespace = namespace_of(job)?;
        let config_name = &job.spec.config_ref.name;
        let config = self
            .store
            .get_config(&namespace, config_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("repo config {}", config_name)))?;

        // A run left over from an earlier admission still counts.
        if self
            .store
            .get_run(&namespace, &self.pipelines.run_name(job))
            .await?
            .is_some()
        {
            return Ok(());
        }

        let run = self.pipelines.generate_run(job, &config)?;
        self.store.create_run(&run).await
    }

    async fn fail(&self, job: &PipelineJob, err: &Error) {
        let mut status = job.status.clone().unwrap_or_default();
        status.state = JobState::Failed;
        status.message = err.to_string();
        if let Err(e) = self.store.patch_job_status(job, &status).await {
            error!(job = %job.name_any(), error = %e, "failed to mark job failed");
        }
    }
}
