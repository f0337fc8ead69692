//! Access to the cluster's resource store.
//!
//! Reconcilers and the admission worker only talk to the cluster through
//! [`ResourceStore`], so they can be exercised against an in-memory store.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::crd::{PipelineJob, PipelineJobStatus, PipelineRun, RepoConfig, RepoConfigStatus};
use crate::error::{Error, Result};

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_config(&self, namespace: &str, name: &str) -> Result<Option<RepoConfig>>;

    /// A missing run is not an error; jobs have none until admitted.
    async fn get_run(&self, namespace: &str, name: &str) -> Result<Option<PipelineRun>>;

    async fn create_run(&self, run: &PipelineRun) -> Result<()>;

    async fn create_job(&self, job: &PipelineJob) -> Result<PipelineJob>;

    /// Replace the job's finalizer list.
    async fn patch_job_finalizers(&self, job: &PipelineJob, finalizers: &[String]) -> Result<()>;

    async fn patch_job_status(&self, job: &PipelineJob, status: &PipelineJobStatus) -> Result<()>;

    async fn patch_config_finalizers(
        &self,
        config: &RepoConfig,
        finalizers: &[String],
    ) -> Result<()>;

    async fn patch_config_status(&self, config: &RepoConfig, status: &RepoConfigStatus)
    -> Result<()>;

    /// One key of a secret, or `None` when the secret or key is absent.
    async fn read_secret(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>>;
}

pub(crate) fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))
}

/// [`ResourceStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_config(&self, namespace: &str, name: &str) -> Result<Option<RepoConfig>> {
        Ok(self.api::<RepoConfig>(namespace).get_opt(name).await?)
    }

    async fn get_run(&self, namespace: &str, name: &str) -> Result<Option<PipelineRun>> {
        Ok(self.api::<PipelineRun>(namespace).get_opt(name).await?)
    }

    async fn create_run(&self, run: &PipelineRun) -> Result<()> {
        let namespace = namespace_of(run)?;
        self.api::<PipelineRun>(&namespace)
            .create(&PostParams::default(), run)
            .await?;
        Ok(())
    }

    async fn create_job(&self, job: &PipelineJob) -> Result<PipelineJob> {
        let namespace = namespace_of(job)?;
        Ok(self
            .api::<PipelineJob>(&namespace)
            .create(&PostParams::default(), job)
            .await?)
    }

    async fn patch_job_finalizers(&self, job: &PipelineJob, finalizers: &[String]) -> Result<()> {
        let namespace = namespace_of(job)?;
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.api::<PipelineJob>(&namespace)
            .patch(&job.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_job_status(&self, job: &PipelineJob, status: &PipelineJobStatus) -> Result<()> {
        let namespace = namespace_of(job)?;
        let patch = json!({ "status": status });
        self.api::<PipelineJob>(&namespace)
            .patch_status(&job.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_config_finalizers(
        &self,
        config: &RepoConfig,
        finalizers: &[String],
    ) -> Result<()> {
        let namespace = namespace_of(config)?;
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.api::<RepoConfig>(&namespace)
            .patch(&config.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_config_status(
        &self,
        config: &RepoConfig,
        status: &RepoConfigStatus,
    ) -> Result<()> {
        let namespace = namespace_of(config)?;
        let patch = json!({ "status": status });
        self.api::<RepoConfig>(&namespace)
            .patch_status(&config.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn read_secret(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>> {
        let Some(secret) = self.api::<Secret>(namespace).get_opt(name).await? else {
            debug!(secret = %name, namespace = %namespace, "secret not found");
            return Ok(None);
        };
        let Some(value) = secret.data.as_ref().and_then(|data| data.get(key)) else {
            return Ok(None);
        };
        let text = String::from_utf8(value.0.clone())
            .map_err(|e| Error::Store(format!("secret {}/{} key {}: {}", namespace, name, key, e)))?;
        Ok(Some(text.trim().to_string()))
    }
}
