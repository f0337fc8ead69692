//! Resources shared by the controller tests.

use prflow_core::GitProvider;

use crate::crd::{
    ConfigRef, GitSpec, JobRefs, PipelineJob, PipelineJobSpec, RepoConfig, RepoConfigSpec,
    SecretKeyRef,
};
use crate::store::memory::MemoryStore;

pub const NAMESPACE: &str = "test-ns";
pub const CONFIG: &str = "test-ic";
pub const REPOSITORY: &str = "org/repo";

/// Fake-provider config whose token lives in the `git-token` secret.
pub fn repo_config() -> RepoConfig {
    let mut config = RepoConfig::new(
        CONFIG,
        RepoConfigSpec {
            git: GitSpec {
                provider: GitProvider::Fake,
                repository: REPOSITORY.to_string(),
                api_url: None,
                token: Some(SecretKeyRef {
                    name: "git-token".to_string(),
                    key: "token".to_string(),
                }),
            },
            webhook_secret: None,
            pipeline_ref: "build".to_string(),
            service_account: None,
        },
    );
    config.metadata.namespace = Some(NAMESPACE.to_string());
    config.metadata.uid = Some("config-uid".to_string());
    config
}

/// Store holding [`repo_config`] and its token.
pub fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.add_config(repo_config());
    store.add_secret(NAMESPACE, "git-token", "token", "s3cr3t");
    store
}

pub fn job(name: &str) -> PipelineJob {
    let mut job = PipelineJob::new(
        name,
        PipelineJobSpec {
            config_ref: ConfigRef {
                name: CONFIG.to_string(),
            },
            refs: JobRefs {
                repository: REPOSITORY.to_string(),
                r#ref: "refs/heads/main".to_string(),
                sha: "abc123".to_string(),
                pull_request: None,
            },
        },
    );
    job.metadata.namespace = Some(NAMESPACE.to_string());
    job.metadata.uid = Some(format!("{}-uid", name));
    job
}
