//! Access to the cluster objects the reconciler reads and writes

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::FIELD_MANAGER;
use crate::crd::{BackupJob, BackupJobStatus};
use crate::error::{Error, Result};

/// Status keys written as null when unset, so a merge patch clears them
const STATUS_KEYS: &[&str] = &[
    "phase",
    "lastRunTime",
    "message",
    "lastJobName",
    "lastExitCode",
    "lastScheduleTime",
    "observedGeneration",
];

/// Result of creating a Job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// An object with the same name already existed
    AlreadyExists,
}

/// Typed read/write access to BackupJobs, Jobs and Pods
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// List Jobs in `namespace` matching a label selector
    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>>;

    /// List Pods in `namespace` matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Fetch a Job by name
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Create a Job; a name collision is reported, not raised
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<CreateOutcome>;

    /// Delete a Job and its pods; a missing Job is not an error
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    /// Write the status of `backup`, failing with a conflict if the object
    /// changed since it was read
    async fn patch_status(&self, backup: &BackupJob, status: &BackupJobStatus) -> Result<()>;
}

/// Build the merge patch for a status write
///
/// Carrying `metadata.resourceVersion` makes the API server reject the write
/// with 409 when the stored object is newer than the one observed.
pub fn status_patch(status: &BackupJobStatus, resource_version: Option<&str>) -> Result<Value> {
    let mut body = serde_json::to_value(status)?;
    if let Value::Object(map) = &mut body {
        for key in STATUS_KEYS {
            map.entry(key.to_string()).or_insert(Value::Null);
        }
    }

    let mut patch = json!({ "status": body });
    if let Some(rv) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    Ok(patch)
}

/// [`ClusterStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let jobs = api.list(&ListParams::default().labels(selector)).await?;
        Ok(jobs.items)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<CreateOutcome> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match api.create(&params, job).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() {
                    debug!(job = %job.name_any(), namespace, "Job already exists");
                    Ok(CreateOutcome::AlreadyExists)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn patch_status(&self, backup: &BackupJob, status: &BackupJobStatus) -> Result<()> {
        let namespace = backup
            .namespace()
            .ok_or(Error::MissingField("metadata.namespace"))?;
        let api: Api<BackupJob> = Api::namespaced(self.client.clone(), &namespace);
        let patch = status_patch(status, backup.metadata.resource_version.as_deref())?;
        api.patch_status(
            &backup.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(patch),
        )
        .await?;
        Ok(())
    }
}
