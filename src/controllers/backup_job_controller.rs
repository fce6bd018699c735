//! BackupJob controller
//!
//! Watches BackupJob resources, the Jobs they own and the pods of those Jobs,
//! and triggers reconciliation of the owning BackupJob.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
    Api, ResourceExt,
};
use tracing::{error, info, instrument};

use crate::controllers::{object_key, Context};
use crate::crd::BackupJob;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::backup_job as backup_job_reconciler;
use crate::reconcilers::job_builder::{ANNOTATION_BACKUP_JOB, LABEL_BACKUP_JOB};

fn api_for<K>(ctx: &Context) -> Api<K>
where
    K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    match &ctx.config.watch_namespace {
        Some(ns) => Api::namespaced(ctx.client.clone(), ns),
        None => Api::all(ctx.client.clone()),
    }
}

/// Map a backup pod to the BackupJob named in its metadata
fn pod_owner(pod: Pod) -> Option<ObjectRef<BackupJob>> {
    let namespace = pod.namespace()?;
    let name = pod
        .annotations()
        .get(ANNOTATION_BACKUP_JOB)
        .or_else(|| pod.labels().get(LABEL_BACKUP_JOB))?
        .clone();
    Some(ObjectRef::new(&name).within(&namespace))
}

/// Run the BackupJob controller
pub async fn run(context: Arc<Context>) {
    let backups: Api<BackupJob> = api_for(&context);
    let jobs: Api<Job> = api_for(&context);
    let pods: Api<Pod> = api_for(&context);

    // Verify CRD is installed
    if let Err(e) = backups.list(&ListParams::default().limit(1)).await {
        error!("BackupJob CRD not installed: {}", e);
        return;
    }

    info!("Starting BackupJob controller");

    let labelled = WatcherConfig::default().labels(LABEL_BACKUP_JOB);

    Controller::new(backups, WatcherConfig::default())
        .owns(jobs, labelled.clone())
        .watches(pods, labelled, pod_owner)
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled BackupJob"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS
                        .with_label_values(&["BackupJob"])
                        .inc();
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<BackupJob>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["BackupJob"])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&["BackupJob"])
        .inc();

    if obj.metadata.deletion_timestamp.is_some() {
        // Owned Jobs are garbage collected through their owner references.
        ctx.retries.reset(&object_key(&obj));
        return Ok(Action::await_change());
    }

    let requeue = backup_job_reconciler::reconcile(
        &obj,
        ctx.store.as_ref(),
        &ctx.registry,
        &ctx.config,
        Utc::now(),
    )
    .await?;

    ctx.retries.reset(&object_key(&obj));
    Ok(requeue.into())
}

/// Error policy for the controller
fn error_policy(obj: Arc<BackupJob>, error: &Error, ctx: Arc<Context>) -> Action {
    let failures = ctx.retries.record_failure(&object_key(&obj));
    let delay = ctx.config.backoff(failures);

    error!(
        name = %obj.name_any(),
        error = %error,
        conflict = error.is_conflict(),
        failures,
        retry_in = ?delay,
        "Reconciliation failed, scheduling retry"
    );

    Action::requeue(delay)
}
