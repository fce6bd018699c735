//! BackupJob reconciler
//!
//! Handles the business logic for BackupJob resources:
//! - Spec validation
//! - Observing owned Jobs and the pods of the current run
//! - Planning actions from observed state alone
//! - Applying the plan against the cluster store
//!
//! Every invocation starts from what the store shows now, so running it twice
//! in a row, or after a restart, reaches the same decision.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::{runtime::controller::Action, ResourceExt};
use tracing::{debug, info, warn};

use crate::adapters::{ClusterStore, CreateOutcome};
use crate::config::OperatorConfig;
use crate::crd::{BackupJob, BackupJobStatus, DestinationKind, Phase};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::guard::{self, Existing};
use crate::reconcilers::job_builder::{self, owned_jobs_selector, run_pods_selector};
use crate::reconcilers::ownership::{is_owned_by, TypeRegistry};
use crate::reconcilers::schedule::{self, Evaluation};
use crate::reconcilers::{retention, status};

/// Cluster state visible to one reconciliation
#[derive(Clone, Debug, Default)]
pub struct Observed {
    /// Jobs controlled by the BackupJob
    pub jobs: Vec<Job>,
    /// Pods of the current run
    pub pods: Vec<Pod>,
}

/// A write the reconciler wants performed
#[derive(Clone, Debug)]
pub enum PlannedAction {
    CreateJob(Box<Job>),
    DeleteJob(String),
    PatchStatus(Box<BackupJobStatus>),
}

/// When to look at the BackupJob again
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Only on a watch event for the BackupJob or one of its Jobs/Pods
    AwaitChange,
    /// On a timer, for the next schedule slot
    After(Duration),
}

impl From<Requeue> for Action {
    fn from(requeue: Requeue) -> Self {
        match requeue {
            Requeue::AwaitChange => Action::await_change(),
            Requeue::After(d) => Action::requeue(d),
        }
    }
}

/// Outcome of planning one reconciliation
#[derive(Clone, Debug)]
pub struct Plan {
    /// Deletions first, then creation, then the status write
    pub actions: Vec<PlannedAction>,
    pub requeue: Requeue,
    /// Terminal phase newly observed for a run
    pub completed: Option<Phase>,
}

impl Plan {
    pub fn created_job(&self) -> Option<&Job> {
        self.actions.iter().find_map(|a| match a {
            PlannedAction::CreateJob(job) => Some(job.as_ref()),
            _ => None,
        })
    }

    pub fn status(&self) -> Option<&BackupJobStatus> {
        self.actions.iter().find_map(|a| match a {
            PlannedAction::PatchStatus(status) => Some(status.as_ref()),
            _ => None,
        })
    }

    pub fn deleted_jobs(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                PlannedAction::DeleteJob(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Validate the BackupJob spec
pub fn validate(backup: &BackupJob) -> Result<()> {
    let spec = &backup.spec;

    if spec.target.kind.trim().is_empty() {
        return Err(Error::validation("Target kind must be specified"));
    }
    if spec.target.name.trim().is_empty() {
        return Err(Error::validation("Target name must be specified"));
    }

    spec.destination
        .type_
        .parse::<DestinationKind>()
        .map_err(Error::validation)?;
    if spec.destination.uri.trim().is_empty() {
        return Err(Error::validation("Destination uri must be specified"));
    }

    job_builder::derive_command(backup)?;

    if backup.is_recurring() {
        if let Some(expr) = &spec.schedule {
            schedule::parse_schedule(expr)?;
        }
    }

    if let Some(timeout) = spec.timeout_seconds {
        if timeout <= 0 {
            return Err(Error::validation(format!(
                "Invalid timeoutSeconds {}: must be greater than zero",
                timeout
            )));
        }
    }

    Ok(())
}

/// Read the Jobs owned by `backup` and the pods of its current run
pub async fn observe(backup: &BackupJob, store: &dyn ClusterStore) -> Result<Observed> {
    let namespace = backup
        .namespace()
        .ok_or(Error::MissingField("metadata.namespace"))?;

    let jobs: Vec<Job> = store
        .list_jobs(&namespace, &owned_jobs_selector(backup))
        .await?
        .into_iter()
        .filter(|job| is_owned_by(job, backup))
        .collect();

    let pods = match guard::current_job(&jobs) {
        Some(job) => {
            store
                .list_pods(&namespace, &run_pods_selector(&job.name_any()))
                .await?
        }
        None => Vec::new(),
    };

    Ok(Observed { jobs, pods })
}

/// Decide what to do for `backup` given the observed cluster state
pub fn plan(
    backup: &BackupJob,
    observed: &Observed,
    registry: &TypeRegistry,
    config: &OperatorConfig,
    now: DateTime<Utc>,
) -> Result<Plan> {
    let name = backup.name_any();
    let original = backup.status.clone().unwrap_or_default();
    let mut next = original.clone();
    next.observed_generation = backup.metadata.generation;

    // Fold the current run into status.
    let mut completed = None;
    match guard::current_job(&observed.jobs) {
        Some(job) => {
            let state = status::run_state(job, &observed.pods, now);
            if status::fold(&mut next, job, &state) && state.is_terminal() {
                completed = Some(state.phase());
            }
        }
        None => {
            if status::fold_vanished(&mut next, now) {
                warn!(name = %name, "Backup job vanished before completing");
                completed = Some(Phase::Failed);
            }
        }
    }

    let mut create = None;
    if let Some(active) = guard::active_job(&observed.jobs) {
        debug!(name = %name, job = %active.name_any(), "Run in progress, waiting");
    } else if backup.spec.suspend {
        debug!(name = %name, "BackupJob is suspended, not starting new runs");
    } else if let Err(e) = validate(backup) {
        warn!(name = %name, error = %e, "Validation failed");
        status::mark_invalid(&mut next, e.to_string());
    } else if let Evaluation::Due { slot, skipped } = schedule::evaluate(backup, &next, now)? {
        let job_name = job_builder::job_name(&name, slot);
        if skipped > 0 {
            info!(name = %name, skipped, "Skipping missed schedule slots, running the latest");
        }

        match guard::check(&observed.jobs, &job_name) {
            Existing::Absent => match build_run(backup, &job_name, slot, registry, config) {
                Ok(job) => {
                    info!(name = %name, job = %job_name, "Creating backup job");
                    status::mark_created(&mut next, &job_name, slot);
                    create = Some(job);
                }
                Err(e @ (Error::Validation(_) | Error::SchemaMismatch(_))) => {
                    warn!(name = %name, error = %e, "Cannot build backup job");
                    status::mark_invalid(&mut next, e.to_string());
                }
                Err(e) => return Err(e),
            },
            existing => {
                debug!(name = %name, job = %job_name, ?existing, "Run already triggered");
                if slot.is_some() && next.last_schedule_time < slot {
                    next.last_schedule_time = slot;
                }
            }
        }
    }

    let mut actions = Vec::new();
    let keep = next.last_job_name.as_deref();
    for expired in retention::expired_jobs(
        &observed.jobs,
        keep,
        backup.spec.successful_jobs_history_limit,
        backup.spec.failed_jobs_history_limit,
    ) {
        actions.push(PlannedAction::DeleteJob(expired));
    }
    if let Some(job) = create {
        actions.push(PlannedAction::CreateJob(Box::new(job)));
    }
    if next != original {
        actions.push(PlannedAction::PatchStatus(Box::new(next)));
    }

    let requeue = if backup.spec.suspend {
        Requeue::AwaitChange
    } else {
        schedule::requeue_after(backup, now, config.max_requeue)
            .map(Requeue::After)
            .unwrap_or(Requeue::AwaitChange)
    };

    Ok(Plan {
        actions,
        requeue,
        completed,
    })
}

/// Build the Job for a run and bind it to its BackupJob
fn build_run(
    backup: &BackupJob,
    job_name: &str,
    slot: Option<DateTime<Utc>>,
    registry: &TypeRegistry,
    config: &OperatorConfig,
) -> Result<Job> {
    let mut job = job_builder::build_job(backup, job_name, slot, &config.runner_image)?;
    registry.bind_owner(backup, &mut job)?;
    Ok(job)
}

/// Perform the planned writes in order
pub async fn apply(backup: &BackupJob, plan: &Plan, store: &dyn ClusterStore) -> Result<()> {
    let name = backup.name_any();
    let namespace = backup
        .namespace()
        .ok_or(Error::MissingField("metadata.namespace"))?;

    for action in &plan.actions {
        match action {
            PlannedAction::DeleteJob(job_name) => {
                store.delete_job(&namespace, job_name).await?;
                info!(name = %name, job = %job_name, "Deleted expired backup job");
                metrics::JOBS_DELETED.with_label_values(&[&namespace]).inc();
            }
            PlannedAction::CreateJob(job) => {
                let job_name = job.name_any();
                match store.create_job(&namespace, job).await? {
                    CreateOutcome::Created => {
                        info!(name = %name, job = %job_name, "Created backup job");
                        metrics::EXECUTIONS_CREATED
                            .with_label_values(&[&namespace, &name])
                            .inc();
                    }
                    CreateOutcome::AlreadyExists => {
                        let existing = store.get_job(&namespace, &job_name).await?;
                        if existing.is_some_and(|j| !is_owned_by(&j, backup)) {
                            return Err(Error::owner_reference(format!(
                                "job {} already exists and is not controlled by this BackupJob",
                                job_name
                            )));
                        }
                        info!(name = %name, job = %job_name, "Backup job already exists, nothing to create");
                        metrics::CREATE_RACES.with_label_values(&[&namespace]).inc();
                    }
                }
            }
            PlannedAction::PatchStatus(status) => {
                store.patch_status(backup, status).await?;
                debug!(name = %name, phase = ?status.phase, "Updated status");
            }
        }
    }

    if let Some(outcome) = plan.completed {
        let outcome = match outcome {
            Phase::Succeeded => "success",
            _ => "failure",
        };
        metrics::EXECUTION_OUTCOMES
            .with_label_values(&[outcome, &namespace, &name])
            .inc();
    }

    Ok(())
}

/// Observe, plan and apply for one BackupJob
pub async fn reconcile(
    backup: &BackupJob,
    store: &dyn ClusterStore,
    registry: &TypeRegistry,
    config: &OperatorConfig,
    now: DateTime<Utc>,
) -> Result<Requeue> {
    let observed = observe(backup, store).await?;
    let plan = plan(backup, &observed, registry, config, now)?;
    apply(backup, &plan, store).await?;
    Ok(plan.requeue)
}
