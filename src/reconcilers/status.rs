//! Folds the lifecycle of an execution Job into its BackupJob's status
//!
//! Folding never moves the phase of a run backwards, so re-delivered or
//! reordered watch events cannot undo an observed completion.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerStateTerminated, Pod};
use kube::ResourceExt;

use crate::crd::{BackupJobStatus, Phase};
use crate::reconcilers::job_builder::CONTAINER_NAME;

/// Exit code reported when a run ended without one (killed, evicted, deleted)
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// Observed state of one run
#[derive(Clone, Debug, PartialEq)]
pub enum RunState {
    Pending,
    Running,
    Succeeded {
        finished_at: DateTime<Utc>,
    },
    Failed {
        exit_code: i32,
        message: String,
        finished_at: DateTime<Utc>,
    },
}

impl RunState {
    pub fn phase(&self) -> Phase {
        match self {
            RunState::Pending => Phase::Pending,
            RunState::Running => Phase::Running,
            RunState::Succeeded { .. } => Phase::Succeeded,
            RunState::Failed { .. } => Phase::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }
}

fn has_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == "True"))
}

/// Terminal outcome recorded on the Job itself, `None` while it is active
pub fn job_outcome(job: &Job) -> Option<Phase> {
    let status = job.status.as_ref();
    if has_condition(job, "Complete") || status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        Some(Phase::Succeeded)
    } else if has_condition(job, "Failed") || status.and_then(|s| s.failed).unwrap_or(0) > 0 {
        Some(Phase::Failed)
    } else {
        None
    }
}

pub fn is_active(job: &Job) -> bool {
    job_outcome(job).is_none()
}

fn terminated_state(pod: &Pod) -> Option<&ContainerStateTerminated> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == CONTAINER_NAME)
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref())
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

fn finish_time(job: &Job, terminated: Option<&ContainerStateTerminated>) -> Option<DateTime<Utc>> {
    let status = job.status.as_ref();
    status
        .and_then(|s| s.completion_time.as_ref())
        .or_else(|| {
            status
                .and_then(|s| s.conditions.as_ref())
                .and_then(|conds| {
                    conds
                        .iter()
                        .find(|c| c.type_ == "Failed" && c.status == "True")
                })
                .and_then(|c| c.last_transition_time.as_ref())
        })
        .or_else(|| terminated.and_then(|t| t.finished_at.as_ref()))
        .map(|t| t.0)
}

fn failure_message(job: &Job, pod: Option<&Pod>, terminated: Option<&ContainerStateTerminated>) -> String {
    if let Some(t) = terminated {
        let reason = t.reason.as_deref().unwrap_or("Error");
        return format!("backup container exited with code {} ({})", t.exit_code, reason);
    }

    let pod_reason = pod
        .and_then(|p| p.status.as_ref())
        .and_then(|s| s.reason.as_deref().map(|r| (r, s.message.as_deref())));
    if let Some((reason, message)) = pod_reason {
        return match message {
            Some(m) => format!("backup pod {}: {}", reason.to_lowercase(), m),
            None => format!("backup pod {}", reason.to_lowercase()),
        };
    }

    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Failed" && c.status == "True"))
        .map(|c| {
            format!(
                "{}: {}",
                c.reason.as_deref().unwrap_or("Failed"),
                c.message.as_deref().unwrap_or("backup job failed")
            )
        })
        .unwrap_or_else(|| "backup job failed".to_string())
}

/// Derive the state of a run from its Job and the Job's pods
pub fn run_state(job: &Job, pods: &[Pod], now: DateTime<Utc>) -> RunState {
    let pod = pods
        .iter()
        .max_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0));
    let terminated = pod.and_then(terminated_state);
    let finished_at = || finish_time(job, terminated).unwrap_or(now);

    let failed = || RunState::Failed {
        exit_code: terminated.map(|t| t.exit_code).unwrap_or(EXIT_CODE_UNKNOWN),
        message: failure_message(job, pod, terminated),
        finished_at: finished_at(),
    };

    match job_outcome(job) {
        Some(Phase::Succeeded) => RunState::Succeeded {
            finished_at: finished_at(),
        },
        Some(_) => failed(),
        None => match pod.and_then(pod_phase) {
            Some("Succeeded") => RunState::Succeeded {
                finished_at: finished_at(),
            },
            Some("Failed") => failed(),
            Some("Running") => RunState::Running,
            _ if job.status.as_ref().and_then(|s| s.ready).unwrap_or(0) > 0 => RunState::Running,
            _ => RunState::Pending,
        },
    }
}

/// Fold the state of `job` into `status`; returns whether anything changed
///
/// The phase of one run only moves forward. A Job other than the one named by
/// `lastJobName` is a newer run and replaces it.
pub fn fold(status: &mut BackupJobStatus, job: &Job, state: &RunState) -> bool {
    let job_name = job.name_any();
    let phase = state.phase();

    if status.last_job_name.as_deref() == Some(job_name.as_str()) {
        if let Some(current) = status.phase {
            if current.rank() >= phase.rank() {
                return false;
            }
        }
    }

    let before = status.clone();
    status.phase = Some(phase);
    status.last_job_name = Some(job_name.clone());
    match state {
        RunState::Pending => {
            status.message = Some(format!("Backup job {} is pending", job_name));
        }
        RunState::Running => {
            status.message = Some(format!("Backup job {} is running", job_name));
        }
        RunState::Succeeded { finished_at } => {
            status.last_exit_code = Some(0);
            status.last_run_time = Some(*finished_at);
            status.message = None;
        }
        RunState::Failed {
            exit_code,
            message,
            finished_at,
        } => {
            status.last_exit_code = Some(*exit_code);
            status.last_run_time = Some(*finished_at);
            status.message = Some(message.clone());
        }
    }
    *status != before
}

/// Fail an in-flight run whose Job no longer exists
pub fn fold_vanished(status: &mut BackupJobStatus, now: DateTime<Utc>) -> bool {
    let in_flight = status.phase.is_some_and(|p| !p.is_terminal());
    let Some(job_name) = status.last_job_name.clone().filter(|_| in_flight) else {
        return false;
    };
    status.phase = Some(Phase::Failed);
    status.last_exit_code = Some(EXIT_CODE_UNKNOWN);
    status.last_run_time = Some(now);
    status.message = Some(format!(
        "Backup job {} disappeared before completing",
        job_name
    ));
    true
}

/// Record a freshly created run
///
/// Only the phase, job name and slot move; exit code and run time keep
/// describing the last completed run.
pub fn mark_created(status: &mut BackupJobStatus, job_name: &str, slot: Option<DateTime<Utc>>) {
    status.phase = Some(Phase::Pending);
    status.last_job_name = Some(job_name.to_string());
    status.message = Some(format!("Backup job {} created", job_name));
    if slot.is_some() {
        status.last_schedule_time = slot;
    }
}

/// Report a spec the operator cannot run
pub fn mark_invalid(status: &mut BackupJobStatus, message: impl Into<String>) {
    status.phase = Some(Phase::Failed);
    status.message = Some(message.into());
}
