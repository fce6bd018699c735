//! Existence checks that keep run creation idempotent

use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;

use crate::reconcilers::status::is_active;

/// What the store already holds for a run name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Existing {
    Absent,
    Active,
    Terminal,
}

/// Look up the run named `job_name` among the observed Jobs
pub fn check(jobs: &[Job], job_name: &str) -> Existing {
    match jobs.iter().find(|j| j.name_any() == job_name) {
        None => Existing::Absent,
        Some(job) if is_active(job) => Existing::Active,
        Some(_) => Existing::Terminal,
    }
}

/// Newest Job still running, if any
pub fn active_job(jobs: &[Job]) -> Option<&Job> {
    jobs.iter().filter(|j| is_active(j)).max_by_key(|j| creation_key(j))
}

/// The Job whose state the BackupJob status should reflect
///
/// An active Job wins; otherwise the newest one.
pub fn current_job(jobs: &[Job]) -> Option<&Job> {
    active_job(jobs).or_else(|| jobs.iter().max_by_key(|j| creation_key(j)))
}

/// Ordering key: creation time, then name (scheduled names sort by slot)
pub(crate) fn creation_key(job: &Job) -> (Option<chrono::DateTime<chrono::Utc>>, String) {
    (
        job.metadata.creation_timestamp.as_ref().map(|t| t.0),
        job.name_any(),
    )
}
