//! History limits for finished execution Jobs

use std::cmp::Reverse;

use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;

use crate::crd::Phase;
use crate::reconcilers::guard::creation_key;
use crate::reconcilers::status::job_outcome;

/// Names of finished Jobs beyond the history limits, newest first
///
/// Active Jobs, Jobs already being deleted, and the Job named by `keep` are
/// never selected.
pub fn expired_jobs(
    jobs: &[Job],
    keep: Option<&str>,
    successful_limit: u32,
    failed_limit: u32,
) -> Vec<String> {
    let mut finished: Vec<(&Job, Phase)> = jobs
        .iter()
        .filter(|j| j.metadata.deletion_timestamp.is_none())
        .filter_map(|j| job_outcome(j).map(|outcome| (j, outcome)))
        .collect();
    finished.sort_by_key(|(j, _)| Reverse(creation_key(j)));

    let mut kept_succeeded = 0u32;
    let mut kept_failed = 0u32;
    let mut expired = Vec::new();

    for (job, outcome) in finished {
        let name = job.name_any();
        let (kept, limit) = match outcome {
            Phase::Succeeded => (&mut kept_succeeded, successful_limit),
            _ => (&mut kept_failed, failed_limit),
        };
        if keep == Some(name.as_str()) {
            *kept += 1;
            continue;
        }
        if *kept < limit {
            *kept += 1;
        } else {
            expired.push(name);
        }
    }

    expired
}
