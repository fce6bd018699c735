//! Custom Resource Definitions for the Backup Operator

mod backup_job;

pub use backup_job::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![serde_yaml::to_string(&BackupJob::crd())?])
}
