//! Maps a BackupJob spec to the batch Job that executes one run
//!
//! Pure functions only; ownership is attached separately by the caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, ExecAction, PodSpec, PodTemplateSpec, Probe,
    SecretEnvSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::{BackupJob, StrategyKind};
use crate::error::{Error, Result};

/// Label carrying the owning BackupJob's name
pub const LABEL_BACKUP_JOB: &str = "backup.javy.dev/backupjob";

/// Label carrying the Job name, set on the Job and its pods
pub const LABEL_RUN: &str = "backup.javy.dev/run";

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Full name of the owning BackupJob, on the pod template
///
/// The label value is shortened for long names; this one is not.
pub const ANNOTATION_BACKUP_JOB: &str = "backup.javy.dev/backupjob-name";

/// Schedule slot a recurring run was created for (RFC 3339)
pub const ANNOTATION_SCHEDULED_AT: &str = "backup.javy.dev/scheduled-at";

/// Name of the single container in every backup pod
pub const CONTAINER_NAME: &str = "backup-runner";

const JOB_NAME_PREFIX: &str = "backupjob-";
const MAX_LABEL_LEN: usize = 63;
const DIGEST_LEN: usize = 8;

/// Deterministic Job name for a run
///
/// One-shot runs are named after the BackupJob alone; scheduled runs append
/// the slot in minutes since the epoch so consecutive runs never collide.
/// Names too long for the label limit are cut and tagged with a digest of
/// the full BackupJob name.
pub fn job_name(backup_name: &str, slot: Option<DateTime<Utc>>) -> String {
    let suffix = slot
        .map(|s| format!("-{}", s.timestamp().div_euclid(60)))
        .unwrap_or_default();
    let budget = MAX_LABEL_LEN - JOB_NAME_PREFIX.len() - suffix.len();
    format!("{}{}{}", JOB_NAME_PREFIX, shorten(backup_name, budget), suffix)
}

/// Label value for a BackupJob name
pub fn label_value(name: &str) -> String {
    shorten(name, MAX_LABEL_LEN)
}

/// Fit `name` into `max` characters, keeping distinct names distinct
fn shorten(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    let head: String = name.chars().take(max - DIGEST_LEN - 1).collect();
    format!("{}-{}", head.trim_end_matches('-'), &digest[..DIGEST_LEN])
}

/// Label selector matching every Job created for `backup`
pub fn owned_jobs_selector(backup: &BackupJob) -> String {
    format!("{}={}", LABEL_BACKUP_JOB, label_value(&backup.name_any()))
}

/// Label selector matching the pods of one Job
pub fn run_pods_selector(job_name: &str) -> String {
    format!("{}={}", LABEL_RUN, job_name)
}

/// Command line for the backup container
///
/// An explicit `strategy.command` always wins. Otherwise the command comes
/// from the strategy type; `custom` has no default and is rejected.
pub fn derive_command(backup: &BackupJob) -> Result<Vec<String>> {
    let strategy = &backup.spec.strategy;
    let explicit = strategy
        .command
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    if let Some(command) = explicit {
        return Ok(vec!["/bin/sh".into(), "-c".into(), command.to_string()]);
    }

    match strategy.type_.parse::<StrategyKind>() {
        Ok(StrategyKind::Custom) => Err(Error::validation(
            "strategy type 'custom' requires a non-empty command",
        )),
        Ok(kind) => Ok(default_command(kind, backup)),
        Err(e) => Err(Error::validation(format!("{} and no command was given", e))),
    }
}

fn default_command(kind: StrategyKind, backup: &BackupJob) -> Vec<String> {
    let spec = &backup.spec;
    let mut command = vec![CONTAINER_NAME.to_string(), kind.as_str().to_string()];
    let flags = [
        ("--target-kind", spec.target.kind.clone()),
        ("--target-name", spec.target.name.clone()),
        ("--target-namespace", backup.target_namespace()),
        ("--path", spec.target.path.clone()),
        ("--destination-type", spec.destination.type_.clone()),
        ("--destination-uri", spec.destination.uri.clone()),
    ];
    for (flag, value) in flags {
        if !value.is_empty() {
            command.push(flag.to_string());
            command.push(value);
        }
    }
    command
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Expose every key of the credentials Secret as an environment variable
fn secret_env(secret_name: &str) -> EnvFromSource {
    EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: secret_name.to_string().into(),
            optional: Some(false),
        }),
        ..Default::default()
    }
}

/// Build the Job for one run of `backup`
pub fn build_job(
    backup: &BackupJob,
    name: &str,
    slot: Option<DateTime<Utc>>,
    default_image: &str,
) -> Result<Job> {
    let command = derive_command(backup)?;
    let spec = &backup.spec;
    let backup_name = backup.name_any();

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), "backup-operator".to_string());
    labels.insert(LABEL_BACKUP_JOB.to_string(), label_value(&backup_name));
    labels.insert(LABEL_RUN.to_string(), name.to_string());

    let annotations = slot.map(|s| {
        BTreeMap::from([(ANNOTATION_SCHEDULED_AT.to_string(), s.to_rfc3339())])
    });

    let env = vec![
        env_var("BACKUP_JOB_NAME", backup_name.clone()),
        env_var("BACKUP_STRATEGY", spec.strategy.type_.clone()),
        env_var("BACKUP_TARGET_KIND", spec.target.kind.clone()),
        env_var("BACKUP_TARGET_NAME", spec.target.name.clone()),
        env_var("BACKUP_TARGET_NAMESPACE", backup.target_namespace()),
        env_var("BACKUP_TARGET_PATH", spec.target.path.clone()),
        env_var("BACKUP_DESTINATION_TYPE", spec.destination.type_.clone()),
        env_var("BACKUP_DESTINATION_URI", spec.destination.uri.clone()),
    ];

    let env_from = if spec.destination.secret_ref.is_empty() {
        None
    } else {
        Some(vec![secret_env(&spec.destination.secret_ref)])
    };

    // One-shot runs finish on their own; completion is read from the pod phase.
    let liveness = spec.strategy.long_running.then(|| Probe {
        exec: Some(ExecAction {
            command: Some(vec!["true".to_string()]),
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    });

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone().unwrap_or_else(|| default_image.to_string())),
        command: Some(command),
        env: Some(env),
        env_from,
        liveness_probe: liveness,
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: backup.namespace(),
            labels: Some(labels.clone()),
            annotations,
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: spec.timeout_seconds,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        ANNOTATION_BACKUP_JOB.to_string(),
                        backup_name.clone(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
