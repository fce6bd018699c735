//! BackupJob Custom Resource Definition

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BackupJob resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "backup.javy.dev",
    version = "v1",
    kind = "BackupJob",
    plural = "backupjobs",
    singular = "backupjob",
    shortname = "bj",
    namespaced,
    status = "BackupJobStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Last Job", "type": "string", "jsonPath": ".status.lastJobName"}"#,
    printcolumn = r#"{"name": "Last Run", "type": "date", "jsonPath": ".status.lastRunTime"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupJobSpec {
    /// What is being backed up
    pub target: BackupTarget,

    /// Where the backup lands
    pub destination: BackupDestination,

    /// How the backup runs
    pub strategy: BackupStrategy,

    /// Cron schedule for recurring backups; absent means run exactly once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Runner image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Stop creating new runs (an in-flight run is still tracked)
    #[serde(default)]
    pub suspend: bool,

    /// Deadline for a single run, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,

    /// Number of succeeded Jobs to keep
    #[serde(default = "default_successful_history")]
    pub successful_jobs_history_limit: u32,

    /// Number of failed Jobs to keep
    #[serde(default = "default_failed_history")]
    pub failed_jobs_history_limit: u32,
}

fn default_successful_history() -> u32 {
    3
}

fn default_failed_history() -> u32 {
    1
}

/// Target of the backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupTarget {
    /// Kind of the target (StatefulSet, Deployment, PersistentVolumeClaim, ...)
    pub kind: String,

    /// Target name
    pub name: String,

    /// Target namespace; defaults to the BackupJob's namespace
    #[serde(default)]
    pub namespace: String,

    /// Path inside the container or volume
    #[serde(default)]
    pub path: String,
}

/// Destination of the backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupDestination {
    /// Destination type (s3, gcs, azure, git, nfs, local, custom)
    #[serde(rename = "type")]
    pub type_: String,

    /// Destination URI, e.g. s3://bucket/path
    pub uri: String,

    /// Name of the Secret holding destination credentials
    #[serde(default)]
    pub secret_ref: String,
}

/// How the backup is performed
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStrategy {
    /// Strategy type (dump, snapshot, copy, custom)
    #[serde(rename = "type")]
    pub type_: String,

    /// Shell command overriding the default for the strategy type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// The command keeps running instead of exiting after one pass
    #[serde(default)]
    pub long_running: bool,
}

/// Parsed `strategy.type`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Dump,
    Snapshot,
    Copy,
    Custom,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Dump => "dump",
            StrategyKind::Snapshot => "snapshot",
            StrategyKind::Copy => "copy",
            StrategyKind::Custom => "custom",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dump" => Ok(StrategyKind::Dump),
            "snapshot" => Ok(StrategyKind::Snapshot),
            "copy" => Ok(StrategyKind::Copy),
            "custom" => Ok(StrategyKind::Custom),
            other => Err(format!(
                "unknown strategy type '{}': must be one of: dump, snapshot, copy, custom",
                other
            )),
        }
    }
}

/// Parsed `destination.type`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestinationKind {
    S3,
    Gcs,
    Azure,
    Git,
    Nfs,
    Local,
    Custom,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::S3 => "s3",
            DestinationKind::Gcs => "gcs",
            DestinationKind::Azure => "azure",
            DestinationKind::Git => "git",
            DestinationKind::Nfs => "nfs",
            DestinationKind::Local => "local",
            DestinationKind::Custom => "custom",
        }
    }
}

impl FromStr for DestinationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s3" => Ok(DestinationKind::S3),
            "gcs" => Ok(DestinationKind::Gcs),
            "azure" => Ok(DestinationKind::Azure),
            "git" => Ok(DestinationKind::Git),
            "nfs" => Ok(DestinationKind::Nfs),
            "local" => Ok(DestinationKind::Local),
            "custom" => Ok(DestinationKind::Custom),
            other => Err(format!(
                "unknown destination type '{}': must be one of: s3, gcs, azure, git, nfs, local, custom",
                other
            )),
        }
    }
}

/// Lifecycle phase of the current run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Phase {
    /// Position in the Pending -> Running -> terminal order
    pub fn rank(&self) -> u8 {
        match self {
            Phase::Pending => 0,
            Phase::Running => 1,
            Phase::Succeeded | Phase::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// BackupJob status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupJobStatus {
    /// Phase of the run named by `lastJobName`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Completion time of the most recently completed run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<DateTime<Utc>>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Job backing the current or most recent run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_job_name: Option<String>,

    /// Exit code of the most recently completed run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,

    /// Schedule slot of the most recently created scheduled run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,

    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl BackupJob {
    /// Namespace of the backup target, falling back to the BackupJob's own
    pub fn target_namespace(&self) -> String {
        if self.spec.target.namespace.is_empty() {
            self.metadata.namespace.clone().unwrap_or_default()
        } else {
            self.spec.target.namespace.clone()
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.spec
            .schedule
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }
}
