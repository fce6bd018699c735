//! Shared fixtures for integration tests: BackupJob builders and an
//! in-memory cluster store.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use backup_operator::adapters::{ClusterStore, CreateOutcome};
use backup_operator::config::OperatorConfig;
use backup_operator::crd::{
    BackupDestination, BackupJob, BackupJobSpec, BackupJobStatus, BackupStrategy, BackupTarget,
};
use backup_operator::reconcilers::backup_job::{self, Requeue};
use backup_operator::reconcilers::job_builder::{CONTAINER_NAME, LABEL_RUN};
use backup_operator::reconcilers::ownership::TypeRegistry;
use backup_operator::{Error, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::core::ErrorResponse;
use kube::ResourceExt;

pub const NAMESPACE: &str = "default";

// ============================================================================
// Fixtures
// ============================================================================

pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, h, m, 0).unwrap()
}

pub fn dump_spec() -> BackupJobSpec {
    BackupJobSpec {
        target: BackupTarget {
            kind: "StatefulSet".to_string(),
            name: "postgres".to_string(),
            namespace: String::new(),
            path: "/var/lib/postgresql/data".to_string(),
        },
        destination: BackupDestination {
            type_: "s3".to_string(),
            uri: "s3://backups/nightly".to_string(),
            secret_ref: "s3-credentials".to_string(),
        },
        strategy: BackupStrategy {
            type_: "dump".to_string(),
            command: None,
            long_running: false,
        },
        schedule: None,
        image: None,
        suspend: false,
        timeout_seconds: None,
        successful_jobs_history_limit: 3,
        failed_jobs_history_limit: 1,
    }
}

pub fn scheduled_spec(schedule: &str) -> BackupJobSpec {
    BackupJobSpec {
        schedule: Some(schedule.to_string()),
        ..dump_spec()
    }
}

pub fn backup_job(name: &str, spec: BackupJobSpec) -> BackupJob {
    BackupJob {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

pub fn config() -> OperatorConfig {
    OperatorConfig::default()
}

pub fn conflict_error() -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct State {
    backups: BTreeMap<String, BackupJob>,
    jobs: BTreeMap<String, Job>,
    pods: BTreeMap<String, Pod>,
    clock: Option<DateTime<Utc>>,
    version: u64,
    creates: u32,
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = self.clock.unwrap_or_else(|| at(0, 0));
        self.clock = Some(now + Duration::seconds(1));
        now
    }

    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Cluster store that keeps objects in memory
///
/// Honors resource versions on status writes, reports name collisions on
/// create and garbage collects Jobs whose owner is deleted.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
        None => labels.contains_key(term),
    })
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock used for creation timestamps
    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.state.lock().unwrap().clock = Some(now);
    }

    /// Store a BackupJob as the API server would: uid, generation, version
    pub fn insert_backup(&self, mut backup: BackupJob) -> BackupJob {
        let mut state = self.state.lock().unwrap();
        let name = backup.name_any();
        let created = state.tick();
        backup.metadata.uid = Some(format!("uid-{}", name));
        backup.metadata.generation = Some(1);
        backup.metadata.creation_timestamp = Some(Time(created));
        backup.metadata.resource_version = Some(state.bump());
        state.backups.insert(name, backup.clone());
        backup
    }

    /// Fresh read of a BackupJob
    pub fn backup(&self, name: &str) -> BackupJob {
        self.state.lock().unwrap().backups[name].clone()
    }

    pub fn status(&self, name: &str) -> BackupJobStatus {
        self.backup(name).status.unwrap_or_default()
    }

    /// Replace the spec, bumping generation and version
    pub fn update_spec(&self, name: &str, spec: BackupJobSpec) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let backup = state.backups.get_mut(name).unwrap();
        backup.spec = spec;
        backup.metadata.generation = backup.metadata.generation.map(|g| g + 1);
        backup.metadata.resource_version = Some(version);
    }

    /// Delete a BackupJob and cascade to the Jobs and Pods it owns
    pub fn delete_backup(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(backup) = state.backups.remove(name) else {
            return;
        };
        let uid = backup.metadata.uid.unwrap_or_default();
        let orphaned: Vec<String> = state
            .jobs
            .values()
            .filter(|job| {
                job.owner_references()
                    .iter()
                    .any(|r| r.uid == uid && r.controller == Some(true))
            })
            .map(|job| job.name_any())
            .collect();
        for job_name in orphaned {
            state.jobs.remove(&job_name);
            state.pods.retain(|_, pod| pod.labels().get(LABEL_RUN) != Some(&job_name));
        }
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state.lock().unwrap().jobs.values().cloned().collect()
    }

    pub fn job(&self, name: &str) -> Option<Job> {
        self.state.lock().unwrap().jobs.get(name).cloned()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.state.lock().unwrap().jobs.keys().cloned().collect()
    }

    pub fn creates(&self) -> u32 {
        self.state.lock().unwrap().creates
    }

    /// Store a Job created by someone else under `name`
    pub fn insert_foreign_job(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let created = state.tick();
        let job = Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                uid: Some(format!("uid-{}", name)),
                creation_timestamp: Some(Time(created)),
                ..Default::default()
            },
            ..Default::default()
        };
        state.jobs.insert(name.to_string(), job);
    }

    /// Remove a Job behind the operator's back
    pub fn remove_job(&self, name: &str) {
        self.state.lock().unwrap().jobs.remove(name);
    }

    fn set_job_status(&self, name: &str, status: JobStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(name) {
            job.status = Some(status);
        }
    }

    fn set_pod(&self, job_name: &str, status: PodStatus) {
        let mut state = self.state.lock().unwrap();
        let created = state.tick();
        let pod_name = format!("{}-pod", job_name);
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.clone()),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(BTreeMap::from([(LABEL_RUN.to_string(), job_name.to_string())])),
                creation_timestamp: Some(Time(created)),
                ..Default::default()
            },
            spec: None,
            status: Some(status),
        };
        state.pods.insert(pod_name, pod);
    }

    /// Execution pod is scheduled and its container started
    pub fn start_run(&self, job_name: &str) {
        self.set_job_status(
            job_name,
            JobStatus {
                active: Some(1),
                ready: Some(1),
                ..Default::default()
            },
        );
        self.set_pod(
            job_name,
            PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            },
        );
    }

    /// Execution finished with exit code 0
    pub fn succeed_run(&self, job_name: &str, finished: DateTime<Utc>) {
        self.set_pod(job_name, terminated_pod("Succeeded", 0, "Completed", finished));
        self.set_job_status(
            job_name,
            JobStatus {
                succeeded: Some(1),
                completion_time: Some(Time(finished)),
                conditions: Some(vec![condition("Complete", None, finished)]),
                ..Default::default()
            },
        );
    }

    /// Execution container exited with a non-zero code
    pub fn fail_run(&self, job_name: &str, exit_code: i32, finished: DateTime<Utc>) {
        self.set_pod(job_name, terminated_pod("Failed", exit_code, "Error", finished));
        self.set_job_status(
            job_name,
            JobStatus {
                failed: Some(1),
                conditions: Some(vec![condition("Failed", Some("BackoffLimitExceeded"), finished)]),
                ..Default::default()
            },
        );
    }

    /// Execution pod evicted before the container reported an exit code
    pub fn evict_run(&self, job_name: &str, finished: DateTime<Utc>) {
        self.set_pod(
            job_name,
            PodStatus {
                phase: Some("Failed".to_string()),
                reason: Some("Evicted".to_string()),
                message: Some("The node was low on resource: memory.".to_string()),
                ..Default::default()
            },
        );
        self.set_job_status(
            job_name,
            JobStatus {
                failed: Some(1),
                conditions: Some(vec![condition("Failed", Some("BackoffLimitExceeded"), finished)]),
                ..Default::default()
            },
        );
    }
}

fn condition(type_: &str, reason: Option<&str>, at: DateTime<Utc>) -> JobCondition {
    JobCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        reason: reason.map(str::to_string),
        last_transition_time: Some(Time(at)),
        ..Default::default()
    }
}

fn terminated_pod(phase: &str, exit_code: i32, reason: &str, finished: DateTime<Utc>) -> PodStatus {
    PodStatus {
        phase: Some(phase.to_string()),
        container_statuses: Some(vec![ContainerStatus {
            name: CONTAINER_NAME.to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    reason: Some(reason.to_string()),
                    finished_at: Some(Time(finished)),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn list_jobs(&self, _namespace: &str, selector: &str) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .values()
            .filter(|job| matches_selector(job.labels(), selector))
            .cloned()
            .collect())
    }

    async fn list_pods(&self, _namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .values()
            .filter(|pod| matches_selector(pod.labels(), selector))
            .cloned()
            .collect())
    }

    async fn get_job(&self, _namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.state.lock().unwrap().jobs.get(name).cloned())
    }

    async fn create_job(&self, _namespace: &str, job: &Job) -> Result<CreateOutcome> {
        let mut state = self.state.lock().unwrap();
        let name = job.name_any();
        if state.jobs.contains_key(&name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let created = state.tick();
        let mut job = job.clone();
        job.metadata.uid = Some(format!("uid-{}", name));
        job.metadata.creation_timestamp = Some(Time(created));
        state.jobs.insert(name, job);
        state.creates += 1;
        Ok(CreateOutcome::Created)
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.jobs.remove(name);
        state.pods.retain(|_, pod| pod.labels().get(LABEL_RUN).map(String::as_str) != Some(name));
        Ok(())
    }

    async fn patch_status(&self, backup: &BackupJob, status: &BackupJobStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = backup.name_any();
        let stored_version = state
            .backups
            .get(&name)
            .and_then(|b| b.metadata.resource_version.clone());
        if backup.metadata.resource_version.is_some()
            && backup.metadata.resource_version != stored_version
        {
            return Err(conflict_error());
        }
        let version = state.bump();
        let stored = state.backups.get_mut(&name).ok_or(Error::MissingField("backup"))?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        Ok(())
    }
}

// ============================================================================
// Driving reconciliations
// ============================================================================

/// Reconcile a fresh read of `name` at `now`
pub async fn reconcile_at(store: &MemoryStore, name: &str, now: DateTime<Utc>) -> Result<Requeue> {
    let backup = store.backup(name);
    backup_job::reconcile(&backup, store, &TypeRegistry::with_defaults(), &config(), now).await
}

/// Number of Jobs that have not finished
pub fn active_jobs(store: &MemoryStore) -> usize {
    store
        .jobs()
        .iter()
        .filter(|j| backup_operator::reconcilers::status::is_active(j))
        .count()
}
