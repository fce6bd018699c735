//! Kubernetes controllers for the BackupJob CRD
//!
//! This module contains the controller that watches for CRD changes and
//! triggers reconciliation.

mod backup_job_controller;

pub use backup_job_controller::run as run_backup_job_controller;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::{Client, ResourceExt};

use crate::adapters::{ClusterStore, KubeStore};
use crate::config::OperatorConfig;
use crate::crd::BackupJob;
use crate::reconcilers::ownership::TypeRegistry;

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,

    /// Store the reconciler reads and writes through
    pub store: Arc<dyn ClusterStore>,

    /// Kinds available for owner references
    pub registry: TypeRegistry,

    /// Operator settings
    pub config: OperatorConfig,

    /// Consecutive failures per object, for retry backoff
    pub retries: RetryTracker,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            store: Arc::new(KubeStore::new(client.clone())),
            client,
            registry: TypeRegistry::with_defaults(),
            config,
            retries: RetryTracker::default(),
        }
    }
}

/// Key identifying a BackupJob in the retry tracker
pub fn object_key(obj: &BackupJob) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Consecutive reconciliation failures per object
///
/// Entries are dropped on success and when the object is being deleted.
#[derive(Debug, Default)]
pub struct RetryTracker {
    failures: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    /// Count a failed reconciliation; returns the consecutive total
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn reset(&self, key: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }

    /// Number of objects currently failing
    pub fn len(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
