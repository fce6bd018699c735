//! Universal Backup Kubernetes Operator
//!
//! This operator turns declarative BackupJob resources into one-shot
//! Kubernetes Jobs and reports each run's outcome back on the resource.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;

pub use error::{Error, Result};
