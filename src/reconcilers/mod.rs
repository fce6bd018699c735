//! Reconcilers for the BackupJob CRD
//!
//! This module contains the business logic for reconciling BackupJobs.
//! Reconcilers are responsible for:
//! - Validating CRD specs
//! - Building and binding execution Jobs
//! - Evaluating schedules
//! - Propagating execution state into resource status

pub mod backup_job;
pub mod guard;
pub mod job_builder;
pub mod ownership;
pub mod retention;
pub mod schedule;
pub mod status;
