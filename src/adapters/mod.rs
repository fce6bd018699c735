//! Adapters between the reconciler and the Kubernetes API

mod store;

pub use store::*;
