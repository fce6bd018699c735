//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the BackupJob
//! resource defined by the backup-operator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/backupjob.yaml

use backup_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
