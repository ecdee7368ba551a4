//! CRD YAML Generator
//!
//! Prints the CustomResourceDefinitions owned by the operator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use cassandra_backup_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
