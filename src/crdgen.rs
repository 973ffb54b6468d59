use arango_backup_operator::api::v1::{ArangoBackup, ArangoBackupPolicy};
use kube::CustomResourceExt as _;

fn main() {
    print!("{}", serde_yaml::to_string(&ArangoBackup::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&ArangoBackupPolicy::crd()).unwrap());
}
