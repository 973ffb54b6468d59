pub mod arangobackup;
pub mod arangobackuppolicy;
pub mod arangodeployment;

pub use arangobackup::{
    ArangoBackup, ArangoBackupSpec, ArangoBackupStatus, BackupDetails, BackupOptions,
    BackupProgress, BackupState, DeploymentRef, DownloadSpec, OperationSpec, BACKUP_FINALIZER,
};
pub use arangobackuppolicy::{
    ArangoBackupPolicy, ArangoBackupPolicySpec, ArangoBackupPolicyStatus, BackupTemplate,
};
pub use arangodeployment::{ArangoDeployment, ArangoDeploymentSpec, ArangoDeploymentStatus};
