use core::fmt;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static BACKUP_FINALIZER: &str = "backups-finalizer.database.arangodb.com";

/// Generate the Kubernetes wrapper struct `ArangoBackup` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "ArangoBackup",
    group = "backup.database.arangodb.com",
    version = "v1",
    namespaced
)]
#[kube(status = "ArangoBackupStatus", shortname = "arangobackup")]
#[kube(
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deployment.name"}"#
)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ArangoBackupSpec {
    /// Target deployment in the same namespace. Immutable after creation.
    pub deployment: DeploymentRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<BackupOptions>,

    /// Setting this requests an upload of the backup to the repository;
    /// clearing it after a successful upload clears the uploaded marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<OperationSpec>,

    /// Present iff this resource adopts a remote backup instead of creating one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadSpec>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
pub struct DeploymentRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupOptions {
    /// Create timeout in seconds, forwarded to the database verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_inconsistent: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    #[serde(rename = "repositoryURL")]
    pub repository_url: String,
    /// Secret in the same namespace holding a single `token` key
    pub credentials_secret_name: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSpec {
    #[serde(rename = "repositoryURL")]
    pub repository_url: String,
    pub credentials_secret_name: String,
    /// Database-side id of the remote backup to adopt
    pub id: String,
}

/// The status object of `ArangoBackup`
///
/// None fields serialize as explicit nulls so a merge patch clears them.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArangoBackupStatus {
    #[serde(default)]
    pub state: BackupState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub progress: Option<BackupProgress>,
    #[serde(default)]
    pub backup: Option<BackupDetails>,
    /// True iff the database currently holds this backup
    #[serde(default)]
    pub available: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum BackupState {
    #[default]
    #[serde(rename = "")]
    None,
    Pending,
    Scheduled,
    Create,
    Upload,
    Download,
    DownloadError,
    Ready,
    Deleted,
    Failed,
}

impl Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackupState::None => write!(f, ""),
            BackupState::Pending => write!(f, "Pending"),
            BackupState::Scheduled => write!(f, "Scheduled"),
            BackupState::Create => write!(f, "Create"),
            BackupState::Upload => write!(f, "Upload"),
            BackupState::Download => write!(f, "Download"),
            BackupState::DownloadError => write!(f, "DownloadError"),
            BackupState::Ready => write!(f, "Ready"),
            BackupState::Deleted => write!(f, "Deleted"),
            BackupState::Failed => write!(f, "Failed"),
        }
    }
}

/// Last observed long-running job on the database side
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub percent: f32,
}

/// Details of the database-side backup associated with this resource
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupDetails {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uploaded: Option<bool>,
    #[serde(default)]
    pub downloaded: Option<bool>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}
