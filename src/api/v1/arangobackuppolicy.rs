use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::arangobackup::{BackupOptions, OperationSpec};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "ArangoBackupPolicy",
    group = "backup.database.arangodb.com",
    version = "v1",
    namespaced
)]
#[kube(status = "ArangoBackupPolicyStatus", shortname = "arangobackuppolicy")]
#[kube(printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#)]
#[kube(printcolumn = r#"{"name":"Scheduled","type":"string","jsonPath":".status.scheduled"}"#)]
#[kube(printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ArangoBackupPolicySpec {
    /// 6-field cron expression (sec min hr dom mon dow)
    pub schedule: String,

    /// Deployments the policy fans out to; an absent selector matches all
    /// deployments in the namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_template: Option<BackupTemplate>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<BackupOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<OperationSpec>,
}

/// The status object of `ArangoBackupPolicy`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArangoBackupPolicyStatus {
    /// Next due tick; strictly increases across the policy's lifetime
    #[serde(default)]
    pub scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
}
