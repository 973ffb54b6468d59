use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Read-only view of `ArangoDeployment`.
///
/// The deployment resource is owned by the deployment controller; this
/// operator only checks existence and reads the restore handshake fields,
/// so the struct carries just those. The CRD manifest is not generated here.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "ArangoDeployment",
    group = "database.arangodb.com",
    version = "v1",
    namespaced
)]
#[kube(status = "ArangoDeploymentStatus", shortname = "arango")]
#[serde(rename_all = "camelCase")]
pub struct ArangoDeploymentSpec {
    /// Name of an ArangoBackup in the same namespace to restore from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_from: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArangoDeploymentStatus {
    /// Written solely by the deployment controller after acting on restoreFrom
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<DeploymentRestoreStatus>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRestoreStatus {
    pub requested_from: String,
    pub restored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
