//! Read-only view of backups for the deployment controller.
//!
//! The restore handshake goes through `ArangoDeployment.spec.restoreFrom`:
//! the deployment controller resolves that name here and performs the
//! restore itself, writing `status.restore` on its side. Nothing in this
//! module mutates any resource.

use kube::{api::Api, client::Client};

use crate::api::v1::{ArangoBackup, BackupState};
use crate::util::errors::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestoreLookup {
    pub found: bool,
    /// True only for a Ready backup the database currently holds
    pub ready: bool,
    pub db_backup_id: Option<String>,
}

/// Resolve a backup name for a restore request.
///
/// A missing resource yields `{found: false}`; the deployment controller
/// turns that into `restored = false` with a message on its own status.
pub async fn lookup(client: &Client, namespace: &str, name: &str) -> Result<RestoreLookup> {
    let backups: Api<ArangoBackup> = Api::namespaced(client.clone(), namespace);

    let Some(backup) = backups.get_opt(name).await.map_err(Error::KubeError)? else {
        return Ok(RestoreLookup::default());
    };

    let status = backup.status.unwrap_or_default();
    Ok(RestoreLookup {
        found: true,
        ready: status.state == BackupState::Ready && status.available,
        db_backup_id: status.backup.map(|details| details.id),
    })
}
