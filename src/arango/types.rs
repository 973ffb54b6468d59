//! Wire types of the database's `/_admin/backup` API.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard response envelope of the database HTTP API
#[derive(Deserialize, Debug)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub error: bool,
    #[serde(default, rename = "errorMessage")]
    pub error_message: Option<String>,
    #[serde(default, rename = "errorNum")]
    pub error_num: Option<i64>,
    pub result: Option<T>,
}

#[derive(Serialize, Debug, Default)]
pub struct CreateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(rename = "allowInconsistent", skip_serializing_if = "Option::is_none")]
    pub allow_inconsistent: Option<bool>,
}

#[derive(Deserialize, Debug)]
pub struct CreateResult {
    pub id: String,
}

#[derive(Serialize, Debug)]
pub struct ListRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ListResult {
    pub list: HashMap<String, BackupMeta>,
}

/// Metadata of one database-side backup as reported by `list`
#[derive(Deserialize, Clone, Debug)]
pub struct BackupMeta {
    pub id: String,
    pub version: String,
    #[serde(rename = "datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "sizeInBytes")]
    pub size_in_bytes: u64,
    #[serde(default, rename = "nrDBServers")]
    pub nr_db_servers: u32,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Serialize, Debug)]
pub struct DeleteRequest {
    pub id: String,
}

/// Starts an upload (`id` set) or polls one (`upload_id` set)
#[derive(Serialize, Debug, Default)]
pub struct UploadRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "uploadId", skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(rename = "remoteRepository", skip_serializing_if = "Option::is_none")]
    pub remote_repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RepositoryConfig>,
}

#[derive(Deserialize, Debug)]
pub struct UploadResult {
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "DBServers", default)]
    pub db_servers: HashMap<String, ServerJobStatus>,
}

/// Starts a download (`id` set) or polls one (`download_id` set)
#[derive(Serialize, Debug, Default)]
pub struct DownloadRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "downloadId", skip_serializing_if = "Option::is_none")]
    pub download_id: Option<String>,
    #[serde(rename = "remoteRepository", skip_serializing_if = "Option::is_none")]
    pub remote_repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RepositoryConfig>,
}

#[derive(Deserialize, Debug)]
pub struct DownloadResult {
    #[serde(rename = "downloadId")]
    pub download_id: Option<String>,
    #[serde(rename = "DBServers", default)]
    pub db_servers: HashMap<String, ServerJobStatus>,
}

/// Repository credentials, forwarded verbatim from the credentials secret
#[derive(Serialize, Debug)]
pub struct RepositoryConfig {
    pub token: String,
}

#[derive(Deserialize, Debug)]
pub struct ServerJobStatus {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Progress", default)]
    pub progress: Option<ServerJobProgress>,
    #[serde(rename = "Error", default)]
    pub error: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ServerJobProgress {
    #[serde(rename = "Total", default)]
    pub total: u64,
    #[serde(rename = "Done", default)]
    pub done: u64,
}

/// One transfer job folded over all db servers
#[derive(Clone, Debug, PartialEq)]
pub struct JobState {
    pub done: bool,
    pub failed: bool,
    pub percent: f32,
    pub message: Option<String>,
}

impl JobState {
    /// Collapse the per-server view into one job state: the job is done when
    /// every server completed, failed when any server failed.
    pub fn fold(servers: &HashMap<String, ServerJobStatus>) -> JobState {
        if servers.is_empty() {
            return JobState {
                done: false,
                failed: false,
                percent: 0.0,
                message: None,
            };
        }

        let mut total = 0u64;
        let mut done = 0u64;
        let mut all_completed = true;
        let mut failure: Option<String> = None;

        for (server, status) in servers {
            if status.status == "FAILED" {
                failure = Some(match &status.error {
                    Some(e) => format!("server {}: {}", server, e),
                    None => format!("server {} failed", server),
                });
            }
            if status.status != "COMPLETED" {
                all_completed = false;
            }
            if let Some(p) = &status.progress {
                total += p.total;
                done += p.done;
            }
        }

        let percent = if all_completed {
            100.0
        } else if total > 0 {
            (done as f32 / total as f32) * 100.0
        } else {
            0.0
        };

        JobState {
            done: all_completed,
            failed: failure.is_some(),
            percent,
            message: failure,
        }
    }
}
