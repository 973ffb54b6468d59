use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::api::v1::BackupOptions;
use crate::arango::types::{
    ApiEnvelope, BackupMeta, CreateRequest, CreateResult, DeleteRequest, DownloadRequest,
    DownloadResult, JobState, ListRequest, ListResult, RepositoryConfig, UploadRequest,
    UploadResult,
};
use crate::util::errors::{Error, Result};

/// Control-plane calls are expected to answer quickly
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Progress polls may block while db servers stat remote pieces
const PROGRESS_TIMEOUT: Duration = Duration::from_secs(60);
/// Create runs synchronously on the database side
const CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for the backup API of one deployment's coordinators.
///
/// Cheap to clone; the inner reqwest client pools connections.
#[derive(Clone)]
pub struct BackupClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackupClient {
    pub fn new(namespace: &str, deployment: &str) -> Self {
        Self {
            base_url: format!("https://{}.{}.svc:8529", deployment, namespace),
            client: reqwest::Client::new(),
        }
    }

    /// Create a backup and stat it, returning its metadata.
    ///
    /// Not idempotent: every call creates a new database-side backup.
    pub async fn create(&self, options: Option<&BackupOptions>) -> Result<BackupMeta> {
        let body = CreateRequest {
            label: None,
            timeout: options.and_then(|o| o.timeout),
            allow_inconsistent: options.and_then(|o| o.allow_inconsistent),
        };
        let created: CreateResult = self.post("create", &body, CREATE_TIMEOUT).await?;
        debug!("Created database backup {}", created.id);

        self.list_one(&created.id).await?.ok_or_else(|| {
            Error::DatabaseRequest(format!("backup {} vanished right after create", created.id))
        })
    }

    /// List all database-side backups keyed by id.
    pub async fn list(&self) -> Result<HashMap<String, BackupMeta>> {
        let result: ListResult = self
            .post("list", &ListRequest { id: None }, REQUEST_TIMEOUT)
            .await?;
        Ok(result.list)
    }

    /// Stat a single backup; `Ok(None)` when the database does not hold it.
    pub async fn list_one(&self, id: &str) -> Result<Option<BackupMeta>> {
        let request = ListRequest {
            id: Some(id.to_string()),
        };
        match self.post::<_, ListResult>("list", &request, REQUEST_TIMEOUT).await {
            Ok(result) => Ok(result.list.into_values().find(|m| m.id == id)),
            Err(Error::BackupNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a backup. A missing id is the `BackupNotFound` sentinel, which
    /// callers treat as success.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let request = DeleteRequest { id: id.to_string() };
        self.post::<_, serde_json::Value>("delete", &request, REQUEST_TIMEOUT)
            .await?;
        debug!("Deleted database backup {}", id);
        Ok(())
    }

    /// Start uploading `id` to the repository; returns the job id.
    ///
    /// Not idempotent: the caller must persist the job id before calling again.
    pub async fn upload(&self, id: &str, repository_url: &str, token: String) -> Result<String> {
        let request = UploadRequest {
            id: Some(id.to_string()),
            remote_repository: Some(repository_url.to_string()),
            config: Some(RepositoryConfig { token }),
            ..Default::default()
        };
        let result: UploadResult = self.post("upload", &request, REQUEST_TIMEOUT).await?;
        result
            .upload_id
            .ok_or_else(|| Error::DatabaseRequest("upload accepted without a job id".to_string()))
    }

    pub async fn upload_progress(&self, job_id: &str) -> Result<JobState> {
        let request = UploadRequest {
            upload_id: Some(job_id.to_string()),
            ..Default::default()
        };
        let result: UploadResult = self.post("upload", &request, PROGRESS_TIMEOUT).await?;
        Ok(JobState::fold(&result.db_servers))
    }

    /// Start downloading the remote backup `id` from the repository; returns
    /// the job id. Not idempotent, same discipline as `upload`.
    pub async fn download(&self, id: &str, repository_url: &str, token: String) -> Result<String> {
        let request = DownloadRequest {
            id: Some(id.to_string()),
            remote_repository: Some(repository_url.to_string()),
            config: Some(RepositoryConfig { token }),
            ..Default::default()
        };
        let result: DownloadResult = self.post("download", &request, REQUEST_TIMEOUT).await?;
        result
            .download_id
            .ok_or_else(|| Error::DatabaseRequest("download accepted without a job id".to_string()))
    }

    pub async fn download_progress(&self, job_id: &str) -> Result<JobState> {
        let request = DownloadRequest {
            download_id: Some(job_id.to_string()),
            ..Default::default()
        };
        let result: DownloadResult = self.post("download", &request, PROGRESS_TIMEOUT).await?;
        Ok(JobState::fold(&result.db_servers))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T> {
        let url = format!("{}/_admin/backup/{}", self.base_url, operation);

        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                warn!("Backup API {} unreachable: {}", url, e);
                Error::DatabaseUnavailable(format!("{}: {}", operation, e))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::BackupNotFound(operation.to_string()));
        }

        let envelope: ApiEnvelope<T> = response.json().await.map_err(|e| {
            Error::DatabaseUnavailable(format!("{}: undecodable response: {}", operation, e))
        })?;

        if envelope.error || !status.is_success() {
            let message = envelope
                .error_message
                .unwrap_or_else(|| format!("http status {}", status));
            return Err(if status.is_server_error() {
                Error::DatabaseUnavailable(format!("{}: {}", operation, message))
            } else {
                Error::DatabaseRequest(format!("{}: {}", operation, message))
            });
        }

        envelope
            .result
            .ok_or_else(|| Error::DatabaseRequest(format!("{}: response without result", operation)))
    }
}

/// One pooled client per deployment, shared across reconciles for that
/// deployment and never across namespaces.
#[derive(Default)]
pub struct ClientCache {
    clients: RwLock<HashMap<(String, String), BackupClient>>,
}

impl ClientCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get(&self, namespace: &str, deployment: &str) -> BackupClient {
        let key = (namespace.to_string(), deployment.to_string());
        if let Some(client) = self.clients.read().await.get(&key) {
            return client.clone();
        }

        let mut clients = self.clients.write().await;
        clients
            .entry(key)
            .or_insert_with(|| BackupClient::new(namespace, deployment))
            .clone()
    }
}
