use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidSchedule: {0}")]
    InvalidSchedule(String),

    /// Transient remote failure (network, 5xx); retried, never promoted to Failed
    #[error("DatabaseUnavailable: {0}")]
    DatabaseUnavailable(String),

    /// Permanent remote failure (rejected request, bad credentials)
    #[error("DatabaseRequest: {0}")]
    DatabaseRequest(String),

    /// Sentinel for a missing database-side backup; callers treat it as the
    /// observation "backup not present", not as a failure
    #[error("BackupNotFound: {0}")]
    BackupNotFound(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube",
            Error::FinalizerError(_) => "finalizer",
            Error::JsonSerializationError(_) => "serialization",
            Error::MetadataMissing(_) => "metadata_missing",
            Error::InvalidSchedule(_) => "invalid_schedule",
            Error::DatabaseUnavailable(_) => "database_unavailable",
            Error::DatabaseRequest(_) => "database_request",
            Error::BackupNotFound(_) => "backup_not_found",
        }
        .to_string()
    }

    /// True for failures that a later reconcile may not see again
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::DatabaseUnavailable(_) => true,
            Error::KubeError(e) => !is_kube_not_found(e),
            _ => false,
        }
    }
}

pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

pub fn is_kube_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
