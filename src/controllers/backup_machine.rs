//! Pure transition function of the backup lifecycle.
//!
//! One reconcile pass feeds a consistent snapshot of the world into
//! [`next`], which returns the status to persist and at most one side
//! effect for the reconciler to issue. All database and apiserver I/O
//! stays in the reconciler; everything here is total over
//! `(spec, status, observations)` and therefore deterministic under
//! replay.

use chrono::{DateTime, Utc};

use crate::api::v1::{
    ArangoBackupSpec, ArangoBackupStatus, BackupDetails, BackupProgress, BackupState,
};
use crate::arango::types::{BackupMeta, JobState};

/// Snapshot of the world gathered at the top of a reconcile pass
#[derive(Clone, Debug)]
pub struct Observations {
    /// Does the spec'd deployment resource exist in this namespace
    pub deployment_exists: bool,
    /// `List(id)` result for the backup id the status tracks, if any
    pub db_backup: Option<BackupMeta>,
    /// `Progress(jobID)` result for the job the status tracks, if any
    pub job: Option<JobState>,
    pub now: DateTime<Utc>,
}

/// Side effect the reconciler must issue after persisting the status.
///
/// `StartUpload` and `StartDownload` are not idempotent on the database
/// side; the reconciler persists the in-flight status before the call and
/// the returned job id right after it (two-phase write).
#[derive(Clone, Debug, PartialEq)]
pub enum SideEffect {
    None,
    CreateBackup,
    StartUpload {
        id: String,
        repository_url: String,
        credentials_secret_name: String,
    },
    StartDownload {
        id: String,
        repository_url: String,
        credentials_secret_name: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub status: ArangoBackupStatus,
    pub effect: SideEffect,
}

impl Transition {
    fn to(status: ArangoBackupStatus) -> Self {
        Transition {
            status,
            effect: SideEffect::None,
        }
    }

    fn with(status: ArangoBackupStatus, effect: SideEffect) -> Self {
        Transition { status, effect }
    }
}

/// Compute the next status and side effect for one backup resource.
pub fn next(
    spec: &ArangoBackupSpec,
    status: &ArangoBackupStatus,
    obs: &Observations,
) -> Transition {
    match status.state {
        BackupState::None => handle_new(status),
        BackupState::Pending => handle_pending(spec, status, obs),
        BackupState::Scheduled => handle_scheduled(spec, status),
        BackupState::Create => handle_create(status),
        BackupState::Download => handle_download(spec, status, obs),
        BackupState::DownloadError => handle_download_error(spec, status),
        BackupState::Ready => handle_ready(spec, status, obs),
        BackupState::Upload => handle_upload(spec, status, obs),
        BackupState::Deleted => handle_deleted(spec, status),
        // Failed is terminal; recovery is delete-and-recreate
        BackupState::Failed => Transition::to(status.clone()),
    }
}

fn handle_new(status: &ArangoBackupStatus) -> Transition {
    Transition::to(ArangoBackupStatus {
        state: BackupState::Pending,
        ..status.clone()
    })
}

fn handle_pending(
    spec: &ArangoBackupSpec,
    status: &ArangoBackupStatus,
    obs: &Observations,
) -> Transition {
    if !obs.deployment_exists {
        return Transition::to(ArangoBackupStatus {
            state: BackupState::Pending,
            message: Some(format!(
                "deployment {:?} does not exist",
                spec.deployment.name
            )),
            ..status.clone()
        });
    }

    Transition::to(ArangoBackupStatus {
        state: BackupState::Scheduled,
        message: None,
        ..status.clone()
    })
}

/// The deployment exists; decide between creating a fresh backup and
/// adopting a remote one.
fn handle_scheduled(spec: &ArangoBackupSpec, status: &ArangoBackupStatus) -> Transition {
    match &spec.download {
        Some(download) => Transition::with(
            ArangoBackupStatus {
                state: BackupState::Download,
                backup: Some(BackupDetails {
                    id: download.id.clone(),
                    downloaded: Some(false),
                    ..Default::default()
                }),
                progress: None,
                message: None,
                ..status.clone()
            },
            SideEffect::StartDownload {
                id: download.id.clone(),
                repository_url: download.repository_url.clone(),
                credentials_secret_name: download.credentials_secret_name.clone(),
            },
        ),
        None => Transition::with(
            ArangoBackupStatus {
                state: BackupState::Create,
                message: None,
                ..status.clone()
            },
            SideEffect::CreateBackup,
        ),
    }
}

/// `Create` persists `status.backup` only after the database call
/// succeeded, so a populated `backup` is the completed-create observation.
fn handle_create(status: &ArangoBackupStatus) -> Transition {
    if status.backup.is_some() {
        return Transition::to(ArangoBackupStatus {
            state: BackupState::Ready,
            message: None,
            available: true,
            ..status.clone()
        });
    }

    // In-flight with nothing persisted: the create never happened or was
    // lost before the status write. Issue it (again).
    Transition::with(status.clone(), SideEffect::CreateBackup)
}

fn handle_download(
    spec: &ArangoBackupSpec,
    status: &ArangoBackupStatus,
    obs: &Observations,
) -> Transition {
    if let Some(job) = &obs.job {
        if job.failed {
            return Transition::to(ArangoBackupStatus {
                state: BackupState::DownloadError,
                message: Some(
                    job.message
                        .clone()
                        .unwrap_or_else(|| "download job failed".to_string()),
                ),
                progress: None,
                ..status.clone()
            });
        }
        if job.done {
            return Transition::to(complete_download(status, obs));
        }
        // Still running; refresh the observed percentage
        let job_id = status
            .progress
            .as_ref()
            .map(|p| p.job_id.clone())
            .unwrap_or_default();
        return Transition::to(ArangoBackupStatus {
            progress: Some(BackupProgress {
                job_id,
                percent: job.percent,
            }),
            ..status.clone()
        });
    }

    if status.progress.is_none() {
        // In-flight without a job handle: a crash hit between the status
        // write and the job-id write. The List probe tells us whether the
        // job finished; only then is re-issuing safe.
        if obs.db_backup.is_some() {
            return Transition::to(complete_download(status, obs));
        }
        if let Some(download) = &spec.download {
            return Transition::with(
                status.clone(),
                SideEffect::StartDownload {
                    id: download.id.clone(),
                    repository_url: download.repository_url.clone(),
                    credentials_secret_name: download.credentials_secret_name.clone(),
                },
            );
        }
    }

    // Job handle present but no progress observation this pass; stale
    // snapshot, try again later.
    Transition::to(status.clone())
}

fn complete_download(status: &ArangoBackupStatus, obs: &Observations) -> ArangoBackupStatus {
    let mut details = status.backup.clone().unwrap_or_default();
    details.downloaded = Some(true);
    if let Some(meta) = &obs.db_backup {
        details.version = Some(meta.version.clone());
        details.created_at = Some(meta.created_at);
    }
    ArangoBackupStatus {
        state: BackupState::Ready,
        backup: Some(details),
        available: true,
        progress: None,
        message: None,
        ..status.clone()
    }
}

/// Sticky until the spec names a different remote backup.
fn handle_download_error(spec: &ArangoBackupSpec, status: &ArangoBackupStatus) -> Transition {
    if let Some(download) = &spec.download {
        let attempted = status.backup.as_ref().map(|b| b.id.as_str());
        if attempted != Some(download.id.as_str()) {
            return Transition::with(
                ArangoBackupStatus {
                    state: BackupState::Download,
                    backup: Some(BackupDetails {
                        id: download.id.clone(),
                        downloaded: Some(false),
                        ..Default::default()
                    }),
                    progress: None,
                    message: None,
                    ..status.clone()
                },
                SideEffect::StartDownload {
                    id: download.id.clone(),
                    repository_url: download.repository_url.clone(),
                    credentials_secret_name: download.credentials_secret_name.clone(),
                },
            );
        }
    }

    Transition::to(status.clone())
}

fn handle_ready(
    spec: &ArangoBackupSpec,
    status: &ArangoBackupStatus,
    obs: &Observations,
) -> Transition {
    // Disappearance is only acted on here; running jobs elsewhere are
    // allowed to finish first.
    if obs.db_backup.is_none() {
        return Transition::to(ArangoBackupStatus {
            state: BackupState::Deleted,
            available: false,
            progress: None,
            ..status.clone()
        });
    }

    let uploaded = status
        .backup
        .as_ref()
        .and_then(|b| b.uploaded)
        .unwrap_or(false);

    if let Some(upload) = &spec.upload {
        if !uploaded {
            let id = status
                .backup
                .as_ref()
                .map(|b| b.id.clone())
                .unwrap_or_default();
            return Transition::with(
                ArangoBackupStatus {
                    state: BackupState::Upload,
                    progress: None,
                    message: None,
                    ..status.clone()
                },
                SideEffect::StartUpload {
                    id,
                    repository_url: upload.repository_url.clone(),
                    credentials_secret_name: upload.credentials_secret_name.clone(),
                },
            );
        }
    } else if uploaded {
        // Upload request withdrawn after success: clear the marker only,
        // no database call.
        let mut details = status.backup.clone().unwrap_or_default();
        details.uploaded = None;
        return Transition::to(ArangoBackupStatus {
            backup: Some(details),
            ..status.clone()
        });
    }

    // Steady state; refresh the version the database reports.
    let mut details = status.backup.clone().unwrap_or_default();
    if let Some(meta) = &obs.db_backup {
        details.version = Some(meta.version.clone());
    }
    Transition::to(ArangoBackupStatus {
        backup: Some(details),
        available: true,
        ..status.clone()
    })
}

fn handle_upload(
    spec: &ArangoBackupSpec,
    status: &ArangoBackupStatus,
    obs: &Observations,
) -> Transition {
    if let Some(job) = &obs.job {
        if job.failed {
            // Back to Ready with the failure recorded; the uploaded marker
            // is left untouched.
            return Transition::to(ArangoBackupStatus {
                state: BackupState::Ready,
                message: Some(
                    job.message
                        .clone()
                        .unwrap_or_else(|| "upload job failed".to_string()),
                ),
                progress: None,
                ..status.clone()
            });
        }
        if job.done {
            let mut details = status.backup.clone().unwrap_or_default();
            details.uploaded = Some(true);
            return Transition::to(ArangoBackupStatus {
                state: BackupState::Ready,
                backup: Some(details),
                progress: None,
                message: None,
                ..status.clone()
            });
        }
        let job_id = status
            .progress
            .as_ref()
            .map(|p| p.job_id.clone())
            .unwrap_or_default();
        return Transition::to(ArangoBackupStatus {
            progress: Some(BackupProgress {
                job_id,
                percent: job.percent,
            }),
            ..status.clone()
        });
    }

    if status.progress.is_none() {
        match &spec.upload {
            Some(upload) => {
                let id = status
                    .backup
                    .as_ref()
                    .map(|b| b.id.clone())
                    .unwrap_or_default();
                return Transition::with(
                    status.clone(),
                    SideEffect::StartUpload {
                        id,
                        repository_url: upload.repository_url.clone(),
                        credentials_secret_name: upload.credentials_secret_name.clone(),
                    },
                );
            }
            // Upload request withdrawn before any job started
            None => {
                return Transition::to(ArangoBackupStatus {
                    state: BackupState::Ready,
                    ..status.clone()
                });
            }
        }
    }

    Transition::to(status.clone())
}

/// A deleted backup can be re-adopted from the repository.
fn handle_deleted(spec: &ArangoBackupSpec, status: &ArangoBackupStatus) -> Transition {
    if let Some(download) = &spec.download {
        return Transition::with(
            ArangoBackupStatus {
                state: BackupState::Download,
                backup: Some(BackupDetails {
                    id: download.id.clone(),
                    downloaded: Some(false),
                    ..Default::default()
                }),
                progress: None,
                message: None,
                ..status.clone()
            },
            SideEffect::StartDownload {
                id: download.id.clone(),
                repository_url: download.repository_url.clone(),
                credentials_secret_name: download.credentials_secret_name.clone(),
            },
        );
    }

    Transition::to(status.clone())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::api::v1::{DeploymentRef, DownloadSpec, OperationSpec};

    fn spec() -> ArangoBackupSpec {
        ArangoBackupSpec {
            deployment: DeploymentRef {
                name: "cluster-a".to_string(),
            },
            options: None,
            upload: None,
            download: None,
        }
    }

    fn spec_with_upload() -> ArangoBackupSpec {
        ArangoBackupSpec {
            upload: Some(OperationSpec {
                repository_url: "s3://bucket/backups".to_string(),
                credentials_secret_name: "repo-creds".to_string(),
            }),
            ..spec()
        }
    }

    fn spec_with_download(id: &str) -> ArangoBackupSpec {
        ArangoBackupSpec {
            download: Some(DownloadSpec {
                repository_url: "s3://bucket/backups".to_string(),
                credentials_secret_name: "repo-creds".to_string(),
                id: id.to_string(),
            }),
            ..spec()
        }
    }

    fn meta(id: &str) -> BackupMeta {
        BackupMeta {
            id: id.to_string(),
            version: "3.11.4".to_string(),
            created_at: Utc::now(),
            size_in_bytes: 4096,
            nr_db_servers: 3,
            available: true,
        }
    }

    fn observed(deployment_exists: bool) -> Observations {
        Observations {
            deployment_exists,
            db_backup: None,
            job: None,
            now: Utc::now(),
        }
    }

    fn status(state: BackupState) -> ArangoBackupStatus {
        ArangoBackupStatus {
            state,
            ..Default::default()
        }
    }

    fn ready_status(id: &str) -> ArangoBackupStatus {
        ArangoBackupStatus {
            state: BackupState::Ready,
            backup: Some(BackupDetails {
                id: id.to_string(),
                version: Some("3.11.4".to_string()),
                ..Default::default()
            }),
            available: true,
            ..Default::default()
        }
    }

    fn running(percent: f32) -> JobState {
        JobState {
            done: false,
            failed: false,
            percent,
            message: None,
        }
    }

    fn finished() -> JobState {
        JobState {
            done: true,
            failed: false,
            percent: 100.0,
            message: None,
        }
    }

    fn failed_job(message: &str) -> JobState {
        JobState {
            done: false,
            failed: true,
            percent: 0.0,
            message: Some(message.to_string()),
        }
    }

    #[test]
    fn test_new_resource_becomes_pending() {
        let t = next(&spec(), &status(BackupState::None), &observed(true));
        assert_eq!(t.status.state, BackupState::Pending);
        assert_eq!(t.effect, SideEffect::None);
    }

    #[test]
    fn test_pending_waits_for_deployment() {
        let t = next(&spec(), &status(BackupState::Pending), &observed(false));
        assert_eq!(t.status.state, BackupState::Pending);
        assert!(t.status.message.as_deref().unwrap().contains("cluster-a"));
        assert_eq!(t.effect, SideEffect::None);
    }

    #[test]
    fn test_pending_schedules_once_deployment_exists() {
        let t = next(&spec(), &status(BackupState::Pending), &observed(true));
        assert_eq!(t.status.state, BackupState::Scheduled);
        assert_eq!(t.status.message, None);
    }

    #[test]
    fn test_scheduled_picks_create_without_download() {
        let t = next(&spec(), &status(BackupState::Scheduled), &observed(true));
        assert_eq!(t.status.state, BackupState::Create);
        assert_eq!(t.effect, SideEffect::CreateBackup);
    }

    #[test]
    fn test_scheduled_picks_download_when_adopting() {
        let t = next(
            &spec_with_download("remote-1"),
            &status(BackupState::Scheduled),
            &observed(true),
        );
        assert_eq!(t.status.state, BackupState::Download);
        assert_eq!(t.status.backup.as_ref().unwrap().id, "remote-1");
        assert_eq!(t.status.backup.as_ref().unwrap().downloaded, Some(false));
        assert!(matches!(t.effect, SideEffect::StartDownload { ref id, .. } if id == "remote-1"));
    }

    #[test]
    fn test_download_spec_never_creates() {
        // Walk a download resource from scratch; no pass may emit CreateBackup
        let s = spec_with_download("remote-1");
        let mut st = status(BackupState::None);
        for _ in 0..5 {
            let t = next(&s, &st, &observed(true));
            assert_ne!(t.effect, SideEffect::CreateBackup);
            st = t.status;
        }
    }

    #[test]
    fn test_create_completion_reaches_ready() {
        let st = ArangoBackupStatus {
            state: BackupState::Create,
            backup: Some(BackupDetails {
                id: "b-1".to_string(),
                version: Some("3.11.4".to_string()),
                created_at: Some(Utc::now()),
                ..Default::default()
            }),
            available: true,
            ..Default::default()
        };
        let t = next(&spec(), &st, &observed(true));
        assert_eq!(t.status.state, BackupState::Ready);
        assert!(t.status.available);
        assert_eq!(t.effect, SideEffect::None);
    }

    #[test]
    fn test_create_without_result_reissues() {
        let t = next(&spec(), &status(BackupState::Create), &observed(true));
        assert_eq!(t.status.state, BackupState::Create);
        assert_eq!(t.effect, SideEffect::CreateBackup);
    }

    #[test]
    fn test_download_running_updates_progress() {
        let st = ArangoBackupStatus {
            state: BackupState::Download,
            backup: Some(BackupDetails {
                id: "remote-1".to_string(),
                downloaded: Some(false),
                ..Default::default()
            }),
            progress: Some(BackupProgress {
                job_id: "job-7".to_string(),
                percent: 10.0,
            }),
            ..Default::default()
        };
        let obs = Observations {
            job: Some(running(42.0)),
            ..observed(true)
        };
        let t = next(&spec_with_download("remote-1"), &st, &obs);
        assert_eq!(t.status.state, BackupState::Download);
        assert_eq!(t.status.progress.as_ref().unwrap().percent, 42.0);
        assert_eq!(t.status.progress.as_ref().unwrap().job_id, "job-7");
        assert_eq!(t.effect, SideEffect::None);
    }

    #[test]
    fn test_download_done_reaches_ready_with_marker() {
        let st = ArangoBackupStatus {
            state: BackupState::Download,
            backup: Some(BackupDetails {
                id: "remote-1".to_string(),
                downloaded: Some(false),
                ..Default::default()
            }),
            progress: Some(BackupProgress {
                job_id: "job-7".to_string(),
                percent: 90.0,
            }),
            ..Default::default()
        };
        let obs = Observations {
            job: Some(finished()),
            db_backup: Some(meta("remote-1")),
            ..observed(true)
        };
        let t = next(&spec_with_download("remote-1"), &st, &obs);
        assert_eq!(t.status.state, BackupState::Ready);
        let details = t.status.backup.unwrap();
        assert_eq!(details.downloaded, Some(true));
        assert_eq!(details.version.as_deref(), Some("3.11.4"));
        assert!(t.status.available);
        assert_eq!(t.status.progress, None);
    }

    #[test]
    fn test_download_failure_is_sticky() {
        let st = ArangoBackupStatus {
            state: BackupState::Download,
            backup: Some(BackupDetails {
                id: "remote-1".to_string(),
                downloaded: Some(false),
                ..Default::default()
            }),
            progress: Some(BackupProgress {
                job_id: "job-7".to_string(),
                percent: 10.0,
            }),
            ..Default::default()
        };
        let obs = Observations {
            job: Some(failed_job("checksum mismatch")),
            ..observed(true)
        };
        let s = spec_with_download("remote-1");
        let t = next(&s, &st, &obs);
        assert_eq!(t.status.state, BackupState::DownloadError);
        assert!(t.status.message.as_deref().unwrap().contains("checksum"));

        // Same spec: stays in DownloadError, no new job
        let t2 = next(&s, &t.status, &observed(true));
        assert_eq!(t2.status.state, BackupState::DownloadError);
        assert_eq!(t2.effect, SideEffect::None);
    }

    #[test]
    fn test_download_error_retries_on_new_id() {
        let st = ArangoBackupStatus {
            state: BackupState::DownloadError,
            backup: Some(BackupDetails {
                id: "remote-1".to_string(),
                downloaded: Some(false),
                ..Default::default()
            }),
            message: Some("checksum mismatch".to_string()),
            ..Default::default()
        };
        let t = next(&spec_with_download("remote-2"), &st, &observed(true));
        assert_eq!(t.status.state, BackupState::Download);
        assert_eq!(t.status.backup.as_ref().unwrap().id, "remote-2");
        assert_eq!(t.status.progress, None);
        assert_eq!(t.status.message, None);
        assert!(matches!(t.effect, SideEffect::StartDownload { ref id, .. } if id == "remote-2"));
    }

    #[test]
    fn test_download_recovery_without_job_handle() {
        // Crash hit between the in-flight write and the job-id write
        let st = ArangoBackupStatus {
            state: BackupState::Download,
            backup: Some(BackupDetails {
                id: "remote-1".to_string(),
                downloaded: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let s = spec_with_download("remote-1");

        // The backup arrived: the lost job completed, no re-issue
        let obs = Observations {
            db_backup: Some(meta("remote-1")),
            ..observed(true)
        };
        let t = next(&s, &st, &obs);
        assert_eq!(t.status.state, BackupState::Ready);
        assert_eq!(t.effect, SideEffect::None);

        // The backup is absent: safe to re-issue
        let t = next(&s, &st, &observed(true));
        assert!(matches!(t.effect, SideEffect::StartDownload { .. }));
    }

    #[test]
    fn test_ready_requests_upload() {
        let t = next(&spec_with_upload(), &ready_with_db("b-1"), &obs_with_db("b-1"));
        assert_eq!(t.status.state, BackupState::Upload);
        assert!(matches!(t.effect, SideEffect::StartUpload { ref id, .. } if id == "b-1"));
    }

    fn ready_with_db(id: &str) -> ArangoBackupStatus {
        ready_status(id)
    }

    fn obs_with_db(id: &str) -> Observations {
        Observations {
            db_backup: Some(meta(id)),
            ..observed(true)
        }
    }

    #[test]
    fn test_ready_does_not_reupload() {
        let mut st = ready_status("b-1");
        st.backup.as_mut().unwrap().uploaded = Some(true);
        let t = next(&spec_with_upload(), &st, &obs_with_db("b-1"));
        assert_eq!(t.status.state, BackupState::Ready);
        assert_eq!(t.effect, SideEffect::None);
    }

    #[test]
    fn test_ready_clears_uploaded_marker() {
        let mut st = ready_status("b-1");
        st.backup.as_mut().unwrap().uploaded = Some(true);
        let t = next(&spec(), &st, &obs_with_db("b-1"));
        assert_eq!(t.status.state, BackupState::Ready);
        assert_eq!(t.status.backup.as_ref().unwrap().uploaded, None);
        assert_eq!(t.effect, SideEffect::None);
    }

    #[test]
    fn test_ready_detects_disappearance() {
        let t = next(&spec(), &ready_status("b-1"), &observed(true));
        assert_eq!(t.status.state, BackupState::Deleted);
        assert!(!t.status.available);
    }

    #[test]
    fn test_upload_completion_sets_marker() {
        let st = ArangoBackupStatus {
            state: BackupState::Upload,
            backup: Some(BackupDetails {
                id: "b-1".to_string(),
                ..Default::default()
            }),
            progress: Some(BackupProgress {
                job_id: "job-9".to_string(),
                percent: 80.0,
            }),
            available: true,
            ..Default::default()
        };
        let obs = Observations {
            job: Some(finished()),
            db_backup: Some(meta("b-1")),
            ..observed(true)
        };
        let t = next(&spec_with_upload(), &st, &obs);
        assert_eq!(t.status.state, BackupState::Ready);
        assert_eq!(t.status.backup.as_ref().unwrap().uploaded, Some(true));
        assert_eq!(t.status.progress, None);
    }

    #[test]
    fn test_upload_failure_returns_to_ready_without_marker() {
        let st = ArangoBackupStatus {
            state: BackupState::Upload,
            backup: Some(BackupDetails {
                id: "b-1".to_string(),
                ..Default::default()
            }),
            progress: Some(BackupProgress {
                job_id: "job-9".to_string(),
                percent: 10.0,
            }),
            available: true,
            ..Default::default()
        };
        let obs = Observations {
            job: Some(failed_job("access denied")),
            db_backup: Some(meta("b-1")),
            ..observed(true)
        };
        let t = next(&spec_with_upload(), &st, &obs);
        assert_eq!(t.status.state, BackupState::Ready);
        assert_eq!(t.status.backup.as_ref().unwrap().uploaded, None);
        assert!(t.status.message.as_deref().unwrap().contains("access denied"));
    }

    #[test]
    fn test_upload_survives_disappearance_until_done() {
        // The db backup vanished mid-upload; the job is allowed to finish
        let st = ArangoBackupStatus {
            state: BackupState::Upload,
            backup: Some(BackupDetails {
                id: "b-1".to_string(),
                ..Default::default()
            }),
            progress: Some(BackupProgress {
                job_id: "job-9".to_string(),
                percent: 50.0,
            }),
            available: true,
            ..Default::default()
        };
        let obs = Observations {
            job: Some(running(60.0)),
            db_backup: None,
            ..observed(true)
        };
        let t = next(&spec_with_upload(), &st, &obs);
        assert_eq!(t.status.state, BackupState::Upload);
    }

    #[test]
    fn test_upload_withdrawn_before_job_started() {
        let st = ArangoBackupStatus {
            state: BackupState::Upload,
            backup: Some(BackupDetails {
                id: "b-1".to_string(),
                ..Default::default()
            }),
            available: true,
            ..Default::default()
        };
        let t = next(&spec(), &st, &observed(true));
        assert_eq!(t.status.state, BackupState::Ready);
        assert_eq!(t.effect, SideEffect::None);
    }

    #[test]
    fn test_deleted_readopts_via_download() {
        let st = ArangoBackupStatus {
            state: BackupState::Deleted,
            backup: Some(BackupDetails {
                id: "b-1".to_string(),
                uploaded: Some(true),
                ..Default::default()
            }),
            available: false,
            ..Default::default()
        };
        let t = next(&spec_with_download("b-1"), &st, &observed(true));
        assert_eq!(t.status.state, BackupState::Download);
        assert!(matches!(t.effect, SideEffect::StartDownload { .. }));
    }

    #[test]
    fn test_failed_is_terminal() {
        let st = ArangoBackupStatus {
            state: BackupState::Failed,
            message: Some("create rejected".to_string()),
            ..Default::default()
        };
        for s in [spec(), spec_with_upload(), spec_with_download("x")] {
            let t = next(&s, &st, &obs_with_db("b-1"));
            assert_eq!(t.status.state, BackupState::Failed);
            assert_eq!(t.effect, SideEffect::None);
        }
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        // Applying the machine twice to identical inputs yields the same
        // status and the same (not an additional) effect.
        let cases: Vec<(ArangoBackupSpec, ArangoBackupStatus, Observations)> = vec![
            (spec(), status(BackupState::None), observed(true)),
            (spec(), status(BackupState::Pending), observed(false)),
            (spec(), status(BackupState::Scheduled), observed(true)),
            (spec_with_upload(), ready_status("b-1"), obs_with_db("b-1")),
            (
                spec_with_download("r-1"),
                status(BackupState::Scheduled),
                observed(true),
            ),
            (spec(), ready_status("b-1"), observed(true)),
        ];
        for (s, st, obs) in cases {
            let first = next(&s, &st, &obs);
            let second = next(&s, &st, &obs);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_at_most_one_job_started_per_trace() {
        // Drive a full upload round trip; count StartUpload effects between
        // job completions.
        let s = spec_with_upload();
        let mut st = status(BackupState::None);
        let mut started = 0;

        let passes: Vec<Observations> = vec![
            observed(true),     // "" -> Pending
            observed(true),     // Pending -> Scheduled
            observed(true),     // Scheduled -> Create, result synthesized below
            observed(true),     // Create -> Ready
            obs_with_db("b-1"), // Ready -> Upload (start)
            obs_with_db("b-1"), // job handle present, no progress observed yet
            Observations {
                job: Some(running(30.0)),
                db_backup: Some(meta("b-1")),
                ..observed(true)
            },
            Observations {
                job: Some(running(70.0)),
                db_backup: Some(meta("b-1")),
                ..observed(true)
            },
            Observations {
                job: Some(finished()),
                db_backup: Some(meta("b-1")),
                ..observed(true)
            },
            obs_with_db("b-1"), // Ready, uploaded
        ];

        for obs in passes {
            let t = next(&s, &st, &obs);
            st = t.status;
            match t.effect {
                SideEffect::StartUpload { .. } => {
                    started += 1;
                    // reconciler persists the job handle after starting
                    st.progress = Some(BackupProgress {
                        job_id: "job-1".to_string(),
                        percent: 0.0,
                    });
                }
                SideEffect::CreateBackup => {
                    // reconciler persists the create result
                    st.backup = Some(BackupDetails {
                        id: "b-1".to_string(),
                        version: Some("3.11.4".to_string()),
                        created_at: Some(Utc::now()),
                        ..Default::default()
                    });
                    st.available = true;
                }
                _ => {}
            }
        }

        assert_eq!(started, 1);
        assert_eq!(st.state, BackupState::Ready);
        assert_eq!(st.backup.as_ref().unwrap().uploaded, Some(true));
    }

    #[test]
    fn test_round_trip_adoption() {
        // Scenario: uploaded backup disappears, CR is recreated with a
        // download spec, and comes back Ready with the downloaded marker.
        let s = spec();
        let mut st = ready_status("b-1");
        st.backup.as_mut().unwrap().uploaded = Some(true);

        // db-side backup deleted out of band
        let t = next(&s, &st, &observed(true));
        assert_eq!(t.status.state, BackupState::Deleted);
        assert!(!t.status.available);

        // fresh CR adopting the uploaded copy
        let s2 = spec_with_download("b-1");
        let mut st2 = status(BackupState::None);
        let trace: Vec<Observations> = vec![
            observed(true),
            observed(true),
            observed(true), // Scheduled -> Download (start)
            Observations {
                job: Some(finished()),
                db_backup: Some(meta("b-1")),
                ..observed(true)
            },
        ];
        for obs in trace {
            let t = next(&s2, &st2, &obs);
            st2 = t.status;
            if matches!(t.effect, SideEffect::StartDownload { .. }) {
                st2.progress = Some(BackupProgress {
                    job_id: "job-2".to_string(),
                    percent: 0.0,
                });
            }
        }
        assert_eq!(st2.state, BackupState::Ready);
        assert_eq!(st2.backup.as_ref().unwrap().downloaded, Some(true));
        assert!(st2.available);
    }
}
