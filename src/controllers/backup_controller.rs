use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
    },
    Resource,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::*;

use super::backup_machine::{self, Observations, SideEffect};
use super::Context;
use crate::api::v1::{
    ArangoBackup, ArangoBackupStatus, ArangoDeployment, BackupDetails, BackupProgress,
    BackupState, BACKUP_FINALIZER,
};
use crate::util::errors::{is_kube_conflict, Error, Result};

pub const FIELD_MANAGER: &str = "arango-backup-controller";

/// Requeue delay after a transient database failure while a side effect
/// was being issued
const EFFECT_RETRY: Duration = Duration::from_secs(30);

impl ArangoBackup {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>, oref: &ObjectReference) -> Result<Action> {
        let namespace = self.namespace().unwrap();
        let status = self.status.clone().unwrap_or_default();

        // A vanished deployment is only meaningful while we wait for it in
        // Pending; in any later state the database is simply unreachable, so
        // hold position instead of feeding the machine unobservable state.
        let deployment_exists = self.deployment_exists(&ctx, &namespace).await?;
        if !deployment_exists
            && !matches!(status.state, BackupState::None | BackupState::Pending)
        {
            info!(
                "Deployment {:?} of backup {:?} is gone; holding state {}",
                self.spec.deployment.name,
                self.name_any(),
                status.state
            );
            return Ok(Action::requeue(Duration::from_secs(60)));
        }

        let (observations, job_lost) = self.observe(&ctx, &namespace, &status, deployment_exists).await?;

        if job_lost {
            // The database no longer knows the persisted job; drop the handle
            // so the next pass runs the in-flight recovery probe.
            let mut cleared = status.clone();
            cleared.progress = None;
            self.write_status(&ctx, &namespace, &cleared).await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }

        let transition = backup_machine::next(&self.spec, &status, &observations);
        let next_state = transition.status.state;

        let action = match transition.effect {
            SideEffect::None => {
                if transition.status != status {
                    self.write_status(&ctx, &namespace, &transition.status).await?;
                }
                requeue_for(next_state)
            }
            SideEffect::CreateBackup => {
                self.run_create(&ctx, &namespace, oref, &status, transition.status)
                    .await?
            }
            SideEffect::StartUpload {
                id,
                repository_url,
                credentials_secret_name,
            } => {
                self.run_transfer(
                    &ctx,
                    &namespace,
                    oref,
                    &status,
                    transition.status,
                    TransferKind::Upload,
                    &id,
                    &repository_url,
                    &credentials_secret_name,
                )
                .await?
            }
            SideEffect::StartDownload {
                id,
                repository_url,
                credentials_secret_name,
            } => {
                self.run_transfer(
                    &ctx,
                    &namespace,
                    oref,
                    &status,
                    transition.status,
                    TransferKind::Download,
                    &id,
                    &repository_url,
                    &credentials_secret_name,
                )
                .await?
            }
        };

        if next_state != status.state {
            self.publish_transition(&ctx, oref, status.state, next_state).await;
        }

        Ok(action)
    }

    async fn deployment_exists(&self, ctx: &Context, namespace: &str) -> Result<bool> {
        let deployments: Api<ArangoDeployment> = Api::namespaced(ctx.client.clone(), namespace);
        Ok(deployments
            .get_opt(&self.spec.deployment.name)
            .await
            .map_err(Error::KubeError)?
            .is_some())
    }

    /// Gather the observation snapshot for this pass. The second value is
    /// true when the database has forgotten the job the status points at.
    async fn observe(
        &self,
        ctx: &Context,
        namespace: &str,
        status: &ArangoBackupStatus,
        deployment_exists: bool,
    ) -> Result<(Observations, bool)> {
        let mut observations = Observations {
            deployment_exists,
            db_backup: None,
            job: None,
            now: Utc::now(),
        };

        if !deployment_exists {
            return Ok((observations, false));
        }

        let client = ctx
            .backups
            .get(namespace, &self.spec.deployment.name)
            .await;

        let tracked_id = match status.state {
            BackupState::Download | BackupState::DownloadError => self
                .spec
                .download
                .as_ref()
                .map(|d| d.id.clone())
                .or_else(|| status.backup.as_ref().map(|b| b.id.clone())),
            _ => status.backup.as_ref().map(|b| b.id.clone()),
        };

        if let Some(id) = &tracked_id {
            observations.db_backup = client.list_one(id).await?;
        }

        if let Some(progress) = &status.progress {
            let polled = match status.state {
                BackupState::Upload => Some(client.upload_progress(&progress.job_id).await),
                BackupState::Download => Some(client.download_progress(&progress.job_id).await),
                _ => None,
            };
            match polled {
                Some(Ok(job)) => observations.job = Some(job),
                Some(Err(Error::BackupNotFound(_))) => return Ok((observations, true)),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }

        Ok((observations, false))
    }

    /// Issue the synchronous create and persist its result. The in-flight
    /// status is written first so a crash leaves a resumable `Create`.
    async fn run_create(
        &self,
        ctx: &Context,
        namespace: &str,
        oref: &ObjectReference,
        previous: &ArangoBackupStatus,
        mut status: ArangoBackupStatus,
    ) -> Result<Action> {
        if &status != previous {
            self.write_status(ctx, namespace, &status).await?;
        }

        let client = ctx
            .backups
            .get(namespace, &self.spec.deployment.name)
            .await;

        match client.create(self.spec.options.as_ref()).await {
            Ok(meta) => {
                status.backup = Some(BackupDetails {
                    id: meta.id,
                    version: Some(meta.version),
                    created_at: Some(meta.created_at),
                    ..Default::default()
                });
                status.available = true;
                status.message = None;
                self.write_status(ctx, namespace, &status).await?;
                Ok(Action::requeue(Duration::from_secs(1)))
            }
            Err(e) if e.is_temporary() => {
                status.message = Some(e.to_string());
                self.write_status(ctx, namespace, &status).await?;
                Ok(Action::requeue(EFFECT_RETRY))
            }
            Err(e) => {
                warn!("Create for backup {:?} rejected: {}", self.name_any(), e);
                status.state = BackupState::Failed;
                status.message = Some(e.to_string());
                self.write_status(ctx, namespace, &status).await?;
                self.publish_transition(ctx, oref, BackupState::Create, BackupState::Failed)
                    .await;
                Ok(Action::await_change())
            }
        }
    }

    /// Start an upload or download under the two-phase write discipline:
    /// persist the in-flight state, issue the call, persist the job handle.
    #[allow(clippy::too_many_arguments)]
    async fn run_transfer(
        &self,
        ctx: &Context,
        namespace: &str,
        oref: &ObjectReference,
        previous: &ArangoBackupStatus,
        mut status: ArangoBackupStatus,
        kind: TransferKind,
        id: &str,
        repository_url: &str,
        credentials_secret_name: &str,
    ) -> Result<Action> {
        if &status != previous {
            self.write_status(ctx, namespace, &status).await?;
        }

        let token =
            match read_repository_token(&ctx.client, namespace, credentials_secret_name).await {
                Ok(token) => token,
                Err(e) if e.is_temporary() => return Err(e),
                Err(e) => return self.fail_transfer(ctx, namespace, oref, status, kind, e).await,
            };

        let client = ctx
            .backups
            .get(namespace, &self.spec.deployment.name)
            .await;

        let started = match kind {
            TransferKind::Upload => client.upload(id, repository_url, token).await,
            TransferKind::Download => client.download(id, repository_url, token).await,
        };

        match started {
            Ok(job_id) => {
                status.progress = Some(BackupProgress {
                    job_id,
                    percent: 0.0,
                });
                self.write_status(ctx, namespace, &status).await?;
                Ok(requeue_for(status.state))
            }
            Err(e) if e.is_temporary() => {
                status.message = Some(e.to_string());
                self.write_status(ctx, namespace, &status).await?;
                Ok(Action::requeue(EFFECT_RETRY))
            }
            Err(e) => self.fail_transfer(ctx, namespace, oref, status, kind, e).await,
        }
    }

    /// A permanently rejected upload fails the resource; a rejected download
    /// lands in DownloadError so a corrected spec can retry it.
    async fn fail_transfer(
        &self,
        ctx: &Context,
        namespace: &str,
        oref: &ObjectReference,
        mut status: ArangoBackupStatus,
        kind: TransferKind,
        error: Error,
    ) -> Result<Action> {
        warn!(
            "{:?} for backup {:?} rejected: {}",
            kind,
            self.name_any(),
            error
        );
        let from = status.state;
        status.state = match kind {
            TransferKind::Upload => BackupState::Failed,
            TransferKind::Download => BackupState::DownloadError,
        };
        status.message = Some(error.to_string());
        status.progress = None;
        self.write_status(ctx, namespace, &status).await?;
        self.publish_transition(ctx, oref, from, status.state).await;
        Ok(Action::await_change())
    }

    async fn write_status(
        &self,
        ctx: &Context,
        namespace: &str,
        status: &ArangoBackupStatus,
    ) -> Result<()> {
        let backups: Api<ArangoBackup> = Api::namespaced(ctx.client.clone(), namespace);
        backups
            .patch_status(
                &self.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(json!({ "status": status })),
            )
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn publish_transition(
        &self,
        ctx: &Context,
        oref: &ObjectReference,
        from: BackupState,
        to: BackupState,
    ) {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        let type_ = match to {
            BackupState::Failed | BackupState::DownloadError => EventType::Warning,
            _ => EventType::Normal,
        };
        // Event publishing is best effort; a failed event never fails the pass
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: to.to_string(),
                    note: Some(match from {
                        BackupState::None => format!("Entered {}", to),
                        _ => format!("Transition from {} to {}", from, to),
                    }),
                    action: "Reconciling".into(),
                    secondary: None,
                },
                oref,
            )
            .await
        {
            warn!("Failed to publish event for {:?}: {}", self.name_any(), e);
        }
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>, oref: &ObjectReference) -> Result<Action> {
        let namespace = self.namespace().unwrap();
        let status = self.status.clone().unwrap_or_default();

        if let Some(details) = &status.backup {
            // Without the deployment there is no database to clean up
            if self.deployment_exists(&ctx, &namespace).await? {
                let client = ctx
                    .backups
                    .get(&namespace, &self.spec.deployment.name)
                    .await;
                match client.delete(&details.id).await {
                    Ok(()) => info!(
                        "Removed database backup {:?} for deleted resource {:?}",
                        details.id,
                        self.name_any()
                    ),
                    Err(Error::BackupNotFound(_)) => {}
                    Err(e) if e.is_temporary() => return Err(e),
                    Err(e) => warn!(
                        "Could not remove database backup {:?}: {}; releasing anyway",
                        details.id, e
                    ),
                }
            }
        }

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteRequested".into(),
                    note: Some(format!("Delete `{}`", self.name_any())),
                    action: "Deleting".into(),
                    secondary: None,
                },
                oref,
            )
            .await
            .map_err(Error::KubeError)?;
        Ok(Action::await_change())
    }
}

#[derive(Clone, Copy, Debug)]
enum TransferKind {
    Upload,
    Download,
}

/// Requeue cadence by state: in-flight states poll in seconds, Ready gets a
/// periodic resync, terminal-ish states wait for a spec change.
fn requeue_for(state: BackupState) -> Action {
    match state {
        BackupState::None | BackupState::Scheduled => Action::requeue(Duration::from_secs(1)),
        BackupState::Pending => Action::requeue(Duration::from_secs(15)),
        BackupState::Create | BackupState::Upload | BackupState::Download => {
            Action::requeue(Duration::from_secs(10))
        }
        BackupState::Ready => Action::requeue(Duration::from_secs(5 * 60)),
        BackupState::Deleted | BackupState::DownloadError | BackupState::Failed => {
            Action::await_change()
        }
    }
}

async fn read_repository_token(
    client: &Client,
    namespace: &str,
    secret_name: &str,
) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get(secret_name).await.map_err(Error::KubeError)?;

    let data = secret.data.as_ref().ok_or_else(|| {
        Error::MetadataMissing(format!("secret {:?} has no data", secret_name))
    })?;
    let token = data.get("token").ok_or_else(|| {
        Error::MetadataMissing(format!("secret {:?} has no `token` key", secret_name))
    })?;

    String::from_utf8(token.0.clone())
        .map_err(|_| Error::MetadataMissing(format!("secret {:?} token is not UTF-8", secret_name)))
}

#[instrument(skip(ctx, backup))]
pub async fn reconcile(backup: Arc<ArangoBackup>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("backup");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = backup.namespace().unwrap(); // backup is namespace scoped
    let backups: Api<ArangoBackup> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling ArangoBackup \"{}\" in {}", backup.name_any(), ns);
    finalizer(&backups, BACKUP_FINALIZER, backup.clone(), |event| async {
        match event {
            Finalizer::Apply(backup) => backup.reconcile(ctx.clone(), &backup.object_ref(&())).await,
            Finalizer::Cleanup(backup) => {
                backup.cleanup(ctx.clone(), &backup.object_ref(&())).await
            }
        }
    })
    .await
    .map_err(|e| {
        error!("Failed to reconcile backup: {}", e);
        Error::FinalizerError(Box::new(e))
    })
}

fn error_policy(backup: Arc<ArangoBackup>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_backup_failure(&backup, error);
    // A conflict just means our snapshot went stale mid-pass
    if let Error::KubeError(e) = error {
        if is_kube_conflict(e) {
            return Action::requeue(Duration::from_secs(1));
        }
    }
    Action::requeue(Duration::from_secs(60))
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: super::State) {
    let client = Client::try_default().await.expect("failed to create kube Client");

    let backups = Api::<ArangoBackup>::all(client.clone());
    if let Err(e) = backups.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    Controller::new(backups, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
