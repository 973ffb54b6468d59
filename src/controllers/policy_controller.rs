use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        watcher::Config,
    },
    Resource,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::*;

use super::Context;
use crate::api::v1::{
    ArangoBackup, ArangoBackupPolicy, ArangoBackupPolicyStatus, ArangoBackupSpec,
    ArangoDeployment, DeploymentRef,
};
use crate::util::cron;
use crate::util::errors::{Error, Result};

pub const FIELD_MANAGER: &str = "arango-backuppolicy-controller";

impl ArangoBackupPolicy {
    async fn reconcile(&self, ctx: Arc<Context>, oref: &ObjectReference) -> Result<Action> {
        let namespace = self.namespace().unwrap();
        let now = Utc::now();
        let status = self.status.clone().unwrap_or_default();

        // First pass after creation (or after a spec fix): only schedule
        let next_due = match status.scheduled {
            Some(due) => due,
            None => {
                let due = match cron::next_after(&self.spec.schedule, now) {
                    Ok(due) => due,
                    Err(e) => return self.stop_scheduling(&ctx, &namespace, e).await,
                };
                self.write_status(
                    &ctx,
                    &namespace,
                    &ArangoBackupPolicyStatus {
                        scheduled: Some(due),
                        message: None,
                    },
                )
                .await?;
                return Ok(requeue_until(due, now));
            }
        };

        if now < next_due {
            return Ok(requeue_until(next_due, now));
        }

        // Tick: fan out one backup per matched deployment
        let label_query = match selector_to_label_query(self.spec.deployment_selector.as_ref()) {
            Ok(query) => query,
            Err(e) => return self.stop_scheduling(&ctx, &namespace, e).await,
        };

        let deployments: Api<ArangoDeployment> = Api::namespaced(ctx.client.clone(), &namespace);
        let mut params = ListParams::default();
        if let Some(query) = &label_query {
            params = params.labels(query);
        }
        let matched = deployments.list(&params).await.map_err(Error::KubeError)?;

        let backups: Api<ArangoBackup> = Api::namespaced(ctx.client.clone(), &namespace);
        let stamp = now.format("%Y%m%d%H%M%S").to_string();
        let mut created = 0;
        let mut failures: Vec<String> = Vec::new();

        for deployment in matched.iter() {
            let name = deployment.name_any();
            let child = self.child_backup(&name, &stamp);
            match backups.create(&PostParams::default(), &child).await {
                Ok(_) => created += 1,
                // One deployment failing must not starve the others
                Err(e) => failures.push(format!("{}: {}", name, e)),
            }
        }

        info!(
            "Policy {:?} tick created {} backups across {} deployments",
            self.name_any(),
            created,
            matched.items.len()
        );
        self.publish_tick(&ctx, oref, created, failures.len()).await;

        let scheduled = match cron::next_after(&self.spec.schedule, now) {
            Ok(due) => due,
            Err(e) => return self.stop_scheduling(&ctx, &namespace, e).await,
        };
        self.write_status(
            &ctx,
            &namespace,
            &ArangoBackupPolicyStatus {
                scheduled: Some(scheduled),
                message: if failures.is_empty() {
                    None
                } else {
                    Some(failures.join("; "))
                },
            },
        )
        .await?;

        Ok(requeue_until(scheduled, now))
    }

    /// Build the child resource for one deployment. The scheduler never
    /// touches it again after creation.
    fn child_backup(&self, deployment: &str, stamp: &str) -> ArangoBackup {
        let template = self.spec.backup_template.clone().unwrap_or_default();
        ArangoBackup {
            metadata: ObjectMeta {
                // A tick can fan out to several deployments within one
                // second, so the timestamp alone is not unique.
                generate_name: Some(format!("{}-{}-", self.name_any(), stamp)),
                namespace: self.namespace(),
                labels: Some(self.labels().clone()).filter(|l| !l.is_empty()),
                ..Default::default()
            },
            spec: ArangoBackupSpec {
                deployment: DeploymentRef {
                    name: deployment.to_string(),
                },
                options: template.options,
                upload: template.upload,
                download: None,
            },
            status: None,
        }
    }

    /// A malformed schedule or selector stops the policy until its spec
    /// changes; the error lands in status.message.
    async fn stop_scheduling(
        &self,
        ctx: &Context,
        namespace: &str,
        error: Error,
    ) -> Result<Action> {
        warn!("Policy {:?} stopped: {}", self.name_any(), error);
        let status = self.status.clone().unwrap_or_default();
        self.write_status(
            ctx,
            namespace,
            &ArangoBackupPolicyStatus {
                message: Some(error.to_string()),
                ..status
            },
        )
        .await?;
        Ok(Action::await_change())
    }

    async fn write_status(
        &self,
        ctx: &Context,
        namespace: &str,
        status: &ArangoBackupPolicyStatus,
    ) -> Result<()> {
        let policies: Api<ArangoBackupPolicy> = Api::namespaced(ctx.client.clone(), namespace);
        policies
            .patch_status(
                &self.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(json!({ "status": status })),
            )
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn publish_tick(&self, ctx: &Context, oref: &ObjectReference, created: usize, failed: usize) {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        let event = Event {
            type_: if failed == 0 {
                EventType::Normal
            } else {
                EventType::Warning
            },
            reason: "BackupsScheduled".into(),
            note: Some(format!("Created {} backups, {} failed", created, failed)),
            action: "Scheduling".into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, oref).await {
            warn!("Failed to publish event for {:?}: {}", self.name_any(), e);
        }
    }
}

fn requeue_until(due: DateTime<Utc>, now: DateTime<Utc>) -> Action {
    let wait = (due - now).to_std().unwrap_or(std::time::Duration::ZERO);
    // Never spin below one second even when the tick is imminent
    Action::requeue(wait.max(std::time::Duration::from_secs(1)))
}

/// Render a LabelSelector as an apiserver label query. An absent or empty
/// selector matches everything.
fn selector_to_label_query(selector: Option<&LabelSelector>) -> Result<Option<String>> {
    let Some(selector) = selector else {
        return Ok(None);
    };

    let mut parts: Vec<String> = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            parts.push(format!("{}={}", key, value));
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            let values = expression.values.clone().unwrap_or_default().join(",");
            match expression.operator.as_str() {
                "In" => parts.push(format!("{} in ({})", expression.key, values)),
                "NotIn" => parts.push(format!("{} notin ({})", expression.key, values)),
                "Exists" => parts.push(expression.key.clone()),
                "DoesNotExist" => parts.push(format!("!{}", expression.key)),
                other => {
                    return Err(Error::MetadataMissing(format!(
                        "unsupported selector operator {:?}",
                        other
                    )))
                }
            }
        }
    }

    Ok(if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    })
}

#[instrument(skip(ctx, policy))]
pub async fn reconcile(policy: Arc<ArangoBackupPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("policy");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = policy.namespace().unwrap(); // policy is namespace scoped
    info!(
        "Reconciling ArangoBackupPolicy \"{}\" in {}",
        policy.name_any(),
        ns
    );

    policy.reconcile(ctx.clone(), &policy.object_ref(&())).await
}

fn error_policy(policy: Arc<ArangoBackupPolicy>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_policy_failure(&policy, error);
    Action::requeue(Duration::from_secs(60))
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: super::State) {
    let client = Client::try_default().await.expect("failed to create kube Client");

    let policies = Api::<ArangoBackupPolicy>::all(client.clone());
    if let Err(e) = policies.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    Controller::new(policies, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
