use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;

use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource,
};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::*;

use crate::controllers::manifestwork::reconcilers::bundles::{
    apply_manifest_work, hosted_kubeconfig_work,
};
use crate::controllers::{update_cluster_condition, Diagnostics, State};
use crate::resources::imports::{
    import_secret_name, ImportPayload, ANNOTATION_CURRENT_RETRY, ANNOTATION_KEEP_AUTO_IMPORT_SECRET,
    AUTO_IMPORT_SECRET_NAME,
};
use crate::resources::managedclusters::{
    KlusterletDeployMode, ManagedCluster, CONDITION_IMPORT_SUCCEEDED, REASON_IMPORTING,
    REASON_IMPORTED, REASON_IMPORT_FAILED, REASON_WAIT_FOR_IMPORTING,
};
use crate::resources::manifestworks::ManifestWork;
use crate::resources::Condition;
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::apply::apply_import_payload;
use super::reconcilers::credentials::{
    client_from_kubeconfig, credential_kind, kubeconfig_from_secret, CredentialKind,
};
use super::reconcilers::retry::{retry_decision, RetryBudget, RetryDecision};
use super::reconcilers::rosa::{RosaCredentials, RosaTokenGetter};

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Delay between import attempts
    pub retry_period: Duration,
    /// Per-cluster OCM state that outlives single attempts
    pub rosa_getters: Arc<Mutex<HashMap<String, RosaTokenGetter>>>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "cluster-import-operator".into()),
            retry_period: state.import_retry_period,
            rosa_getters: Arc::new(Mutex::new(HashMap::new())),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

/// What the credential secret resolved to, before any network traffic
enum ResolvedCredential {
    Kubeconfig(kube::config::Kubeconfig),
    Rosa(RosaCredentials),
}

#[instrument(skip(ctx, mc), fields(trace_id))]
async fn reconcile(mc: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ManagedCluster>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = mc.name_any();

    if mc.meta().deletion_timestamp.is_some() {
        // teardown belongs to the cleanup controller
        return Ok(Action::await_change());
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &name);
    let secret = match secrets.get_opt(AUTO_IMPORT_SECRET_NAME).await? {
        // without credentials there is nothing to drive
        None => return Ok(Action::await_change()),
        Some(secret) => secret,
    };

    info!("Reconciling auto import of ManagedCluster \"{name}\"");
    match sync_auto_import(&mc, &ctx, &secrets, secret).await {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &mc.object_ref(&()),
                )
                .await?;

            ctx.metrics.reconcile_failure(mc.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy<K, C>(_mc: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

async fn sync_auto_import(
    mc: &ManagedCluster,
    ctx: &Context,
    secrets: &Api<Secret>,
    secret: Secret,
) -> Result<Action> {
    let name = mc.name_any();
    let mc_api: Api<ManagedCluster> = Api::all(ctx.client.clone());

    // a kept credential secret must not drive the import all over again
    if mc.is_imported() {
        return Ok(Action::await_change());
    }

    // everything rejected here is wrong in the secret itself: record the
    // terminal condition and preserve the secret for inspection
    let (budget, mode, resolved) = match validate(mc, &name, &secret) {
        Ok(parts) => parts,
        Err(err) => {
            warn!("credential secret for cluster {name} is invalid: {err}");
            update_cluster_condition(
                &mc_api,
                mc,
                Condition::new(
                    CONDITION_IMPORT_SUCCEEDED,
                    "False",
                    REASON_IMPORT_FAILED,
                    &format!("AutoImportSecretInvalid {name}/{AUTO_IMPORT_SECRET_NAME}; {err}"),
                ),
            )
            .await?;
            ctx.metrics.import_attempt(&name, "invalid");
            return Ok(Action::await_change());
        }
    };

    if budget.exhausted() {
        // a previous pass already burned the budget, wait for new credentials
        return Ok(Action::await_change());
    }

    // the rendered payload has to exist before an attempt can do anything
    let payload = if mode.is_hosted_side() {
        None
    } else {
        match secrets.get_opt(&import_secret_name(&name)).await? {
            Some(import_secret) => Some(ImportPayload::from_secret(&name, &import_secret)?),
            None => {
                update_cluster_condition(
                    &mc_api,
                    mc,
                    Condition::new(
                        CONDITION_IMPORT_SUCCEEDED,
                        "False",
                        REASON_WAIT_FOR_IMPORTING,
                        &format!("Waiting for the import secret {name}/{} to be created", import_secret_name(&name)),
                    ),
                )
                .await?;
                return Ok(Action::requeue(ctx.retry_period));
            }
        }
    };

    match attempt_import(mc, ctx, &name, mode, &resolved, payload.as_ref()).await {
        Ok(()) => {
            let changed = update_cluster_condition(
                &mc_api,
                mc,
                Condition::new(
                    CONDITION_IMPORT_SUCCEEDED,
                    "True",
                    REASON_IMPORTED,
                    "Import succeeded",
                ),
            )
            .await?;
            if changed {
                ctx.recorder
                    .publish(
                        &Event {
                            type_: EventType::Normal,
                            reason: "ManagedClusterImported".into(),
                            note: Some(format!("The cluster {name} is imported")),
                            action: "Import".into(),
                            secondary: None,
                        },
                        &mc.object_ref(&()),
                    )
                    .await?;
            }
            ctx.metrics.import_attempt(&name, "success");

            finish_credential_flow(ctx, secrets, &secret, &name, &resolved).await;
            Ok(Action::await_change())
        }
        Err(err) => {
            match retry_decision(budget, err.is_retryable(), ctx.retry_period) {
                RetryDecision::Retry { next, after } => {
                    warn!("import attempt {next}/{} for cluster {name} failed: {err}", budget.total);
                    persist_retry_counter(secrets, &secret, next).await?;
                    update_cluster_condition(
                        &mc_api,
                        mc,
                        Condition::new(
                            CONDITION_IMPORT_SUCCEEDED,
                            "False",
                            REASON_IMPORTING,
                            &format!("Importing, attempt {next} of {}: {err}", budget.total),
                        ),
                    )
                    .await?;
                    ctx.metrics.import_attempt(&name, "retry");
                    Ok(Action::requeue(after))
                }
                RetryDecision::Terminal { next } => {
                    warn!("giving up importing cluster {name} after attempt {next}: {err}");
                    persist_retry_counter(secrets, &secret, next).await?;
                    update_cluster_condition(
                        &mc_api,
                        mc,
                        Condition::new(
                            CONDITION_IMPORT_SUCCEEDED,
                            "False",
                            REASON_IMPORT_FAILED,
                            &format!("Import failed after {next} attempt(s): {err}"),
                        ),
                    )
                    .await?;
                    ctx.metrics.import_attempt(&name, "failed");

                    finish_credential_flow(ctx, secrets, &secret, &name, &resolved).await;
                    Ok(Action::await_change())
                }
            }
        }
    }
}

/// Static validation of the credential secret: budget, deploy mode and
/// credential shape. No network traffic happens here.
fn validate(
    mc: &ManagedCluster,
    name: &str,
    secret: &Secret,
) -> Result<(RetryBudget, KlusterletDeployMode, ResolvedCredential)> {
    let budget = RetryBudget::from_secret(name, secret)?;
    let mode = mc.deploy_mode()?;
    if mode.is_hosted_side() {
        // the hosting flow needs the name up front
        mc.hosting_cluster()?;
    }

    let resolved = match credential_kind(name, secret)? {
        CredentialKind::Rosa if mode.is_hosted_side() => {
            return Err(Error::InvalidCredential(
                name.to_string(),
                "rosa credentials cannot drive a hosted import".to_string(),
            ))
        }
        CredentialKind::Rosa => ResolvedCredential::Rosa(RosaCredentials::from_secret(name, secret)?),
        _ => ResolvedCredential::Kubeconfig(kubeconfig_from_secret(name, secret)?),
    };

    Ok((budget, mode, resolved))
}

/// One import attempt. Failures are charged against the retry budget.
async fn attempt_import(
    mc: &ManagedCluster,
    ctx: &Context,
    name: &str,
    mode: KlusterletDeployMode,
    resolved: &ResolvedCredential,
    payload: Option<&ImportPayload>,
) -> Result<()> {
    if mode.is_hosted_side() {
        let kubeconfig = match resolved {
            ResolvedCredential::Kubeconfig(kubeconfig) => serde_yaml::to_string(kubeconfig)?,
            ResolvedCredential::Rosa(_) => {
                return Err(Error::InvalidCredential(
                    name.to_string(),
                    "rosa credentials cannot drive a hosted import".to_string(),
                ))
            }
        };
        let hosting = mc.hosting_cluster()?;
        let works: Api<ManifestWork> = Api::namespaced(ctx.client.clone(), &hosting);
        apply_manifest_work(&works, hosted_kubeconfig_work(name, &hosting, &kubeconfig)).await?;
        return Ok(());
    }

    let payload = payload.ok_or_else(|| {
        Error::InvalidImportSecret(name.to_string(), "the import payload vanished".to_string())
    })?;

    let target = match resolved {
        ResolvedCredential::Kubeconfig(kubeconfig) => {
            client_from_kubeconfig(kubeconfig.clone()).await?
        }
        ResolvedCredential::Rosa(creds) => {
            // the map lock covers only the checkout, the OCM calls run
            // unlocked so unrelated clusters do not serialize behind them
            let mut getter = checkout_token_getter(&ctx.rosa_getters, name).await;
            let token_result = getter.cluster_token(creds).await;
            checkin_token_getter(&ctx.rosa_getters, name, getter).await;
            let (api_url, token) = token_result?;
            let kubeconfig =
                super::reconcilers::credentials::kubeconfig_for_token(&api_url, &token, None)?;
            client_from_kubeconfig(kubeconfig).await?
        }
    };

    apply_import_payload(&target, name, payload).await
}

/// End of the flow, successful or not: drop the ephemeral OCM identity and
/// the credential secret (unless the user asked to keep it). Best effort,
/// the flow outcome is already recorded.
async fn finish_credential_flow(
    ctx: &Context,
    secrets: &Api<Secret>,
    secret: &Secret,
    name: &str,
    resolved: &ResolvedCredential,
) {
    if let ResolvedCredential::Rosa(creds) = resolved {
        let getter = ctx.rosa_getters.lock().await.remove(name);
        if let Some(mut getter) = getter {
            if let Err(err) = getter.cleanup(creds).await {
                warn!("failed to clean up the rosa import identity for cluster {name}: {err}");
            }
        }
    }

    let keep = secret
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_KEEP_AUTO_IMPORT_SECRET));
    if keep {
        return;
    }

    if let Err(err) = secrets
        .delete(AUTO_IMPORT_SECRET_NAME, &DeleteParams::default())
        .await
    {
        if !matches!(&err, kube::Error::Api(e) if e.code == 404) {
            warn!("failed to delete the auto import secret of cluster {name}: {err}");
        }
    }
}

/// Take a cluster's token getter out of the shared map. The map lock is
/// released before any OCM traffic happens.
async fn checkout_token_getter(
    getters: &Mutex<HashMap<String, RosaTokenGetter>>,
    cluster: &str,
) -> RosaTokenGetter {
    getters.lock().await.remove(cluster).unwrap_or_default()
}

async fn checkin_token_getter(
    getters: &Mutex<HashMap<String, RosaTokenGetter>>,
    cluster: &str,
    getter: RosaTokenGetter,
) {
    getters.lock().await.insert(cluster.to_string(), getter);
}

async fn persist_retry_counter(secrets: &Api<Secret>, secret: &Secret, next: u32) -> Result<()> {
    secrets
        .patch(
            &secret.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({
                "metadata": { "annotations": { ANNOTATION_CURRENT_RETRY: next.to_string() } }
            })),
        )
        .await?;
    Ok(())
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let mc_api = Api::<ManagedCluster>::all(client.clone());
    let secret_api = Api::<Secret>::all(client.clone());

    // secrets have no generation, hash the data to catch payload edits
    let secret_watcher = watcher(secret_api, Config::default())
        .map(ensure_deletion_change)
        .touched_objects()
        .predicate_filter(changed_predicate.combine(secret_data_predicate));

    Controller::new(mc_api, Config::default())
        .shutdown_on_signal()
        .watches_stream(secret_watcher, |secret: Secret| {
            let namespace = secret.meta().namespace.clone()?;
            let name = secret.name_any();
            if name == AUTO_IMPORT_SECRET_NAME || name == import_secret_name(&namespace) {
                Some(ObjectRef::<ManagedCluster>::new(&namespace))
            } else {
                None
            }
        })
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<watcher::Event<K>, E>,
) -> Result<watcher::Event<K>, E> {
    if let Ok(watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    Some(hasher.finish())
}

fn secret_data_predicate(obj: &Secret) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(data) = &obj.data {
        for (k, v) in data {
            k.hash(&mut hasher);
            v.0.hash(&mut hasher);
        }
    }
    obj.type_.hash(&mut hasher);
    Some(hasher.finish())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn token_getter_checkout_releases_the_map() {
        let getters = Mutex::new(HashMap::new());

        let getter = checkout_token_getter(&getters, "c1").await;
        // while c1's token flow is in flight, other clusters get the map
        assert!(getters.try_lock().is_ok());

        checkin_token_getter(&getters, "c1", getter).await;
        assert!(getters.lock().await.contains_key("c1"));
    }
}
