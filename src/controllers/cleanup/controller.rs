use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;

use kube::core::PartialObjectMeta;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{metadata_watcher, watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource,
};
use tokio::sync::RwLock;
use tracing::*;

use crate::controllers::{
    ensure_cluster_finalizer, remove_cluster_finalizer, update_cluster_condition, Diagnostics,
    State,
};
use crate::resources::managedclusteraddons::ManagedClusterAddOn;
use crate::resources::managedclusters::{
    ManagedCluster, CONDITION_IMPORT_SUCCEEDED, IMPORT_FINALIZER, MANIFEST_WORK_FINALIZER,
    REASON_DETACHING, REASON_FORCE_DETACHING,
};
use crate::resources::manifestworks::{
    klusterlet_crds_work_name, ManifestWork, LABEL_HOSTED_CLUSTER,
};
use crate::resources::Condition;
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::hosting::{next_graceful_deletions, next_hosting_deletions};
use super::reconcilers::sweep::{
    delete_manifest_work, force_sweep_namespace, partial_cleanup, strip_finalizers,
    work_role_binding_name,
};

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// How long a postpone-delete window stays open
    pub postpone_grace: Duration,
    /// How long to wait for the CRD work's agent acknowledgement
    pub crd_work_grace: Duration,
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
            postpone_grace: state.postpone_delete_grace,
            crd_work_grace: state.crd_work_grace,
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, mc), fields(trace_id))]
async fn reconcile(mc: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ManagedCluster>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = mc.name_any();
    let mc_api: Api<ManagedCluster> = Api::all(ctx.client.clone());

    if mc.meta().deletion_timestamp.is_none() {
        // hold the cluster until its import artefacts can be torn down
        ensure_cluster_finalizer(&mc_api, &mc, IMPORT_FINALIZER).await?;
        return Ok(Action::await_change());
    }

    info!("Reconciling deletion of ManagedCluster \"{name}\"");

    let force = mc.needs_force_detach();
    let (reason, message) = if force {
        (
            REASON_FORCE_DETACHING,
            "The cluster is being detached without waiting for agent acknowledgements",
        )
    } else {
        (REASON_DETACHING, "The cluster is being detached")
    };
    let changed = update_cluster_condition(
        &mc_api,
        &mc,
        Condition::new(CONDITION_IMPORT_SUCCEEDED, "False", reason, message),
    )
    .await?;
    if changed {
        ctx.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.to_string(),
                    note: Some(message.to_string()),
                    action: "Detach".into(),
                    secondary: None,
                },
                &mc.object_ref(&()),
            )
            .await?;
    }

    let detach = if force {
        force_detach(&ctx, &name).await
    } else {
        graceful_detach(&ctx, &mc, &name).await
    };
    let complete = match detach {
        Ok(complete) => complete,
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
            return Err(err);
        }
    };

    if complete {
        remove_cluster_finalizer(&mc_api, &mc, MANIFEST_WORK_FINALIZER).await?;
        remove_cluster_finalizer(&mc_api, &mc, IMPORT_FINALIZER).await?;
        info!("ManagedCluster \"{name}\" is fully detached");
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(Duration::from_secs(2)))
}

fn error_policy<K, C>(_mc: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Tear the cluster down while its agent still acknowledges deletions.
/// Every pass issues the deletes that are due and reports whether nothing
/// is left. Partial failures are collected so one broken object does not
/// stall the rest.
async fn graceful_detach(ctx: &Context, mc: &ManagedCluster, name: &str) -> Result<bool> {
    let now = Utc::now();
    let mut failures: Vec<String> = vec![];

    // addons first. Their finalizers belong to the addon framework, the
    // deletes are polled until the framework lets go.
    let addons: Api<ManagedClusterAddOn> = Api::namespaced(ctx.client.clone(), name);
    let mut addon_count: Option<usize> = None;
    match addons.list(&ListParams::default()).await {
        Ok(list) => {
            addon_count = Some(list.items.len());
            for addon in list
                .items
                .iter()
                .filter(|a| a.meta().deletion_timestamp.is_none())
            {
                let addon_name = addon.name_any();
                if let Err(err) = addons.delete(&addon_name, &DeleteParams::default()).await {
                    if !is_not_found(&err) {
                        failures.push(format!("addon {addon_name}: {err}"));
                    }
                }
            }
        }
        Err(err) => failures.push(format!("listing addons: {err}")),
    }

    // then the cluster-namespace works, in dependency order. The core
    // bundles stay up until the last addon finalizer has cleared; an
    // unlistable addon set counts as addons remaining.
    let works: Api<ManifestWork> = Api::namespaced(ctx.client.clone(), name);
    let mut work_count: Option<usize> = None;
    match works.list(&ListParams::default()).await {
        Ok(list) => {
            work_count = Some(list.items.len());
            let deletion_started = mc.meta().deletion_timestamp.as_ref();
            let extensions_remaining = addon_count.unwrap_or(1);
            for work in next_graceful_deletions(
                name,
                &list.items,
                extensions_remaining,
                deletion_started,
                now,
                ctx.postpone_grace,
            ) {
                if let Err(err) = delete_manifest_work(&works, &work.name_any()).await {
                    failures.push(format!("work {}: {err}", work.name_any()));
                }
            }
            // once the crds work deletion is in progress the agent that would
            // acknowledge it is already gone, so its finalizers come off
            let crds_name = klusterlet_crds_work_name(name);
            if list
                .items
                .iter()
                .any(|w| w.name_any() == crds_name && w.meta().deletion_timestamp.is_some())
            {
                if let Err(err) = strip_finalizers(&works, &crds_name).await {
                    failures.push(format!("work {crds_name}: {err}"));
                }
            }
        }
        Err(err) => failures.push(format!("listing works: {err}")),
    }

    // hosting-side works wait for the cluster namespace to drain
    let namespace_empty = namespace_drained(addon_count, work_count);
    let mut remaining = addon_count.unwrap_or(1) + work_count.unwrap_or(1);
    let all_works: Api<ManifestWork> = Api::all(ctx.client.clone());
    match all_works
        .list(&ListParams::default().labels(&format!("{LABEL_HOSTED_CLUSTER}={name}")))
        .await
    {
        Ok(list) => {
            remaining += list.items.len();
            if namespace_empty {
                for work in next_hosting_deletions(&list.items) {
                    let namespace = work
                        .meta()
                        .namespace
                        .clone()
                        .unwrap_or_else(|| name.to_string());
                    let api: Api<ManifestWork> = Api::namespaced(ctx.client.clone(), &namespace);
                    if let Err(err) = delete_manifest_work(&api, &work.name_any()).await {
                        failures.push(format!("hosting work {}: {err}", work.name_any()));
                    }
                }
            }
        }
        Err(err) => failures.push(format!("listing hosting works: {err}")),
    }

    // the agent's work rolebinding goes last, it is needed to report the
    // work deletions above
    if remaining == 0 && failures.is_empty() {
        let role_bindings: Api<k8s_openapi::api::rbac::v1::RoleBinding> =
            Api::namespaced(ctx.client.clone(), name);
        let rb_name = work_role_binding_name(name);
        match role_bindings.get_opt(&rb_name).await {
            Ok(Some(_)) => {
                remaining += 1;
                if let Err(err) = role_bindings.delete(&rb_name, &DeleteParams::default()).await {
                    if !is_not_found(&err) {
                        failures.push(format!("rolebinding {rb_name}: {err}"));
                    }
                }
            }
            Ok(None) => {}
            Err(err) => failures.push(format!("rolebinding {rb_name}: {err}")),
        }
    }

    partial_cleanup(failures)?;
    Ok(remaining == 0)
}

/// Whether the cluster namespace is verifiably empty. A list that failed
/// leaves the answer unknown, which counts as not drained.
fn namespace_drained(addon_count: Option<usize>, work_count: Option<usize>) -> bool {
    addon_count == Some(0) && work_count == Some(0)
}

/// Tear the cluster down without agent acknowledgements. The cluster
/// namespace is force swept; hosting-side works are deleted normally since
/// the hosting cluster is still reachable.
async fn force_detach(ctx: &Context, name: &str) -> Result<bool> {
    let now = Utc::now();
    let mut clean = force_sweep_namespace(&ctx.client, name, now, ctx.crd_work_grace).await?;

    let all_works: Api<ManifestWork> = Api::all(ctx.client.clone());
    let hosting = all_works
        .list(&ListParams::default().labels(&format!("{LABEL_HOSTED_CLUSTER}={name}")))
        .await?;
    if !hosting.items.is_empty() {
        clean = false;
        for work in next_hosting_deletions(&hosting.items) {
            let namespace = work
                .meta()
                .namespace
                .clone()
                .unwrap_or_else(|| name.to_string());
            let api: Api<ManifestWork> = Api::namespaced(ctx.client.clone(), &namespace);
            delete_manifest_work(&api, &work.name_any()).await?;
        }
    }

    Ok(clean)
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let mc_api = Api::<ManagedCluster>::all(client.clone());
    let work_api = Api::<ManifestWork>::all(client.clone());
    let addon_api = Api::<ManagedClusterAddOn>::all(client.clone());

    let work_watcher = watcher(work_api, Config::default())
        .map(ensure_deletion_change)
        .touched_objects()
        .predicate_filter(changed_predicate.combine(work_predicate));

    let addon_watcher = metadata_watcher(addon_api, Config::default())
        .map(ensure_deletion_change)
        .touched_objects()
        .predicate_filter(changed_predicate);

    Controller::new(mc_api, Config::default())
        .shutdown_on_signal()
        .watches_stream(work_watcher, |work: ManifestWork| {
            if let Some(cluster) = work.labels().get(LABEL_HOSTED_CLUSTER) {
                return Some(ObjectRef::<ManagedCluster>::new(cluster));
            }
            work.meta()
                .namespace
                .as_deref()
                .map(ObjectRef::<ManagedCluster>::new)
        })
        .watches_stream(
            addon_watcher,
            |addon: PartialObjectMeta<ManagedClusterAddOn>| {
                addon
                    .meta()
                    .namespace
                    .as_deref()
                    .map(ObjectRef::<ManagedCluster>::new)
            },
        )
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

/// Spec and status both matter here: the teardown ordering is driven by
/// Applied and Deleting acknowledgements.
fn work_predicate(obj: &ManifestWork) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    serde_hashkey::to_key(&obj.spec)
        .expect("serde_hashkey never to return an error")
        .hash(&mut hasher);
    if let Some(status) = &obj.status {
        serde_hashkey::to_key(status)
            .expect("serde_hashkey never to return an error")
            .hash(&mut hasher);
    }
    Some(hasher.finish())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hosting_works_wait_for_a_verifiably_empty_namespace() {
        assert!(namespace_drained(Some(0), Some(0)));

        assert!(!namespace_drained(Some(1), Some(0)));
        assert!(!namespace_drained(Some(0), Some(2)));

        // a failed list is not an empty namespace
        assert!(!namespace_drained(Some(0), None));
        assert!(!namespace_drained(None, Some(0)));
    }
}
