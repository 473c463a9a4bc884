use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;

use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, ListParams, ResourceExt},
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
    ensure_cluster_finalizer, remove_cluster_finalizer, Diagnostics, State,
};
use crate::resources::imports::{import_secret_name, ImportPayload};
use crate::resources::managedclusters::{ManagedCluster, MANIFEST_WORK_FINALIZER};
use crate::resources::manifestworks::{ManifestWork, LABEL_HOSTED_CLUSTER};
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::bundles::{apply_manifest_work, desired_bundles};

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State) -> Arc<Context> {
        Arc::new(Context {
            client,
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

    match sync_manifest_works(&mc, &ctx).await {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);
            ctx.metrics.reconcile_failure(mc.as_ref(), &err);
            Err(err)
        }
    }
}

async fn sync_manifest_works(mc: &ManagedCluster, ctx: &Context) -> Result<Action> {
    let name = mc.name_any();
    let mc_api: Api<ManagedCluster> = Api::all(ctx.client.clone());

    let count = count_cluster_works(&ctx.client, &name).await?;

    if mc.meta().deletion_timestamp.is_some() {
        // the cleanup controller drives the teardown ordering, we only
        // retire our finalizer once nothing is left to track
        if count == 0 {
            remove_cluster_finalizer(&mc_api, &mc, MANIFEST_WORK_FINALIZER).await?;
        }
        return Ok(Action::await_change());
    }

    if !mc.is_joined() {
        if count == 0 {
            remove_cluster_finalizer(&mc_api, &mc, MANIFEST_WORK_FINALIZER).await?;
        }
        return Ok(Action::await_change());
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &name);
    let secret = match secrets.get_opt(&import_secret_name(&name)).await? {
        // the payload has not been rendered yet
        None => {
            if count == 0 {
                remove_cluster_finalizer(&mc_api, mc, MANIFEST_WORK_FINALIZER).await?;
            }
            return Ok(Action::await_change());
        }
        Some(secret) => secret,
    };
    let payload = ImportPayload::from_secret(&name, &secret)?;

    info!("Reconciling manifest works of ManagedCluster \"{name}\"");

    // the finalizer has to be in place before the first work exists
    ensure_cluster_finalizer(&mc_api, &mc, MANIFEST_WORK_FINALIZER).await?;

    for desired in desired_bundles(&mc, &payload)? {
        let namespace = desired
            .meta()
            .namespace
            .clone()
            .unwrap_or_else(|| name.clone());
        let works: Api<ManifestWork> = Api::namespaced(ctx.client.clone(), &namespace);
        apply_manifest_work(&works, desired).await?;
    }

    Ok(Action::await_change())
}

fn error_policy<K, C>(_mc: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

/// Works belonging to a cluster: everything in its namespace plus
/// hosting-side works carrying its label.
async fn count_cluster_works(client: &Client, cluster: &str) -> Result<usize> {
    let ns_works: Api<ManifestWork> = Api::namespaced(client.clone(), cluster);
    let all_works: Api<ManifestWork> = Api::all(client.clone());

    let mut count = ns_works.list(&ListParams::default()).await?.items.len();
    count += all_works
        .list(&ListParams::default().labels(&format!("{LABEL_HOSTED_CLUSTER}={cluster}")))
        .await?
        .items
        .len();
    Ok(count)
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let mc_api = Api::<ManagedCluster>::all(client.clone());
    let work_api = Api::<ManifestWork>::all(client.clone());
    let secret_api = Api::<Secret>::all(client.clone());

    if let Err(e) = work_api.list(&ListParams::default().limit(1)).await {
        error!("ManifestWork is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let work_watcher = watcher(work_api, Config::default())
        .map(ensure_deletion_change)
        .touched_objects()
        .predicate_filter(changed_predicate.combine(work_spec_predicate));

    // payload secrets carry no generation, hash the data instead
    let secret_watcher = watcher(secret_api, Config::default())
        .map(ensure_deletion_change)
        .touched_objects()
        .predicate_filter(changed_predicate.combine(secret_data_predicate));

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
        .watches_stream(secret_watcher, |secret: Secret| {
            let namespace = secret.meta().namespace.clone()?;
            if secret.name_any() == import_secret_name(&namespace) {
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

fn work_spec_predicate(obj: &ManifestWork) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    serde_hashkey::to_key(&obj.spec)
        .expect("serde_hashkey never to return an error")
        .hash(&mut hasher);
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
