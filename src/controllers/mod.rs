use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::error;

use crate::resources::managedclusters::ManagedCluster;
use crate::resources::{set_status_condition, Condition};
use crate::{Metrics, Result};

pub mod autoimport;
pub mod cleanup;
pub mod gc;
pub mod manifestwork;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,

    /// How long a work's postpone-delete window stays open after the cluster
    /// deletion started
    pub postpone_delete_grace: Duration,
    /// How long to wait for the CRD work's agent acknowledgement before its
    /// finalizers are stripped during a forced detach
    pub crd_work_grace: Duration,
    /// Delay between import attempts
    pub import_retry_period: Duration,
    /// Delay between garbage collection sweeps
    pub gc_interval: Duration,
    /// Externally owned kinds whose vanished owners prune work owner refs,
    /// as Kind.group/version
    pub gc_owner_kinds: Vec<String>,
}

impl State {
    pub fn new(
        postpone_delete_grace: Duration,
        crd_work_grace: Duration,
        import_retry_period: Duration,
        gc_interval: Duration,
        gc_owner_kinds: Vec<String>,
    ) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            postpone_delete_grace,
            crd_work_grace,
            import_retry_period,
            gc_interval,
            gc_owner_kinds,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Start every controller loop (given the CRDs are installed)
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let metrics = Metrics::default()
        .register(&state.registry)
        .expect("failed to register metrics");

    let mc_api = Api::<ManagedCluster>::all(client.clone());
    if let Err(e) = mc_api.list(&ListParams::default().limit(1)).await {
        error!("ManagedCluster is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    tokio::join!(
        autoimport::run(client.clone(), metrics.clone(), state.clone()),
        manifestwork::run(client.clone(), metrics.clone(), state.clone()),
        cleanup::run(client.clone(), metrics.clone(), state.clone()),
        gc::run(client.clone(), metrics.clone(), state.clone()),
    );
}

/// Merge a condition into the cluster status, patching only when something
/// actually changed. Returns whether a write happened.
pub(crate) async fn update_cluster_condition(
    api: &Api<ManagedCluster>,
    cluster: &ManagedCluster,
    condition: Condition,
) -> Result<bool> {
    let mut conditions = cluster.conditions().to_vec();
    if !set_status_condition(&mut conditions, condition, Time(Utc::now())) {
        return Ok(false);
    }

    api.patch_status(
        &cluster.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": { "conditions": conditions } })),
    )
    .await?;
    Ok(true)
}

pub(crate) async fn ensure_cluster_finalizer(
    api: &Api<ManagedCluster>,
    cluster: &ManagedCluster,
    finalizer: &str,
) -> Result<()> {
    let mut finalizers = cluster.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());
    api.patch(
        &cluster.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

pub(crate) async fn remove_cluster_finalizer(
    api: &Api<ManagedCluster>,
    cluster: &ManagedCluster,
    finalizer: &str,
) -> Result<()> {
    let finalizers: Vec<_> = cluster
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    if finalizers.len() == cluster.finalizers().len() {
        return Ok(());
    }
    api.patch(
        &cluster.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}
