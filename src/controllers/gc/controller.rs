use std::collections::HashSet;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::*;

use crate::controllers::cleanup::reconcilers::hosting::next_hosting_deletions;
use crate::controllers::cleanup::reconcilers::sweep::{
    delete_manifest_work, force_sweep_namespace, partial_cleanup,
};
use crate::controllers::State;
use crate::resources::managedclusters::ManagedCluster;
use crate::resources::manifestworks::{
    klusterlet_crds_work_name, klusterlet_work_name, ManifestWork, LABEL_HOSTED_CLUSTER,
};
use crate::{Metrics, Result};

/// An externally owned kind whose disappearance releases the works it owns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerKind {
    kind: String,
    group: String,
    version: String,
}

impl OwnerKind {
    /// Parses `Kind.group/version`, e.g. `ClusterDeployment.hive.openshift.io/v1`.
    pub fn parse(value: &str) -> Option<OwnerKind> {
        let (kind, rest) = value.split_once('.')?;
        let (group, version) = rest.split_once('/')?;
        if kind.is_empty() || version.is_empty() {
            return None;
        }
        Some(OwnerKind {
            kind: kind.to_string(),
            group: group.to_string(),
            version: version.to_string(),
        })
    }

    fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn matches(&self, owner: &OwnerReference) -> bool {
        owner.kind == self.kind && owner.api_version == self.api_version()
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(&self.group, &self.version, &self.kind))
    }
}

/// Owner references that survive an existence check.
pub fn prune_owner_refs(
    refs: &[OwnerReference],
    exists: impl Fn(&OwnerReference) -> bool,
) -> Vec<OwnerReference> {
    refs.iter().filter(|r| exists(r)).cloned().collect()
}

// Periodic garbage collection sweeps until shutdown
pub async fn run(client: Client, _metrics: Metrics, state: State) {
    let owner_kinds: Vec<OwnerKind> = state
        .gc_owner_kinds
        .iter()
        .filter_map(|value| {
            let parsed = OwnerKind::parse(value);
            if parsed.is_none() {
                warn!("ignoring malformed gc owner kind {value:?}, expected Kind.group/version");
            }
            parsed
        })
        .collect();

    let mut interval = tokio::time::interval(state.gc_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("garbage collector shutting down");
                return;
            }
            _ = interval.tick() => {}
        }
        state.diagnostics.write().await.last_event = Utc::now();
        if let Err(err) = sweep(&client, &state, &owner_kinds).await {
            warn!("garbage collection sweep failed: {err}");
        }
    }
}

async fn sweep(client: &Client, state: &State, owner_kinds: &[OwnerKind]) -> Result<()> {
    let all_works: Api<ManifestWork> = Api::all(client.clone());
    let works = all_works.list(&ListParams::default()).await?.items;

    // one stuck work or cluster must not starve the rest of the sweep, so
    // per-item failures are collected instead of aborting
    let mut failures: Vec<String> = vec![];

    // namespaces and labels that point back at a cluster
    let mut cluster_names: HashSet<String> = HashSet::new();

    for work in &works {
        let Some(namespace) = work.meta().namespace.clone() else {
            continue;
        };
        let name = work.name_any();
        if name == klusterlet_work_name(&namespace) || name == klusterlet_crds_work_name(&namespace)
        {
            cluster_names.insert(namespace.clone());
        }
        if let Some(cluster) = work.labels().get(LABEL_HOSTED_CLUSTER) {
            cluster_names.insert(cluster.clone());
        }

        if let Err(err) = collect_owned_work(client, work, &namespace, owner_kinds).await {
            failures.push(format!("work {namespace}/{name}: {err}"));
        }
    }

    let addons: Api<crate::resources::managedclusteraddons::ManagedClusterAddOn> =
        Api::all(client.clone());
    match addons.list(&ListParams::default()).await {
        Ok(list) => {
            for addon in list.items {
                if let Some(namespace) = &addon.meta().namespace {
                    cluster_names.insert(namespace.clone());
                }
            }
        }
        Err(err) => failures.push(format!("listing addons: {err}")),
    }

    sweep_orphaned_clusters(client, state, cluster_names, &mut failures).await;

    partial_cleanup(failures)
}

/// Re-check the externally owned references of one work, pruning the
/// vanished owners and deleting the work once none remain.
async fn collect_owned_work(
    client: &Client,
    work: &ManifestWork,
    namespace: &str,
    owner_kinds: &[OwnerKind],
) -> Result<()> {
    let refs = work.owner_references();
    if refs.is_empty() {
        return Ok(());
    }

    let mut vanished: HashSet<String> = HashSet::new();
    for owner in refs {
        let Some(kind) = owner_kinds.iter().find(|k| k.matches(owner)) else {
            continue;
        };
        let api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), namespace, &kind.api_resource());
        match api.get_opt(&owner.name).await? {
            // a recreated owner has a fresh uid, the reference is stale
            Some(found) if found.meta().uid.as_deref() == Some(owner.uid.as_str()) => {}
            _ => {
                vanished.insert(owner.uid.clone());
            }
        }
    }
    if vanished.is_empty() {
        return Ok(());
    }

    let name = work.name_any();
    let pruned = prune_owner_refs(refs, |r| !vanished.contains(&r.uid));
    let api: Api<ManifestWork> = Api::namespaced(client.clone(), namespace);
    if pruned.is_empty() {
        info!("every owner of manifest work {namespace}/{name} is gone, deleting it");
        delete_manifest_work(&api, &name).await
    } else {
        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "metadata": { "ownerReferences": pruned } })),
        )
        .await?;
        Ok(())
    }
}

/// Import artefacts whose ManagedCluster no longer exists cannot be torn
/// down by the cleanup controller, it never sees a reconcile for them.
async fn sweep_orphaned_clusters(
    client: &Client,
    state: &State,
    cluster_names: HashSet<String>,
    failures: &mut Vec<String>,
) {
    let mc_api: Api<ManagedCluster> = Api::all(client.clone());
    let all_works: Api<ManifestWork> = Api::all(client.clone());

    for cluster in cluster_names {
        match mc_api.get_opt(&cluster).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => {
                failures.push(format!("cluster {cluster}: {err}"));
                continue;
            }
        }
        warn!("ManagedCluster {cluster} is gone but its import artefacts remain, sweeping them");

        if let Err(err) =
            force_sweep_namespace(client, &cluster, Utc::now(), state.crd_work_grace).await
        {
            failures.push(format!("cluster {cluster}: {err}"));
        }

        // stray hosting-side works, deleted in the usual order
        match all_works
            .list(&ListParams::default().labels(&format!("{LABEL_HOSTED_CLUSTER}={cluster}")))
            .await
        {
            Ok(hosting) => {
                for work in next_hosting_deletions(&hosting.items) {
                    let Some(namespace) = work.meta().namespace.clone() else {
                        continue;
                    };
                    let api: Api<ManifestWork> = Api::namespaced(client.clone(), &namespace);
                    if let Err(err) = delete_manifest_work(&api, &work.name_any()).await {
                        failures.push(format!("hosting work {}: {err}", work.name_any()));
                    }
                }
            }
            Err(err) => failures.push(format!("cluster {cluster} hosting works: {err}")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn owner(kind: &str, api_version: &str, name: &str, uid: &str) -> OwnerReference {
        OwnerReference {
            kind: kind.to_string(),
            api_version: api_version.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn owner_kind_parsing() {
        let kind = OwnerKind::parse("ClusterDeployment.hive.openshift.io/v1").unwrap();
        assert!(kind.matches(&owner(
            "ClusterDeployment",
            "hive.openshift.io/v1",
            "c1",
            "u1"
        )));
        assert!(!kind.matches(&owner("ClusterPool", "hive.openshift.io/v1", "c1", "u1")));
        assert!(!kind.matches(&owner(
            "ClusterDeployment",
            "hive.openshift.io/v1beta1",
            "c1",
            "u1"
        )));

        assert!(OwnerKind::parse("ClusterDeployment").is_none());
        assert!(OwnerKind::parse("ClusterDeployment.hive.openshift.io").is_none());
        assert!(OwnerKind::parse(".hive.openshift.io/v1").is_none());
    }

    #[test]
    fn pruning_keeps_only_living_owners() {
        let refs = vec![
            owner("ClusterDeployment", "hive.openshift.io/v1", "c1", "u1"),
            owner("ClusterDeployment", "hive.openshift.io/v1", "c2", "u2"),
        ];

        let pruned = prune_owner_refs(&refs, |r| r.uid == "u2");
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].name, "c2");

        assert!(prune_owner_refs(&refs, |_| false).is_empty());
        assert_eq!(prune_owner_refs(&refs, |_| true).len(), 2);
    }
}
