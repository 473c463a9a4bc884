use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::info;

use crate::resources::managedclusteraddons::ManagedClusterAddOn;
use crate::resources::manifestworks::ManifestWork;
use crate::{Error, Result};

use super::hosting::{force_teardown_step, WorkTeardown};

/// The rolebinding through which a cluster's agent reports work status
pub fn work_role_binding_name(cluster: &str) -> String {
    format!("open-cluster-management:managedcluster:{cluster}:work")
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Collapse the failures collected over a multi-step sweep into a single
/// error, so one broken object never hides the progress made on the rest.
pub fn partial_cleanup(mut failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    let count = failures.len();
    Err(Error::PartialCleanup(count, failures.swap_remove(0)))
}

pub async fn delete_manifest_work(api: &Api<ManifestWork>, name: &str) -> Result<()> {
    info!("deleting manifest work {name}");
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Delete a work and strip its finalizers, so it goes away without any
/// agent acknowledgement.
pub async fn force_delete_manifest_work(api: &Api<ManifestWork>, name: &str) -> Result<()> {
    delete_manifest_work(api, name).await?;
    strip_finalizers(api, name).await
}

pub async fn strip_finalizers<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api
        .patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "metadata": { "finalizers": [] } })),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn delete_role_binding(api: &Api<RoleBinding>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Force delete everything import-related in a cluster namespace: addons,
/// manifest works and the work rolebinding. Partial failures are collected
/// so one broken object does not stall the rest of the sweep. Returns
/// whether the namespace is clean.
pub async fn force_sweep_namespace(
    client: &Client,
    cluster: &str,
    now: DateTime<Utc>,
    crd_work_grace: Duration,
) -> Result<bool> {
    let mut failures: Vec<String> = vec![];
    let mut remaining = 0usize;

    let addons: Api<ManagedClusterAddOn> = Api::namespaced(client.clone(), cluster);
    match addons.list(&ListParams::default()).await {
        Ok(list) => {
            for addon in list.items {
                remaining += 1;
                let name = addon.name_any();
                if let Err(err) = addons.delete(&name, &DeleteParams::default()).await {
                    if !is_not_found(&err) {
                        failures.push(format!("addon {name}: {err}"));
                        continue;
                    }
                }
                if let Err(err) = strip_finalizers(&addons, &name).await {
                    failures.push(format!("addon {name}: {err}"));
                }
            }
        }
        Err(err) => failures.push(format!("listing addons: {err}")),
    }

    let works: Api<ManifestWork> = Api::namespaced(client.clone(), cluster);
    match works.list(&ListParams::default()).await {
        Ok(list) => {
            for work in &list.items {
                remaining += 1;
                let name = work.name_any();
                let result = match force_teardown_step(cluster, work, now, crd_work_grace) {
                    WorkTeardown::ForceDelete => force_delete_manifest_work(&works, &name).await,
                    WorkTeardown::Delete => delete_manifest_work(&works, &name).await,
                    WorkTeardown::Wait => Ok(()),
                };
                if let Err(err) = result {
                    failures.push(format!("work {name}: {err}"));
                }
            }
        }
        Err(err) => failures.push(format!("listing works: {err}")),
    }

    let role_bindings: Api<RoleBinding> = Api::namespaced(client.clone(), cluster);
    let rb_name = work_role_binding_name(cluster);
    match role_bindings.get_opt(&rb_name).await {
        Ok(Some(_)) => {
            remaining += 1;
            if let Err(err) = delete_role_binding(&role_bindings, &rb_name).await {
                failures.push(format!("rolebinding {rb_name}: {err}"));
            } else if let Err(err) = strip_finalizers(&role_bindings, &rb_name).await {
                failures.push(format!("rolebinding {rb_name}: {err}"));
            }
        }
        Ok(None) => {}
        Err(err) => failures.push(format!("rolebinding {rb_name}: {err}")),
    }

    partial_cleanup(failures)?;
    Ok(remaining == 0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn collected_failures_collapse_into_one_error() {
        assert!(partial_cleanup(vec![]).is_ok());

        let err = partial_cleanup(vec![
            "work c1-klusterlet: boom".to_string(),
            "addon helm: boom".to_string(),
        ])
        .unwrap_err();
        assert!(
            matches!(err, Error::PartialCleanup(2, ref first) if first == "work c1-klusterlet: boom")
        );
    }
}
