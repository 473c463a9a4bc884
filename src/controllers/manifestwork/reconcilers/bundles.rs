use base64::Engine;
use kube::api::{ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::resources::imports::{supports_crd_v1, ImportPayload};
use crate::resources::managedclusters::ManagedCluster;
use crate::resources::manifestworks::{
    hosted_klusterlet_work_name, hosted_kubeconfig_work_name, klusterlet_crds_work_name,
    klusterlet_work_name, DeleteOption, ManifestWork, ManifestWorkSpec, ManifestsTemplate,
    ANNOTATION_CLEANUP_PRIORITY, LABEL_HOSTED_CLUSTER,
};
use crate::{Error, Result};

/// Name of the kubeconfig secret the hosting-side agent consumes
pub static EXTERNAL_MANAGED_KUBECONFIG: &str = "external-managed-kubeconfig";

/// Namespace on the hosting cluster where a hosted klusterlet runs
pub fn hosted_klusterlet_namespace(cluster: &str) -> String {
    format!("klusterlet-{cluster}")
}

/// Split a multi-document YAML payload into raw JSON manifests.
pub fn yaml_documents(cluster: &str, yaml: &str) -> Result<Vec<serde_json::Value>> {
    let mut documents = vec![];
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_json::Value::deserialize(document).map_err(|e| {
            Error::InvalidImportSecret(cluster.to_string(), format!("unparsable manifest: {e}"))
        })?;
        if value.is_null() {
            continue;
        }
        documents.push(value);
    }
    Ok(documents)
}

fn bundle_meta(name: String, namespace: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace),
        ..Default::default()
    }
}

/// The set of klusterlet bundles a cluster should carry, derived from its
/// deploy mode and the rendered import payload.
pub fn desired_bundles(
    cluster: &ManagedCluster,
    payload: &ImportPayload,
) -> Result<Vec<ManifestWork>> {
    let name = cluster.name_any();
    let mode = cluster.deploy_mode()?;

    if !mode.is_hosted_side() {
        return desired_default_bundles(cluster, &name, payload);
    }

    let hosting = cluster.hosting_cluster()?;

    // the agent namespace on the managed cluster is owned by the hosting
    // flow, it has to survive the work's foreground deletion
    let manifests = yaml_documents(&name, &payload.import_yaml)?
        .into_iter()
        .filter(|m| m.get("kind").and_then(serde_json::Value::as_str) != Some("Namespace"))
        .collect();

    let mut work = ManifestWork::new(
        &hosted_klusterlet_work_name(&name),
        ManifestWorkSpec {
            workload: ManifestsTemplate { manifests },
            delete_option: Some(DeleteOption::foreground()),
        },
    );
    work.metadata.namespace = Some(hosting);
    work.metadata.labels = Some(BTreeMap::from([(
        LABEL_HOSTED_CLUSTER.to_string(),
        name.clone(),
    )]));
    // deleted after the addon works but before the kubeconfig work
    work.metadata.annotations = Some(BTreeMap::from([(
        ANNOTATION_CLEANUP_PRIORITY.to_string(),
        "100".to_string(),
    )]));
    Ok(vec![work])
}

fn desired_default_bundles(
    cluster: &ManagedCluster,
    name: &str,
    payload: &ImportPayload,
) -> Result<Vec<ManifestWork>> {
    let v1_supported = cluster
        .status
        .as_ref()
        .and_then(|s| s.version.as_ref())
        .and_then(|v| v.kubernetes.as_deref())
        .map(supports_crd_v1)
        .unwrap_or(true);

    let mut bundles = vec![];

    if let Some(crds) = payload.crds_for(v1_supported) {
        bundles.push(ManifestWork {
            metadata: bundle_meta(klusterlet_crds_work_name(name), name.to_string()),
            spec: ManifestWorkSpec {
                workload: ManifestsTemplate {
                    manifests: yaml_documents(name, crds)?,
                },
                delete_option: None,
            },
            status: None,
        });
    }

    bundles.push(ManifestWork {
        metadata: bundle_meta(klusterlet_work_name(name), name.to_string()),
        spec: ManifestWorkSpec {
            workload: ManifestsTemplate {
                manifests: yaml_documents(name, &payload.import_yaml)?,
            },
            // the agent cannot acknowledge removal of its own runtime,
            // the applied resources are orphaned on deletion
            delete_option: Some(DeleteOption::orphan()),
        },
        status: None,
    });

    Ok(bundles)
}

/// The work that carries a managed cluster's kubeconfig onto its hosting
/// cluster, where the agent consumes and removes the materialised secret.
pub fn hosted_kubeconfig_work(
    cluster: &str,
    hosting_namespace: &str,
    kubeconfig_yaml: &str,
) -> ManifestWork {
    let encoded = base64::engine::general_purpose::STANDARD.encode(kubeconfig_yaml);
    let secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": EXTERNAL_MANAGED_KUBECONFIG,
            "namespace": hosted_klusterlet_namespace(cluster),
        },
        "data": { "kubeconfig": encoded },
    });

    let mut work = ManifestWork::new(
        &hosted_kubeconfig_work_name(cluster),
        ManifestWorkSpec {
            workload: ManifestsTemplate {
                manifests: vec![secret],
            },
            delete_option: Some(DeleteOption::orphan()),
        },
    );
    work.metadata.namespace = Some(hosting_namespace.to_string());
    work.metadata.labels = Some(BTreeMap::from([(
        LABEL_HOSTED_CLUSTER.to_string(),
        cluster.to_string(),
    )]));
    work
}

/// Content equality between works: the manifest JSON and the delete option
/// decide, never metadata or status.
pub fn manifest_works_equal(a: &ManifestWork, b: &ManifestWork) -> bool {
    a.spec == b.spec
}

/// Create or update a work by content. Regenerating an identical bundle
/// must produce zero writes.
pub async fn apply_manifest_work(api: &Api<ManifestWork>, desired: ManifestWork) -> Result<bool> {
    let name = desired.name_any();
    match api.get_opt(&name).await? {
        None => {
            info!("creating manifest work {name}");
            api.create(&PostParams::default(), &desired).await?;
            Ok(true)
        }
        Some(existing) if manifest_works_equal(&existing, &desired) => {
            debug!("manifest work {name} is unchanged");
            Ok(false)
        }
        Some(_) => {
            info!("updating manifest work {name}");
            api.patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": desired.spec })),
            )
            .await?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use crate::resources::managedclusters::{
        ManagedClusterSpec, ManagedClusterStatus, ManagedClusterVersion,
        ANNOTATION_HOSTING_CLUSTER_NAME, ANNOTATION_KLUSTERLET_DEPLOY_MODE,
    };
    use crate::resources::manifestworks::PROPAGATION_POLICY_FOREGROUND;

    const IMPORT_YAML: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: open-cluster-management-agent
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: klusterlet
  namespace: open-cluster-management-agent
"#;

    fn payload() -> ImportPayload {
        ImportPayload {
            import_yaml: IMPORT_YAML.to_string(),
            crds_v1: Some("apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: klusterlets.operator.open-cluster-management.io\n".to_string()),
            crds_v1beta1: Some("apiVersion: apiextensions.k8s.io/v1beta1\nkind: CustomResourceDefinition\nmetadata:\n  name: klusterlets.operator.open-cluster-management.io\n".to_string()),
        }
    }

    fn cluster(version: Option<&str>) -> ManagedCluster {
        let mut mc = ManagedCluster::new("c1", ManagedClusterSpec::default());
        mc.status = Some(ManagedClusterStatus {
            version: version.map(|v| ManagedClusterVersion {
                kubernetes: Some(v.to_string()),
            }),
            ..Default::default()
        });
        mc
    }

    fn hosted_cluster() -> ManagedCluster {
        let mut mc = cluster(None);
        mc.metadata.annotations = Some(BTreeMap::from([
            (
                ANNOTATION_KLUSTERLET_DEPLOY_MODE.to_string(),
                "hosted".to_string(),
            ),
            (
                ANNOTATION_HOSTING_CLUSTER_NAME.to_string(),
                "hosting1".to_string(),
            ),
        ]));
        mc
    }

    #[test]
    fn default_mode_produces_crds_and_klusterlet_bundles() {
        let bundles = desired_bundles(&cluster(Some("v1.25.0")), &payload()).unwrap();
        assert_eq!(bundles.len(), 2);

        let crds = &bundles[0];
        assert_eq!(crds.metadata.name.as_deref(), Some("c1-klusterlet-crds"));
        assert_eq!(crds.metadata.namespace.as_deref(), Some("c1"));
        assert!(crds.spec.delete_option.is_none());
        assert_eq!(
            crds.spec.workload.manifests[0]["apiVersion"],
            "apiextensions.k8s.io/v1"
        );

        let klusterlet = &bundles[1];
        assert_eq!(klusterlet.metadata.name.as_deref(), Some("c1-klusterlet"));
        assert_json_eq!(
            serde_json::to_value(&klusterlet.spec.delete_option).unwrap(),
            json!({ "propagationPolicy": "Orphan", "selectivelyOrphan": null })
        );
        assert_eq!(klusterlet.spec.workload.manifests.len(), 2);
    }

    #[test]
    fn old_clusters_get_the_v1beta1_crd_bundle() {
        let bundles = desired_bundles(&cluster(Some("v1.15.2")), &payload()).unwrap();
        assert_eq!(
            bundles[0].spec.workload.manifests[0]["apiVersion"],
            "apiextensions.k8s.io/v1beta1"
        );
    }

    #[test]
    fn hosted_mode_produces_one_hosting_side_bundle() {
        let bundles = desired_bundles(&hosted_cluster(), &payload()).unwrap();
        assert_eq!(bundles.len(), 1);

        let work = &bundles[0];
        assert_eq!(work.metadata.name.as_deref(), Some("c1-hosted-klusterlet"));
        assert_eq!(work.metadata.namespace.as_deref(), Some("hosting1"));
        assert_eq!(
            work.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_HOSTED_CLUSTER))
                .map(String::as_str),
            Some("c1")
        );
        assert_eq!(
            work.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_CLEANUP_PRIORITY))
                .map(String::as_str),
            Some("100")
        );
        assert_eq!(
            work.spec.delete_option.as_ref().unwrap().propagation_policy,
            PROPAGATION_POLICY_FOREGROUND
        );
        // namespace manifests are stripped on the hosting side
        assert!(work
            .spec
            .workload
            .manifests
            .iter()
            .all(|m| m["kind"] != "Namespace"));
    }

    #[test]
    fn hosted_mode_without_hosting_cluster_fails() {
        let mut mc = cluster(None);
        mc.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_KLUSTERLET_DEPLOY_MODE.to_string(),
            "hosted".to_string(),
        )]));
        assert!(matches!(
            desired_bundles(&mc, &payload()),
            Err(Error::HostingClusterMissing(_))
        ));
    }

    #[test]
    fn identical_regeneration_compares_equal() {
        let a = desired_bundles(&cluster(Some("v1.25.0")), &payload()).unwrap();
        let b = desired_bundles(&cluster(Some("v1.25.0")), &payload()).unwrap();
        assert!(manifest_works_equal(&a[0], &b[0]));
        assert!(manifest_works_equal(&a[1], &b[1]));

        // metadata differences do not force a rewrite
        let mut relabelled = b[0].clone();
        relabelled.metadata.labels =
            Some(BTreeMap::from([("extra".to_string(), "label".to_string())]));
        assert!(manifest_works_equal(&a[0], &relabelled));

        // content differences do
        let mut edited = b[1].clone();
        edited.spec.workload.manifests.pop();
        assert!(!manifest_works_equal(&a[1], &edited));
    }

    #[test]
    fn kubeconfig_work_wraps_the_blob_for_the_agent_namespace() {
        let work = hosted_kubeconfig_work("c1", "hosting1", "apiVersion: v1\nkind: Config\n");
        assert_eq!(work.metadata.name.as_deref(), Some("c1-hosted-kubeconfig"));
        assert_eq!(work.metadata.namespace.as_deref(), Some("hosting1"));
        let secret = &work.spec.workload.manifests[0];
        assert_eq!(secret["metadata"]["name"], EXTERNAL_MANAGED_KUBECONFIG);
        assert_eq!(secret["metadata"]["namespace"], "klusterlet-c1");
        assert!(secret["data"]["kubeconfig"].is_string());
    }
}
