use kube::api::{Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::{Api, Client, ResourceExt};
use serde::Deserialize;
use tracing::debug;

use crate::resources::imports::ImportPayload;
use crate::{Error, Result};

/// Apply the rendered klusterlet payload to the target cluster: the CRD
/// document first (picked to match what the target serves), then the
/// installation manifests once the new types are discoverable.
pub async fn apply_import_payload(
    client: &Client,
    cluster: &str,
    payload: &ImportPayload,
) -> Result<()> {
    let discovery = Discovery::new(client.clone()).run().await?;

    if let Some(crds) = payload.crds_for(crd_v1_served(&discovery)) {
        apply_manifests(client, &discovery, cluster, parse_manifests(crds)?).await?;
    }

    // rerun discovery so the freshly applied CRDs resolve
    let discovery = Discovery::new(client.clone()).run().await?;
    apply_manifests(
        client,
        &discovery,
        cluster,
        parse_manifests(&payload.import_yaml)?,
    )
    .await?;
    Ok(())
}

/// Whether the target serves apiextensions v1, straight from its discovery doc.
pub fn crd_v1_served(discovery: &Discovery) -> bool {
    let gvk = GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition");
    discovery.resolve_gvk(&gvk).is_some()
}

/// Split a multi-document YAML payload into dynamic objects, dropping empty
/// documents.
pub fn parse_manifests(yaml: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = vec![];
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value: serde_json::Value = serde_json::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_json::from_value(value)?);
    }
    Ok(objects)
}

async fn apply_manifests(
    client: &Client,
    discovery: &Discovery,
    cluster: &str,
    objects: Vec<DynamicObject>,
) -> Result<()> {
    let params = PatchParams::apply("cluster-import-operator").force();
    for obj in objects {
        let gvk = obj
            .types
            .as_ref()
            .and_then(|t| GroupVersionKind::try_from(t).ok())
            .ok_or_else(|| {
                Error::InvalidImportSecret(
                    cluster.to_string(),
                    format!("manifest {} has no usable apiVersion/kind", obj.name_any()),
                )
            })?;
        let (ar, caps) = discovery.resolve_gvk(&gvk).ok_or(Error::DiscoveryMissing {
            group: gvk.group.clone(),
            kind: gvk.kind.clone(),
        })?;

        let api: Api<DynamicObject> = match caps.scope {
            Scope::Cluster => Api::all_with(client.clone(), &ar),
            Scope::Namespaced => Api::namespaced_with(
                client.clone(),
                obj.metadata.namespace.as_deref().unwrap_or("default"),
                &ar,
            ),
        };

        let name = obj.name_any();
        debug!(kind = %gvk.kind, %name, "applying manifest on the target cluster");
        api.patch(&name, &params, &Patch::Apply(&obj)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn multidoc_payload_splits_and_skips_empty_documents() {
        let yaml = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: open-cluster-management-agent
---
# a comment-only document
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: klusterlet
  namespace: open-cluster-management-agent
spec:
  replicas: 1
"#;
        let objects = parse_manifests(yaml).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].types.as_ref().unwrap().kind, "Namespace");
        assert_eq!(objects[1].types.as_ref().unwrap().kind, "Deployment");
        assert_eq!(
            objects[1].metadata.namespace.as_deref(),
            Some("open-cluster-management-agent")
        );
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(parse_manifests("a: [unclosed").is_err());
    }
}
