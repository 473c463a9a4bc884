use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Addon enablement for a managed cluster. Only metadata is consumed here;
/// the addon framework owns the spec and the finalizers on these objects.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ManagedClusterAddOn",
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnSpec {
    pub install_namespace: Option<String>,
}
