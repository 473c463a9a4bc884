use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

pub static KLUSTERLET_WORK_SUFFIX: &str = "klusterlet";
pub static KLUSTERLET_CRDS_WORK_SUFFIX: &str = "klusterlet-crds";
pub static HOSTED_KLUSTERLET_WORK_SUFFIX: &str = "hosted-klusterlet";
pub static HOSTED_KUBECONFIG_WORK_SUFFIX: &str = "hosted-kubeconfig";

/// Holds off graceful deletion of a work while the window is open
pub static ANNOTATION_POSTPONE_DELETE: &str = "open-cluster-management/postpone-delete";
/// Higher values are deleted later during a teardown
pub static ANNOTATION_CLEANUP_PRIORITY: &str = "open-cluster-management.io/cleanup-priority";
/// Marks hosting-side works with the cluster they belong to
pub static LABEL_HOSTED_CLUSTER: &str = "import.open-cluster-management.io/hosted-cluster";

pub static CONDITION_WORK_APPLIED: &str = "Applied";
pub static CONDITION_WORK_AVAILABLE: &str = "Available";
pub static CONDITION_WORK_DELETING: &str = "Deleting";

pub static PROPAGATION_POLICY_ORPHAN: &str = "Orphan";
pub static PROPAGATION_POLICY_FOREGROUND: &str = "Foreground";

pub fn klusterlet_work_name(cluster: &str) -> String {
    format!("{cluster}-{KLUSTERLET_WORK_SUFFIX}")
}

pub fn klusterlet_crds_work_name(cluster: &str) -> String {
    format!("{cluster}-{KLUSTERLET_CRDS_WORK_SUFFIX}")
}

pub fn hosted_klusterlet_work_name(cluster: &str) -> String {
    format!("{cluster}-{HOSTED_KLUSTERLET_WORK_SUFFIX}")
}

pub fn hosted_kubeconfig_work_name(cluster: &str) -> String {
    format!("{cluster}-{HOSTED_KUBECONFIG_WORK_SUFFIX}")
}

/// A bundle of manifests delivered to a cluster's agent for application
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "ManifestWork",
    group = "work.open-cluster-management.io",
    version = "v1",
    namespaced,
    status = "ManifestWorkStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkSpec {
    pub workload: ManifestsTemplate,
    /// How applied resources are treated when the work itself is deleted.
    pub delete_option: Option<DeleteOption>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestsTemplate {
    #[serde(default)]
    pub manifests: Vec<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOption {
    /// Orphan, Foreground or SelectivelyOrphan.
    pub propagation_policy: String,
    pub selectively_orphan: Option<SelectivelyOrphan>,
}

impl DeleteOption {
    pub fn orphan() -> Self {
        DeleteOption {
            propagation_policy: PROPAGATION_POLICY_ORPHAN.to_string(),
            selectively_orphan: None,
        }
    }

    pub fn foreground() -> Self {
        DeleteOption {
            propagation_policy: PROPAGATION_POLICY_FOREGROUND.to_string(),
            selectively_orphan: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectivelyOrphan {
    pub orphaning_rules: Option<Vec<OrphaningRule>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrphaningRule {
    pub group: Option<String>,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkStatus {
    pub conditions: Option<Vec<Condition>>,
}

impl ManifestWork {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or(&[])
    }

    /// Whether the agent has acknowledged applying this work.
    pub fn is_applied(&self) -> bool {
        super::is_condition_true(self.conditions(), CONDITION_WORK_APPLIED)
    }

    /// Whether the agent has acknowledged that deletion is in progress.
    pub fn is_deleting_reported(&self) -> bool {
        super::is_condition_true(self.conditions(), CONDITION_WORK_DELETING)
    }
}
