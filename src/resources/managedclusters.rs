use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{find_condition, Condition};
use crate::{Error, Result};

/// Finalizer that holds the cluster until its namespace is fully torn down
pub static IMPORT_FINALIZER: &str =
    "managedcluster-import-controller.open-cluster-management.io/cleanup";
/// Finalizer that holds the cluster while klusterlet manifest works exist
pub static MANIFEST_WORK_FINALIZER: &str =
    "managedcluster-import-controller.open-cluster-management.io/manifestwork-cleanup";

pub static CONDITION_IMPORT_SUCCEEDED: &str = "ManagedClusterImportSucceeded";
pub static CONDITION_JOINED: &str = "ManagedClusterJoined";
pub static CONDITION_AVAILABLE: &str = "ManagedClusterConditionAvailable";

pub static REASON_WAIT_FOR_IMPORTING: &str = "ManagedClusterWaitForImporting";
pub static REASON_IMPORTING: &str = "ManagedClusterImporting";
pub static REASON_IMPORTED: &str = "ManagedClusterImported";
pub static REASON_IMPORT_FAILED: &str = "ManagedClusterImportFailed";
pub static REASON_DETACHING: &str = "ManagedClusterDetaching";
pub static REASON_FORCE_DETACHING: &str = "ManagedClusterForceDetaching";

pub static ANNOTATION_KLUSTERLET_DEPLOY_MODE: &str =
    "import.open-cluster-management.io/klusterlet-deploy-mode";
pub static ANNOTATION_HOSTING_CLUSTER_NAME: &str =
    "import.open-cluster-management.io/hosting-cluster-name";

/// Represents a cluster that has been accepted onto the hub
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ManagedCluster",
    group = "cluster.open-cluster-management.io",
    version = "v1",
    shortname = "mc",
    printcolumn = r#"{"name":"Hub Accepted", "type":"boolean", "jsonPath":".spec.hubAcceptsClient"}"#,
    printcolumn = r#"{"name":"Joined", "type":"string", "jsonPath":".status.conditions[?(@.type==\"ManagedClusterJoined\")].status"}"#,
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"ManagedClusterConditionAvailable\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ManagedClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// hubAcceptsClient indicates whether the hub accepts requests from the
    /// cluster's agent. Deleting a cluster with this unset triggers a forced
    /// detach, since the agent can no longer acknowledge anything.
    #[serde(default)]
    pub hub_accepts_client: bool,
    /// Endpoints through which the cluster's apiserver can be reached.
    pub managed_cluster_client_configs: Option<Vec<ClientConfig>>,
    /// Lease renewal period for the registration agent, in seconds.
    pub lease_duration_seconds: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub url: String,
    pub ca_bundle: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    pub conditions: Option<Vec<Condition>>,
    pub version: Option<ManagedClusterVersion>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterVersion {
    pub kubernetes: Option<String>,
}

/// Where the klusterlet for a cluster runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KlusterletDeployMode {
    /// Agent runs on the managed cluster itself
    Default,
    /// Agent runs on a hosting cluster, managed cluster stays agentless
    Hosted,
    /// Like hosted, but the managed cluster never runs any agent components
    Detached,
}

impl KlusterletDeployMode {
    pub fn is_hosted_side(&self) -> bool {
        matches!(
            self,
            KlusterletDeployMode::Hosted | KlusterletDeployMode::Detached
        )
    }
}

impl ManagedCluster {
    pub fn deploy_mode(&self) -> Result<KlusterletDeployMode> {
        match self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_KLUSTERLET_DEPLOY_MODE))
            .map(String::as_str)
        {
            None | Some("") | Some("default") => Ok(KlusterletDeployMode::Default),
            Some("hosted") => Ok(KlusterletDeployMode::Hosted),
            Some("detached") => Ok(KlusterletDeployMode::Detached),
            Some(other) => Err(Error::InvalidDeployMode(other.to_string())),
        }
    }

    pub fn hosting_cluster(&self) -> Result<String> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_HOSTING_CLUSTER_NAME))
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::HostingClusterMissing(self.metadata.name.clone().unwrap_or_default()))
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or(&[])
    }

    pub fn is_joined(&self) -> bool {
        super::is_condition_true(self.conditions(), CONDITION_JOINED)
    }

    pub fn is_imported(&self) -> bool {
        super::is_condition_true(self.conditions(), CONDITION_IMPORT_SUCCEEDED)
    }

    /// Available condition False or Unknown means the agent cannot be relied
    /// on to acknowledge work deletions.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            find_condition(self.conditions(), CONDITION_AVAILABLE).map(|c| c.status.as_str()),
            Some("False") | Some("Unknown")
        )
    }

    /// Whether teardown must skip waiting for agent acknowledgements.
    pub fn needs_force_detach(&self) -> bool {
        !self.spec.hub_accepts_client || self.is_unavailable()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn cluster_with_mode(mode: Option<&str>) -> ManagedCluster {
        let mut mc = ManagedCluster::new("test", ManagedClusterSpec::default());
        if let Some(mode) = mode {
            mc.metadata.annotations = Some(BTreeMap::from([(
                ANNOTATION_KLUSTERLET_DEPLOY_MODE.to_string(),
                mode.to_string(),
            )]));
        }
        mc
    }

    fn cluster_with_available(status: &str) -> ManagedCluster {
        let mut mc = ManagedCluster::new("test", ManagedClusterSpec::default());
        mc.status = Some(ManagedClusterStatus {
            conditions: Some(vec![Condition::new(
                CONDITION_AVAILABLE,
                status,
                "ManagedClusterAvailable",
                "",
            )]),
            ..Default::default()
        });
        mc
    }

    #[test]
    fn deploy_mode_defaults_when_annotation_absent() {
        assert_eq!(
            cluster_with_mode(None).deploy_mode().unwrap(),
            KlusterletDeployMode::Default
        );
        assert_eq!(
            cluster_with_mode(Some("hosted")).deploy_mode().unwrap(),
            KlusterletDeployMode::Hosted
        );
        assert_eq!(
            cluster_with_mode(Some("detached")).deploy_mode().unwrap(),
            KlusterletDeployMode::Detached
        );
    }

    #[test]
    fn deploy_mode_rejects_unknown_values() {
        assert!(matches!(
            cluster_with_mode(Some("standalone")).deploy_mode(),
            Err(Error::InvalidDeployMode(v)) if v == "standalone"
        ));
    }

    #[test]
    fn imported_requires_the_condition_to_be_true() {
        let mut mc = ManagedCluster::new("test", ManagedClusterSpec::default());
        assert!(!mc.is_imported());

        mc.status = Some(ManagedClusterStatus {
            conditions: Some(vec![Condition::new(
                CONDITION_IMPORT_SUCCEEDED,
                "False",
                REASON_IMPORTING,
                "",
            )]),
            ..Default::default()
        });
        assert!(!mc.is_imported());

        mc.status = Some(ManagedClusterStatus {
            conditions: Some(vec![Condition::new(
                CONDITION_IMPORT_SUCCEEDED,
                "True",
                REASON_IMPORTED,
                "",
            )]),
            ..Default::default()
        });
        assert!(mc.is_imported());
    }

    #[test]
    fn unavailable_covers_false_and_unknown() {
        assert!(cluster_with_available("False").is_unavailable());
        assert!(cluster_with_available("Unknown").is_unavailable());
        assert!(!cluster_with_available("True").is_unavailable());
        // no condition at all: cannot say it is unavailable
        let mc = ManagedCluster::new("test", ManagedClusterSpec::default());
        assert!(!mc.is_unavailable());
    }

    #[test]
    fn force_detach_when_hub_no_longer_accepts() {
        let mut mc = cluster_with_available("True");
        assert!(mc.needs_force_detach(), "hubAcceptsClient defaults to false");
        mc.spec.hub_accepts_client = true;
        assert!(!mc.needs_force_detach());
        let mut mc = cluster_with_available("Unknown");
        mc.spec.hub_accepts_client = true;
        assert!(mc.needs_force_detach());
    }
}
