use k8s_openapi::api::core::v1::Secret;

use crate::{Error, Result};

/// Name of the credential secret a user drops into the cluster namespace
pub static AUTO_IMPORT_SECRET_NAME: &str = "auto-import-secret";

/// Data key on the credential secret holding the total attempt budget
pub static AUTO_IMPORT_RETRY_KEY: &str = "autoImportRetry";
/// Budget key used by rosa credential secrets instead
pub static ROSA_RETRY_TIMES_KEY: &str = "retry_times";

/// Annotation persisting the attempt counter across controller restarts
pub static ANNOTATION_CURRENT_RETRY: &str =
    "managedcluster-import-controller.open-cluster-management.io/current-retry";
/// Presence keeps the credential secret around after the flow finishes
pub static ANNOTATION_KEEP_AUTO_IMPORT_SECRET: &str =
    "managedcluster-import-controller.open-cluster-management.io/keeping-auto-import-secret";

pub static SECRET_TYPE_KUBECONFIG: &str = "auto-import/kubeconfig";
pub static SECRET_TYPE_KUBETOKEN: &str = "auto-import/kubetoken";
pub static SECRET_TYPE_ROSA: &str = "auto-import/rosa";

pub static KUBECONFIG_KEY: &str = "kubeconfig";
pub static TOKEN_KEY: &str = "token";
pub static SERVER_KEY: &str = "server";

pub static IMPORT_SECRET_SUFFIX: &str = "import";
pub static IMPORT_YAML_KEY: &str = "import.yaml";
pub static CRDS_V1_YAML_KEY: &str = "crdsv1.yaml";
pub static CRDS_V1BETA1_YAML_KEY: &str = "crdsv1beta1.yaml";

pub fn import_secret_name(cluster: &str) -> String {
    format!("{cluster}-{IMPORT_SECRET_SUFFIX}")
}

/// Read a data key off a secret as UTF-8
pub fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .filter(|v| !v.is_empty())
}

pub fn secret_has_key(secret: &Secret, key: &str) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| !v.0.is_empty())
        == Some(true)
}

/// The rendered klusterlet installation payload for one cluster, produced
/// into the `<cluster>-import` secret by the payload generator.
#[derive(Clone, Debug)]
pub struct ImportPayload {
    pub import_yaml: String,
    pub crds_v1: Option<String>,
    pub crds_v1beta1: Option<String>,
}

impl ImportPayload {
    pub fn from_secret(cluster: &str, secret: &Secret) -> Result<ImportPayload> {
        let import_yaml = secret_string(secret, IMPORT_YAML_KEY).ok_or_else(|| {
            Error::InvalidImportSecret(
                cluster.to_string(),
                format!("the data key {IMPORT_YAML_KEY} is missing or empty"),
            )
        })?;

        Ok(ImportPayload {
            import_yaml,
            crds_v1: secret_string(secret, CRDS_V1_YAML_KEY),
            crds_v1beta1: secret_string(secret, CRDS_V1BETA1_YAML_KEY),
        })
    }

    /// Pick the CRD document matching what the target cluster serves.
    pub fn crds_for(&self, v1_supported: bool) -> Option<&str> {
        if v1_supported {
            self.crds_v1.as_deref().or(self.crds_v1beta1.as_deref())
        } else {
            self.crds_v1beta1.as_deref()
        }
    }
}

/// Whether a cluster at this Kubernetes version serves apiextensions v1.
/// CRD v1 landed in 1.16; an unparsable version assumes a modern cluster.
pub fn supports_crd_v1(kubernetes_version: &str) -> bool {
    let trimmed = kubernetes_version.trim_start_matches('v');
    let mut parts = trimmed.split(['.', '-', '+']);
    let major: u32 = match parts.next().and_then(|p| p.parse().ok()) {
        Some(m) => m,
        None => return true,
    };
    let minor: u32 = match parts.next().and_then(|p| p.parse().ok()) {
        Some(m) => m,
        None => return true,
    };
    (major, minor) >= (1, 16)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret_with(data: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn payload_requires_import_yaml() {
        let err = ImportPayload::from_secret("c1", &secret_with(&[(CRDS_V1_YAML_KEY, "crds")]))
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidImportSecret(c, _) if c == "c1"));

        let err = ImportPayload::from_secret("c1", &secret_with(&[(IMPORT_YAML_KEY, "")]))
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidImportSecret(_, _)));
    }

    #[test]
    fn crd_document_choice_follows_target_support() {
        let payload = ImportPayload::from_secret(
            "c1",
            &secret_with(&[
                (IMPORT_YAML_KEY, "manifests"),
                (CRDS_V1_YAML_KEY, "v1"),
                (CRDS_V1BETA1_YAML_KEY, "v1beta1"),
            ]),
        )
        .unwrap();
        assert_eq!(payload.crds_for(true), Some("v1"));
        assert_eq!(payload.crds_for(false), Some("v1beta1"));
    }

    #[test]
    fn crd_v1_support_by_version() {
        assert!(supports_crd_v1("v1.18.3"));
        assert!(supports_crd_v1("1.16.0"));
        assert!(supports_crd_v1("v1.28.2+rke2r1"));
        assert!(!supports_crd_v1("v1.15.9"));
        assert!(!supports_crd_v1("0.9.1"));
        // unknown versions assume a modern apiserver
        assert!(supports_crd_v1("weird"));
    }
}
