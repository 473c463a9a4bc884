use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;

use crate::resources::imports::{
    secret_has_key, secret_string, KUBECONFIG_KEY, SECRET_TYPE_KUBECONFIG, SECRET_TYPE_KUBETOKEN,
    SECRET_TYPE_ROSA, SERVER_KEY, TOKEN_KEY,
};
use crate::{Error, Result};

pub static CA_KEY: &str = "ca.crt";

/// How the credential secret authenticates against the target cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    Kubeconfig,
    Token,
    Rosa,
}

/// Dispatch on the secret type. Opaque secrets are inspected by field for
/// compatibility with older payload generators.
pub fn credential_kind(cluster: &str, secret: &Secret) -> Result<CredentialKind> {
    match secret.type_.as_deref() {
        t if t == Some(SECRET_TYPE_KUBECONFIG) => Ok(CredentialKind::Kubeconfig),
        t if t == Some(SECRET_TYPE_KUBETOKEN) => Ok(CredentialKind::Token),
        t if t == Some(SECRET_TYPE_ROSA) => Ok(CredentialKind::Rosa),
        Some("Opaque") | None => {
            if secret_has_key(secret, KUBECONFIG_KEY) {
                return Ok(CredentialKind::Kubeconfig);
            }
            if secret_has_key(secret, TOKEN_KEY) && secret_has_key(secret, SERVER_KEY) {
                return Ok(CredentialKind::Token);
            }
            Err(Error::InvalidCredential(
                cluster.to_string(),
                "kubeconfig or token/server pair is missing".to_string(),
            ))
        }
        Some(other) => Err(Error::UnsupportedCredentialType(other.to_string())),
    }
}

/// The kubeconfig the credentials boil down to, either carried verbatim or
/// generated around a bearer token.
pub fn kubeconfig_from_secret(cluster: &str, secret: &Secret) -> Result<Kubeconfig> {
    match credential_kind(cluster, secret)? {
        CredentialKind::Kubeconfig => {
            let raw = secret_string(secret, KUBECONFIG_KEY).ok_or_else(|| {
                Error::InvalidCredential(
                    cluster.to_string(),
                    format!("the data key {KUBECONFIG_KEY} is missing or empty"),
                )
            })?;
            Ok(Kubeconfig::from_yaml(&raw)?)
        }
        CredentialKind::Token => {
            let token = secret_string(secret, TOKEN_KEY).ok_or_else(|| {
                Error::InvalidCredential(
                    cluster.to_string(),
                    format!("the data key {TOKEN_KEY} is missing or empty"),
                )
            })?;
            let server = secret_string(secret, SERVER_KEY).ok_or_else(|| {
                Error::InvalidCredential(
                    cluster.to_string(),
                    format!("the data key {SERVER_KEY} is missing or empty"),
                )
            })?;
            let ca = secret
                .data
                .as_ref()
                .and_then(|d| d.get(CA_KEY))
                .map(|b| base64::engine::general_purpose::STANDARD.encode(&b.0));
            kubeconfig_for_token(&server, &token, ca.as_deref())
        }
        CredentialKind::Rosa => Err(Error::InvalidCredential(
            cluster.to_string(),
            "a rosa credential carries no kubeconfig of its own".to_string(),
        )),
    }
}

/// Generate a single-context kubeconfig around a bearer token. Without CA
/// material the connection falls back to skipping verification, matching
/// what cluster provisioners hand out for bootstrap tokens.
pub fn kubeconfig_for_token(server: &str, token: &str, ca_data: Option<&str>) -> Result<Kubeconfig> {
    let cluster = match ca_data {
        Some(ca) => json!({ "server": server, "certificate-authority-data": ca }),
        None => json!({ "server": server, "insecure-skip-tls-verify": true }),
    };
    let kubeconfig: Kubeconfig = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "default-cluster", "cluster": cluster }],
        "users": [{ "name": "default-auth", "user": { "token": token } }],
        "contexts": [{
            "name": "default-context",
            "context": { "cluster": "default-cluster", "user": "default-auth", "namespace": "default" }
        }],
        "current-context": "default-context"
    }))?;
    Ok(kubeconfig)
}

/// Build a client against the target cluster from a resolved kubeconfig.
pub async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client> {
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(type_: Option<&str>, data: &[(&str, &str)]) -> Secret {
        Secret {
            type_: type_.map(String::from),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn typed_secrets_dispatch_directly() {
        assert_eq!(
            credential_kind("c1", &secret(Some(SECRET_TYPE_KUBECONFIG), &[])).unwrap(),
            CredentialKind::Kubeconfig
        );
        assert_eq!(
            credential_kind("c1", &secret(Some(SECRET_TYPE_KUBETOKEN), &[])).unwrap(),
            CredentialKind::Token
        );
        assert_eq!(
            credential_kind("c1", &secret(Some(SECRET_TYPE_ROSA), &[])).unwrap(),
            CredentialKind::Rosa
        );
    }

    #[test]
    fn opaque_secrets_are_inspected_by_field() {
        assert_eq!(
            credential_kind("c1", &secret(Some("Opaque"), &[(KUBECONFIG_KEY, "yaml")])).unwrap(),
            CredentialKind::Kubeconfig
        );
        assert_eq!(
            credential_kind(
                "c1",
                &secret(Some("Opaque"), &[(TOKEN_KEY, "t"), (SERVER_KEY, "s")])
            )
            .unwrap(),
            CredentialKind::Token
        );
        // kubeconfig wins when both are present
        assert_eq!(
            credential_kind(
                "c1",
                &secret(
                    Some("Opaque"),
                    &[(KUBECONFIG_KEY, "yaml"), (TOKEN_KEY, "t"), (SERVER_KEY, "s")]
                )
            )
            .unwrap(),
            CredentialKind::Kubeconfig
        );
    }

    #[test]
    fn opaque_secret_with_partial_fields_is_invalid() {
        assert!(matches!(
            credential_kind("c1", &secret(Some("Opaque"), &[(TOKEN_KEY, "t")])),
            Err(Error::InvalidCredential(_, _))
        ));
        assert!(matches!(
            credential_kind("c1", &secret(Some("kubernetes.io/tls"), &[])),
            Err(Error::UnsupportedCredentialType(t)) if t == "kubernetes.io/tls"
        ));
    }

    #[test]
    fn token_kubeconfig_skips_verification_only_without_ca() {
        let kc = kubeconfig_for_token("https://api.example.com:6443", "tok", None).unwrap();
        let cluster = kc.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(
            cluster.server.as_deref(),
            Some("https://api.example.com:6443")
        );
        assert_eq!(cluster.insecure_skip_tls_verify, Some(true));

        let kc = kubeconfig_for_token("https://api.example.com:6443", "tok", Some("Y2E=")).unwrap();
        let cluster = kc.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.certificate_authority_data.as_deref(), Some("Y2E="));
        assert_eq!(cluster.insecure_skip_tls_verify, None);
    }

    #[test]
    fn blob_resolution_requires_the_named_fields() {
        let err =
            kubeconfig_from_secret("c1", &secret(Some(SECRET_TYPE_KUBETOKEN), &[(TOKEN_KEY, "t")]))
                .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_, m) if m.contains(SERVER_KEY)));
    }
}
