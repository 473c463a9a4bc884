use k8s_openapi::api::core::v1::Secret;
use reqwest::{redirect, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::resources::imports::secret_string;
use crate::{Error, Result};

pub static DEFAULT_API_URL: &str = "https://api.openshift.com";
pub static DEFAULT_TOKEN_URL: &str =
    "https://sso.redhat.com/auth/realms/redhat-external/protocol/openid-connect/token";

/// The ephemeral identity provisioned on the target cluster for the import
pub static IMPORT_IDP_NAME: &str = "acm-import";
pub static IMPORT_USER: &str = "acm-import";
pub static CLUSTER_ADMIN_GROUP: &str = "cluster-admins";

static SSO_PUBLIC_CLIENT_ID: &str = "cloud-services";
static CHALLENGING_CLIENT_ID: &str = "openshift-challenging-client";

pub static AUTH_METHOD_KEY: &str = "auth_method";
pub static API_TOKEN_KEY: &str = "api_token";
pub static CLIENT_ID_KEY: &str = "client_id";
pub static CLIENT_SECRET_KEY: &str = "client_secret";
pub static CLUSTER_ID_KEY: &str = "cluster_id";
pub static API_URL_KEY: &str = "api_url";
pub static TOKEN_URL_KEY: &str = "token_url";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RosaAuthMethod {
    OfflineToken { api_token: String },
    ServiceAccount { client_id: String, client_secret: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosaCredentials {
    pub cluster_id: String,
    pub auth: RosaAuthMethod,
    pub api_url: String,
    pub token_url: String,
}

impl RosaCredentials {
    pub fn from_secret(cluster: &str, secret: &Secret) -> Result<RosaCredentials> {
        let missing = |key: &str| {
            Error::InvalidCredential(cluster.to_string(), format!("{key} is missing"))
        };

        let auth = match secret_string(secret, AUTH_METHOD_KEY).as_deref() {
            None | Some("offline-token") => RosaAuthMethod::OfflineToken {
                api_token: secret_string(secret, API_TOKEN_KEY)
                    .ok_or_else(|| missing(API_TOKEN_KEY))?,
            },
            Some("service-account") => RosaAuthMethod::ServiceAccount {
                client_id: secret_string(secret, CLIENT_ID_KEY)
                    .ok_or_else(|| missing(CLIENT_ID_KEY))?,
                client_secret: secret_string(secret, CLIENT_SECRET_KEY)
                    .ok_or_else(|| missing(CLIENT_SECRET_KEY))?,
            },
            Some(other) => {
                return Err(Error::InvalidCredential(
                    cluster.to_string(),
                    format!("unsupported auth method {other}"),
                ))
            }
        };

        Ok(RosaCredentials {
            cluster_id: secret_string(secret, CLUSTER_ID_KEY)
                .ok_or_else(|| missing(CLUSTER_ID_KEY))?,
            auth,
            api_url: secret_string(secret, API_URL_KEY)
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            token_url: secret_string(secret, TOKEN_URL_KEY)
                .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
        })
    }
}

/// Per-cluster state that outlives single attempts: the password of the
/// ephemeral identity, so retries do not churn it on every pass.
#[derive(Clone, Debug, Default)]
pub struct RosaTokenGetter {
    import_user_password: Option<String>,
}

impl RosaTokenGetter {
    /// Resolve a bearer token against the ROSA cluster, provisioning the
    /// import identity on the way if it does not exist yet.
    pub async fn cluster_token(&mut self, creds: &RosaCredentials) -> Result<(String, String)> {
        let session = OcmSession::connect(creds).await?;
        let api_url = session.cluster_api_url().await?;

        if self.import_user_password.is_none() {
            let password = session.ensure_import_user().await?;
            session.ensure_cluster_admin_membership().await?;
            self.import_user_password = Some(password);
        }

        let password = self
            .import_user_password
            .as_deref()
            .unwrap_or_default()
            .to_string();
        let token = request_cluster_token(&api_url, IMPORT_USER, &password).await?;
        Ok((api_url, token))
    }

    /// Drop the ephemeral identity again. Best effort, errors aggregate.
    pub async fn cleanup(&mut self, creds: &RosaCredentials) -> Result<()> {
        let session = OcmSession::connect(creds).await?;
        let mut failures = vec![];
        if let Err(e) = session.delete_import_idp().await {
            failures.push(e);
        }
        if let Err(e) = session.remove_cluster_admin_membership().await {
            failures.push(e);
        }
        self.import_user_password = None;
        match failures.len() {
            0 => Ok(()),
            n => Err(Error::PartialCleanup(n, failures.remove(0).to_string())),
        }
    }
}

/// An authenticated connection to the OCM clusters_mgmt API
struct OcmSession {
    http: reqwest::Client,
    api_url: Url,
    cluster_id: String,
    access_token: String,
}

impl OcmSession {
    async fn connect(creds: &RosaCredentials) -> Result<OcmSession> {
        let http = reqwest::Client::new();

        let form: Vec<(&str, &str)> = match &creds.auth {
            RosaAuthMethod::OfflineToken { api_token } => vec![
                ("grant_type", "refresh_token"),
                ("client_id", SSO_PUBLIC_CLIENT_ID),
                ("refresh_token", api_token),
            ],
            RosaAuthMethod::ServiceAccount {
                client_id,
                client_secret,
            } => vec![
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ],
        };

        let response = http.post(&creds.token_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::ExternalService {
                message: format!("token exchange against {} failed: {status}", creds.token_url),
                // a rejected grant will not fix itself by retrying
                retryable: !matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST),
            });
        }
        let body: Value = response.json().await?;
        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ExternalService {
                message: "token exchange response carries no access_token".to_string(),
                retryable: false,
            })?
            .to_string();

        Ok(OcmSession {
            http,
            api_url: Url::parse(&creds.api_url)?,
            cluster_id: creds.cluster_id.clone(),
            access_token,
        })
    }

    fn cluster_path(&self, suffix: &str) -> String {
        format!(
            "/api/clusters_mgmt/v1/clusters/{}{suffix}",
            self.cluster_id
        )
    }

    async fn get(&self, path: &str) -> Result<(StatusCode, Value)> {
        let response = self
            .http
            .get(self.api_url.join(path)?)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let status = response.status();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    async fn send_json(&self, method: reqwest::Method, path: &str, body: Value) -> Result<StatusCode> {
        let response = self
            .http
            .request(method, self.api_url.join(path)?)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        Ok(response.status())
    }

    fn unexpected(&self, what: &str, status: StatusCode) -> Error {
        Error::ExternalService {
            message: format!("{what} for rosa cluster {} failed: {status}", self.cluster_id),
            retryable: true,
        }
    }

    async fn cluster_api_url(&self) -> Result<String> {
        let (status, body) = self.get(&self.cluster_path("")).await?;
        if !status.is_success() {
            return Err(self.unexpected("looking up the cluster", status));
        }
        body.pointer("/api/url")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| Error::ExternalService {
                message: format!("rosa cluster {} api url is not found", self.cluster_id),
                retryable: true,
            })
    }

    /// Create or refresh the htpasswd identity, returning its password.
    async fn ensure_import_user(&self) -> Result<String> {
        let (status, body) = self.get(&self.cluster_path("/identity_providers")).await?;
        if !status.is_success() {
            return Err(self.unexpected("listing identity providers", status));
        }

        let password = generate_password();
        let provider_id = match find_htpasswd_idp(&body) {
            None => {
                let status = self
                    .send_json(
                        reqwest::Method::POST,
                        &self.cluster_path("/identity_providers"),
                        json!({
                            "name": IMPORT_IDP_NAME,
                            "type": "HTPasswdIdentityProvider",
                            "htpasswd": { "users": { "items": [
                                { "username": IMPORT_USER, "password": password }
                            ]}}
                        }),
                    )
                    .await?;
                if !status.is_success() {
                    return Err(self.unexpected("creating the import identity provider", status));
                }
                return Ok(password);
            }
            Some(id) => id,
        };

        let users_path = self.cluster_path(&format!("/identity_providers/{provider_id}/htpasswd_users"));
        let (status, users) = self.get(&users_path).await?;
        if !status.is_success() {
            return Err(self.unexpected("listing htpasswd users", status));
        }

        let user_body = json!({ "username": IMPORT_USER, "password": password });
        let status = match find_htpasswd_user(&users) {
            None => self.send_json(reqwest::Method::POST, &users_path, user_body).await?,
            Some(user_id) => {
                self.send_json(
                    reqwest::Method::PATCH,
                    &format!("{users_path}/{user_id}"),
                    json!({ "password": password }),
                )
                .await?
            }
        };
        if !status.is_success() {
            return Err(self.unexpected("provisioning the import user", status));
        }
        Ok(password)
    }

    async fn ensure_cluster_admin_membership(&self) -> Result<()> {
        let member_path =
            self.cluster_path(&format!("/groups/{CLUSTER_ADMIN_GROUP}/users/{IMPORT_USER}"));
        let (status, _) = self.get(&member_path).await?;
        if status.is_success() {
            return Ok(());
        }
        if status != StatusCode::NOT_FOUND {
            return Err(self.unexpected("checking group membership", status));
        }

        let status = self
            .send_json(
                reqwest::Method::POST,
                &self.cluster_path(&format!("/groups/{CLUSTER_ADMIN_GROUP}/users")),
                json!({ "id": IMPORT_USER }),
            )
            .await?;
        if !status.is_success() {
            return Err(self.unexpected("adding the import user to the admin group", status));
        }
        Ok(())
    }

    async fn delete_import_idp(&self) -> Result<()> {
        let (status, body) = self.get(&self.cluster_path("/identity_providers")).await?;
        if !status.is_success() {
            return Err(self.unexpected("listing identity providers", status));
        }
        let provider_id = match find_htpasswd_idp(&body) {
            None => return Ok(()),
            Some(id) => id,
        };
        let status = self
            .send_json(
                reqwest::Method::DELETE,
                &self.cluster_path(&format!("/identity_providers/{provider_id}")),
                Value::Null,
            )
            .await?;
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(self.unexpected("deleting the import identity provider", status));
        }
        Ok(())
    }

    async fn remove_cluster_admin_membership(&self) -> Result<()> {
        let member_path =
            self.cluster_path(&format!("/groups/{CLUSTER_ADMIN_GROUP}/users/{IMPORT_USER}"));
        let (status, _) = self.get(&member_path).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !status.is_success() {
            return Err(self.unexpected("checking group membership", status));
        }
        let status = self
            .send_json(reqwest::Method::DELETE, &member_path, Value::Null)
            .await?;
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(self.unexpected("removing the import user from the admin group", status));
        }
        Ok(())
    }
}

/// Exchange the htpasswd identity for a bearer token via the cluster's
/// challenging oauth client. The cluster's certificates are typically not
/// trusted yet at import time, so verification is skipped here just as it is
/// in the generated bootstrap kubeconfig.
async fn request_cluster_token(api_url: &str, username: &str, password: &str) -> Result<String> {
    let http = reqwest::Client::builder()
        .redirect(redirect::Policy::none())
        .danger_accept_invalid_certs(true)
        .build()?;

    let (status, metadata) = {
        let response = http
            .get(Url::parse(api_url)?.join("/.well-known/oauth-authorization-server")?)
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        (status, body)
    };
    if !status.is_success() {
        return Err(Error::ExternalService {
            message: format!("oauth discovery against {api_url} failed: {status}"),
            retryable: true,
        });
    }
    let authorize_endpoint = metadata
        .get("authorization_endpoint")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ExternalService {
            message: format!("{api_url} serves no authorization endpoint"),
            retryable: true,
        })?;

    let mut authorize_url = Url::parse(authorize_endpoint)?;
    authorize_url
        .query_pairs_mut()
        .append_pair("response_type", "token")
        .append_pair("client_id", CHALLENGING_CLIENT_ID);

    let response = http
        .get(authorize_url)
        .basic_auth(username, Some(password))
        .header("X-CSRF-Token", "1")
        .send()
        .await?;

    let status = response.status();
    if !status.is_redirection() {
        debug!(%status, "challenging oauth request was not redirected");
        return Err(Error::ExternalService {
            message: format!("token request against {api_url} failed: {status}"),
            // freshly provisioned identities take a while to propagate
            retryable: true,
        });
    }

    response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|l| l.to_str().ok())
        .and_then(token_from_redirect)
        .ok_or_else(|| {
            warn!("oauth redirect carried no access token");
            Error::ExternalService {
                message: format!("token request against {api_url} returned no token"),
                retryable: true,
            }
        })
}

/// Pull the access token out of an implicit-flow redirect location.
fn token_from_redirect(location: &str) -> Option<String> {
    let url = Url::parse(location).ok()?;
    url.fragment()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("access_token="))
        .map(String::from)
}

fn find_htpasswd_idp(list: &Value) -> Option<String> {
    list.get("items")?
        .as_array()?
        .iter()
        .find(|idp| {
            idp.get("name").and_then(Value::as_str) == Some(IMPORT_IDP_NAME)
                && idp
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.eq_ignore_ascii_case("HTPasswdIdentityProvider"))
        })?
        .get("id")
        .and_then(Value::as_str)
        .map(String::from)
}

fn find_htpasswd_user(list: &Value) -> Option<String> {
    list.get("items")?
        .as_array()?
        .iter()
        .find(|user| user.get("username").and_then(Value::as_str) == Some(IMPORT_USER))?
        .get("id")
        .and_then(Value::as_str)
        .map(String::from)
}

fn generate_password() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(data: &[(&str, &str)]) -> Secret {
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
    fn offline_token_is_the_default_auth_method() {
        let creds = RosaCredentials::from_secret(
            "c1",
            &secret(&[(API_TOKEN_KEY, "tok"), (CLUSTER_ID_KEY, "abc")]),
        )
        .unwrap();
        assert_eq!(
            creds.auth,
            RosaAuthMethod::OfflineToken {
                api_token: "tok".to_string()
            }
        );
        assert_eq!(creds.api_url, DEFAULT_API_URL);
        assert_eq!(creds.token_url, DEFAULT_TOKEN_URL);
    }

    #[test]
    fn service_account_requires_both_halves() {
        let err = RosaCredentials::from_secret(
            "c1",
            &secret(&[
                (AUTH_METHOD_KEY, "service-account"),
                (CLIENT_ID_KEY, "id"),
                (CLUSTER_ID_KEY, "abc"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_, m) if m.contains(CLIENT_SECRET_KEY)));
    }

    #[test]
    fn missing_cluster_id_is_invalid() {
        let err = RosaCredentials::from_secret("c1", &secret(&[(API_TOKEN_KEY, "tok")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_, m) if m.contains(CLUSTER_ID_KEY)));
    }

    #[test]
    fn unknown_auth_method_is_invalid() {
        let err = RosaCredentials::from_secret(
            "c1",
            &secret(&[(AUTH_METHOD_KEY, "device-code"), (CLUSTER_ID_KEY, "abc")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_, m) if m.contains("device-code")));
    }

    #[test]
    fn redirect_fragment_token_extraction() {
        assert_eq!(
            token_from_redirect(
                "https://console.example.com/oauth/token/implicit#access_token=sha256~abc&expires_in=86400&token_type=Bearer"
            ),
            Some("sha256~abc".to_string())
        );
        assert_eq!(
            token_from_redirect("https://console.example.com/?error=access_denied"),
            None
        );
    }

    #[test]
    fn idp_lookup_matches_name_and_type() {
        let list = serde_json::json!({ "items": [
            { "id": "idp-1", "name": "company-sso", "type": "OpenIDIdentityProvider" },
            { "id": "idp-2", "name": IMPORT_IDP_NAME, "type": "HTPasswdIdentityProvider" },
        ]});
        assert_eq!(find_htpasswd_idp(&list), Some("idp-2".to_string()));

        let mismatched = serde_json::json!({ "items": [
            { "id": "idp-3", "name": IMPORT_IDP_NAME, "type": "OpenIDIdentityProvider" },
        ]});
        assert_eq!(find_htpasswd_idp(&mismatched), None);
    }
}
