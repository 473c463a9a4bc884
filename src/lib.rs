use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML Error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Invalid kubeconfig: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),

    #[error("Invalid credential secret {0}: {1}")]
    InvalidCredential(String, String),

    #[error("Unsupported credential secret type {0}")]
    UnsupportedCredentialType(String),

    #[error("Invalid klusterlet deploy mode {0}")]
    InvalidDeployMode(String),

    #[error("Cluster {0} is in hosted mode but has no hosting cluster annotation")]
    HostingClusterMissing(String),

    #[error("Invalid import secret for cluster {0}: {1}")]
    InvalidImportSecret(String, String),

    #[error("The API group {group} with kind {kind} is not served by the target cluster")]
    DiscoveryMissing { group: String, kind: String },

    #[error("Cluster service call failed: {message}")]
    ExternalService { message: String, retryable: bool },

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    #[error("Cleanup is incomplete: {0} step(s) failed, first: {1}")]
    PartialCleanup(usize, String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::KubeError(_) => "KubeError",
            Error::KubeconfigError(_) => "KubeconfigError",
            Error::InvalidCredential(_, _) => "InvalidCredential",
            Error::UnsupportedCredentialType(_) => "UnsupportedCredentialType",
            Error::InvalidDeployMode(_) => "InvalidDeployMode",
            Error::HostingClusterMissing(_) => "HostingClusterMissing",
            Error::InvalidImportSecret(_, _) => "InvalidImportSecret",
            Error::DiscoveryMissing { .. } => "DiscoveryMissing",
            Error::ExternalService { .. } => "ExternalService",
            Error::HttpError(_) => "HttpError",
            Error::InvalidUrl(_) => "InvalidUrl",
            Error::PartialCleanup(_, _) => "PartialCleanup",
        }
    }

    /// Whether a retry against the same credentials can be expected to make progress.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InvalidCredential(_, _)
            | Error::UnsupportedCredentialType(_)
            | Error::InvalidDeployMode(_)
            | Error::HostingClusterMissing(_)
            | Error::InvalidImportSecret(_, _) => false,
            Error::ExternalService { retryable, .. } => *retryable,
            _ => true,
        }
    }
}

pub mod controllers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

pub use controllers::{run, State};

/// CRDs managed and consumed by the operator
pub mod resources;
