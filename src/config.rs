//! Process configuration and the Vault auth config file
//!
//! Every setting has a long flag and an environment-variable fallback, so the
//! controller runs unchanged as a plain binary or inside a pod spec. The auth
//! config is a separate YAML file because it carries credentials and is
//! typically mounted from a Secret.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::{Error, Result, DEFAULT_SIGNER_NAME, DEFAULT_WORKERS};

/// vault-signer - sign Kubernetes CSRs through a Vault PKI engine
#[derive(Parser, Debug, Clone)]
#[command(name = "vault-signer", version, about, long_about = None)]
pub struct Config {
    /// Path to a kubeconfig file; uses in-cluster configuration when omitted
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Maximum validity granted to issued certificates
    ///
    /// Requests asking for more are clamped down to this value; requests
    /// asking for nothing get exactly this value.
    #[arg(long, env = "SIGNING_DURATION", default_value = "8760h", value_parser = humantime::parse_duration)]
    pub signing_duration: Duration,

    /// Vault server address, e.g. https://vault.example.com:8200
    #[arg(long, env = "VAULT_ADDR")]
    pub vault_address: String,

    /// Path to the Vault auth config YAML file
    #[arg(long, env = "VAULT_AUTH_CONFIG")]
    pub vault_auth_config: PathBuf,

    /// Mount path of the Vault PKI secrets engine
    #[arg(long, env = "VAULT_PKI")]
    pub vault_pki: String,

    /// Vault PKI role used for issuance
    #[arg(long, env = "VAULT_ROLE")]
    pub vault_role: String,

    /// Signer name this controller is responsible for
    #[arg(long, default_value = DEFAULT_SIGNER_NAME)]
    pub signer_name: String,

    /// Number of concurrent reconciliation workers
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Request timeout for Vault HTTP calls
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub vault_timeout: Duration,
}

/// Vault authentication method selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AuthMethod {
    /// Authenticate with a role id / secret id pair
    #[serde(rename = "app-role", alias = "approle")]
    AppRole,
    /// Authenticate with the pod's service account token
    #[serde(rename = "kubernetes")]
    Kubernetes,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::AppRole => write!(f, "app-role"),
            AuthMethod::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// App-role credentials
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppRoleConfig {
    /// Role id of the app role
    pub role_id: String,
    /// Secret id of the app role
    pub secret_id: String,
}

/// Kubernetes (cluster identity) auth settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubernetesConfig {
    /// Name of the Vault role bound to the service account
    pub role_name: String,
    /// Override for the service account token path
    #[serde(default)]
    pub token_path: Option<PathBuf>,
}

/// Vault authentication configuration, loaded once at startup
///
/// A method selector plus one sub-record per supported method. Only the
/// record matching the selected method is required; an unknown method or a
/// missing record is a fatal configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Selected authentication method
    pub method: AuthMethod,
    /// Credentials for the app-role method
    #[serde(default)]
    pub app_role: Option<AppRoleConfig>,
    /// Settings for the kubernetes method
    #[serde(default)]
    pub kubernetes: Option<KubernetesConfig>,
}

impl AuthConfig {
    /// Read and validate the auth config file
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!(
                "unable to read vault auth config {}: {e}",
                path.display()
            ))
        })?;
        let config: AuthConfig = serde_yaml::from_str(&raw).map_err(|e| {
            Error::config(format!(
                "unable to parse vault auth config {}: {e}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the record for the selected method is present and complete
    ///
    /// All problems are reported in one error so a bad file is fixed in a
    /// single pass.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        match self.method {
            AuthMethod::AppRole => match &self.app_role {
                None => missing.push("app_role section".to_string()),
                Some(app_role) => {
                    if app_role.role_id.is_empty() {
                        missing.push("app_role.role_id".to_string());
                    }
                    if app_role.secret_id.is_empty() {
                        missing.push("app_role.secret_id".to_string());
                    }
                }
            },
            AuthMethod::Kubernetes => match &self.kubernetes {
                None => missing.push("kubernetes section".to_string()),
                Some(kubernetes) => {
                    if kubernetes.role_name.is_empty() {
                        missing.push("kubernetes.role_name".to_string());
                    }
                }
            },
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::config(format!(
                "vault auth config for method {} is incomplete, missing: {}",
                self.method,
                missing.join(", ")
            )))
        }
    }
}
