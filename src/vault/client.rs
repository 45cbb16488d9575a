//! Thin HTTP client for the Vault API
//!
//! The client owns the current session token behind a lock; the session
//! watcher is the only writer, everyone else reads the always-current value
//! indirectly by making requests. Request timeout handling is delegated to
//! the underlying HTTP client.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[cfg(test)]
use mockall::automock;

/// Errors from the Vault client
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VaultError {
    /// The configured address could not be parsed
    #[error("invalid vault address {address:?}: {reason}")]
    InvalidAddress {
        /// The address as configured
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// Transport-level failure talking to Vault
    #[error("vault request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Vault answered with an error status
    #[error("vault returned status {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Joined messages from the response's errors list
        message: String,
    },

    /// The response carried no auth block
    #[error("vault response is missing auth data")]
    MissingAuthData,

    /// The response carried no signed certificate
    #[error("vault response is missing certificate data")]
    MissingCertificate,

    /// Renewal requires a renewable session
    #[error("secret is not renewable")]
    NotRenewable,
}

/// An authenticated Vault session
///
/// Holds the client token plus the lease metadata the renewal loop needs.
/// The token is zeroized on drop and never appears in Debug output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Session {
    token: String,
    /// Whether the lease can be renewed
    #[zeroize(skip)]
    pub renewable: bool,
    /// Validity window granted by the server
    #[zeroize(skip)]
    pub lease_duration: Duration,
    /// Auth metadata returned by the server (role name and friends)
    #[zeroize(skip)]
    pub metadata: HashMap<String, String>,
}

impl Session {
    /// Create a session from its parts
    pub fn new(token: impl Into<String>, renewable: bool, lease_duration: Duration) -> Self {
        Self {
            token: token.into(),
            renewable,
            lease_duration,
            metadata: HashMap::new(),
        }
    }

    /// The client token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Role name from the auth metadata, when the server reported one
    pub fn role_name(&self) -> Option<&str> {
        self.metadata
            .get("role_name")
            .or_else(|| self.metadata.get("role"))
            .map(String::as_str)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("renewable", &self.renewable)
            .field("lease_duration", &self.lease_duration)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Parameters for a sign-verbatim issuance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    /// Mount path of the PKI secrets engine
    pub mount: String,
    /// PKI role to issue under
    pub role: String,
    /// The certificate request, PEM encoded
    pub csr_pem: String,
    /// Requested validity
    pub ttl: Duration,
    /// Key usage names, in the backend's spelling
    pub key_usage: Vec<String>,
    /// Extended key usage names, in the backend's spelling
    pub ext_key_usage: Vec<String>,
}

/// A certificate issued by the PKI engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssuedCertificate {
    /// The issued certificate, PEM encoded
    pub certificate: String,
    /// Certificate of the issuing CA
    #[serde(default)]
    pub issuing_ca: Option<String>,
    /// Chain up to the root, when the engine returns one
    #[serde(default)]
    pub ca_chain: Vec<String>,
    /// Serial number of the issued certificate
    #[serde(default)]
    pub serial_number: Option<String>,
}

/// Operations the rest of the system drives against Vault
///
/// The concrete client implements this over HTTP; tests substitute a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// Log in with an app-role credential pair
    async fn login_app_role(
        &self,
        role_id: &str,
        secret_id: &str,
    ) -> Result<Session, VaultError>;

    /// Log in with a service account JWT
    async fn login_kubernetes(&self, role: &str, jwt: &str) -> Result<Session, VaultError>;

    /// Renew the current token, asking for `increment` more lease time
    async fn renew_token(&self, increment: Duration) -> Result<Session, VaultError>;

    /// Install a new session token for subsequent requests
    async fn set_token(&self, token: &str);

    /// Sign a certificate request through the PKI engine
    async fn sign_certificate(&self, request: SignRequest)
        -> Result<IssuedCertificate, VaultError>;
}

/// Settings for the HTTP client
#[derive(Debug, Clone)]
pub struct VaultClientConfig {
    /// Base address of the Vault server
    pub address: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for VaultClientConfig {
    fn default() -> Self {
        Self {
            address: "https://127.0.0.1:8200".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP implementation of [`VaultApi`]
pub struct VaultClient {
    http: reqwest::Client,
    address: Url,
    token: RwLock<String>,
}

impl VaultClient {
    /// Build a client for the given address
    pub fn new(config: VaultClientConfig) -> Result<Self, VaultError> {
        let address = Url::parse(&config.address).map_err(|e| VaultError::InvalidAddress {
            address: config.address.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(address.scheme(), "http" | "https") {
            return Err(VaultError::InvalidAddress {
                address: config.address,
                reason: "scheme must be http or https".to_string(),
            });
        }
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            address,
            token: RwLock::new(String::new()),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/v1/{path}",
            self.address.as_str().trim_end_matches('/')
        )
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
        authenticated: bool,
    ) -> Result<T, VaultError> {
        let mut request = self.http.post(self.endpoint(path)).json(&body);
        if authenticated {
            let token = self.token.read().await.clone();
            request = request.header("X-Vault-Token", token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            let message = if body.errors.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            } else {
                body.errors.join(", ")
            };
            return Err(VaultError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl VaultApi for VaultClient {
    async fn login_app_role(
        &self,
        role_id: &str,
        secret_id: &str,
    ) -> Result<Session, VaultError> {
        let response: AuthResponse = self
            .post(
                "auth/approle/login",
                serde_json::json!({ "role_id": role_id, "secret_id": secret_id }),
                false,
            )
            .await?;
        response
            .auth
            .map(AuthPayload::into_session)
            .ok_or(VaultError::MissingAuthData)
    }

    async fn login_kubernetes(&self, role: &str, jwt: &str) -> Result<Session, VaultError> {
        let response: AuthResponse = self
            .post(
                "auth/kubernetes/login",
                serde_json::json!({ "role": role, "jwt": jwt }),
                false,
            )
            .await?;
        response
            .auth
            .map(AuthPayload::into_session)
            .ok_or(VaultError::MissingAuthData)
    }

    async fn renew_token(&self, increment: Duration) -> Result<Session, VaultError> {
        let response: AuthResponse = self
            .post(
                "auth/token/renew-self",
                serde_json::json!({ "increment": format!("{}s", increment.as_secs()) }),
                true,
            )
            .await?;
        response
            .auth
            .map(AuthPayload::into_session)
            .ok_or(VaultError::MissingAuthData)
    }

    async fn set_token(&self, token: &str) {
        *self.token.write().await = token.to_string();
    }

    async fn sign_certificate(
        &self,
        request: SignRequest,
    ) -> Result<IssuedCertificate, VaultError> {
        let path = sign_verbatim_path(&request.mount, &request.role);
        let body = serde_json::json!({
            "csr": request.csr_pem,
            "ttl": format!("{}s", request.ttl.as_secs()),
            "key_usage": request.key_usage,
            "ext_key_usage": request.ext_key_usage,
        });
        let response: SignResponse = self.post(&path, body, true).await?;
        response.data.ok_or(VaultError::MissingCertificate)
    }
}

fn sign_verbatim_path(mount: &str, role: &str) -> String {
    format!("{}/sign-verbatim/{role}", mount.trim_matches('/'))
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    auth: Option<AuthPayload>,
}

#[derive(Debug, Deserialize)]
struct AuthPayload {
    client_token: String,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

impl AuthPayload {
    fn into_session(self) -> Session {
        Session {
            token: self.client_token,
            renewable: self.renewable,
            lease_duration: Duration::from_secs(self.lease_duration),
            metadata: self.metadata.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    data: Option<IssuedCertificate>,
}
