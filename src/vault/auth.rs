//! Vault login flows
//!
//! One authenticator per process, built from the auth config file. It knows
//! how to perform the initial login and is reused by the session watcher
//! whenever the current session can no longer be renewed.

use std::path::PathBuf;

use tracing::info;

use super::client::{Session, VaultApi};
use crate::config::{AuthConfig, AuthMethod};
use crate::{Error, Result, DEFAULT_SERVICE_ACCOUNT_TOKEN_PATH};

/// Logs into Vault with the configured method and installs the session token
pub struct Authenticator {
    config: AuthConfig,
}

impl Authenticator {
    /// Build an authenticator from a validated auth config
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Perform a login and hand the new token to the client
    ///
    /// The service account JWT is re-read on every call so a rotated token
    /// is picked up the next time we authenticate.
    pub async fn authenticate(&self, client: &dyn VaultApi) -> Result<Session> {
        let session = match self.config.method {
            AuthMethod::AppRole => {
                let app_role = self
                    .config
                    .app_role
                    .as_ref()
                    .ok_or_else(|| Error::config("vault auth config has no app_role section"))?;
                client
                    .login_app_role(&app_role.role_id, &app_role.secret_id)
                    .await?
            }
            AuthMethod::Kubernetes => {
                let kubernetes = self
                    .config
                    .kubernetes
                    .as_ref()
                    .ok_or_else(|| Error::config("vault auth config has no kubernetes section"))?;
                let token_path = kubernetes
                    .token_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVICE_ACCOUNT_TOKEN_PATH));
                let jwt = tokio::fs::read_to_string(&token_path).await.map_err(|e| {
                    Error::config(format!(
                        "unable to read service account token {}: {e}",
                        token_path.display()
                    ))
                })?;
                client
                    .login_kubernetes(&kubernetes.role_name, jwt.trim())
                    .await?
            }
        };

        client.set_token(session.token()).await;
        match session.role_name() {
            Some(role) => info!(method = %self.config.method, role, "logged into vault"),
            None => info!(method = %self.config.method, "logged into vault"),
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{AppRoleConfig, KubernetesConfig};
    use crate::vault::client::MockVaultApi;

    fn app_role_config() -> AuthConfig {
        AuthConfig {
            method: AuthMethod::AppRole,
            app_role: Some(AppRoleConfig {
                role_id: "role-123".to_string(),
                secret_id: "secret-456".to_string(),
            }),
            kubernetes: None,
        }
    }

    #[tokio::test]
    async fn app_role_login_installs_the_returned_token() {
        let mut api = MockVaultApi::new();
        api.expect_login_app_role()
            .once()
            .withf(|role_id, secret_id| role_id == "role-123" && secret_id == "secret-456")
            .returning(|_, _| Ok(Session::new("s.token", true, Duration::from_secs(3600))));
        api.expect_set_token()
            .once()
            .withf(|token| token == "s.token")
            .returning(|_| ());

        let session = Authenticator::new(app_role_config())
            .authenticate(&api)
            .await
            .expect("login succeeds");
        assert_eq!(session.token(), "s.token");
        assert!(session.renewable);
    }

    #[tokio::test]
    async fn kubernetes_login_reads_the_jwt_from_disk() {
        let token_path = std::env::temp_dir().join(format!(
            "vault-signer-jwt-{}-{}",
            std::process::id(),
            line!()
        ));
        tokio::fs::write(&token_path, "eyJhbGciOi.jwt.payload\n")
            .await
            .expect("write token file");

        let mut api = MockVaultApi::new();
        api.expect_login_kubernetes()
            .once()
            .withf(|role, jwt| role == "csr-signer" && jwt == "eyJhbGciOi.jwt.payload")
            .returning(|_, _| Ok(Session::new("s.k8s", true, Duration::from_secs(600))));
        api.expect_set_token().once().returning(|_| ());

        let config = AuthConfig {
            method: AuthMethod::Kubernetes,
            app_role: None,
            kubernetes: Some(KubernetesConfig {
                role_name: "csr-signer".to_string(),
                token_path: Some(token_path.clone()),
            }),
        };
        Authenticator::new(config)
            .authenticate(&api)
            .await
            .expect("login succeeds");

        tokio::fs::remove_file(&token_path).await.ok();
    }

    #[tokio::test]
    async fn missing_jwt_file_is_a_config_error() {
        let api = MockVaultApi::new();
        let config = AuthConfig {
            method: AuthMethod::Kubernetes,
            app_role: None,
            kubernetes: Some(KubernetesConfig {
                role_name: "csr-signer".to_string(),
                token_path: Some(PathBuf::from("/nonexistent/token")),
            }),
        };
        let err = Authenticator::new(config)
            .authenticate(&api)
            .await
            .expect_err("missing file must fail");
        assert!(err.to_string().contains("/nonexistent/token"));
    }

    #[tokio::test]
    async fn method_without_its_section_is_a_config_error() {
        let api = MockVaultApi::new();
        let config = AuthConfig {
            method: AuthMethod::AppRole,
            app_role: None,
            kubernetes: None,
        };
        let err = Authenticator::new(config)
            .authenticate(&api)
            .await
            .expect_err("section is required");
        assert!(err.to_string().contains("app_role"));
    }

    #[tokio::test]
    async fn login_failure_propagates() {
        let mut api = MockVaultApi::new();
        api.expect_login_app_role().once().returning(|_, _| {
            Err(crate::vault::client::VaultError::Api {
                status: 400,
                message: "invalid secret id".to_string(),
            })
        });
        api.expect_set_token().never();

        let err = Authenticator::new(app_role_config())
            .authenticate(&api)
            .await
            .expect_err("login failure surfaces");
        assert!(err.to_string().contains("invalid secret id"));
    }
}
