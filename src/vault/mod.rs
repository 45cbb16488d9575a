//! Vault integration
//!
//! Everything that talks to Vault lives here: the HTTP [`client`], the
//! login flows in [`auth`], and the session renewal loop in [`watch`]. The
//! [`VaultSigner`] at the root adapts the PKI engine's sign-verbatim
//! endpoint to the signing backend interface the request handler drives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::signer::usages::{ExtKeyUsage, KeyUsage};
use crate::signer::SignerBackend;
use crate::{Error, Result};

pub mod auth;
pub mod client;
pub mod watch;

pub use auth::Authenticator;
pub use client::{
    IssuedCertificate, Session, SignRequest, VaultApi, VaultClient, VaultClientConfig, VaultError,
};
pub use watch::{LifetimeWatcher, SessionWatcher};

/// Signing backend backed by Vault's PKI sign-verbatim endpoint
///
/// Sign-verbatim issues exactly what the request asks for, so usage policy
/// stays with the handler and its recognizer rather than with a Vault role.
pub struct VaultSigner {
    api: Arc<dyn VaultApi>,
    mount: String,
    role: String,
}

impl VaultSigner {
    /// Backend issuing through the given PKI mount and role
    pub fn new(api: Arc<dyn VaultApi>, mount: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            api,
            mount: mount.into(),
            role: role.into(),
        }
    }
}

#[async_trait]
impl SignerBackend for VaultSigner {
    async fn sign(
        &self,
        csr_der: &[u8],
        key_usage: KeyUsage,
        ext_key_usages: &[ExtKeyUsage],
        ttl: Duration,
    ) -> Result<Vec<u8>> {
        let csr_pem = pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", csr_der));
        let request = SignRequest {
            mount: self.mount.clone(),
            role: self.role.clone(),
            csr_pem,
            ttl,
            key_usage: key_usage.names().iter().map(|n| n.to_string()).collect(),
            ext_key_usage: ext_key_usages.iter().map(|e| e.name().to_string()).collect(),
        };
        let issued = self.api.sign_certificate(request).await?;

        // Engines differ in whitespace and trailing newlines; re-encode so
        // status always carries one canonical CERTIFICATE block.
        let block = pem::parse(issued.certificate.as_bytes())
            .map_err(|e| Error::csr(format!("vault returned an unparseable certificate: {e}")))?;
        if block.tag() != "CERTIFICATE" {
            return Err(Error::csr(format!(
                "vault returned unexpected PEM block {:?}",
                block.tag()
            )));
        }
        Ok(pem::encode(&block).into_bytes())
    }
}
