//! Error types for the vault-signer controller

use thiserror::Error;

use crate::vault::VaultError;

/// Main error type for vault-signer operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Vault client error
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// Configuration error, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Certificate request parse or verification error
    #[error("certificate request error: {0}")]
    Csr(String),

    /// One or more usage tokens on the request are not recognized
    #[error("unrecognized certificate usages: {0:?}")]
    UnrecognizedUsages(Vec<String>),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The watch cache terminated before or during synchronization
    #[error("cache sync error: {0}")]
    CacheSync(String),

    /// Retryable sync failure that is logged at debug instead of error
    ///
    /// Ignorable errors take the same rate-limited retry path as every other
    /// sync failure; the classification only changes how loudly they are
    /// reported.
    #[error("{0}")]
    Ignorable(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a certificate request error with the given message
    pub fn csr(msg: impl Into<String>) -> Self {
        Self::Csr(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a cache sync error with the given message
    pub fn cache_sync(msg: impl Into<String>) -> Self {
        Self::CacheSync(msg.into())
    }

    /// Create an ignorable sync error with the given message
    pub fn ignorable(msg: impl Into<String>) -> Self {
        Self::Ignorable(msg.into())
    }

    /// Whether this error should be logged at debug rather than reported
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::Ignorable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Classification During Reconciliation
    // ==========================================================================
    //
    // Failed syncs re-enter the queue through the rate limiter regardless of
    // error type; the variants exist so the worker loop and the operator
    // reading the logs can tell failure categories apart.

    /// Story: a malformed CSR body surfaces as a certificate request error
    ///
    /// Unparseable request bytes come from the requester, not from us, so the
    /// message carries enough context to find the offending object.
    #[test]
    fn story_malformed_request_produces_csr_error() {
        let err = Error::csr("unable to decode PEM block from request");
        assert!(err.to_string().contains("certificate request error"));
        assert!(err.to_string().contains("PEM"));
        assert!(!err.is_ignorable());

        match Error::csr("any message") {
            Error::Csr(msg) => assert_eq!(msg, "any message"),
            _ => panic!("expected Csr variant"),
        }
    }

    /// Story: unknown usage tokens are reported together
    ///
    /// A request asking for usages we cannot translate fails with every bad
    /// token listed, so the requester fixes them in one pass.
    #[test]
    fn story_all_unrecognized_usages_are_listed() {
        let err = Error::UnrecognizedUsages(vec!["flying".into(), "swimming".into()]);
        let msg = err.to_string();
        assert!(msg.contains("flying"));
        assert!(msg.contains("swimming"));
    }

    /// Story: ignorable errors retry quietly
    ///
    /// Requests dropped by a filter class still requeue, but the worker logs
    /// them at debug so routine skips do not page anyone.
    #[test]
    fn story_ignorable_errors_keep_their_message() {
        let err = Error::ignorable("request is not for this signer class");
        assert!(err.is_ignorable());
        assert_eq!(err.to_string(), "request is not for this signer class");

        // every other variant is reportable
        assert!(!Error::config("missing VAULT_ADDR").is_ignorable());
        assert!(!Error::cache_sync("watch writer dropped").is_ignorable());
    }

    /// Story: configuration errors fail startup with actionable text
    #[test]
    fn story_config_errors_name_the_missing_setting() {
        let err = Error::config("vault auth config has no approle section");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("approle"));
    }
}
