//! vault-signer - Kubernetes CSR signing controller backed by Vault
//!
//! vault-signer watches `CertificateSigningRequest` objects cluster-wide and,
//! for approved requests addressed to its configured signer name, signs them
//! through a Vault PKI engine and writes the issued certificate back into the
//! request status.
//!
//! # Architecture
//!
//! Three cooperating subsystems, wired together in `main`:
//! - A queue-based reconciliation engine that deduplicates work, rate-limits
//!   retries, and guarantees at-most-once-in-flight per request
//! - A signer state machine that gates on approval and signer name, validates
//!   the CSR, and drives issuance through the PKI backend
//! - A credential lifecycle manager that keeps the Vault session alive,
//!   re-authenticating when renewal runs out
//!
//! # Modules
//!
//! - [`controller`] - Generic queue-based reconciliation engine
//! - [`signer`] - CSR signing state machine and key-usage translation
//! - [`vault`] - Vault client, authentication, and session lifecycle
//! - [`config`] - Process configuration and the auth config file
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod signer;
pub mod vault;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Signer name this controller handles unless overridden on the command line
///
/// Only CertificateSigningRequests whose `spec.signerName` equals the
/// configured name are processed; everything else is silently skipped.
pub const DEFAULT_SIGNER_NAME: &str = "vault-signer.io/pki";

/// Default number of concurrent reconciliation workers
pub const DEFAULT_WORKERS: usize = 5;

/// Default path of the service account token used for kubernetes auth
pub const DEFAULT_SERVICE_ACCOUNT_TOKEN_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";
