//! Certificate signing state machine
//!
//! The [`Signer`] is the handler the controller drives for every queued
//! request. It walks one request through a fixed gate order: requests that
//! are not approved, already failed, or addressed to another signer are
//! skipped; requests with durable defects (unparseable body, rejected by the
//! recognizer, untranslatable usages) never retry; everything else is signed
//! through the backend and the issued certificate is written back to the
//! request's status.
//!
//! Durable defects are split two ways on purpose. A recognizer rejection is
//! recorded on the request as a `Failed` condition so the requester can see
//! it, while parse and usage defects only surface in our logs, matching how
//! the upstream kubelet-serving signers behave.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use tracing::{debug, info};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

#[cfg(test)]
use mockall::automock;

use crate::controller::{
    has_true_condition, is_certificate_request_approved, CsrHandler, CONDITION_FAILED,
};
use crate::signer::usages::{key_usages_from_strings, ExtKeyUsage, KeyUsage};
use crate::{Error, Result};

pub mod usages;

/// Floor applied to requested expirations
///
/// Matches the minimum the built-in Kubernetes signers will issue for.
pub const MIN_SIGNING_DURATION: Duration = Duration::from_secs(600);

/// PEM block type required on incoming requests
const CSR_BLOCK_TYPE: &str = "CERTIFICATE REQUEST";

/// Reason recorded on the Failed condition when the recognizer rejects
const REASON_VALIDATION_FAILURE: &str = "SignerValidationFailure";

/// Identity and issuance policy of one signer
#[derive(Debug, Clone)]
pub struct SignerSpec {
    /// Signer name this instance answers for
    pub signer_name: String,
    /// Validity ceiling for issued certificates
    pub cert_ttl: Duration,
    /// Validity floor for issued certificates
    pub min_ttl: Duration,
}

impl SignerSpec {
    /// Spec with the default validity floor
    pub fn new(signer_name: impl Into<String>, cert_ttl: Duration) -> Self {
        Self {
            signer_name: signer_name.into(),
            cert_ttl,
            min_ttl: MIN_SIGNING_DURATION,
        }
    }
}

/// Content policy hook run on each parsed request
///
/// Receives the parsed request, the requested usages, and the request's
/// signer name. `Ok(false)` skips the request quietly; an error records a
/// `Failed` condition on it. The default recognizer accepts any request
/// whose signer name matches the configured one.
pub type Recognizer =
    Box<dyn for<'a> Fn(&X509CertificationRequest<'a>, &[String], &str) -> Result<bool> + Send + Sync>;

/// Write access to CertificateSigningRequest status subresources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrClient: Send + Sync {
    /// Replace the status subresource of the given request
    async fn update_status(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest>;
}

/// Issues certificates for validated requests
///
/// Implementations receive the request in DER (already parsed and signature
/// checked), the translated usages, and the validity to issue for, and
/// return the certificate as a single PEM `CERTIFICATE` block.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SignerBackend: Send + Sync {
    /// Sign the request and return the issued certificate
    async fn sign(
        &self,
        csr_der: &[u8],
        key_usage: KeyUsage,
        ext_key_usages: &[ExtKeyUsage],
        ttl: Duration,
    ) -> Result<Vec<u8>>;
}

/// [`CsrClient`] backed by the cluster API
pub struct KubeCsrClient {
    api: Api<CertificateSigningRequest>,
}

impl KubeCsrClient {
    /// Client over the cluster-scoped CertificateSigningRequest API
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CsrClient for KubeCsrClient {
    async fn update_status(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest> {
        let name = csr
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::csr("request has no name"))?;
        let body = serde_json::to_vec(csr).map_err(|e| Error::serialization(e.to_string()))?;
        Ok(self
            .api
            .replace_status(name, &PostParams::default(), body)
            .await?)
    }
}

/// Signs approved requests addressed to one signer name
pub struct Signer<C, B> {
    client: C,
    backend: B,
    spec: SignerSpec,
    recognizer: Recognizer,
}

impl<C: CsrClient, B: SignerBackend> Signer<C, B> {
    /// Signer with the default name-match recognizer
    pub fn new(client: C, backend: B, spec: SignerSpec) -> Self {
        let signer_name = spec.signer_name.clone();
        Self {
            client,
            backend,
            spec,
            recognizer: Box::new(move |_, _, requested| Ok(requested == signer_name)),
        }
    }

    /// Replace the content policy hook
    pub fn with_recognizer(mut self, recognizer: Recognizer) -> Self {
        self.recognizer = recognizer;
        self
    }

    /// Validity to issue for, from the requested expiration
    ///
    /// Absent expirations get the full configured validity; present ones are
    /// clamped into `[min_ttl, cert_ttl]`.
    fn duration(&self, expiration_seconds: Option<i32>) -> Duration {
        match expiration_seconds {
            None => self.spec.cert_ttl,
            Some(seconds) => {
                let requested = Duration::from_secs(seconds.max(0) as u64);
                if requested > self.spec.cert_ttl {
                    self.spec.cert_ttl
                } else if requested < self.spec.min_ttl {
                    self.spec.min_ttl
                } else {
                    requested
                }
            }
        }
    }

    /// Verify the request and issue a certificate for it
    async fn sign(
        &self,
        der: &[u8],
        usages: &[String],
        expiration_seconds: Option<i32>,
    ) -> Result<Vec<u8>> {
        let (_, request) = X509CertificationRequest::from_der(der)
            .map_err(|e| Error::csr(format!("unable to parse certificate request: {e}")))?;
        request
            .verify_signature()
            .map_err(|e| Error::csr(format!("certificate request signature is invalid: {e}")))?;
        let (key_usage, ext_key_usages) = key_usages_from_strings(usages)?;
        let ttl = self.duration(expiration_seconds);
        self.backend.sign(der, key_usage, &ext_key_usages, ttl).await
    }
}

#[async_trait]
impl<C: CsrClient, B: SignerBackend> CsrHandler for Signer<C, B> {
    async fn handle(&self, mut csr: CertificateSigningRequest) -> Result<()> {
        let name = csr.metadata.name.clone().unwrap_or_default();

        if !is_certificate_request_approved(&csr) || has_true_condition(&csr, CONDITION_FAILED) {
            debug!(csr = %name, "skipping request that is not approved or already failed");
            return Ok(());
        }
        if csr.spec.signer_name != self.spec.signer_name {
            debug!(csr = %name, signer = %csr.spec.signer_name, "skipping request for another signer");
            return Ok(());
        }

        let der = parse_csr_pem(&csr.spec.request.0)?;
        let usages = csr.spec.usages.clone().unwrap_or_default();

        // Recognizer rejections are recorded on the request itself; they are
        // requester mistakes, so retrying will not fix them.
        {
            let (_, request) = X509CertificationRequest::from_der(&der)
                .map_err(|e| Error::csr(format!("unable to parse certificate request: {e}")))?;
            match (self.recognizer)(&request, &usages, &csr.spec.signer_name) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(csr = %name, "request not recognized by this signer");
                    return Ok(());
                }
                Err(err) => {
                    info!(csr = %name, error = %err, "request failed signer validation");
                    append_failed_condition(
                        &mut csr,
                        format!("failed to validate certificate request: {err}"),
                    );
                    self.client.update_status(&csr).await?;
                    return Ok(());
                }
            }
        }

        let certificate = self
            .sign(&der, &usages, csr.spec.expiration_seconds)
            .await?;
        csr.status.get_or_insert_with(Default::default).certificate =
            Some(ByteString(certificate));
        self.client.update_status(&csr).await?;
        info!(csr = %name, "issued certificate");
        Ok(())
    }
}

/// Decode the request body and require a certificate request block
fn parse_csr_pem(request: &[u8]) -> Result<Vec<u8>> {
    let block = pem::parse(request)
        .map_err(|e| Error::csr(format!("unable to decode PEM block from request: {e}")))?;
    if block.tag() != CSR_BLOCK_TYPE {
        return Err(Error::csr(format!(
            "PEM block type must be {CSR_BLOCK_TYPE}, got {:?}",
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

/// Append a Failed condition; existing conditions are never rewritten
fn append_failed_condition(csr: &mut CertificateSigningRequest, message: String) {
    let condition = CertificateSigningRequestCondition {
        type_: CONDITION_FAILED.to_string(),
        status: "True".to_string(),
        reason: Some(REASON_VALIDATION_FAILURE.to_string()),
        message: Some(message),
        last_update_time: Some(Time(Utc::now())),
        last_transition_time: None,
    };
    csr.status
        .get_or_insert_with(Default::default)
        .conditions
        .get_or_insert_with(Vec::new)
        .push(condition);
}
