//! Generic queue-based reconciliation engine
//!
//! The engine consumes a typed notification stream and a read-through cache;
//! it owns neither. Events are reduced to request keys and pushed through a
//! deduplicating work queue, so each request is processed by at most one
//! worker at a time and repeat notifications collapse instead of fanning out.
//!
//! Failed syncs requeue through a two-tier rate limiter (per-key exponential
//! backoff plus a global token bucket); successful syncs reset their backoff.
//! Workers do not start until the cache reports its initial synchronization
//! complete.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::runtime::reflector::{ObjectRef, Store};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

pub mod queue;
pub mod ratelimit;

pub use queue::WorkQueue;
pub use ratelimit::{default_controller_rate_limiter, RateLimiter};

/// Condition type recorded when a request has been approved
pub const CONDITION_APPROVED: &str = "Approved";

/// Condition type recorded when a request has been denied
pub const CONDITION_DENIED: &str = "Denied";

/// Condition type recorded when signing failed permanently
pub const CONDITION_FAILED: &str = "Failed";

/// Identity of a request in the queue and the cache
///
/// CertificateSigningRequests are cluster-scoped, so the key is normally just
/// the object name; a namespace is carried when one is present so the key
/// round-trips for namespaced resources too.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    name: String,
    namespace: Option<String>,
}

impl RequestKey {
    /// Key for a cluster-scoped object
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Derive the key for an object, `None` when it has no name
    pub fn for_object(csr: &CertificateSigningRequest) -> Option<Self> {
        let name = csr.metadata.name.clone()?;
        Some(Self {
            name,
            namespace: csr.metadata.namespace.clone(),
        })
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace, when the object is namespaced
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Final state of a deleted object
///
/// Deletions normally carry the last observed object; when the watch missed
/// the delete and only a tombstone survived, just the key is known.
#[derive(Debug, Clone)]
pub enum DeletedCsr {
    /// The last observed state of the deleted object
    Object(Arc<CertificateSigningRequest>),
    /// Only the key of the deleted object is known
    Tombstone(RequestKey),
}

/// A notification from the watch stream
///
/// All variants funnel into the same enqueue path; the distinction only
/// matters for logging.
#[derive(Debug, Clone)]
pub enum CsrEvent {
    /// Object observed for the first time
    Added(Arc<CertificateSigningRequest>),
    /// Object changed
    Updated(Arc<CertificateSigningRequest>),
    /// Object deleted
    Deleted(DeletedCsr),
}

impl CsrEvent {
    /// Derive the request key, `None` when the event carries no identity
    pub fn key(&self) -> Option<RequestKey> {
        match self {
            CsrEvent::Added(obj) | CsrEvent::Updated(obj) => RequestKey::for_object(obj),
            CsrEvent::Deleted(DeletedCsr::Object(obj)) => RequestKey::for_object(obj),
            CsrEvent::Deleted(DeletedCsr::Tombstone(key)) => Some(key.clone()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CsrEvent::Added(_) => "add",
            CsrEvent::Updated(_) => "update",
            CsrEvent::Deleted(_) => "delete",
        }
    }
}

/// Read-through cache of the watched objects
///
/// Backed by the reflector store in production; tests substitute an
/// in-memory map.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrStore: Send + Sync {
    /// Current cached state of the object, `None` when deleted
    fn get(&self, key: &RequestKey) -> Option<Arc<CertificateSigningRequest>>;

    /// Resolve once the initial full synchronization has completed
    async fn wait_until_synced(&self) -> Result<()>;
}

/// Pluggable per-object reconciliation logic
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrHandler: Send + Sync {
    /// Process one object; errors requeue the key through the rate limiter
    async fn handle(&self, csr: CertificateSigningRequest) -> Result<()>;
}

/// [`CsrStore`] backed by a kube reflector store
pub struct ReflectorStore {
    store: Store<CertificateSigningRequest>,
}

impl ReflectorStore {
    /// Wrap a reflector store
    pub fn new(store: Store<CertificateSigningRequest>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CsrStore for ReflectorStore {
    fn get(&self, key: &RequestKey) -> Option<Arc<CertificateSigningRequest>> {
        let mut obj_ref = ObjectRef::new(key.name());
        if let Some(namespace) = key.namespace() {
            obj_ref = obj_ref.within(namespace);
        }
        self.store.get(&obj_ref)
    }

    async fn wait_until_synced(&self) -> Result<()> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|_| Error::cache_sync("watch writer dropped before initial sync completed"))
    }
}

// =============================================================================
// Condition helpers
// =============================================================================

/// Whether the request carries an approval and no denial
///
/// Presence of the condition is what counts; approval tooling writes the
/// condition type and not always a status.
pub fn is_certificate_request_approved(csr: &CertificateSigningRequest) -> bool {
    let (approved, denied) = certificate_approval_state(csr);
    approved && !denied
}

/// Presence of `Approved` / `Denied` conditions on the request
pub fn certificate_approval_state(csr: &CertificateSigningRequest) -> (bool, bool) {
    let mut approved = false;
    let mut denied = false;
    if let Some(conditions) = csr.status.as_ref().and_then(|s| s.conditions.as_ref()) {
        for condition in conditions {
            if condition.type_ == CONDITION_APPROVED {
                approved = true;
            } else if condition.type_ == CONDITION_DENIED {
                denied = true;
            }
        }
    }
    (approved, denied)
}

/// Whether a condition of the given type is present and true
///
/// An empty status string counts as true: early API versions did not require
/// the field.
pub fn has_true_condition(csr: &CertificateSigningRequest, condition_type: &str) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == condition_type && (c.status.is_empty() || c.status == "True")
            })
        })
}

// =============================================================================
// Controller
// =============================================================================

/// Queue-based controller dispatching cached objects to a handler
pub struct CertificateController<S, H> {
    name: String,
    store: S,
    handler: H,
    queue: Arc<WorkQueue<RequestKey>>,
}

impl<S, H> CertificateController<S, H>
where
    S: CsrStore + 'static,
    H: CsrHandler + 'static,
{
    /// Create a controller with the default two-tier rate limiter
    pub fn new(name: impl Into<String>, store: S, handler: H) -> Self {
        Self {
            name: name.into(),
            store,
            handler,
            queue: Arc::new(WorkQueue::new(Box::new(default_controller_rate_limiter()))),
        }
    }

    /// Intake for the notification stream; add, update and delete all enqueue
    pub fn handle_event(&self, event: CsrEvent) {
        let kind = event.kind();
        match event.key() {
            Some(key) => {
                debug!(controller = %self.name, %key, kind, "enqueuing certificate signing request");
                self.queue.add(key);
            }
            None => {
                warn!(controller = %self.name, kind, "discarding event with no derivable key");
            }
        }
    }

    /// Run the controller until `shutdown` fires
    ///
    /// Blocks on the cache's initial synchronization, then starts `workers`
    /// concurrent workers. On shutdown the queue is closed, blocked workers
    /// return immediately, and in-flight syncs run to completion.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: CancellationToken) -> Result<()> {
        info!(controller = %self.name, "starting certificate controller");

        tokio::select! {
            _ = shutdown.cancelled() => {
                self.queue.shut_down();
                info!(controller = %self.name, "shut down before cache sync completed");
                return Ok(());
            }
            synced = self.store.wait_until_synced() => synced?,
        }
        info!(controller = %self.name, workers, "caches synced, starting workers");

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let controller = Arc::clone(&self);
            handles.push(tokio::spawn(async move { controller.worker(worker).await }));
        }

        shutdown.cancelled().await;
        self.queue.shut_down();
        for handle in handles {
            let _ = handle.await;
        }
        info!(controller = %self.name, "certificate controller stopped");
        Ok(())
    }

    async fn worker(&self, worker: usize) {
        while let Some(key) = self.queue.get().await {
            match self.sync(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(err) => {
                    self.queue.add_rate_limited(key.clone());
                    if err.is_ignorable() {
                        debug!(controller = %self.name, worker, %key, error = %err, "sync failed, requeuing");
                    } else {
                        error!(
                            controller = %self.name,
                            worker,
                            %key,
                            error = %err,
                            retries = self.queue.retries(&key),
                            "sync failed, requeuing"
                        );
                    }
                }
            }
            self.queue.done(&key);
        }
    }

    async fn sync(&self, key: &RequestKey) -> Result<()> {
        let started = Instant::now();
        let Some(csr) = self.store.get(key) else {
            debug!(controller = %self.name, %key, "request deleted before sync, nothing to do");
            return Ok(());
        };
        if csr
            .status
            .as_ref()
            .and_then(|s| s.certificate.as_ref())
            .is_some_and(|c| !c.0.is_empty())
        {
            debug!(controller = %self.name, %key, "certificate already issued, nothing to do");
            return Ok(());
        }

        // workers own their copy; the cache stays untouched
        let result = self.handler.handle((*csr).clone()).await;
        debug!(controller = %self.name, %key, elapsed = ?started.elapsed(), "finished syncing request");
        result
    }
}
