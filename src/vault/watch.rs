//! Session lifetime watching
//!
//! A [`LifetimeWatcher`] keeps one session alive by renewing it at roughly
//! half of each granted lease, and reports when renewal stops working. The
//! [`SessionWatcher`] wraps that in a loop for the life of the process:
//! whenever a watcher finishes it logs in again and starts a fresh one, and
//! treats a failed re-login as fatal so the operator notices dead
//! credentials instead of the signer limping along until the token expires.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::Authenticator;
use super::client::{Session, VaultApi, VaultError};
use crate::Result;

/// Never schedule a renewal sooner than this, even for tiny leases
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// Renews one session in the background until it can no longer be renewed
#[derive(Debug)]
pub struct LifetimeWatcher {
    renewed: mpsc::Receiver<Session>,
    done: oneshot::Receiver<Option<VaultError>>,
    _stop: tokio_util::sync::DropGuard,
}

impl LifetimeWatcher {
    /// Start renewing the given session
    ///
    /// Refuses sessions the server marked non-renewable; there is nothing
    /// to watch for those. Dropping the watcher stops the renewal task.
    pub fn start(
        api: Arc<dyn VaultApi>,
        session: &Session,
    ) -> std::result::Result<Self, VaultError> {
        if !session.renewable {
            return Err(VaultError::NotRenewable);
        }
        let (renewed_tx, renewed) = mpsc::channel(4);
        let (done_tx, done) = oneshot::channel();
        let cancel = CancellationToken::new();
        let lease = session.lease_duration;
        tokio::spawn(renew_loop(
            api,
            lease,
            renewed_tx,
            done_tx,
            cancel.clone(),
        ));
        Ok(Self {
            renewed,
            done,
            _stop: cancel.drop_guard(),
        })
    }
}

async fn renew_loop(
    api: Arc<dyn VaultApi>,
    mut lease: Duration,
    renewed: mpsc::Sender<Session>,
    done: oneshot::Sender<Option<VaultError>>,
    cancel: CancellationToken,
) {
    loop {
        let wait = renew_interval(lease);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        match api.renew_token(lease).await {
            Err(err) => {
                let _ = done.send(Some(err));
                return;
            }
            Ok(session) => {
                lease = session.lease_duration;
                let renewable = session.renewable;
                if renewed.send(session).await.is_err() {
                    return;
                }
                if !renewable || lease.is_zero() {
                    let _ = done.send(None);
                    return;
                }
            }
        }
    }
}

/// Half the lease, with 10% jitter so replicas do not renew in lockstep
fn renew_interval(lease: Duration) -> Duration {
    let half = lease.as_secs_f64() / 2.0;
    let jitter = rand::thread_rng().gen_range(0.9..1.1);
    Duration::from_secs_f64(half * jitter).max(MIN_RENEW_INTERVAL)
}

/// Keeps the process authenticated for its whole lifetime
pub struct SessionWatcher {
    api: Arc<dyn VaultApi>,
    authenticator: Authenticator,
}

impl SessionWatcher {
    /// Build a watcher around the shared client and its login flow
    pub fn new(api: Arc<dyn VaultApi>, authenticator: Authenticator) -> Self {
        Self { api, authenticator }
    }

    /// Watch and renew sessions until shutdown
    ///
    /// Returns an error when a session cannot be watched or a re-login
    /// fails; the caller is expected to treat that as fatal.
    pub async fn run(self, initial: Session, shutdown: CancellationToken) -> Result<()> {
        let mut session = initial;
        loop {
            let mut watcher = LifetimeWatcher::start(Arc::clone(&self.api), &session)?;
            let outcome = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("session watcher stopped");
                        return Ok(());
                    }
                    renewed = watcher.renewed.recv() => match renewed {
                        // The renewal keeps the same token; only the lease
                        // changes, which the watcher tracks itself. A fresh
                        // login replaces the session once the watcher ends.
                        Some(renewed) => {
                            debug!(lease = ?renewed.lease_duration, "renewed vault session");
                        }
                        None => break (&mut watcher.done).await,
                    },
                    done = &mut watcher.done => break done,
                }
            };
            match outcome {
                Ok(Some(err)) => warn!(error = %err, "failed to renew vault session"),
                Ok(None) => info!("vault session can no longer be renewed"),
                Err(_) => warn!("vault session renewal ended unexpectedly"),
            }
            info!("logging into vault again");
            session = self.authenticator.authenticate(self.api.as_ref()).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppRoleConfig, AuthConfig, AuthMethod};
    use crate::vault::client::MockVaultApi;

    fn authenticator() -> Authenticator {
        Authenticator::new(AuthConfig {
            method: AuthMethod::AppRole,
            app_role: Some(AppRoleConfig {
                role_id: "role".to_string(),
                secret_id: "secret".to_string(),
            }),
            kubernetes: None,
        })
    }

    #[test]
    fn renew_interval_is_half_the_lease_with_jitter() {
        let interval = renew_interval(Duration::from_secs(60));
        assert!(interval >= Duration::from_secs(27), "got {interval:?}");
        assert!(interval <= Duration::from_secs(33), "got {interval:?}");
    }

    #[test]
    fn renew_interval_never_goes_below_the_floor() {
        assert_eq!(renew_interval(Duration::ZERO), MIN_RENEW_INTERVAL);
        assert_eq!(
            renew_interval(Duration::from_millis(200)),
            MIN_RENEW_INTERVAL
        );
    }

    #[tokio::test]
    async fn non_renewable_sessions_are_refused() {
        let api: Arc<dyn VaultApi> = Arc::new(MockVaultApi::new());
        let session = Session::new("s.static", false, Duration::from_secs(3600));
        let err = LifetimeWatcher::start(api, &session).expect_err("must refuse");
        assert!(matches!(err, VaultError::NotRenewable));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_sessions_are_renewed_on_a_cadence() {
        let (renewals_tx, mut renewals) = mpsc::unbounded_channel();
        let mut api = MockVaultApi::new();
        api.expect_renew_token().returning(move |increment| {
            let _ = renewals_tx.send(increment);
            Ok(Session::new("s.renewed", true, Duration::from_secs(120)))
        });

        let initial = Session::new("s.first", true, Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let watcher = SessionWatcher::new(Arc::new(api), authenticator());
        let handle = tokio::spawn(watcher.run(initial, shutdown.clone()));

        // First renewal asks for the initial lease, later ones for the
        // lease the server last granted.
        assert_eq!(renewals.recv().await, Some(Duration::from_secs(60)));
        assert_eq!(renewals.recv().await, Some(Duration::from_secs(120)));
        assert_eq!(renewals.recv().await, Some(Duration::from_secs(120)));

        shutdown.cancel();
        handle
            .await
            .expect("watcher task")
            .expect("clean shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_sessions_trigger_a_fresh_login() {
        let (logins_tx, mut logins) = mpsc::unbounded_channel();
        let mut api = MockVaultApi::new();
        // Renewal comes back non-renewable, so the watcher finishes and the
        // session watcher logs in again.
        api.expect_renew_token()
            .times(1)
            .returning(|_| Ok(Session::new("s.last", false, Duration::from_secs(30))));
        api.expect_login_app_role().times(1).returning(move |_, _| {
            let _ = logins_tx.send(());
            Ok(Session::new("s.fresh", true, Duration::from_secs(3600)))
        });
        api.expect_set_token()
            .times(1)
            .withf(|token| token == "s.fresh")
            .returning(|_| ());

        let initial = Session::new("s.first", true, Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let watcher = SessionWatcher::new(Arc::new(api), authenticator());
        let handle = tokio::spawn(watcher.run(initial, shutdown.clone()));

        logins.recv().await.expect("re-login happens");
        shutdown.cancel();
        handle
            .await
            .expect("watcher task")
            .expect("clean shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_relogin_is_fatal() {
        let mut api = MockVaultApi::new();
        api.expect_renew_token().times(1).returning(|_| {
            Err(VaultError::Api {
                status: 403,
                message: "permission denied".to_string(),
            })
        });
        api.expect_login_app_role().times(1).returning(|_, _| {
            Err(VaultError::Api {
                status: 400,
                message: "invalid secret id".to_string(),
            })
        });
        api.expect_set_token().never();

        let initial = Session::new("s.first", true, Duration::from_secs(60));
        let watcher = SessionWatcher::new(Arc::new(api), authenticator());
        let err = watcher
            .run(initial, CancellationToken::new())
            .await
            .expect_err("re-login failure must be fatal");
        assert!(err.to_string().contains("invalid secret id"));
    }

    #[tokio::test]
    async fn run_refuses_a_non_renewable_initial_session() {
        let watcher = SessionWatcher::new(Arc::new(MockVaultApi::new()), authenticator());
        let initial = Session::new("s.static", false, Duration::from_secs(3600));
        let err = watcher
            .run(initial, CancellationToken::new())
            .await
            .expect_err("nothing to watch");
        assert!(err.to_string().contains("not renewable"));
    }
}
