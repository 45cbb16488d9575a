//! vault-signer - signs Kubernetes CertificateSigningRequests with Vault PKI

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::runtime::watcher::Event;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vault_signer::config::{AuthConfig, Config};
use vault_signer::controller::{CertificateController, CsrEvent, DeletedCsr, ReflectorStore};
use vault_signer::signer::{KubeCsrClient, Signer, SignerSpec};
use vault_signer::vault::{
    Authenticator, SessionWatcher, VaultApi, VaultClient, VaultClientConfig, VaultSigner,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    // This MUST succeed for the application to operate securely.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The signer cannot talk to Vault or the API server without a \
             working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        signer = %config.signer_name,
        vault = %config.vault_address,
        pki = %config.vault_pki,
        "vault signer starting"
    );

    // Vault side: client, initial login, then a watcher that keeps the
    // session alive for the life of the process.
    let auth_config = AuthConfig::load(&config.vault_auth_config).await?;
    let vault: Arc<dyn VaultApi> = Arc::new(VaultClient::new(VaultClientConfig {
        address: config.vault_address.clone(),
        timeout: config.vault_timeout,
    })?);
    let authenticator = Authenticator::new(auth_config);
    let session = authenticator
        .authenticate(vault.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!("initial vault login failed: {e}"))?;

    let shutdown = CancellationToken::new();
    let mut session_task = tokio::spawn(
        SessionWatcher::new(Arc::clone(&vault), authenticator).run(session, shutdown.clone()),
    );

    // Kubernetes side: client, reflector-backed cache, and the controller
    // that drains the work queue into the signer.
    let client = kubernetes_client(&config).await?;
    let api: Api<CertificateSigningRequest> = Api::all(client.clone());
    let (reader, writer) = reflector::store();

    let signer = Signer::new(
        KubeCsrClient::new(client),
        VaultSigner::new(
            Arc::clone(&vault),
            config.vault_pki.clone(),
            config.vault_role.clone(),
        ),
        SignerSpec::new(config.signer_name.clone(), config.signing_duration),
    );
    let controller = Arc::new(CertificateController::new(
        "vault-signer",
        ReflectorStore::new(reader),
        signer,
    ));

    // Event pump: apply watch events to the cache, then enqueue their keys.
    let pump_controller = Arc::clone(&controller);
    let pump_shutdown = shutdown.clone();
    let mut watch_task = tokio::spawn(async move {
        let mut stream = Box::pin(reflector(
            writer,
            watcher(api, watcher::Config::default()).default_backoff(),
        ));
        loop {
            tokio::select! {
                _ = pump_shutdown.cancelled() => return Ok(()),
                event = stream.next() => match event {
                    Some(Ok(Event::InitApply(csr))) => {
                        pump_controller.handle_event(CsrEvent::Added(Arc::new(csr)));
                    }
                    Some(Ok(Event::Apply(csr))) => {
                        pump_controller.handle_event(CsrEvent::Updated(Arc::new(csr)));
                    }
                    Some(Ok(Event::Delete(csr))) => {
                        pump_controller
                            .handle_event(CsrEvent::Deleted(DeletedCsr::Object(Arc::new(csr))));
                    }
                    Some(Ok(Event::Init | Event::InitDone)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "csr watch interrupted, backing off");
                    }
                    None => anyhow::bail!("csr watch stream ended"),
                },
            }
        }
    });

    let mut controller_task =
        tokio::spawn(Arc::clone(&controller).run(config.workers, shutdown.clone()));

    // Run until a signal arrives or one of the long-lived tasks dies. A dead
    // session watcher means we will start failing against Vault as soon as
    // the current token expires, so it is fatal rather than degraded.
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("termination requested, shutting down");
        }
        result = &mut session_task => {
            return Err(task_failure("vault session watcher", result));
        }
        result = &mut watch_task => {
            return Err(task_failure("csr watch", result));
        }
        result = &mut controller_task => {
            return Err(task_failure("certificate controller", result));
        }
    }

    shutdown.cancel();
    controller_task.await??;
    watch_task.await??;
    session_task.await??;
    tracing::info!("vault signer stopped");
    Ok(())
}

/// Build a client from an explicit kubeconfig, or infer the environment
async fn kubernetes_client(config: &Config) -> anyhow::Result<Client> {
    match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .map_err(|e| anyhow::anyhow!("failed to read kubeconfig {path:?}: {e}"))?;
            let options = kube::config::KubeConfigOptions::default();
            let client_config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| anyhow::anyhow!("failed to load kubeconfig {path:?}: {e}"))?;
            Ok(Client::try_from(client_config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// Describe why a task that should outlive the process stopped early
fn task_failure<E: std::fmt::Display>(
    what: &str,
    result: Result<Result<(), E>, tokio::task::JoinError>,
) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow::anyhow!("{what} exited unexpectedly"),
        Ok(Err(e)) => anyhow::anyhow!("{what} failed: {e}"),
        Err(e) => anyhow::anyhow!("{what} panicked: {e}"),
    }
}
