//! Listener fabric
//!
//! The public socket binds the configured address and optionally terminates
//! TLS with a certificate provisioned by the overlay network daemon. The CTL
//! socket is always plain TCP on `127.0.0.1:0`.

use crate::config::{PublicConfig, TlsConfig};
use crate::error::{Error, Result};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound socket ready to serve a router
pub struct BoundListener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    local_addr: SocketAddr,
}

impl BoundListener {
    /// Bind the control-plane-facing socket
    pub async fn public(config: &PublicConfig) -> Result<Self> {
        let tls = config.tls.as_ref().map(load_tls).transpose()?;
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("cannot bind public listener on {}: {}", addr, e)))?;
        Self::from_listener(listener, tls)
    }

    /// Bind the loopback CTL socket on an OS-assigned port
    pub async fn ctl() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Self::from_listener(listener, None)
    }

    fn from_listener(listener: TcpListener, tls: Option<TlsAcceptor>) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            tls,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// `http(s)://addr`
    pub fn base_url(&self) -> String {
        let scheme = if self.is_tls() { "https" } else { "http" };
        format!("{}://{}", scheme, self.local_addr)
    }

    /// Serve until `shutdown` fires, then drain open connections
    pub async fn serve(self, router: Router, shutdown: CancellationToken) -> Result<()> {
        match self.tls {
            None => {
                axum::serve(self.listener, router)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await?;
                Ok(())
            }
            Some(acceptor) => serve_tls(self.listener, acceptor, router, shutdown).await,
        }
    }
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let connections = TaskTracker::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            let stream = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(%peer, "TLS handshake failed: {}", e);
                    return;
                }
                Err(_) => {
                    tracing::debug!(%peer, "TLS handshake timed out");
                    return;
                }
            };

            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(
                TokioIo::new(stream),
                TowerToHyperService::new(router),
            );
            tokio::pin!(conn);
            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                tracing::debug!(%peer, "Connection closed with error: {}", e);
            }
        });
    }

    connections.close();
    connections.wait().await;
    Ok(())
}

/// Build a TLS acceptor from PEM files
pub fn load_tls(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(&config.cert)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| {
            Error::Config(format!(
                "cannot read TLS certificate {}: {}",
                config.cert.display(),
                e
            ))
        })?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificate found in {}",
            config.cert.display()
        )));
    }
    let key = PrivateKeyDer::from_pem_file(&config.key).map_err(|e| {
        Error::Config(format!(
            "cannot read TLS key {}: {}",
            config.key.display(),
            e
        ))
    })?;

    let server_config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("TLS protocol setup failed: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Config(format!("invalid TLS certificate or key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
