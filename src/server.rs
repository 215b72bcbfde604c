//! TCP and TLS listeners and the accept loop.
//!
//! The server owns nothing beyond its configuration: every accepted
//! connection gets a fully private session (room cache, sync loop,
//! channel table), so there is no cross-connection state to guard.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::connection;

pub struct Server {
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Bind and serve until the process ends.
    pub async fn run(self) -> Result<()> {
        let (addr, handle) = self.start().await?;
        tracing::info!(%addr, "Listening for IRC clients");
        handle.await?
    }

    /// Bind and serve in the background; returns the bound plain-TCP
    /// address. Tests bind port 0 and read the address from here.
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        let addr = listener.local_addr()?;

        if let Some(acceptor) = self.build_tls_acceptor()? {
            let tls_listener = TcpListener::bind(&self.config.tls_listen_addr)
                .await
                .with_context(|| format!("Failed to bind {}", self.config.tls_listen_addr))?;
            tracing::info!(addr = %self.config.tls_listen_addr, "TLS listener up");
            let config = self.config.clone();
            tokio::spawn(accept_tls_loop(tls_listener, acceptor, config));
        }

        let config = self.config.clone();
        let handle = tokio::spawn(accept_loop(listener, config));
        Ok((addr, handle))
    }

    fn build_tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        if !self.config.tls_enabled() {
            return Ok(None);
        }

        let cert_path = self.config.tls_cert.as_deref().unwrap();
        let key_path = self.config.tls_key.as_deref().unwrap();

        let cert_pem = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("Failed to read TLS key: {key_path}"))?;

        let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse TLS certificates")?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .context("Failed to parse TLS private key")?
            .context("No private key found in PEM file")?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Invalid TLS configuration")?;

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

async fn accept_loop(listener: TcpListener, config: Arc<ServerConfig>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = connection::handle(stream, config).await {
                tracing::warn!(%peer, "Connection ended with error: {err:#}");
            }
        });
    }
}

async fn accept_tls_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    config: Arc<ServerConfig>,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let config = config.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    if let Err(err) = connection::handle_generic(tls_stream, config).await {
                        tracing::warn!(%peer, "TLS connection ended with error: {err:#}");
                    }
                }
                Err(err) => {
                    tracing::debug!(%peer, "TLS handshake failed: {err}");
                }
            }
        });
    }
}
