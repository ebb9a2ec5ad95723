//! TLS listener answering TLS-ALPN-01 validation handshakes
//!
//! Every accepted connection is handshaken on its own task with the shared
//! certificate resolver, checked for the `acme-tls/1` protocol, and closed.
//! Nothing is read or written after the handshake.
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::server::ResolvesServerCert;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::ACME_TLS_ALPN_NAME;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  - Check if another process is using this port: lsof -i :{port}\n  - Ports below 1024 usually need elevated privileges")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to resolve listen address {address}: {reason}")]
    Resolve { address: String, reason: String },

    #[error("Error accepting new connection: {0}")]
    Accept(std::io::Error),
}

/// How a single inbound connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Handshake completed with `acme-tls/1`
    Validated,
    /// Handshake completed but the client offered no ALPN
    NoApplicationProtocol,
    /// Handshake completed with some other protocol; only a misconfiguration
    /// could get here since `acme-tls/1` is the only one advertised
    UnexpectedProtocol(Vec<u8>),
    HandshakeFailed(String),
}

pub struct ChallengeListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl ChallengeListener {
    /// Bind the listener; handshakes are served from `resolver`
    pub async fn bind(
        bind_addr: SocketAddr,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<Self, ListenerError> {
        crate::ensure_crypto_provider();

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ListenerError::BindError {
                address: bind_addr.ip().to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            listener,
            acceptor: challenge_acceptor(resolver),
        })
    }

    /// Resolve a `host:port` string and bind the first address that works
    pub async fn bind_host(
        listen: &str,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<Self, ListenerError> {
        let resolve_err = |reason: String| ListenerError::Resolve {
            address: listen.to_string(),
            reason,
        };

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(listen)
            .await
            .map_err(|e| resolve_err(e.to_string()))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match Self::bind(addr, resolver.clone()).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    debug!("Could not bind {} for {}: {}", addr, listen, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| resolve_err("no addresses found".to_string())))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listening socket fails
    ///
    /// Individual handshake failures never end the loop.
    pub async fn run(self) -> Result<(), ListenerError> {
        loop {
            let (socket, peer_addr) = self
                .listener
                .accept()
                .await
                .map_err(ListenerError::Accept)?;
            debug!("New connection from {}", peer_addr);

            let acceptor = self.acceptor.clone();
            tokio::spawn(async move {
                handle_connection(acceptor, socket, peer_addr).await;
            });
        }
    }

    /// Run the accept loop on a background task
    pub fn spawn(self) -> JoinHandle<Result<(), ListenerError>> {
        tokio::spawn(self.run())
    }
}

/// TLS acceptor that only advertises `acme-tls/1`
pub fn challenge_acceptor(resolver: Arc<dyn ResolvesServerCert>) -> TlsAcceptor {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![ACME_TLS_ALPN_NAME.to_vec()];

    TlsAcceptor::from(Arc::new(config))
}

/// Handshake one connection and close it
///
/// The socket is closed on every path: explicitly after a completed
/// handshake, by drop otherwise.
pub async fn handle_connection(
    acceptor: TlsAcceptor,
    socket: TcpStream,
    peer_addr: SocketAddr,
) -> ConnectionOutcome {
    let mut tag = peer_addr.to_string();

    let mut stream = match acceptor.accept(socket).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[{}] Handshake error: {}", tag, e);
            return ConnectionOutcome::HandshakeFailed(e.to_string());
        }
    };

    let (_, conn) = stream.get_ref();
    if let Some(sni) = conn.server_name() {
        tag = format!("{} ({})", peer_addr, sni);
    }

    let outcome = match conn.alpn_protocol() {
        Some(protocol) if protocol == ACME_TLS_ALPN_NAME => {
            info!("[{}] Answered validation handshake", tag);
            ConnectionOutcome::Validated
        }
        None => {
            warn!("[{}] No application protocol", tag);
            ConnectionOutcome::NoApplicationProtocol
        }
        Some(protocol) => {
            error!(
                "[{}] Unexpected application protocol {:?} - this is a bug",
                tag,
                String::from_utf8_lossy(protocol)
            );
            ConnectionOutcome::UnexpectedProtocol(protocol.to_vec())
        }
    };

    if let Err(e) = stream.shutdown().await {
        debug!("[{}] Error closing connection: {}", tag, e);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChallengeResolver;

    #[tokio::test]
    async fn test_bind_conflict_reports_port() {
        let resolver = Arc::new(ChallengeResolver::new());
        let first = ChallengeListener::bind("127.0.0.1:0".parse().unwrap(), resolver.clone())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        let err = ChallengeListener::bind(addr, resolver).await.err().unwrap();
        match err {
            ListenerError::BindError { port, .. } => assert_eq!(port, addr.port()),
            other => panic!("expected bind error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_host_resolves_names() {
        let resolver = Arc::new(ChallengeResolver::new());

        let listener = ChallengeListener::bind_host("localhost:0", resolver.clone())
            .await
            .unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());

        let listener = ChallengeListener::bind_host("127.0.0.1:0", resolver)
            .await
            .unwrap();
        assert_eq!(
            listener.local_addr().unwrap().ip(),
            "127.0.0.1".parse::<std::net::IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_bind_host_rejects_unresolvable_address() {
        let resolver = Arc::new(ChallengeResolver::new());
        let err = ChallengeListener::bind_host("no port here", resolver)
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, ListenerError::Resolve { ref address, .. } if address == "no port here"),
            "{:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_bind_host_conflict_reports_port() {
        let resolver = Arc::new(ChallengeResolver::new());
        let first = ChallengeListener::bind("127.0.0.1:0".parse().unwrap(), resolver.clone())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        let err = ChallengeListener::bind_host(&addr.to_string(), resolver)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ListenerError::BindError { port, .. } if port == addr.port()));
    }

    #[tokio::test]
    async fn test_acceptor_advertises_only_acme_alpn() {
        crate::ensure_crypto_provider();
        let acceptor = challenge_acceptor(Arc::new(ChallengeResolver::new()));
        assert_eq!(
            acceptor.config().alpn_protocols,
            vec![ACME_TLS_ALPN_NAME.to_vec()]
        );
    }
}
