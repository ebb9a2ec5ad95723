//! Certificate acquisition over ACME TLS-ALPN-01
//!
//! Builds a realistic handshake template, answers the CA's validation
//! handshakes on a TLS listener, and writes the issued key and chain to disk.

pub mod acme;
pub mod acquire;
pub mod challenge;
pub mod hello;
pub mod key;
pub mod listener;
pub mod storage;

pub use acme::{AcmeConfig, AcmeError, AcmeManager, CertificateManager};
pub use acquire::{acquire_all, AcquisitionReport, DomainFailure, FailureStage};
pub use challenge::{certified_key, challenge_certificate, ChallengeError, ChallengeResolver};
pub use hello::{build_hello_template, HandshakeTemplate, HelloError};
pub use key::{EcPrivateKey, KeyAlgorithm, KeyError, PrivateKey};
pub use listener::{ChallengeListener, ConnectionOutcome, ListenerError};
pub use storage::{save_cert, StorageError, WriteError};

use rustls::pki_types::CertificateDer;

/// ALPN protocol identifier for TLS-ALPN-01 validation handshakes (RFC 8737)
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// Issued certificate chain with its private key
///
/// `cert_chain[0]` is the leaf; the rest is the issuer chain, leaf-to-root.
#[derive(Debug)]
pub struct CertificateResult {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKey,
}

impl CertificateResult {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, private_key: PrivateKey) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// The leaf certificate, if the chain is not empty
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.cert_chain.first()
    }

    /// Everything after the leaf
    pub fn issuers(&self) -> &[CertificateDer<'static>] {
        self.cert_chain.get(1..).unwrap_or_default()
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
