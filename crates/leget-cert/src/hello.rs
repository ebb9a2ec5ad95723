//! Handshake template harvested from a real client negotiation
//!
//! Certificate selection keys off what the client says it supports. An empty
//! template looks like a legacy client and gets an RSA key, so instead we run
//! a throwaway rustls handshake over an in-memory pipe, capture the
//! ClientHello the server side sees, and abort the handshake.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{
    CipherSuite, ClientConfig, DigitallySignedStruct, NamedGroup, ProtocolVersion, ServerConfig,
    SignatureScheme,
};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::key::KeyAlgorithm;

/// Size of each direction of the in-memory pipe; a ClientHello fits easily
const PIPE_BUFFER: usize = 16 * 1024;

const TLS13_SUITES: std::ops::RangeInclusive<u16> = 0x1301..=0x1305;
const RENEGOTIATION_INFO_SCSV: u16 = 0x00ff;
const ECDHE_ECDSA_SUITES: &[u16] = &[
    0xc007, // RC4_128_SHA
    0xc009, // AES_128_CBC_SHA
    0xc00a, // AES_256_CBC_SHA
    0xc023, // AES_128_CBC_SHA256
    0xc024, // AES_256_CBC_SHA384
    0xc02b, // AES_128_GCM_SHA256
    0xc02c, // AES_256_GCM_SHA384
    0xc0ac, // AES_128_CCM
    0xc0ad, // AES_256_CCM
    0xcca9, // CHACHA20_POLY1305_SHA256
];

#[derive(Debug, Error)]
pub enum HelloError {
    #[error("unexpected handshake success")]
    UnexpectedSuccess,

    #[error("unexpected handshake error: {0}")]
    Handshake(std::io::Error),
}

/// What a client offered in its ClientHello
///
/// Everything but `server_name` is fixed once harvested; the name is set per
/// domain before each certificate request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeTemplate {
    pub server_name: Option<String>,
    pub supported_versions: Vec<ProtocolVersion>,
    pub cipher_suites: Vec<CipherSuite>,
    pub signature_schemes: Vec<SignatureScheme>,
    pub key_exchange_groups: Vec<NamedGroup>,
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl HandshakeTemplate {
    pub fn from_client_hello(hello: &ClientHello<'_>) -> Self {
        let cipher_suites = hello.cipher_suites().to_vec();
        Self {
            server_name: hello.server_name().map(str::to_owned),
            supported_versions: versions_offered(&cipher_suites),
            signature_schemes: hello.signature_schemes().to_vec(),
            key_exchange_groups: hello
                .named_groups()
                .map(<[NamedGroup]>::to_vec)
                .unwrap_or_default(),
            alpn_protocols: hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
            cipher_suites,
        }
    }

    pub fn set_server_name(&mut self, name: &str) {
        self.server_name = Some(name.to_string());
    }

    /// True when nothing was captured beyond (possibly) a server name
    pub fn is_empty(&self) -> bool {
        self.supported_versions.is_empty()
            && self.cipher_suites.is_empty()
            && self.signature_schemes.is_empty()
    }

    /// Whether a certificate with an ECDSA P-256 key would be acceptable
    pub fn supports_ecdsa(&self) -> bool {
        let ecdsa_scheme = self.signature_schemes.iter().any(|scheme| {
            matches!(
                scheme,
                SignatureScheme::ECDSA_NISTP256_SHA256
                    | SignatureScheme::ECDSA_NISTP384_SHA384
                    | SignatureScheme::ECDSA_NISTP521_SHA512
                    | SignatureScheme::ECDSA_SHA1_Legacy
            )
        });
        if !ecdsa_scheme {
            return false;
        }

        if !self.key_exchange_groups.is_empty()
            && !self.key_exchange_groups.contains(&NamedGroup::secp256r1)
        {
            return false;
        }

        self.cipher_suites.iter().any(|suite| {
            let code = u16::from(*suite);
            TLS13_SUITES.contains(&code) || ECDHE_ECDSA_SUITES.contains(&code)
        })
    }

    pub fn preferred_key_algorithm(&self) -> KeyAlgorithm {
        if self.supports_ecdsa() {
            KeyAlgorithm::EcdsaP256
        } else {
            KeyAlgorithm::Rsa2048
        }
    }
}

fn versions_offered(suites: &[CipherSuite]) -> Vec<ProtocolVersion> {
    let codes: Vec<u16> = suites.iter().map(|suite| u16::from(*suite)).collect();

    let mut versions = Vec::new();
    if codes.iter().any(|code| TLS13_SUITES.contains(code)) {
        versions.push(ProtocolVersion::TLSv1_3);
    }
    if codes
        .iter()
        .any(|code| !TLS13_SUITES.contains(code) && *code != RENEGOTIATION_INFO_SCSV)
    {
        versions.push(ProtocolVersion::TLSv1_2);
    }
    versions
}

/// Build a template from a modern client's ClientHello
///
/// No retries; without a template no certificate can be requested.
pub async fn build_hello_template() -> Result<HandshakeTemplate, HelloError> {
    crate::ensure_crypto_provider();

    let (client_io, server_io) = tokio::io::duplex(PIPE_BUFFER);

    // Only here to present a ClientHello. An IP server name keeps SNI out of it.
    let connector = TlsConnector::from(Arc::new(template_client_config()));
    let client = tokio::spawn(async move {
        let _ = connector
            .connect(ServerName::from(IpAddr::V4(Ipv4Addr::LOCALHOST)), client_io)
            .await;
    });

    let capture = Arc::new(HelloCapture::default());
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(capture.clone());
    let outcome = TlsAcceptor::from(Arc::new(server_config))
        .accept(server_io)
        .await;

    // The server end is gone by now, so the client finishes promptly
    let _ = client.await;

    match outcome {
        Ok(_) => Err(HelloError::UnexpectedSuccess),
        // A captured hello means the failure is the resolver's deliberate refusal
        Err(err) => match capture.take() {
            Some(template) => {
                debug!(
                    "Harvested handshake template: {} cipher suites, {} signature schemes",
                    template.cipher_suites.len(),
                    template.signature_schemes.len()
                );
                Ok(template)
            }
            None => Err(HelloError::Handshake(err)),
        },
    }
}

fn template_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth()
}

/// Resolver that records the ClientHello and declines to pick a certificate
#[derive(Debug, Default)]
struct HelloCapture {
    captured: Mutex<Option<HandshakeTemplate>>,
}

impl HelloCapture {
    fn take(&self) -> Option<HandshakeTemplate> {
        self.captured.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl ResolvesServerCert for HelloCapture {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let template = HandshakeTemplate::from_client_hello(&client_hello);
        if let Ok(mut slot) = self.captured.lock() {
            *slot = Some(template);
        }
        None
    }
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
pub struct SkipServerVerification;

impl SkipServerVerification {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
