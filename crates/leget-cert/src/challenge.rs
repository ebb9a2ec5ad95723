//! TLS-ALPN-01 challenge responses
//!
//! [`ChallengeResolver`] is the certificate-resolution callback shared by the
//! challenge listener and the ACME manager. Validation handshakes (ALPN
//! `acme-tls/1`) get the pending response certificate for their SNI; other
//! handshakes get the certificate already issued for that name, if any.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ACME_TLS_ALPN_NAME;

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Certificate generation error: {0}")]
    CertGen(String),

    #[error("Unusable signing key: {0}")]
    SigningKey(String),
}

/// Certificates served to inbound handshakes, keyed by lowercase server name
#[derive(Debug, Default)]
pub struct ChallengeResolver {
    challenges: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    certificates: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the response certificate for a pending validation
    pub fn insert_challenge(&self, domain: &str, key: Arc<CertifiedKey>) {
        insert(&self.challenges, domain, key);
    }

    /// Drop the response certificate once the order has settled
    pub fn remove_challenge(&self, domain: &str) -> bool {
        match self.challenges.write() {
            Ok(mut guard) => guard.remove(&domain.to_ascii_lowercase()).is_some(),
            Err(_) => {
                warn!("Challenge store lock poisoned; cleanup skipped");
                false
            }
        }
    }

    pub fn has_challenge(&self, domain: &str) -> bool {
        lookup(&self.challenges, &domain.to_ascii_lowercase()).is_some()
    }

    /// Register an issued certificate for ordinary handshakes
    pub fn insert_certificate(&self, domain: &str, key: Arc<CertifiedKey>) {
        insert(&self.certificates, domain, key);
    }
}

impl ResolvesServerCert for ChallengeResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            debug!("ClientHello without SNI; no certificate");
            return None;
        };
        let name = name.to_ascii_lowercase();

        if offers_acme_alpn(&client_hello) {
            let found = lookup(&self.challenges, &name);
            if found.is_none() {
                debug!("No pending challenge for {}", name);
            }
            found
        } else {
            lookup(&self.certificates, &name)
        }
    }
}

fn offers_acme_alpn(client_hello: &ClientHello<'_>) -> bool {
    client_hello
        .alpn()
        .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN_NAME))
        .unwrap_or(false)
}

fn insert(map: &RwLock<HashMap<String, Arc<CertifiedKey>>>, domain: &str, key: Arc<CertifiedKey>) {
    match map.write() {
        Ok(mut guard) => {
            guard.insert(domain.to_ascii_lowercase(), key);
        }
        Err(_) => {
            warn!("Challenge store lock poisoned; insert skipped");
        }
    }
}

fn lookup(map: &RwLock<HashMap<String, Arc<CertifiedKey>>>, name: &str) -> Option<Arc<CertifiedKey>> {
    match map.read() {
        Ok(guard) => guard.get(name).cloned(),
        Err(_) => {
            warn!("Challenge store lock poisoned; lookup skipped");
            None
        }
    }
}

/// Self-signed TLS-ALPN-01 response certificate for `domain`
///
/// The only SAN is the domain being validated, and the critical
/// acmeIdentifier extension carries the SHA-256 digest of the key
/// authorization.
pub fn challenge_certificate(
    domain: &str,
    key_authorization_digest: &[u8],
) -> Result<CertifiedKey, ChallengeError> {
    // Throwaway key; only the extension matters to the CA
    let key_pair = KeyPair::generate().map_err(|e| ChallengeError::CertGen(e.to_string()))?;

    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| ChallengeError::CertGen(e.to_string()))?;
    params
        .custom_extensions
        .push(CustomExtension::new_acme_identifier(key_authorization_digest));
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ChallengeError::CertGen(e.to_string()))?;

    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    certified_key(vec![cert.der().clone()], &key_der)
}

/// Pair a chain with its private key for serving over rustls
///
/// Bypasses `ServerConfig::with_single_cert`, which would reject the
/// challenge certificate's unknown critical extension.
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'_>,
) -> Result<CertifiedKey, ChallengeError> {
    let signing_key = any_supported_type(key).map_err(|e| ChallengeError::SigningKey(e.to_string()))?;
    Ok(CertifiedKey::new(chain, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> Vec<u8> {
        vec![0xab; 32]
    }

    #[test]
    fn test_challenge_certificate_has_single_cert() {
        let key = challenge_certificate("example.com", &digest()).unwrap();
        assert_eq!(key.cert.len(), 1);
        assert!(!key.cert[0].is_empty());
    }

    #[test]
    fn test_challenge_registration_is_case_insensitive() {
        let resolver = ChallengeResolver::new();
        let key = Arc::new(challenge_certificate("Example.COM", &digest()).unwrap());

        resolver.insert_challenge("Example.COM", key);
        assert!(resolver.has_challenge("example.com"));

        assert!(resolver.remove_challenge("EXAMPLE.com"));
        assert!(!resolver.has_challenge("example.com"));
        assert!(!resolver.remove_challenge("example.com"));
    }

    #[test]
    fn test_issued_certificates_are_not_challenges() {
        let resolver = ChallengeResolver::new();
        let key = Arc::new(challenge_certificate("example.com", &digest()).unwrap());

        resolver.insert_certificate("example.com", key);
        assert!(!resolver.has_challenge("example.com"));
    }

    #[test]
    fn test_certified_key_rejects_garbage() {
        let garbage = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(vec![1, 2, 3]));
        let err = certified_key(Vec::new(), &garbage).unwrap_err();
        assert!(matches!(err, ChallengeError::SigningKey(_)));
    }
}
