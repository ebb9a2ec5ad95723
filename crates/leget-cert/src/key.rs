//! Private keys as a tagged variant per algorithm
//!
//! Issued keys are either elliptic-curve (written as SEC1, PEM label `EC`) or
//! RSA (written as PKCS#1, PEM label `RSA`). Anything else is carried as
//! [`PrivateKey::Unsupported`] and refuses to encode.

use std::fmt;

use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, PrivateKeyInfo};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::RsaPrivateKey;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;

/// PEM label for SEC1-encoded elliptic-curve keys
pub const EC_PEM_LABEL: &str = "EC";
/// PEM label for PKCS#1-encoded RSA keys
pub const RSA_PEM_LABEL: &str = "RSA";

const RSA_KEY_BITS: usize = 2048;

const OID_ED25519: &str = "1.3.101.112";
const OID_ED448: &str = "1.3.101.113";

/// Key errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unknown private key type {0}")]
    Unsupported(String),

    #[error("DER-encoding: {0}")]
    Encoding(String),

    #[error("DER-decoding: {0}")]
    Decoding(String),

    #[error("Key generation failed: {0}")]
    Generation(String),
}

/// Algorithm to request for a newly issued certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    EcdsaP256,
    Rsa2048,
}

/// Elliptic-curve private key
#[derive(Clone)]
pub enum EcPrivateKey {
    P256(p256::SecretKey),
    P384(p384::SecretKey),
}

/// Private key belonging to an issued certificate
pub enum PrivateKey {
    Ec(EcPrivateKey),
    Rsa(Box<RsaPrivateKey>),
    /// A key of an algorithm this tool cannot persist, named by algorithm
    Unsupported(String),
}

impl PrivateKey {
    /// Generate a fresh key for the given algorithm
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self, KeyError> {
        match algorithm {
            KeyAlgorithm::EcdsaP256 => Ok(Self::Ec(EcPrivateKey::P256(p256::SecretKey::random(
                &mut OsRng,
            )))),
            KeyAlgorithm::Rsa2048 => {
                let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
                    .map_err(|e| KeyError::Generation(e.to_string()))?;
                Ok(Self::Rsa(Box::new(key)))
            }
        }
    }

    /// Interpret a DER key as handed out by rustls or read from disk
    pub fn from_der(der: &PrivateKeyDer<'_>) -> Result<Self, KeyError> {
        match der {
            PrivateKeyDer::Pkcs1(pkcs1) => RsaPrivateKey::from_pkcs1_der(pkcs1.secret_pkcs1_der())
                .map(|k| Self::Rsa(Box::new(k)))
                .map_err(|e| KeyError::Decoding(e.to_string())),
            PrivateKeyDer::Sec1(sec1) => {
                let bytes = sec1.secret_sec1_der();
                if let Ok(k) = p256::SecretKey::from_sec1_der(bytes) {
                    return Ok(Self::Ec(EcPrivateKey::P256(k)));
                }
                p384::SecretKey::from_sec1_der(bytes)
                    .map(|k| Self::Ec(EcPrivateKey::P384(k)))
                    .map_err(|e| KeyError::Decoding(format!("unsupported SEC1 curve: {}", e)))
            }
            PrivateKeyDer::Pkcs8(pkcs8) => Self::from_pkcs8_bytes(pkcs8.secret_pkcs8_der()),
            _ => Ok(Self::Unsupported("unrecognised key encoding".to_string())),
        }
    }

    fn from_pkcs8_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if let Ok(k) = p256::SecretKey::from_pkcs8_der(bytes) {
            return Ok(Self::Ec(EcPrivateKey::P256(k)));
        }
        if let Ok(k) = p384::SecretKey::from_pkcs8_der(bytes) {
            return Ok(Self::Ec(EcPrivateKey::P384(k)));
        }
        if let Ok(k) = RsaPrivateKey::from_pkcs8_der(bytes) {
            return Ok(Self::Rsa(Box::new(k)));
        }

        let info =
            PrivateKeyInfo::try_from(bytes).map_err(|e| KeyError::Decoding(e.to_string()))?;
        let oid = info.algorithm.oid.to_string();
        let name = match oid.as_str() {
            OID_ED25519 => "Ed25519".to_string(),
            OID_ED448 => "Ed448".to_string(),
            _ => oid,
        };
        Ok(Self::Unsupported(name))
    }

    /// Human-readable algorithm name
    pub fn algorithm_name(&self) -> &str {
        match self {
            Self::Ec(EcPrivateKey::P256(_)) => "ECDSA P-256",
            Self::Ec(EcPrivateKey::P384(_)) => "ECDSA P-384",
            Self::Rsa(_) => "RSA",
            Self::Unsupported(name) => name.as_str(),
        }
    }

    /// DER encoding to persist along with its PEM label
    ///
    /// EC keys encode as SEC1, RSA keys as PKCS#1.
    pub fn to_der(&self) -> Result<(&'static str, Vec<u8>), KeyError> {
        match self {
            Self::Ec(EcPrivateKey::P256(k)) => k
                .to_sec1_der()
                .map(|der| (EC_PEM_LABEL, der.to_vec()))
                .map_err(|e| KeyError::Encoding(e.to_string())),
            Self::Ec(EcPrivateKey::P384(k)) => k
                .to_sec1_der()
                .map(|der| (EC_PEM_LABEL, der.to_vec()))
                .map_err(|e| KeyError::Encoding(e.to_string())),
            Self::Rsa(k) => k
                .to_pkcs1_der()
                .map(|doc| (RSA_PEM_LABEL, doc.as_bytes().to_vec()))
                .map_err(|e| KeyError::Encoding(e.to_string())),
            Self::Unsupported(name) => Err(KeyError::Unsupported(name.clone())),
        }
    }

    /// PEM text for the key file
    pub fn to_pem(&self) -> Result<String, KeyError> {
        let (label, der) = self.to_der()?;
        Ok(crate::storage::encode_pem(label, der))
    }

    /// PKCS#8 form, as consumed by rcgen and rustls signers
    pub fn to_pkcs8_der(&self) -> Result<PrivatePkcs8KeyDer<'static>, KeyError> {
        let doc = match self {
            Self::Ec(EcPrivateKey::P256(k)) => k.to_pkcs8_der(),
            Self::Ec(EcPrivateKey::P384(k)) => k.to_pkcs8_der(),
            Self::Rsa(k) => k.to_pkcs8_der(),
            Self::Unsupported(name) => return Err(KeyError::Unsupported(name.clone())),
        }
        .map_err(|e| KeyError::Encoding(e.to_string()))?;

        Ok(PrivatePkcs8KeyDer::from(doc.as_bytes().to_vec()))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey")
            .field(&self.algorithm_name())
            .finish()
    }
}
