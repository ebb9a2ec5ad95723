//! Certificate persistence
//!
//! For a domain `d` three PEM files are written to the certificate directory:
//! `d.key` (private key, mode 0600), `d.crt` (leaf) and `d.issuer.crt` (issuer
//! chain, possibly no blocks at all). Existing files are truncated. A failure
//! aborts the remaining steps; files already written are left in place.

use std::path::{Path, PathBuf};

use pem::{EncodeConfig, LineEnding, Pem};
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::key::{KeyError, PrivateKey};
use crate::CertificateResult;

pub const CERTIFICATE_PEM_LABEL: &str = "CERTIFICATE";

pub const KEY_SUFFIX: &str = ".key";
pub const LEAF_SUFFIX: &str = ".crt";
pub const ISSUER_SUFFIX: &str = ".issuer.crt";

const FILE_MODE: u32 = 0o600;

/// Certificate persistence errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no leaf certificate in chain for {0}")]
    EmptyChain(String),

    #[error("saving private key: {0}")]
    Key(WriteError),

    #[error("saving leaf certificate: {0}")]
    Leaf(WriteError),

    #[error("saving issuer chain: {0}")]
    Issuer(WriteError),
}

/// Failure while producing or writing a single PEM file
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("{0}")]
    Key(#[from] KeyError),

    #[error("opening file {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("writing to file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Save the domain's private key, leaf certificate and issuer chain to `dir`
pub async fn save_cert(dir: &Path, name: &str, cert: &CertificateResult) -> Result<(), StorageError> {
    let leaf = cert
        .leaf()
        .ok_or_else(|| StorageError::EmptyChain(name.to_string()))?;

    save_key(dir, name, &cert.private_key)
        .await
        .map_err(StorageError::Key)?;

    save_certs(
        dir,
        name,
        "certificate",
        LEAF_SUFFIX,
        std::slice::from_ref(leaf),
    )
    .await
    .map_err(StorageError::Leaf)?;

    save_certs(
        dir,
        name,
        "issuer certificate chain",
        ISSUER_SUFFIX,
        cert.issuers(),
    )
    .await
    .map_err(StorageError::Issuer)?;

    Ok(())
}

/// Path of one of the domain's files
pub fn cert_file_path(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{}{}", name, suffix))
}

async fn save_key(dir: &Path, name: &str, key: &PrivateKey) -> Result<(), WriteError> {
    // Encode before touching the file so an unsupported key leaves disk alone
    let encoded = key.to_pem()?;

    let path = cert_file_path(dir, name, KEY_SUFFIX);
    write_file(&path, encoded.as_bytes()).await?;

    info!("[{}] Wrote key to {}", name, path.display());
    Ok(())
}

async fn save_certs(
    dir: &Path,
    name: &str,
    what: &str,
    suffix: &str,
    certs: &[CertificateDer<'static>],
) -> Result<(), WriteError> {
    let path = cert_file_path(dir, name, suffix);
    write_file(&path, encode_certificates(certs).as_bytes()).await?;

    info!("[{}] Wrote {} to {}", name, what, path.display());
    Ok(())
}

/// Create or truncate `path` with owner-only permissions and write `contents`
pub(crate) async fn write_file(path: &Path, contents: &[u8]) -> Result<(), WriteError> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(FILE_MODE);

    let mut file = options.open(path).await.map_err(|source| WriteError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let write_err = |source| WriteError::Write {
        path: path.to_path_buf(),
        source,
    };
    file.write_all(contents).await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;

    Ok(())
}

fn pem_config() -> EncodeConfig {
    EncodeConfig::new().set_line_ending(LineEnding::LF)
}

/// PEM-encode a single block with `\n` line endings
pub fn encode_pem(label: &str, der: Vec<u8>) -> String {
    pem::encode_config(&Pem::new(label, der), pem_config())
}

/// PEM-encode certificates as successive `CERTIFICATE` blocks
pub fn encode_certificates(certs: &[CertificateDer<'_>]) -> String {
    let blocks: Vec<Pem> = certs
        .iter()
        .map(|cert| Pem::new(CERTIFICATE_PEM_LABEL, cert.as_ref().to_vec()))
        .collect();
    pem::encode_many_config(&blocks, pem_config())
}
