//! ACME certificate manager
//!
//! [`CertificateManager`] is the seam the acquisition loop talks to.
//! [`AcmeManager`] implements it against a real CA with `instant-acme`,
//! answering TLS-ALPN-01 challenges through the shared [`ChallengeResolver`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::challenge::{certified_key, challenge_certificate, ChallengeError, ChallengeResolver};
use crate::hello::HandshakeTemplate;
use crate::key::{KeyAlgorithm, KeyError, PrivateKey};
use crate::CertificateResult;

/// Account credentials cache, relative to the certificate directory
pub const ACCOUNT_FILE: &str = "acme_account.json";

const ORDER_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INITIAL_DELAY: Duration = Duration::from_millis(250);

/// ACME errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME error: {0}")]
    AcmeError(String),

    #[error("Account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("Order creation failed: {0}")]
    OrderCreationFailed(String),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Certificate finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("No server name in handshake template")]
    MissingServerName,

    #[error("Host {0} is not among the requested domains")]
    HostNotAllowed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate generation error: {0}")]
    CertGen(String),

    #[error("Private key error: {0}")]
    Key(#[from] KeyError),

    #[error("Challenge response error: {0}")]
    Challenge(#[from] ChallengeError),
}

/// Source of certificates for the acquisition loop
#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Obtain a certificate for `template.server_name`
    ///
    /// The template's capabilities decide the key algorithm.
    async fn request_certificate(
        &self,
        template: &HandshakeTemplate,
    ) -> Result<CertificateResult, AcmeError>;
}

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Optional contact email, registered as a `mailto:` contact
    pub contact_email: Option<String>,
    /// Use Let's Encrypt staging environment (for testing)
    pub use_staging: bool,
    /// Directory URL overriding the Let's Encrypt endpoints
    pub directory_url: Option<String>,
    /// Extra PEM root for reaching the directory (e.g. Pebble's minica)
    pub root_ca: Option<PathBuf>,
    /// Directory holding the account credentials cache
    pub cert_dir: PathBuf,
    /// The only names certificates may be requested for
    pub domains: Vec<String>,
}

impl AcmeConfig {
    pub fn directory_url(&self) -> String {
        match &self.directory_url {
            Some(url) => url.clone(),
            None if self.use_staging => LetsEncrypt::Staging.url().to_string(),
            None => LetsEncrypt::Production.url().to_string(),
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            contact_email: None,
            use_staging: false,
            directory_url: None,
            root_ca: None,
            cert_dir: PathBuf::from("leget_certs"),
            domains: Vec::new(),
        }
    }
}

/// Removes a pending challenge from the resolver when the order settles
struct PendingChallenge<'a> {
    resolver: &'a ChallengeResolver,
    domain: &'a str,
}

impl Drop for PendingChallenge<'_> {
    fn drop(&mut self) {
        if self.resolver.remove_challenge(self.domain) {
            debug!("[{}] Challenge response withdrawn", self.domain);
        }
    }
}

/// ACME client for certificate provisioning over TLS-ALPN-01
pub struct AcmeManager {
    config: AcmeConfig,
    allowed: HashSet<String>,
    resolver: Arc<ChallengeResolver>,
    account: OnceCell<Account>,
}

impl AcmeManager {
    pub fn new(config: AcmeConfig) -> Self {
        let allowed = config
            .domains
            .iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        Self {
            config,
            allowed,
            resolver: Arc::new(ChallengeResolver::new()),
            account: OnceCell::new(),
        }
    }

    /// Resolver to install on the challenge listener
    pub fn resolver(&self) -> Arc<ChallengeResolver> {
        self.resolver.clone()
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.contains(&name.to_ascii_lowercase())
    }

    fn allowed_host(&self, template: &HandshakeTemplate) -> Result<String, AcmeError> {
        let name = template
            .server_name
            .as_deref()
            .ok_or(AcmeError::MissingServerName)?;
        if !self.is_allowed(name) {
            return Err(AcmeError::HostNotAllowed(name.to_string()));
        }
        Ok(name.to_ascii_lowercase())
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account, AcmeError> {
        let builder = match &self.config.root_ca {
            Some(root) => Account::builder_with_root(root),
            None => Account::builder(),
        }
        .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;

        let directory_url = self.config.directory_url();
        let path = self.config.cert_dir.join(ACCOUNT_FILE);
        match tokio::fs::read(&path).await {
            Ok(json) => match cached_credentials(&json, &directory_url) {
                Some(credentials) => {
                    let credentials: AccountCredentials = serde_json::from_value(credentials)
                        .map_err(|e| {
                            AcmeError::AccountCreationFailed(format!(
                                "parsing {}: {}",
                                path.display(),
                                e
                            ))
                        })?;
                    let account = builder
                        .from_credentials(credentials)
                        .await
                        .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;
                    info!("Using ACME account from {}", path.display());
                    return Ok(account);
                }
                None => info!(
                    "Cached ACME account in {} is not for {}, registering a new one",
                    path.display(),
                    directory_url
                ),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let contact: Vec<String> = self
            .config
            .contact_email
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = builder
            .create(
                &NewAccount {
                    contact: &contact,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory_url.clone(),
                None,
            )
            .await
            .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;
        info!("Registered ACME account with {}", directory_url);

        // The account stays usable for this run even if caching it fails
        let cached = serde_json::to_value(&credentials).map(|credentials| CachedAccount {
            directory_url,
            credentials,
        });
        let saved = match cached {
            Ok(cached) => save_credentials(&path, &cached).await,
            Err(e) => Err(AcmeError::AcmeError(format!("serializing account: {}", e))),
        };
        if let Err(e) = saved {
            warn!("Unable to cache ACME account in {}: {}", path.display(), e);
        }

        Ok(account)
    }

    async fn order_certificate(
        &self,
        domain: &str,
        algorithm: KeyAlgorithm,
    ) -> Result<CertificateResult, AcmeError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderCreationFailed(e.to_string()))?;

        let _pending = PendingChallenge {
            resolver: &self.resolver,
            domain,
        };

        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result.map_err(|e| AcmeError::AcmeError(e.to_string()))?;
                match &authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => {
                        return Err(AcmeError::ChallengeFailed(format!(
                            "authorization is {:?}",
                            status
                        )))
                    }
                }

                let mut challenge = authz.challenge(ChallengeType::TlsAlpn01).ok_or_else(|| {
                    AcmeError::ChallengeFailed("no tls-alpn-01 challenge offered".to_string())
                })?;

                let digest = challenge.key_authorization().digest();
                let response = challenge_certificate(domain, digest.as_ref())?;
                self.resolver.insert_challenge(domain, Arc::new(response));

                challenge
                    .set_ready()
                    .await
                    .map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
                debug!("[{}] Challenge ready", domain);
            }
        }

        let retry = RetryPolicy::new()
            .timeout(ORDER_TIMEOUT)
            .initial_delay(POLL_INITIAL_DELAY);
        let status = order
            .poll_ready(&retry)
            .await
            .map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
        if status != OrderStatus::Ready {
            return Err(AcmeError::ChallengeFailed(format!(
                "unexpected order status {:?}",
                status
            )));
        }

        let private_key = PrivateKey::generate(algorithm)?;
        let csr = certificate_signing_request(domain, &private_key)?;
        order
            .finalize_csr(&csr)
            .await
            .map_err(|e| AcmeError::FinalizationFailed(e.to_string()))?;

        let chain_pem = order
            .poll_certificate(&retry)
            .await
            .map_err(|e| AcmeError::FinalizationFailed(e.to_string()))?;
        let cert_chain = parse_chain(&chain_pem)?;

        self.serve_issued(domain, &cert_chain, &private_key);

        Ok(CertificateResult::new(cert_chain, private_key))
    }

    /// Make the fresh certificate available to ordinary handshakes
    fn serve_issued(&self, domain: &str, chain: &[CertificateDer<'static>], key: &PrivateKey) {
        let served = key
            .to_pkcs8_der()
            .map_err(AcmeError::from)
            .and_then(|pkcs8| {
                certified_key(chain.to_vec(), &PrivateKeyDer::Pkcs8(pkcs8)).map_err(AcmeError::from)
            });
        match served {
            Ok(certified) => self.resolver.insert_certificate(domain, Arc::new(certified)),
            Err(e) => warn!("[{}] Issued certificate not served: {}", domain, e),
        }
    }
}

#[async_trait]
impl CertificateManager for AcmeManager {
    async fn request_certificate(
        &self,
        template: &HandshakeTemplate,
    ) -> Result<CertificateResult, AcmeError> {
        let domain = self.allowed_host(template)?;
        let algorithm = template.preferred_key_algorithm();
        debug!("[{}] Ordering certificate with {:?} key", domain, algorithm);

        self.order_certificate(&domain, algorithm).await
    }
}

/// DER CSR for `domain`, signed by `key`
pub fn certificate_signing_request(domain: &str, key: &PrivateKey) -> Result<Vec<u8>, AcmeError> {
    let pkcs8 = key.to_pkcs8_der()?;
    let key_pair = KeyPair::try_from(pkcs8.secret_pkcs8_der())
        .map_err(|e| AcmeError::CertGen(e.to_string()))?;

    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| AcmeError::CertGen(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| AcmeError::CertGen(e.to_string()))?;

    Ok(csr.der().as_ref().to_vec())
}

/// Split the CA's PEM bundle into DER certificates, leaf first
pub fn parse_chain(chain_pem: &str) -> Result<Vec<CertificateDer<'static>>, AcmeError> {
    let chain = rustls_pemfile::certs(&mut chain_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AcmeError::FinalizationFailed(format!("Failed to parse certificate: {}", e)))?;

    if chain.is_empty() {
        return Err(AcmeError::FinalizationFailed(
            "CA returned no certificates".to_string(),
        ));
    }
    Ok(chain)
}

/// On-disk account cache; credentials are only valid for the directory that issued them
#[derive(Debug, Serialize, Deserialize)]
struct CachedAccount {
    directory_url: String,
    credentials: serde_json::Value,
}

/// Credentials from a cache file, if it parses and belongs to `directory_url`
fn cached_credentials(json: &[u8], directory_url: &str) -> Option<serde_json::Value> {
    let cached: CachedAccount = serde_json::from_slice(json).ok()?;
    (cached.directory_url == directory_url).then_some(cached.credentials)
}

async fn save_credentials<T: Serialize>(
    path: &std::path::Path,
    credentials: &T,
) -> Result<(), AcmeError> {
    let json = serde_json::to_vec_pretty(credentials)
        .map_err(|e| AcmeError::AcmeError(format!("serializing account: {}", e)))?;

    crate::storage::write_file(path, &json)
        .await
        .map_err(|e| AcmeError::AcmeError(e.to_string()))
}
