//! Command-line options and the validated run configuration

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use leget_cert::AcmeConfig;
use thiserror::Error;

/// Subdirectory of the certificate directory used with the staging CA
pub const STAGING_DIR: &str = "staging";

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// leget - Get TLS certificates from Let's Encrypt over TLS-ALPN-01
#[derive(Parser, Debug)]
#[command(name = "leget")]
#[command(about = "Requests certificate(s) from Let's Encrypt for the given domain(s)", long_about = None)]
#[command(override_usage = "leget [OPTIONS] <DOMAIN>...")]
#[command(after_help = "Each domain will have its own cert and key generated.\n\nUse of this program implies acceptance of Let's Encrypt's Terms of Service.")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
pub struct Cli {
    /// Domains to request certificates for
    #[arg(value_name = "DOMAIN")]
    pub domains: Vec<String>,

    /// Use the staging server
    #[arg(long, env = "LEGET_STAGING")]
    pub staging: bool,

    /// Listen address for validation connections (`host:port` or `:port`)
    #[arg(long, env = "LEGET_LISTEN", default_value = ":443")]
    pub listen: String,

    /// Certificate directory
    #[arg(long, env = "LEGET_DIR", default_value = "leget_certs")]
    pub dir: PathBuf,

    /// Optional contact email address
    #[arg(long, env = "LEGET_EMAIL")]
    pub email: Option<String>,

    /// ACME directory URL, overriding the Let's Encrypt servers
    #[arg(long, env = "LEGET_DIRECTORY_URL")]
    pub directory_url: Option<String>,

    /// Extra PEM root CA to trust when talking to the ACME directory
    #[arg(long, env = "LEGET_CA_ROOT")]
    pub ca_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LEGET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No domains specified (try -h)")]
    NoDomains,

    #[error("Invalid domain {domain:?}: {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("Invalid contact email {0:?}")]
    InvalidEmail(String),

    #[error("Invalid listen address {0:?}: expected host:port or :port")]
    InvalidListen(String),
}

/// Validated settings for one acquisition run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Lowercased, in the order given, first occurrence kept
    pub domains: Vec<String>,
    /// `host:port`, resolved when the listener binds
    pub listen: String,
    pub cert_dir: PathBuf,
    pub staging: bool,
    pub contact_email: Option<String>,
    pub directory_url: Option<String>,
    pub root_ca: Option<PathBuf>,
}

impl RunConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.domains.is_empty() {
            return Err(ConfigError::NoDomains);
        }

        let mut seen = HashSet::new();
        let mut domains = Vec::with_capacity(cli.domains.len());
        for raw in &cli.domains {
            let domain = normalize_domain(raw)?;
            if seen.insert(domain.clone()) {
                domains.push(domain);
            }
        }

        let contact_email = match cli.email {
            Some(email) if email.trim().is_empty() => None,
            Some(email) if !email.contains('@') => return Err(ConfigError::InvalidEmail(email)),
            other => other,
        };

        let listen = normalize_listen(&cli.listen)?;

        let mut cert_dir = clean_path(&cli.dir);
        if cli.staging {
            cert_dir.push(STAGING_DIR);
        }

        Ok(Self {
            domains,
            listen,
            cert_dir,
            staging: cli.staging,
            contact_email,
            directory_url: cli.directory_url,
            root_ca: cli.ca_root,
        })
    }

    pub fn acme_config(&self) -> AcmeConfig {
        AcmeConfig {
            contact_email: self.contact_email.clone(),
            use_staging: self.staging,
            directory_url: self.directory_url.clone(),
            root_ca: self.root_ca.clone(),
            cert_dir: self.cert_dir.clone(),
            domains: self.domains.clone(),
        }
    }
}

/// Lowercase and check a DNS name a certificate can be requested for
fn normalize_domain(raw: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDomain {
        domain: raw.to_string(),
        reason: reason.to_string(),
    };

    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return Err(invalid("empty name"));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("name too long"));
    }
    if domain.parse::<IpAddr>().is_ok() {
        return Err(invalid("IP addresses are not supported"));
    }
    if domain.contains('*') {
        return Err(invalid("wildcards cannot be validated over TLS-ALPN-01"));
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid("bad label length"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with a hyphen"));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(invalid("invalid character"));
        }
    }

    Ok(domain)
}

/// Accept `host:port`, `[v6]:port` or `:port`; an empty host means all interfaces
fn normalize_listen(raw: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidListen(raw.to_string());

    let listen = raw.trim();
    let (host, port) = listen.rsplit_once(':').ok_or_else(invalid)?;
    port.parse::<u16>().map_err(|_| invalid())?;
    if host.contains(char::is_whitespace) {
        return Err(invalid());
    }

    if host.is_empty() {
        Ok(format!("0.0.0.0:{}", port))
    } else {
        Ok(listen.to_string())
    }
}

/// Lexically normalize a path: drop `.` components and fold `..` where possible
pub fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let last = cleaned.components().next_back();
                let folds = matches!(last, Some(Component::Normal(_)));
                let at_root = matches!(last, Some(Component::RootDir | Component::Prefix(_)));
                if folds {
                    cleaned.pop();
                } else if !at_root {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }

    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

/// Create the certificate directory tree, owner-only
pub fn prepare_cert_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }

    builder
        .create(dir)
        .with_context(|| format!("Error making directory {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("leget").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::from_cli(parse(&["example.com"])).unwrap();
        assert_eq!(config.domains, vec!["example.com"]);
        assert_eq!(config.listen, "0.0.0.0:443");
        assert_eq!(config.cert_dir, PathBuf::from("leget_certs"));
        assert!(!config.staging);
        assert_eq!(config.contact_email, None);
    }

    #[test]
    fn test_no_domains_is_an_error() {
        let err = RunConfig::from_cli(parse(&[])).unwrap_err();
        assert_eq!(err, ConfigError::NoDomains);
        assert_eq!(err.to_string(), "No domains specified (try -h)");
    }

    #[test]
    fn test_staging_appends_subdirectory() {
        let config =
            RunConfig::from_cli(parse(&["--staging", "--dir", "./certs/", "example.com"])).unwrap();
        assert_eq!(config.cert_dir, PathBuf::from("certs").join(STAGING_DIR));
        assert!(config.acme_config().use_staging);
    }

    #[test]
    fn test_domains_are_normalized_and_deduplicated() {
        let config =
            RunConfig::from_cli(parse(&["B.example.", "a.example", "b.example"])).unwrap();
        assert_eq!(config.domains, vec!["b.example", "a.example"]);
    }

    #[test]
    fn test_invalid_domains_are_rejected() {
        for bad in ["*.example.com", "10.0.0.1", "bad_name.com", "-a.example", "a..b"] {
            let err = RunConfig::from_cli(parse(&["--", bad])).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidDomain { ref domain, .. } if domain == bad),
                "{} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_leading_hyphen_domain_after_separator() {
        let err = RunConfig::from_cli(parse(&["--", "-a.example"])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidDomain {
                domain: "-a.example".to_string(),
                reason: "label starts or ends with a hyphen".to_string(),
            }
        );

        // Without the separator clap sees an unknown flag
        assert!(Cli::try_parse_from(["leget", "-a.example"]).is_err());
    }

    #[test]
    fn test_empty_email_is_ignored() {
        let config = RunConfig::from_cli(parse(&["--email", "", "example.com"])).unwrap();
        assert_eq!(config.contact_email, None);

        let err = RunConfig::from_cli(parse(&["--email", "nobody", "example.com"])).unwrap_err();
        assert_eq!(err, ConfigError::InvalidEmail("nobody".to_string()));
    }

    #[test]
    fn test_listen_accepts_host_names_and_bare_ports() {
        let listen = |value: &str| {
            RunConfig::from_cli(parse(&["--listen", value, "example.com"])).map(|c| c.listen)
        };

        assert_eq!(listen(":443").unwrap(), "0.0.0.0:443");
        assert_eq!(listen("localhost:8443").unwrap(), "localhost:8443");
        assert_eq!(listen("127.0.0.1:443").unwrap(), "127.0.0.1:443");
        assert_eq!(listen("[::1]:443").unwrap(), "[::1]:443");

        for bad in ["nonsense", "localhost:https", "host:70000", ":"] {
            assert_eq!(
                listen(bad).unwrap_err(),
                ConfigError::InvalidListen(bad.to_string())
            );
        }
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("a/./b/../c/")), PathBuf::from("a/c"));
        assert_eq!(clean_path(Path::new("./")), PathBuf::from("."));
        assert_eq!(clean_path(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(clean_path(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn test_prepare_cert_dir_is_owner_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("leget_certs").join(STAGING_DIR);

        prepare_cert_dir(&dir).unwrap();
        assert!(dir.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        // Existing directory is fine
        prepare_cert_dir(&dir).unwrap();
    }

    #[test]
    fn test_directory_override_is_passed_through() {
        let config = RunConfig::from_cli(parse(&[
            "--directory-url",
            "https://localhost:14000/dir",
            "--ca-root",
            "minica.pem",
            "example.com",
        ]))
        .unwrap();

        let acme = config.acme_config();
        assert_eq!(acme.directory_url(), "https://localhost:14000/dir");
        assert_eq!(acme.root_ca, Some(PathBuf::from("minica.pem")));
        assert_eq!(acme.domains, vec!["example.com"]);
    }
}
