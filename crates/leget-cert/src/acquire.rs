//! Sequential certificate acquisition across domains

use std::fmt;
use std::path::Path;

use tracing::{error, info};

use crate::acme::CertificateManager;
use crate::hello::HandshakeTemplate;
use crate::storage::save_cert;

/// Where a domain's acquisition stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Request,
    Save,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::Request => write!(f, "request"),
            FailureStage::Save => write!(f, "save"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainFailure {
    pub domain: String,
    pub stage: FailureStage,
    pub reason: String,
}

/// Per-domain results of one run, in the order the domains were given
#[derive(Debug, Default)]
pub struct AcquisitionReport {
    pub saved: Vec<String>,
    pub failed: Vec<DomainFailure>,
}

impl AcquisitionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, domain: &str, stage: FailureStage, reason: String) {
        self.failed.push(DomainFailure {
            domain: domain.to_string(),
            stage,
            reason,
        });
    }
}

/// Request and save a certificate for each domain, in order
///
/// The template's server name is overwritten for every domain. A failure
/// for one domain is logged and recorded; the remaining domains are still
/// attempted.
pub async fn acquire_all<M>(
    manager: &M,
    template: &mut HandshakeTemplate,
    domains: &[String],
    dir: &Path,
) -> AcquisitionReport
where
    M: CertificateManager + ?Sized,
{
    let mut report = AcquisitionReport::default();

    for domain in domains {
        info!("[{}] Requesting certificates", domain);
        template.set_server_name(domain);

        let cert = match manager.request_certificate(template).await {
            Ok(cert) => cert,
            Err(e) => {
                error!("[{}] Error retrieving certs: {}", domain, e);
                report.fail(domain, FailureStage::Request, e.to_string());
                continue;
            }
        };

        match save_cert(dir, domain, &cert).await {
            Ok(()) => report.saved.push(domain.clone()),
            Err(e) => {
                error!("[{}] Error saving certs: {}", domain, e);
                report.fail(domain, FailureStage::Save, e.to_string());
            }
        }
    }

    report
}
