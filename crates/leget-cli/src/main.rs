//! leget - Get TLS certificates from Let's Encrypt over TLS-ALPN-01

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leget_cert::{
    acquire_all, build_hello_template, ensure_crypto_provider, AcmeManager, ChallengeListener,
};
use leget_cli::config::{prepare_cert_dir, Cli, RunConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = RunConfig::from_cli(cli)?;
    ensure_crypto_provider();

    // A realistic hello gets ECDSA certificates; an empty one would get RSA
    let mut template = build_hello_template()
        .await
        .context("Error generating template Client Hello")?;

    prepare_cert_dir(&config.cert_dir)?;

    let acme = config.acme_config();
    info!("Using ACME directory {}", acme.directory_url());
    let manager = AcmeManager::new(acme);

    let listener = ChallengeListener::bind_host(&config.listen, manager.resolver())
        .await
        .with_context(|| format!("Error listening on {}", config.listen))?;
    info!("Listening on {}", listener.local_addr()?);
    let mut listener = listener.spawn();

    let report = tokio::select! {
        result = &mut listener => {
            return match result {
                Ok(Ok(())) => Err(anyhow!("Challenge listener stopped")),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow!("Challenge listener task failed: {}", e)),
            };
        }
        report = acquire_all(&manager, &mut template, &config.domains, &config.cert_dir) => report,
    };
    listener.abort();

    for failure in &report.failed {
        warn!(
            "[{}] No certificate ({} failed): {}",
            failure.domain, failure.stage, failure.reason
        );
    }
    info!(
        "Saved certificates for {} of {} domain(s) in {}",
        report.saved.len(),
        config.domains.len(),
        config.cert_dir.display()
    );

    Ok(())
}
