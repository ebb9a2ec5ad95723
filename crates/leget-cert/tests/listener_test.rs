//! Challenge listener handshake tests over loopback TCP

use std::net::SocketAddr;
use std::sync::Arc;

use leget_cert::hello::SkipServerVerification;
use leget_cert::listener::{challenge_acceptor, handle_connection};
use leget_cert::{
    certified_key, challenge_certificate, ensure_crypto_provider, ChallengeListener,
    ChallengeResolver, ConnectionOutcome, ACME_TLS_ALPN_NAME,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::ClientConfig;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const DOMAIN: &str = "example.com";

async fn connect(
    addr: SocketAddr,
    name: &str,
    alpn: &[&[u8]],
) -> std::io::Result<TlsStream<TcpStream>> {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    let server_name = ServerName::try_from(name.to_string()).expect("valid server name");
    let tcp = TcpStream::connect(addr).await?;
    TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
}

/// Resolver holding a pending challenge for DOMAIN; returns the response cert
fn resolver_with_challenge() -> (Arc<ChallengeResolver>, CertificateDer<'static>) {
    let response = challenge_certificate(DOMAIN, &[0x42; 32]).unwrap();
    let served = response.cert[0].clone();

    let resolver = Arc::new(ChallengeResolver::new());
    resolver.insert_challenge(DOMAIN, Arc::new(response));
    (resolver, served)
}

fn register_issued(resolver: &ChallengeResolver) {
    let issued = rcgen::generate_simple_self_signed(vec![DOMAIN.to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(issued.key_pair.serialize_der()));
    let certified = certified_key(vec![issued.cert.der().clone()], &key).unwrap();
    resolver.insert_certificate(DOMAIN, Arc::new(certified));
}

/// Run one server-side connection against a client driven by `client`
async fn one_connection<F, Fut, T>(
    resolver: Arc<ChallengeResolver>,
    client: F,
) -> (ConnectionOutcome, T)
where
    F: FnOnce(SocketAddr) -> Fut,
    Fut: std::future::Future<Output = T>,
{
    ensure_crypto_provider();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = challenge_acceptor(resolver);

    let server = async move {
        let (socket, peer) = listener.accept().await.unwrap();
        handle_connection(acceptor, socket, peer).await
    };

    tokio::join!(server, client(addr))
}

#[tokio::test]
async fn test_validation_handshake_serves_challenge_certificate() {
    let (resolver, served) = resolver_with_challenge();

    let (outcome, client) = one_connection(resolver, |addr| async move {
        let mut stream = connect(addr, DOMAIN, &[ACME_TLS_ALPN_NAME]).await.unwrap();
        let (_, conn) = stream.get_ref();
        let alpn = conn.alpn_protocol().map(|p| p.to_vec());
        let peer_certs = conn.peer_certificates().map(|c| c.to_vec());

        // Server closes right after the handshake
        let mut buf = [0u8; 16];
        let read = stream.read(&mut buf).await;
        (alpn, peer_certs, read)
    })
    .await;

    let (alpn, peer_certs, read) = client;
    assert_eq!(outcome, ConnectionOutcome::Validated);
    assert_eq!(alpn.as_deref(), Some(ACME_TLS_ALPN_NAME));
    assert_eq!(peer_certs.unwrap(), vec![served]);
    assert!(!matches!(read, Ok(n) if n > 0), "server sent application data");
}

#[tokio::test]
async fn test_sni_lookup_is_case_insensitive() {
    let (resolver, _) = resolver_with_challenge();

    let (outcome, connected) = one_connection(resolver, |addr| async move {
        connect(addr, "EXAMPLE.com", &[ACME_TLS_ALPN_NAME]).await.is_ok()
    })
    .await;

    assert!(connected);
    assert_eq!(outcome, ConnectionOutcome::Validated);
}

#[tokio::test]
async fn test_handshake_without_alpn_is_closed() {
    let (resolver, _) = resolver_with_challenge();
    register_issued(&resolver);

    let (outcome, connected) = one_connection(resolver, |addr| async move {
        connect(addr, DOMAIN, &[]).await.is_ok()
    })
    .await;

    assert!(connected);
    assert_eq!(outcome, ConnectionOutcome::NoApplicationProtocol);
}

#[tokio::test]
async fn test_unknown_name_fails_handshake() {
    let (resolver, _) = resolver_with_challenge();

    let (outcome, connected) = one_connection(resolver, |addr| async move {
        connect(addr, "unknown.example", &[ACME_TLS_ALPN_NAME])
            .await
            .is_ok()
    })
    .await;

    assert!(!connected);
    assert!(matches!(outcome, ConnectionOutcome::HandshakeFailed(_)));
}

#[tokio::test]
async fn test_other_protocol_fails_handshake() {
    let (resolver, _) = resolver_with_challenge();

    let (outcome, connected) = one_connection(resolver, |addr| async move {
        connect(addr, DOMAIN, &[b"h2".as_slice()]).await.is_ok()
    })
    .await;

    assert!(!connected);
    assert!(matches!(outcome, ConnectionOutcome::HandshakeFailed(_)));
}

#[tokio::test]
async fn test_listener_survives_failed_handshakes() {
    let (resolver, _) = resolver_with_challenge();
    let listener = ChallengeListener::bind("127.0.0.1:0".parse().unwrap(), resolver)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = listener.spawn();

    // Garbage instead of a ClientHello
    {
        use tokio::io::AsyncWriteExt;
        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    }
    assert!(connect(addr, "unknown.example", &[ACME_TLS_ALPN_NAME])
        .await
        .is_err());

    let stream = connect(addr, DOMAIN, &[ACME_TLS_ALPN_NAME]).await.unwrap();
    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(ACME_TLS_ALPN_NAME));

    assert!(!handle.is_finished());
    handle.abort();
}
