//! End-to-end tests for the CA server
//!
//! The server runs against the in-memory trust store on ephemeral loopback
//! ports; clients are the generated tonic client over plain TCP and TLS.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::{Code, Request};

use meshca::{CaServer, Options, Phase, ServingHandles};
use meshca_common::trust_store::MemoryTrustStore;
use meshca_infra::pki::{decode_cert, CertificateRequest as Csr};
use meshca_proto::certificate_service_client::CertificateServiceClient;
use meshca_proto::{CertificateRequest, CertificateResponse};

const TOKEN: &str = "system:serviceaccount:apps:web";

fn install_crypto_provider() {
    // another test in this binary may have installed it already
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn options(extra: &[&str]) -> Options {
    let args = ["meshca", "--namespace", "mesh"]
        .into_iter()
        .chain(extra.iter().copied());
    Options::try_parse_from(args).expect("options should parse")
}

async fn start(options: Options, store: Arc<MemoryTrustStore>) -> (CaServer, ServingHandles) {
    let mut server = CaServer::new(options);
    server
        .init_with_store(store)
        .await
        .expect("init should succeed");

    let plain = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind plain");
    let secure = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind secure");
    let handles = server
        .start_with_listeners(plain, secure)
        .expect("start should succeed");
    assert_eq!(server.phase(), Phase::Serving);
    (server, handles)
}

async fn shutdown(mut server: CaServer, handles: ServingHandles) {
    server.stop().await;
    tokio::time::timeout(Duration::from_secs(10), handles.wait())
        .await
        .expect("listeners should drain")
        .expect("listeners should stop cleanly");
    assert_eq!(server.phase(), Phase::Stopped);
}

fn authority_pem(server: &CaServer) -> String {
    server
        .state()
        .expect("state")
        .active()
        .expect("active authority")
        .cert_pem()
        .to_string()
}

fn csr_request(token: Option<&str>) -> (Csr, Request<CertificateRequest>) {
    let csr = Csr::new("web", &["web.apps.svc"]).expect("CSR generation");
    let mut request = Request::new(CertificateRequest {
        csr: csr.csr_pem().to_string(),
        kind: "sidecar".to_string(),
    });
    if let Some(token) = token {
        request.metadata_mut().insert(
            "authorization",
            format!("Bearer {}", token)
                .parse()
                .expect("valid metadata value"),
        );
    }
    (csr, request)
}

fn assert_issued(response: &CertificateResponse, authority_pem: &str) {
    assert!(response.success);
    assert_eq!(response.trust_certs, vec![authority_pem.to_string()]);
    let leaf = decode_cert(&response.cert_pem).expect("leaf should parse");
    assert_eq!(leaf.common_name, "web");
    assert_eq!(response.expire_time, leaf.not_after * 1000);
}

async fn tls_channel(
    addr: std::net::SocketAddr,
    authority_pem: &str,
    identity: Option<Identity>,
) -> Result<Channel, tonic::transport::Error> {
    let mut tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(authority_pem))
        .domain_name("localhost");
    if let Some(identity) = identity {
        tls = tls.identity(identity);
    }
    Channel::from_shared(format!("https://{}", addr))
        .expect("valid URI")
        .tls_config(tls)?
        .connect()
        .await
}

#[tokio::test]
async fn plain_listener_signs_for_valid_token() {
    install_crypto_provider();
    let store = Arc::new(
        MemoryTrustStore::new()
            .with_namespaces(["apps", "kube-system"])
            .allow_token(TOKEN),
    );
    let (server, handles) = start(options(&[]), store.clone()).await;
    let authority = authority_pem(&server);
    assert_eq!(store.trust_record("apps"), Some(authority.clone()));

    let mut client = CertificateServiceClient::connect(format!("http://{}", handles.plain_addr))
        .await
        .expect("plain connect");

    let (_csr, request) = csr_request(Some(TOKEN));
    let response = client
        .create_certificate(request)
        .await
        .expect("request should succeed")
        .into_inner();
    assert_issued(&response, &authority);

    let (_csr, request) = csr_request(None);
    let status = client
        .create_certificate(request)
        .await
        .expect_err("request without token should fail");
    assert_eq!(status.code(), Code::Unauthenticated);

    drop(client);
    shutdown(server, handles).await;
}

#[tokio::test]
async fn secure_listener_presents_authority_signed_leaf() {
    install_crypto_provider();
    let store = Arc::new(MemoryTrustStore::new().allow_token(TOKEN));
    let (server, handles) = start(options(&[]), store).await;
    let authority = authority_pem(&server);

    let channel = tls_channel(handles.secure_addr, &authority, None)
        .await
        .expect("TLS connect should succeed");
    let mut client = CertificateServiceClient::new(channel);

    let (_csr, request) = csr_request(Some(TOKEN));
    let response = client
        .create_certificate(request)
        .await
        .expect("request should succeed")
        .into_inner();
    assert_issued(&response, &authority);

    drop(client);
    shutdown(server, handles).await;
}

#[tokio::test]
async fn client_certificate_replaces_token() {
    install_crypto_provider();
    let store = Arc::new(MemoryTrustStore::new());
    let (server, handles) = start(options(&[]), store).await;
    let authority = authority_pem(&server);

    let workload = Csr::new("web", &["web.apps.svc"]).expect("CSR generation");
    let issued = server
        .state()
        .expect("state")
        .active()
        .expect("active authority")
        .sign_csr(workload.csr_pem(), Duration::from_secs(60 * 60))
        .expect("signing");
    let identity = Identity::from_pem(&issued.cert_pem, workload.private_key_pem());

    let channel = tls_channel(handles.secure_addr, &authority, Some(identity))
        .await
        .expect("mTLS connect should succeed");
    let mut client = CertificateServiceClient::new(channel);

    let (_csr, request) = csr_request(None);
    let response = client
        .create_certificate(request)
        .await
        .expect("client certificate should authenticate")
        .into_inner();
    assert_issued(&response, &authority);

    drop(client);
    shutdown(server, handles).await;
}

#[tokio::test]
async fn untrusted_client_certificate_fails_the_handshake() {
    install_crypto_provider();
    let store = Arc::new(MemoryTrustStore::new());
    let (server, handles) = start(options(&[]), store).await;
    let authority = authority_pem(&server);

    let foreign = meshca_infra::AuthorityCert::generate(None, Duration::from_secs(24 * 60 * 60))
        .expect("generation");
    let workload = Csr::new("intruder", &["intruder.apps.svc"]).expect("CSR generation");
    let issued = foreign
        .sign_csr(workload.csr_pem(), Duration::from_secs(60 * 60))
        .expect("signing");
    let identity = Identity::from_pem(&issued.cert_pem, workload.private_key_pem());

    let outcome = match tls_channel(handles.secure_addr, &authority, Some(identity)).await {
        Err(_) => None,
        Ok(channel) => {
            let mut client = CertificateServiceClient::new(channel);
            let (_csr, request) = csr_request(None);
            Some(client.create_certificate(request).await)
        }
    };
    assert!(
        !matches!(outcome, Some(Ok(_))),
        "a certificate from a foreign authority must not authenticate"
    );

    shutdown(server, handles).await;
}

#[tokio::test]
async fn stop_before_start_stops_refresh_loop() {
    let store = Arc::new(MemoryTrustStore::new().with_namespaces(["apps"]));
    let mut server = CaServer::new(options(&[]));
    server
        .init_with_store(store.clone())
        .await
        .expect("init should succeed");
    assert_eq!(server.phase(), Phase::Initialized);

    let token = server.stop_token();
    server.stop().await;
    assert!(token.is_cancelled());
    assert_eq!(server.phase(), Phase::Stopped);

    server.stop().await;
    assert_eq!(server.phase(), Phase::Stopped);
}
