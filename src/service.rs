//! CreateCertificate gRPC service
//!
//! Workloads send a PEM CSR and receive a leaf signed by the active authority,
//! plus every trusted authority so they can verify peers issued before the
//! last rotation.
//!
//! # Authentication
//!
//! A caller is accepted when it either presented a client certificate on the
//! secure listener (rustls has already checked it against the trusted set) or
//! sends `authorization: Bearer <token>` metadata that the cluster accepts as
//! a service account token. Token checks can be switched off for local runs.

use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{error, info, instrument, warn};

use meshca_common::trust_store::TrustStore;
use meshca_infra::{AuthorityCertState, PkiError};
use meshca_proto::certificate_service_server::{CertificateService, CertificateServiceServer};
use meshca_proto::{CertificateRequest, CertificateResponse};

const AUTHORIZATION: &str = "authorization";
const BEARER_PREFIX: &str = "Bearer ";

/// How a caller was authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Caller {
    ClientCert,
    Token,
    Unverified,
}

/// Signs workload CSRs with the active authority
#[derive(Clone)]
pub struct CertificateServiceImpl {
    state: Arc<AuthorityCertState>,
    store: Arc<dyn TrustStore>,
    cert_validity: Duration,
    verify_tokens: bool,
}

impl CertificateServiceImpl {
    /// Create the service
    ///
    /// With `verify_tokens` unset, callers without a client certificate are
    /// accepted without a token.
    pub fn new(
        state: Arc<AuthorityCertState>,
        store: Arc<dyn TrustStore>,
        cert_validity: Duration,
        verify_tokens: bool,
    ) -> Self {
        Self {
            state,
            store,
            cert_validity,
            verify_tokens,
        }
    }

    /// Convert to a tonic service
    pub fn into_service(self) -> CertificateServiceServer<Self> {
        CertificateServiceServer::new(self)
    }

    async fn authenticate<T>(&self, request: &Request<T>) -> Result<Caller, Status> {
        if request
            .peer_certs()
            .is_some_and(|certs| !certs.is_empty())
        {
            return Ok(Caller::ClientCert);
        }

        if !self.verify_tokens {
            return Ok(Caller::Unverified);
        }

        let token = request
            .metadata()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Status::unauthenticated("missing bearer token"))?;

        if self.store.verify_service_account(token).await {
            Ok(Caller::Token)
        } else {
            Err(Status::unauthenticated("service account token rejected"))
        }
    }
}

fn signing_status(err: PkiError) -> Status {
    match err {
        err @ PkiError::CaNotInitialized => Status::unavailable(err.to_string()),
        PkiError::InvalidCsr(msg) => Status::invalid_argument(msg),
        other => {
            error!(error = %other, "Failed to sign certificate");
            Status::internal("failed to sign certificate")
        }
    }
}

impl std::fmt::Debug for CertificateServiceImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateServiceImpl")
            .field("cert_validity", &self.cert_validity)
            .field("verify_tokens", &self.verify_tokens)
            .finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl CertificateService for CertificateServiceImpl {
    #[instrument(skip(self, request))]
    async fn create_certificate(
        &self,
        request: Request<CertificateRequest>,
    ) -> Result<Response<CertificateResponse>, Status> {
        let remote_addr = request.remote_addr();
        let caller = match self.authenticate(&request).await {
            Ok(caller) => caller,
            Err(status) => {
                warn!(?remote_addr, reason = status.message(), "Rejected certificate request");
                return Err(status);
            }
        };

        let request = request.into_inner();
        if request.csr.trim().is_empty() {
            return Err(Status::invalid_argument("csr must not be empty"));
        }

        let snapshot = self.state.snapshot();
        let issued = snapshot
            .active()
            .ok_or(PkiError::CaNotInitialized)
            .and_then(|authority| authority.sign_csr(&request.csr, self.cert_validity))
            .map_err(signing_status)?;

        info!(
            ?remote_addr,
            ?caller,
            kind = %request.kind,
            generation = snapshot.generation(),
            not_after = issued.not_after,
            "Issued workload certificate"
        );

        Ok(Response::new(CertificateResponse {
            success: true,
            cert_pem: issued.cert_pem,
            trust_certs: snapshot.trusted_pems(),
            expire_time: issued.not_after.saturating_mul(1000),
            message: String::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshca_common::trust_store::MemoryTrustStore;
    use meshca_infra::pki::{decode_cert, now_unix, CertificateRequest as Csr};
    use meshca_infra::{AuthorityCert, TrustRetention};
    use tonic::Code;

    const VALIDITY: Duration = Duration::from_secs(60 * 60);

    fn state_with_authority() -> Arc<AuthorityCertState> {
        let state = Arc::new(AuthorityCertState::new(None, TrustRetention::KeepAll));
        state.install(
            AuthorityCert::generate(None, Duration::from_secs(24 * 60 * 60))
                .expect("generation should succeed"),
        );
        state
    }

    fn service(state: Arc<AuthorityCertState>, verify_tokens: bool) -> CertificateServiceImpl {
        let store = Arc::new(MemoryTrustStore::new().allow_token("good-token"));
        CertificateServiceImpl::new(state, store, VALIDITY, verify_tokens)
    }

    fn csr_request(token: Option<&str>) -> Request<CertificateRequest> {
        let csr = Csr::new("workload", &["workload.mesh.svc"]).expect("CSR generation");
        let mut request = Request::new(CertificateRequest {
            csr: csr.csr_pem().to_string(),
            kind: "sidecar".to_string(),
        });
        if let Some(token) = token {
            request.metadata_mut().insert(
                AUTHORIZATION,
                format!("Bearer {}", token)
                    .parse()
                    .expect("valid metadata value"),
            );
        }
        request
    }

    #[tokio::test]
    async fn valid_token_gets_a_signed_leaf() {
        let state = state_with_authority();
        let authority_pem = state.active().expect("active").cert_pem().to_string();
        let service = service(state, true);

        let response = service
            .create_certificate(csr_request(Some("good-token")))
            .await
            .expect("request should succeed")
            .into_inner();

        assert!(response.success);
        assert_eq!(response.trust_certs, vec![authority_pem]);
        let leaf = decode_cert(&response.cert_pem).expect("leaf should parse");
        assert_eq!(leaf.common_name, "workload");
        assert_eq!(response.expire_time, leaf.not_after * 1000);
        assert!(leaf.not_after > now_unix());
    }

    #[tokio::test]
    async fn trust_certs_include_previous_authorities() {
        let state = state_with_authority();
        state.install(
            AuthorityCert::generate(None, Duration::from_secs(24 * 60 * 60))
                .expect("generation should succeed"),
        );
        let service = service(state.clone(), true);

        let response = service
            .create_certificate(csr_request(Some("good-token")))
            .await
            .expect("request should succeed")
            .into_inner();
        assert_eq!(response.trust_certs, state.snapshot().trusted_pems());
        assert_eq!(response.trust_certs.len(), 2);
    }

    #[tokio::test]
    async fn missing_token_is_unauthenticated() {
        let service = service(state_with_authority(), true);
        let status = service
            .create_certificate(csr_request(None))
            .await
            .expect_err("request should be rejected");
        assert_eq!(status.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn rejected_token_is_unauthenticated() {
        let service = service(state_with_authority(), true);
        let status = service
            .create_certificate(csr_request(Some("stolen-token")))
            .await
            .expect_err("request should be rejected");
        assert_eq!(status.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn token_check_can_be_disabled() {
        let service = service(state_with_authority(), false);
        let response = service
            .create_certificate(csr_request(None))
            .await
            .expect("request should succeed");
        assert!(response.into_inner().success);
    }

    #[tokio::test]
    async fn empty_csr_is_invalid() {
        let service = service(state_with_authority(), false);
        let status = service
            .create_certificate(Request::new(CertificateRequest {
                csr: "  ".to_string(),
                kind: String::new(),
            }))
            .await
            .expect_err("request should be rejected");
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn garbage_csr_is_invalid() {
        let service = service(state_with_authority(), false);
        let status = service
            .create_certificate(Request::new(CertificateRequest {
                csr: "-----BEGIN CERTIFICATE REQUEST-----\nnope\n-----END CERTIFICATE REQUEST-----\n"
                    .to_string(),
                kind: String::new(),
            }))
            .await
            .expect_err("request should be rejected");
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn no_authority_is_unavailable() {
        let state = Arc::new(AuthorityCertState::new(None, TrustRetention::KeepAll));
        let service = service(state, false);
        let status = service
            .create_certificate(csr_request(None))
            .await
            .expect_err("request should be rejected");
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "CA not initialized");
    }
}
