//! TLS configuration for the secure listener
//!
//! The server certificate comes from [`DynamicCertResolver`]. Client
//! certificates are optional: when present they must chain to one of the
//! trusted authorities, otherwise the caller authenticates with a token.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tracing::debug;

use crate::authority::AuthorityCertState;
use crate::resolver::DynamicCertResolver;

/// ALPN protocol for gRPC over HTTP/2
pub const ALPN_H2: &[u8] = b"h2";

/// mTLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfigError(String),

    /// No authority has been installed yet
    #[error("no trusted authority installed")]
    NoTrustedAuthority,
}

/// The aws-lc-rs provider used for every TLS config in this crate
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

struct GenerationVerifier {
    generation: u64,
    inner: Arc<dyn ClientCertVerifier>,
}

/// Client certificate verifier backed by the live trusted set
///
/// The underlying webpki verifier is rebuilt whenever the authority
/// generation changes, so a rotation takes effect on the next handshake.
pub struct TrustedClientVerifier {
    state: Arc<AuthorityCertState>,
    provider: Arc<CryptoProvider>,
    current: ArcSwapOption<GenerationVerifier>,
}

impl TrustedClientVerifier {
    /// Create a verifier over `state`
    pub fn new(state: Arc<AuthorityCertState>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            state,
            provider,
            current: ArcSwapOption::empty(),
        }
    }

    fn verifier(&self) -> Result<Arc<dyn ClientCertVerifier>, MtlsError> {
        let snapshot = self.state.snapshot();
        if let Some(current) = self.current.load_full() {
            if current.generation == snapshot.generation() {
                return Ok(current.inner.clone());
            }
        }

        if snapshot.trusted().is_empty() {
            return Err(MtlsError::NoTrustedAuthority);
        }

        let mut roots = RootCertStore::empty();
        for authority in snapshot.trusted() {
            roots
                .add(authority.cert_der().clone())
                .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;
        }

        let inner = WebPkiClientVerifier::builder_with_provider(
            Arc::new(roots),
            self.provider.clone(),
        )
        .allow_unauthenticated()
        .build()
        .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;

        debug!(
            generation = snapshot.generation(),
            trusted = snapshot.trusted().len(),
            "Rebuilt client cert verifier"
        );
        self.current.store(Some(Arc::new(GenerationVerifier {
            generation: snapshot.generation(),
            inner: inner.clone(),
        })));
        Ok(inner)
    }
}

impl std::fmt::Debug for TrustedClientVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustedClientVerifier")
            .field("generation", &self.state.generation())
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for TrustedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let verifier = self
            .verifier()
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        verifier.verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        // token callers connect without a certificate
        false
    }
}

/// Build the rustls config for the secure listener
///
/// With `verify_clients` set, presented client certificates are checked
/// against the trusted set; otherwise client certificates are not requested.
/// Fails while no authority is installed.
pub fn server_config(
    state: Arc<AuthorityCertState>,
    resolver: Arc<DynamicCertResolver>,
    verify_clients: bool,
) -> Result<ServerConfig, MtlsError> {
    if state.active().is_none() {
        return Err(MtlsError::NoTrustedAuthority);
    }

    let provider = crypto_provider();
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;

    let mut config = if verify_clients {
        builder
            .with_client_cert_verifier(Arc::new(TrustedClientVerifier::new(state, provider)))
            .with_cert_resolver(resolver)
    } else {
        builder.with_no_client_auth().with_cert_resolver(resolver)
    };
    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(config)
}
