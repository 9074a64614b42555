//! PKI operations for the mesh CA
//!
//! The CA holds one active authority certificate (self-signed, or signed by an
//! operator-supplied root) and uses it to issue two kinds of leaves:
//!
//! - server certificates for the CA's own TLS listener, one per SNI hostname
//! - workload certificates signed from CSRs; the CA never sees workload keys
//!
//! # Refresh
//!
//! An authority certificate needs a refresh once it is outside its validity
//! window or has less than 20% of its lifetime left. Refreshed authorities are
//! appended to the trusted set so that leaves issued by older ones keep
//! verifying until they expire.

use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

/// Default authority certificate lifetime (30 days)
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default lifetime for server and workload certificates (1 hour)
pub const DEFAULT_CERT_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Fraction of the lifetime after which a certificate should be replaced
pub const REFRESH_THRESHOLD: f64 = 0.80;

const ORGANIZATION: &str = "meshca";
const AUTHORITY_COMMON_NAME: &str = "meshca authority";

/// Current time as a Unix timestamp in seconds
pub fn now_unix() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Compute (not_before, not_after) for a certificate valid from now
fn compute_validity(
    validity: Duration,
) -> Result<(::time::OffsetDateTime, ::time::OffsetDateTime)> {
    let now = ::time::OffsetDateTime::now_utc();
    let lifetime = ::time::Duration::try_from(validity)
        .map_err(|e| PkiError::CertificateGenerationFailed(format!("invalid validity: {}", e)))?;
    let not_after = now.checked_add(lifetime).ok_or_else(|| {
        PkiError::CertificateGenerationFailed("validity overflows the calendar".to_string())
    })?;
    Ok((now, not_after))
}

/// Information about a certificate's validity window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Whether `now` falls inside the validity window
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Whether the certificate is outside its window or less than 20% of its
    /// lifetime remains at `now`
    pub fn needs_refresh_at(&self, now: i64) -> bool {
        if !self.is_valid_at(now) {
            return true;
        }
        let lifetime = self.lifetime_secs();
        if lifetime <= 0 {
            return true;
        }
        let age = (now - self.not_before) as f64;
        age / lifetime as f64 >= REFRESH_THRESHOLD
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        now_unix() > self.not_after
    }
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// No active authority certificate to sign with
    #[error("CA not initialized")]
    CaNotInitialized,

    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// The private key does not belong to the certificate
    #[error("private key does not match certificate {0}")]
    KeyMismatch(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate or key parsing error
    #[error("parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Decode a PEM certificate into its validity info
pub fn decode_cert(cert_pem: &str) -> Result<CertificateInfo> {
    CertificateInfo::from_pem(cert_pem)
}

/// Decode a PEM private key
pub fn decode_private_key(key_pem: &str) -> Result<KeyPair> {
    KeyPair::from_pem(key_pem)
        .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {}", e)))
}

/// Reject a key pair whose public key differs from the certificate's
fn ensure_key_matches(cert_der: &[u8], key_pair: &KeyPair) -> Result<()> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    let cert_public_key = cert
        .tbs_certificate
        .subject_pki
        .subject_public_key
        .data
        .as_ref();
    if cert_public_key != key_pair.public_key_raw() {
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("<unnamed>")
            .to_string();
        return Err(PkiError::KeyMismatch(common_name));
    }
    Ok(())
}

fn dns_or_ip_san(name: &str) -> Result<SanType> {
    if let Ok(ip) = name.parse::<std::net::IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("invalid DNS name '{}': {}", name, e))
        })
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Operator-supplied trust anchor that signs authority certificates
#[derive(Clone)]
pub struct RootCert {
    cert_pem: String,
    key_pem: Zeroizing<String>,
    info: CertificateInfo,
}

impl std::fmt::Debug for RootCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCert")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl RootCert {
    /// Load a root from PEM strings; the key must match the certificate
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let der = parse_pem(cert_pem)?;
        let info = CertificateInfo::from_der(&der)?;
        let key_pair = decode_private_key(key_pem)?;
        ensure_key_matches(&der, &key_pair)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: Zeroizing::new(key_pem.to_string()),
            info,
        })
    }

    /// Load a root from PEM files on disk
    pub fn from_files(
        cert_path: impl AsRef<std::path::Path>,
        key_path: impl AsRef<std::path::Path>,
    ) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = Zeroizing::new(std::fs::read_to_string(key_path)?);
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// PEM-encoded root certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Validity info of the root certificate
    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    fn key_pair(&self) -> Result<KeyPair> {
        decode_private_key(&self.key_pem)
    }
}

/// A leaf certificate signed from a CSR
#[derive(Debug, Clone)]
pub struct IssuedCert {
    /// PEM-encoded leaf certificate
    pub cert_pem: String,
    /// Expiry as a Unix timestamp in seconds
    pub not_after: i64,
}

/// A server certificate ready for a TLS handshake
#[derive(Debug, Clone)]
pub struct ServerCert {
    /// Chain `[leaf, authority]` with its signing key
    pub certified_key: Arc<CertifiedKey>,
    /// Leaf expiry as a Unix timestamp in seconds
    pub not_after: i64,
}

/// An authority certificate and its private key
#[derive(Clone)]
pub struct AuthorityCert {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: Zeroizing<String>,
    info: CertificateInfo,
}

impl std::fmt::Debug for AuthorityCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityCert")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl AuthorityCert {
    /// Generate a new authority valid from now for `validity`
    ///
    /// Signed by `root` when given, self-signed otherwise.
    pub fn generate(root: Option<&RootCert>, validity: Duration) -> Result<Self> {
        let (not_before, not_after) = compute_validity(validity)?;
        Self::generate_with_window(root, not_before, not_after)
    }

    /// Generate a new authority with an explicit validity window
    pub fn generate_with_window(
        root: Option<&RootCert>,
        not_before: ::time::OffsetDateTime,
        not_after: ::time::OffsetDateTime,
    ) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(AUTHORITY_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate authority key: {}", e))
        })?;

        let cert = match root {
            Some(root) => {
                let root_key = root.key_pair()?;
                let issuer = Issuer::from_ca_cert_pem(&root.cert_pem, &root_key)
                    .map_err(|e| PkiError::ParseError(format!("failed to load root: {}", e)))?;
                params.signed_by(&key_pair, &issuer)
            }
            None => params.self_signed(&key_pair),
        }
        .map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create authority: {}", e))
        })?;

        let cert_der = cert.der().clone();
        let info = CertificateInfo::from_der(&cert_der)?;
        Ok(Self {
            cert_pem: cert.pem(),
            cert_der,
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
            info,
        })
    }

    /// Load an authority from PEM strings; the key must match the certificate
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let der = parse_pem(cert_pem)?;
        let info = CertificateInfo::from_der(&der)?;
        let key_pair = decode_private_key(key_pem)?;
        ensure_key_matches(&der, &key_pair)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            cert_der: CertificateDer::from(der),
            key_pem: Zeroizing::new(key_pem.to_string()),
            info,
        })
    }

    /// PEM-encoded authority certificate, byte-identical to what is persisted
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER-encoded authority certificate
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// PEM-encoded private key
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Validity info
    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    /// Whether the authority is inside its validity window
    pub fn is_valid(&self) -> bool {
        self.info.is_valid_at(now_unix())
    }

    /// Whether the authority should be replaced
    pub fn needs_refresh(&self) -> bool {
        self.info.needs_refresh_at(now_unix())
    }

    fn key_pair(&self) -> Result<KeyPair> {
        decode_private_key(&self.key_pem)
    }

    /// Leaf expiry: `validity` from now, never past the authority's own expiry
    fn leaf_window(
        &self,
        validity: Duration,
    ) -> Result<(::time::OffsetDateTime, ::time::OffsetDateTime)> {
        let (not_before, not_after) = compute_validity(validity)?;
        let authority_expiry = ::time::OffsetDateTime::from_unix_timestamp(self.info.not_after)
            .map_err(|e| PkiError::ParseError(format!("invalid authority expiry: {}", e)))?;
        Ok((not_before, not_after.min(authority_expiry)))
    }

    /// Issue a TLS server certificate for `hostname`
    ///
    /// The returned chain is `[leaf, authority]` with a fresh leaf key.
    pub fn issue_server_cert(&self, hostname: &str, validity: Duration) -> Result<ServerCert> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(hostname);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = vec![dns_or_ip_san(hostname)?];
        let (not_before, not_after) = self.leaf_window(validity)?;
        params.not_before = not_before;
        params.not_after = not_after;

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate server key: {}", e))
        })?;

        let authority_key = self.key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &authority_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let leaf = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign server cert: {}", e))
        })?;

        let private_key =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
            .map_err(|e| PkiError::ParseError(format!("unsupported server key: {}", e)))?;

        let chain = vec![leaf.der().clone(), self.cert_der.clone()];
        Ok(ServerCert {
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            not_after: not_after.unix_timestamp(),
        })
    }

    /// Sign a workload CSR
    ///
    /// Subject and SANs come from the CSR; the CA controls CA constraints,
    /// key usages and validity.
    pub fn sign_csr(&self, csr_pem: &str, validity: Duration) -> Result<IssuedCert> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        let (not_before, not_after) = self.leaf_window(validity)?;
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;

        let authority_key = self.key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &authority_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let signed = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(IssuedCert {
            cert_pem: signed.pem(),
            not_after: not_after.unix_timestamp(),
        })
    }
}

/// Workload-side key pair and CSR
///
/// The key never leaves the caller; only the CSR is sent to the CA.
pub struct CertificateRequest {
    key_pem: Zeroizing<String>,
    csr_pem: String,
}

impl CertificateRequest {
    /// Generate a key pair and a CSR for `common_name` with DNS/IP `sans`
    pub fn new(common_name: &str, sans: &[&str]) -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate workload key: {}", e))
        })?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.subject_alt_names = sans
            .iter()
            .map(|san| dns_or_ip_san(san))
            .collect::<Result<Vec<_>>>()?;

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self {
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
            csr_pem,
        })
    }

    /// CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key in PEM format
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_by(cert_der: &[u8], issuer_der: &[u8]) -> bool {
        let (_, cert) = X509Certificate::from_der(cert_der).expect("leaf should parse");
        let (_, issuer) = X509Certificate::from_der(issuer_der).expect("issuer should parse");
        cert.verify_signature(Some(issuer.public_key())).is_ok()
    }

    fn window(
        before_now: ::time::Duration,
        after_now: ::time::Duration,
    ) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
        let now = ::time::OffsetDateTime::now_utc();
        (now - before_now, now + after_now)
    }

    #[test]
    fn fresh_authority_is_valid_and_not_due() {
        let authority =
            AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation should succeed");
        assert!(authority.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(authority.key_pem().contains("PRIVATE KEY"));
        assert!(authority.is_valid());
        assert!(!authority.needs_refresh());
        assert_eq!(authority.info().common_name, AUTHORITY_COMMON_NAME);
    }

    #[test]
    fn authority_past_eighty_percent_needs_refresh() {
        let (not_before, not_after) =
            window(::time::Duration::days(9), ::time::Duration::days(1));
        let authority = AuthorityCert::generate_with_window(None, not_before, not_after)
            .expect("generation should succeed");
        assert!(authority.is_valid());
        assert!(authority.needs_refresh());
    }

    #[test]
    fn expired_authority_is_invalid() {
        let (not_before, not_after) =
            window(::time::Duration::days(2), -::time::Duration::days(1));
        let authority = AuthorityCert::generate_with_window(None, not_before, not_after)
            .expect("generation should succeed");
        assert!(!authority.is_valid());
        assert!(authority.needs_refresh());
        assert!(authority.info().is_expired());
    }

    #[test]
    fn refresh_threshold_boundaries() {
        let info = CertificateInfo {
            not_before: 0,
            not_after: 100,
            common_name: String::new(),
        };
        assert!(!info.needs_refresh_at(79));
        assert!(info.needs_refresh_at(80));
        assert!(info.needs_refresh_at(101));
        assert!(info.needs_refresh_at(-1));
        assert!(!info.is_valid_at(-1));
    }

    #[test]
    fn zero_lifetime_always_needs_refresh() {
        let info = CertificateInfo {
            not_before: 50,
            not_after: 50,
            common_name: String::new(),
        };
        assert!(info.needs_refresh_at(50));
    }

    #[test]
    fn authority_survives_pem_round_trip() {
        let original =
            AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation should succeed");
        let restored = AuthorityCert::from_pem(original.cert_pem(), original.key_pem())
            .expect("loading should succeed");
        assert_eq!(restored.cert_pem(), original.cert_pem());
        assert_eq!(restored.info(), original.info());

        let request = CertificateRequest::new("workload", &["workload.mesh.svc"])
            .expect("CSR generation should succeed");
        let issued = restored
            .sign_csr(request.csr_pem(), DEFAULT_CERT_VALIDITY)
            .expect("restored authority should sign");
        let der = parse_pem(&issued.cert_pem).expect("PEM parsing should succeed");
        assert!(signed_by(&der, original.cert_der()));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let a = AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation");
        let b = AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation");
        let result = AuthorityCert::from_pem(a.cert_pem(), b.key_pem());
        assert!(matches!(result, Err(PkiError::KeyMismatch(_))));
    }

    #[test]
    fn garbage_pem_is_a_parse_error() {
        assert!(matches!(
            decode_cert("not a certificate"),
            Err(PkiError::ParseError(_))
        ));
        assert!(matches!(
            decode_private_key("not a key"),
            Err(PkiError::ParseError(_))
        ));
    }

    #[test]
    fn root_signs_authority() {
        let root_source =
            AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("root generation");
        let root = RootCert::from_pem(root_source.cert_pem(), root_source.key_pem())
            .expect("root should load");

        let authority =
            AuthorityCert::generate(Some(&root), DEFAULT_CA_VALIDITY).expect("generation");
        assert!(signed_by(authority.cert_der(), root_source.cert_der()));
        assert!(!signed_by(authority.cert_der(), authority.cert_der()));
    }

    #[test]
    fn root_from_missing_files_is_io_error() {
        let result = RootCert::from_files("/nonexistent/root.crt", "/nonexistent/root.key");
        assert!(matches!(result, Err(PkiError::Io(_))));
    }

    #[test]
    fn server_cert_chain_ends_in_authority() {
        let authority = AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation");
        let server = authority
            .issue_server_cert("meshca.mesh.svc", DEFAULT_CERT_VALIDITY)
            .expect("issuance should succeed");

        let chain = &server.certified_key.cert;
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].as_ref(), authority.cert_der().as_ref());
        assert!(signed_by(chain[0].as_ref(), authority.cert_der()));

        let (_, leaf) = X509Certificate::from_der(chain[0].as_ref()).expect("leaf parses");
        let sans = leaf
            .subject_alternative_name()
            .expect("SAN extension parses")
            .expect("SAN extension present");
        assert!(sans
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName("meshca.mesh.svc"))));
    }

    #[test]
    fn leaf_never_outlives_authority() {
        let (not_before, not_after) =
            window(::time::Duration::hours(1), ::time::Duration::minutes(10));
        let authority =
            AuthorityCert::generate_with_window(None, not_before, not_after).expect("generation");
        let server = authority
            .issue_server_cert("localhost", DEFAULT_CERT_VALIDITY)
            .expect("issuance should succeed");
        assert_eq!(server.not_after, authority.info().not_after);
    }

    #[test]
    fn ip_hostnames_get_ip_sans() {
        let authority = AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation");
        assert!(authority
            .issue_server_cert("10.0.0.7", DEFAULT_CERT_VALIDITY)
            .is_ok());
    }

    #[test]
    fn csr_from_a_foreign_authority_does_not_verify() {
        let ours = AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation");
        let theirs = AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation");
        let request = CertificateRequest::new("spoof", &[]).expect("CSR generation");

        let issued = theirs
            .sign_csr(request.csr_pem(), DEFAULT_CERT_VALIDITY)
            .expect("signing should succeed");
        let der = parse_pem(&issued.cert_pem).expect("PEM parsing");
        assert!(!signed_by(&der, ours.cert_der()));
    }

    #[test]
    fn signed_csr_keeps_requested_subject() {
        let authority = AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation");
        let request = CertificateRequest::new("orders", &["orders.shop.svc"])
            .expect("CSR generation should succeed");
        assert!(!request.csr_pem().contains("PRIVATE KEY"));
        assert!(request.private_key_pem().contains("PRIVATE KEY"));

        let issued = authority
            .sign_csr(request.csr_pem(), DEFAULT_CERT_VALIDITY)
            .expect("signing should succeed");
        let info = decode_cert(&issued.cert_pem).expect("issued cert parses");
        assert_eq!(info.common_name, "orders");
        assert_eq!(info.not_after, issued.not_after);
    }

    #[test]
    fn malformed_csrs_are_rejected() {
        let authority = AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation");
        let invalid_inputs = [
            "not a csr at all",
            "-----BEGIN CERTIFICATE-----\nwrong type\n-----END CERTIFICATE-----",
            "-----BEGIN CERTIFICATE REQUEST-----\ncorrupted\n-----END CERTIFICATE REQUEST-----",
        ];
        for invalid in invalid_inputs {
            let result = authority.sign_csr(invalid, DEFAULT_CERT_VALIDITY);
            assert!(matches!(result, Err(PkiError::InvalidCsr(_))), "{invalid}");
        }
    }

    #[test]
    fn debug_output_hides_key() {
        let authority = AuthorityCert::generate(None, DEFAULT_CA_VALIDITY).expect("generation");
        let rendered = format!("{:?}", authority);
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
