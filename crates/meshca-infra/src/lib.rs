//! Certificate authority internals for meshca
//!
//! - [`pki`]: authority generation, server leaf issuance, CSR signing
//! - [`authority`]: the shared, atomically swapped authority snapshot
//! - [`resolver`]: SNI-driven server certificate resolution for rustls
//! - [`mtls`]: the secure listener's rustls config and client verifier
//!
//! Persistence lives in `meshca-common`; this crate never talks to the
//! cluster.

pub mod authority;
pub mod mtls;
pub mod pki;
pub mod resolver;

pub use authority::{AuthorityCertState, AuthoritySnapshot, TrustRetention};
pub use mtls::{server_config, MtlsError, TrustedClientVerifier};
pub use pki::{AuthorityCert, PkiError, RootCert};
pub use resolver::{AuthorityLeafIssuer, DynamicCertResolver, LeafIssuer, ResolverStats};
