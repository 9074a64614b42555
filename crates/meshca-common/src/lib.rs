//! Common types for meshca: errors, cluster access, the trust store, and
//! logging setup shared by the CA server

#![deny(missing_docs)]

pub mod error;
pub mod kube_client;
pub mod telemetry;
pub mod trust_store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the CA runs in when none is configured
pub const DEFAULT_NAMESPACE: &str = "meshca-system";

/// Default port for the plaintext gRPC listener
pub const DEFAULT_PLAIN_PORT: u16 = 30060;

/// Default port for the TLS gRPC listener
pub const DEFAULT_SECURE_PORT: u16 = 30062;

/// Default name of the Service fronting the CA
pub const DEFAULT_SERVICE_NAME: &str = "meshca";

/// Default cluster DNS domain
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Name of the secret holding the authority certificate and private key
pub const CA_SECRET: &str = "meshca-ca-secret";

/// Secret data key for the authority certificate PEM
pub const CA_CERT_KEY: &str = "cert.pem";

/// Secret data key for the authority private key PEM
pub const CA_KEY_KEY: &str = "pri.pem";

/// Name of the ConfigMap that publishes the authority certificate
pub const TRUST_CONFIG_MAP: &str = "meshca-ca-cert";

/// ConfigMap data key for the published authority certificate
pub const TRUST_CERT_KEY: &str = "ca.crt";

/// Namespace that never receives the trust record
pub const RESERVED_NAMESPACE: &str = "kube-system";

/// Label key marking records owned by meshca
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label value marking records owned by meshca
pub const MANAGED_BY_VALUE: &str = "meshca";

/// In-cluster DNS name of the CA service (`<service>.<namespace>.svc`)
pub fn ca_service_dns(service: &str, namespace: &str) -> String {
    format!("{}.{}.svc", service, namespace)
}

/// Fully qualified DNS name of the CA service
pub fn ca_service_fqdn(service: &str, namespace: &str, cluster_domain: &str) -> String {
    format!("{}.{}", ca_service_dns(service, namespace), cluster_domain)
}
