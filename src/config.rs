//! Process options
//!
//! Every option is a flag with a `MESHCA_*` environment fallback, so the same
//! binary runs from a Deployment manifest or a developer shell.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use thiserror::Error;

use meshca_common::{
    ca_service_dns, ca_service_fqdn, DEFAULT_CLUSTER_DOMAIN, DEFAULT_NAMESPACE,
    DEFAULT_PLAIN_PORT, DEFAULT_SECURE_PORT, DEFAULT_SERVICE_NAME,
};
use meshca_infra::pki::{DEFAULT_CA_VALIDITY, DEFAULT_CERT_VALIDITY};
use meshca_infra::resolver::DEFAULT_MAX_CACHED_LEAVES;
use meshca_infra::TrustRetention;

const DEFAULT_CA_VALIDITY_MS: u64 = DEFAULT_CA_VALIDITY.as_millis() as u64;
const DEFAULT_CERT_VALIDITY_MS: u64 = DEFAULT_CERT_VALIDITY.as_millis() as u64;

/// Option combinations that cannot work
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The authority namespace is empty
    #[error("namespace must not be empty")]
    EmptyNamespace,

    /// A certificate lifetime is zero
    #[error("{0} validity must be positive")]
    ZeroValidity(&'static str),

    /// Both listeners were given the same port
    #[error("plain and secure listeners cannot share port {0}")]
    SharedPort(u16),

    /// The server certificate cache cannot hold anything
    #[error("server certificate cache must hold at least one entry")]
    EmptyCache,
}

/// meshca - certificate authority for service mesh identities
#[derive(Parser, Debug, Clone)]
#[command(name = "meshca", version, about, long_about = None)]
pub struct Options {
    /// Namespace holding the authority secret
    #[arg(long, env = "MESHCA_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Port for the plaintext gRPC listener
    #[arg(long, env = "MESHCA_PLAIN_PORT", default_value_t = DEFAULT_PLAIN_PORT)]
    pub plain_port: u16,

    /// Port for the TLS gRPC listener
    #[arg(long, env = "MESHCA_SECURE_PORT", default_value_t = DEFAULT_SECURE_PORT)]
    pub secure_port: u16,

    /// Lifetime of generated authority certificates, in milliseconds
    #[arg(long, env = "MESHCA_CA_VALIDITY_MS", default_value_t = DEFAULT_CA_VALIDITY_MS)]
    pub ca_validity_ms: u64,

    /// Lifetime of server and workload certificates, in milliseconds
    #[arg(long, env = "MESHCA_CERT_VALIDITY_MS", default_value_t = DEFAULT_CERT_VALIDITY_MS)]
    pub cert_validity_ms: u64,

    /// Name of the Service fronting the CA
    #[arg(long, env = "MESHCA_SERVICE_NAME", default_value = DEFAULT_SERVICE_NAME)]
    pub service_name: String,

    /// Cluster DNS domain
    #[arg(long, env = "MESHCA_CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    pub cluster_domain: String,

    /// PEM root certificate that signs authorities (self-signed when unset)
    #[arg(long, env = "MESHCA_ROOT_CERT", requires = "root_key")]
    pub root_cert: Option<PathBuf>,

    /// PEM private key of the root certificate
    #[arg(long, env = "MESHCA_ROOT_KEY", requires = "root_cert")]
    pub root_key: Option<PathBuf>,

    /// Explicit kubeconfig; in-cluster config or KUBECONFIG otherwise
    #[arg(long, env = "MESHCA_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Accept certificate requests without validating the bearer token
    #[arg(long, env = "MESHCA_SKIP_TOKEN_VERIFICATION")]
    pub skip_token_verification: bool,

    /// Request and verify client certificates on the TLS listener
    #[arg(
        long,
        env = "MESHCA_CLIENT_CERT_AUTH",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub client_cert_auth: bool,

    /// What to do with expired historical authorities (keep-all, drop-expired)
    #[arg(long, env = "MESHCA_TRUST_RETENTION", default_value_t = TrustRetention::KeepAll)]
    pub trust_retention: TrustRetention,

    /// Most hostnames whose server certificates are cached
    #[arg(
        long,
        env = "MESHCA_MAX_CACHED_SERVER_CERTS",
        default_value_t = DEFAULT_MAX_CACHED_LEAVES
    )]
    pub max_cached_server_certs: usize,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "MESHCA_LOG_TEXT")]
    pub log_text: bool,
}

impl Options {
    /// Authority certificate lifetime
    pub fn ca_validity(&self) -> Duration {
        Duration::from_millis(self.ca_validity_ms)
    }

    /// Server and workload certificate lifetime
    pub fn cert_validity(&self) -> Duration {
        Duration::from_millis(self.cert_validity_ms)
    }

    /// In-cluster DNS name of the CA, used when a client sends no SNI
    pub fn service_dns(&self) -> String {
        ca_service_dns(&self.service_name, &self.namespace)
    }

    /// Hostnames whose server certificates are issued at startup
    pub fn prewarm_hostnames(&self) -> Vec<String> {
        vec![
            "localhost".to_string(),
            self.service_dns(),
            ca_service_fqdn(&self.service_name, &self.namespace, &self.cluster_domain),
        ]
    }

    /// Bind address of the plaintext listener
    pub fn plain_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.plain_port))
    }

    /// Bind address of the TLS listener
    pub fn secure_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.secure_port))
    }

    /// Reject option combinations that cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if self.ca_validity_ms == 0 {
            return Err(ConfigError::ZeroValidity("authority"));
        }
        if self.cert_validity_ms == 0 {
            return Err(ConfigError::ZeroValidity("certificate"));
        }
        if self.plain_port != 0 && self.plain_port == self.secure_port {
            return Err(ConfigError::SharedPort(self.plain_port));
        }
        if self.max_cached_server_certs == 0 {
            return Err(ConfigError::EmptyCache);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("meshca").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let options = parse(&[]);
        assert_eq!(options.plain_port, 30060);
        assert_eq!(options.secure_port, 30062);
        assert_eq!(options.ca_validity(), Duration::from_secs(30 * 24 * 60 * 60));
        assert_eq!(options.cert_validity(), Duration::from_secs(60 * 60));
        assert_eq!(options.trust_retention, TrustRetention::KeepAll);
        assert!(options.client_cert_auth);
        assert!(!options.skip_token_verification);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn prewarm_covers_localhost_and_service_names() {
        let options = parse(&["--namespace", "mesh"]);
        assert_eq!(
            options.prewarm_hostnames(),
            vec![
                "localhost".to_string(),
                "meshca.mesh.svc".to_string(),
                "meshca.mesh.svc.cluster.local".to_string(),
            ]
        );
    }

    #[test]
    fn root_cert_requires_root_key() {
        let result = Options::try_parse_from(["meshca", "--root-cert", "/etc/meshca/root.crt"]);
        assert!(result.is_err());

        let options = parse(&[
            "--root-cert",
            "/etc/meshca/root.crt",
            "--root-key",
            "/etc/meshca/root.key",
        ]);
        assert!(options.root_cert.is_some());
    }

    #[test]
    fn retention_and_client_auth_are_configurable() {
        let options = parse(&[
            "--trust-retention",
            "drop-expired",
            "--client-cert-auth",
            "false",
        ]);
        assert_eq!(options.trust_retention, TrustRetention::DropExpired);
        assert!(!options.client_cert_auth);
    }

    #[test]
    fn shared_port_is_rejected() {
        let options = parse(&["--plain-port", "9000", "--secure-port", "9000"]);
        assert_eq!(options.validate(), Err(ConfigError::SharedPort(9000)));
    }

    #[test]
    fn zero_validity_is_rejected() {
        let options = parse(&["--ca-validity-ms", "0"]);
        assert_eq!(options.validate(), Err(ConfigError::ZeroValidity("authority")));

        let options = parse(&["--cert-validity-ms", "0"]);
        let err = options.validate().expect_err("zero leaf validity");
        assert_eq!(err.to_string(), "certificate validity must be positive");
    }

    #[test]
    fn empty_namespace_and_cache_are_rejected() {
        assert_eq!(
            parse(&["--namespace", ""]).validate(),
            Err(ConfigError::EmptyNamespace)
        );
        assert_eq!(
            parse(&["--max-cached-server-certs", "0"]).validate(),
            Err(ConfigError::EmptyCache)
        );
        assert_eq!(
            parse(&[]).max_cached_server_certs,
            DEFAULT_MAX_CACHED_LEAVES
        );
    }
}
