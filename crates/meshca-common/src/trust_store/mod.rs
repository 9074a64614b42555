//! Cluster trust store
//!
//! The CA persists its authority certificate and private key in one secret
//! record, and broadcasts the authority certificate as a public trust record
//! to every workload namespace.
//!
//! Two implementations share the [`TrustStore`] trait:
//!
//! - [`KubeTrustStore`]: Secrets and ConfigMaps through the Kubernetes API
//! - [`MemoryTrustStore`]: an in-process store with write counters, used by tests
//!
//! Both decide create/skip/overwrite through [`plan_write`], so an identical
//! record is never rewritten.

mod kubernetes;
mod memory;

pub use self::kubernetes::KubeTrustStore;
pub use self::memory::MemoryTrustStore;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::Result;

/// Authority material as persisted in the secret record
#[derive(Clone)]
pub struct AuthoritySecret {
    /// PEM-encoded authority certificate
    pub cert_pem: String,
    /// PEM-encoded authority private key (zeroized on drop)
    pub key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for AuthoritySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthoritySecret")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// What happened to a single record on write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record did not exist and was created
    Created,
    /// The record existed with different content and was overwritten
    Updated,
    /// The record already held identical content; nothing was written
    Unchanged,
    /// A conditional write found unexpected content; nothing was written
    Conflict,
}

impl WriteOutcome {
    /// Whether the store was actually modified
    pub fn wrote(&self) -> bool {
        matches!(self, WriteOutcome::Created | WriteOutcome::Updated)
    }
}

/// Planned action for a record given its current and desired content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePlan {
    /// Record is absent
    Create,
    /// Record content differs
    Overwrite,
    /// Record content is byte-identical
    Skip,
}

/// Decide how to bring a record to `desired`
///
/// Comparison is exact byte equality. Records are written with the same
/// PEM string the CA holds in memory, so a re-read returns identical bytes.
pub fn plan_write<T: AsRef<[u8]> + ?Sized>(existing: Option<&T>, desired: &T) -> WritePlan {
    match existing {
        None => WritePlan::Create,
        Some(current) if current.as_ref() == desired.as_ref() => WritePlan::Skip,
        Some(_) => WritePlan::Overwrite,
    }
}

/// Plan for the secret record, which holds both the cert and the key
pub fn plan_secret_write(
    existing: Option<(&str, &str)>,
    cert_pem: &str,
    key_pem: &str,
) -> WritePlan {
    match existing {
        None => WritePlan::Create,
        Some((cert, key)) if cert == cert_pem && key == key_pem => WritePlan::Skip,
        Some(_) => WritePlan::Overwrite,
    }
}

/// Result of broadcasting the authority certificate to every namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Namespaces where the trust record was created
    pub created: Vec<String>,
    /// Namespaces where the trust record was overwritten
    pub updated: Vec<String>,
    /// Namespaces whose trust record already matched
    pub unchanged: Vec<String>,
    /// Namespaces that failed, with the error message
    pub failed: Vec<(String, String)>,
    /// Set when the namespace list itself could not be read
    pub list_error: Option<String>,
}

impl BroadcastReport {
    /// True when every namespace holds the broadcast certificate
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.list_error.is_none()
    }

    /// Number of records that were actually written
    pub fn writes(&self) -> usize {
        self.created.len() + self.updated.len()
    }

    /// Record the outcome for one namespace
    pub fn record(&mut self, namespace: &str, outcome: WriteOutcome) {
        let bucket = match outcome {
            WriteOutcome::Created => &mut self.created,
            WriteOutcome::Updated => &mut self.updated,
            WriteOutcome::Unchanged | WriteOutcome::Conflict => &mut self.unchanged,
        };
        bucket.push(namespace.to_string());
    }
}

/// Persistent, cluster-scoped storage for authority material
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Read the authority secret from `namespace`
    ///
    /// Returns `Ok(None)` when the record does not exist or lacks either key.
    async fn get_authority_cert(&self, namespace: &str) -> Result<Option<AuthoritySecret>>;

    /// Create or overwrite the authority secret, skipping identical content
    async fn update_authority_cert(
        &self,
        cert_pem: &str,
        key_pem: &str,
        namespace: &str,
    ) -> Result<WriteOutcome>;

    /// Overwrite the authority secret only if it still holds `expected_cert_pem`
    ///
    /// `None` expects the record to be absent. Returns
    /// [`WriteOutcome::Conflict`] when the stored cert differs or the record
    /// changed between read and write.
    async fn update_authority_cert_if(
        &self,
        expected_cert_pem: Option<&str>,
        cert_pem: &str,
        key_pem: &str,
        namespace: &str,
    ) -> Result<WriteOutcome>;

    /// Publish `cert_pem` as the trust record in every workload namespace
    ///
    /// The reserved system namespace is skipped. A failure in one namespace
    /// does not stop the others.
    async fn update_authority_public_key(&self, cert_pem: &str) -> BroadcastReport;

    /// Validate a service account token with the cluster
    async fn verify_service_account(&self, token: &str) -> bool;
}
