//! In-process trust store
//!
//! Mirrors the Kubernetes store's record layout and write rules, and counts
//! every write so tests can assert that identical content is never rewritten.
//! Failures can be injected per namespace.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{
    plan_secret_write, plan_write, AuthoritySecret, BroadcastReport, TrustStore, WriteOutcome,
    WritePlan,
};
use crate::{Error, Result, RESERVED_NAMESPACE};

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    secrets: HashMap<String, AuthoritySecret>,
    trust_records: BTreeMap<String, String>,
    trust_writes: HashMap<String, usize>,
    secret_writes: usize,
    failing_namespaces: BTreeSet<String>,
    fail_secret_writes: bool,
    failing_secret_reads: usize,
    fail_listing: bool,
    allowed_tokens: BTreeSet<String>,
}

/// Trust store held entirely in memory
#[derive(Default)]
pub struct MemoryTrustStore {
    state: Mutex<State>,
}

impl MemoryTrustStore {
    /// Create an empty store with no namespaces
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the namespace list used by broadcasts
    pub fn with_namespaces<I, S>(self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .namespaces
            .extend(namespaces.into_iter().map(Into::into));
        self
    }

    /// Accept `token` in [`TrustStore::verify_service_account`]
    pub fn allow_token(self, token: impl Into<String>) -> Self {
        self.state.lock().allowed_tokens.insert(token.into());
        self
    }

    /// Add a namespace after construction
    pub fn add_namespace(&self, namespace: impl Into<String>) {
        self.state.lock().namespaces.insert(namespace.into());
    }

    /// Make every trust record write in `namespace` fail
    pub fn fail_namespace(&self, namespace: impl Into<String>) {
        self.state.lock().failing_namespaces.insert(namespace.into());
    }

    /// Undo [`fail_namespace`](Self::fail_namespace)
    pub fn heal_namespace(&self, namespace: &str) {
        self.state.lock().failing_namespaces.remove(namespace);
    }

    /// Make authority secret writes fail
    pub fn set_fail_secret_writes(&self, fail: bool) {
        self.state.lock().fail_secret_writes = fail;
    }

    /// Make the next `count` authority secret reads fail
    pub fn fail_secret_reads(&self, count: usize) {
        self.state.lock().failing_secret_reads = count;
    }

    /// Make the namespace listing fail
    pub fn set_fail_listing(&self, fail: bool) {
        self.state.lock().fail_listing = fail;
    }

    /// Overwrite the secret record directly, as another writer would
    pub fn put_secret(&self, namespace: &str, cert_pem: &str, key_pem: &str) {
        self.state.lock().secrets.insert(
            namespace.to_string(),
            AuthoritySecret {
                cert_pem: cert_pem.to_string(),
                key_pem: Zeroizing::new(key_pem.to_string()),
            },
        );
    }

    /// Current secret record in `namespace`
    pub fn secret(&self, namespace: &str) -> Option<AuthoritySecret> {
        self.state.lock().secrets.get(namespace).cloned()
    }

    /// Current trust record in `namespace`
    pub fn trust_record(&self, namespace: &str) -> Option<String> {
        self.state.lock().trust_records.get(namespace).cloned()
    }

    /// Number of trust record writes performed in `namespace`
    pub fn trust_writes(&self, namespace: &str) -> usize {
        self.state
            .lock()
            .trust_writes
            .get(namespace)
            .copied()
            .unwrap_or(0)
    }

    /// Number of secret record writes performed across all namespaces
    pub fn secret_writes(&self) -> usize {
        self.state.lock().secret_writes
    }

    fn write_secret(
        state: &mut State,
        cert_pem: &str,
        key_pem: &str,
        namespace: &str,
    ) -> Result<WriteOutcome> {
        let plan = plan_secret_write(
            state
                .secrets
                .get(namespace)
                .map(|s| (s.cert_pem.as_str(), s.key_pem.as_str())),
            cert_pem,
            key_pem,
        );
        if plan == WritePlan::Skip {
            return Ok(WriteOutcome::Unchanged);
        }
        if state.fail_secret_writes {
            return Err(Error::store(namespace, "secret write rejected"));
        }

        state.secrets.insert(
            namespace.to_string(),
            AuthoritySecret {
                cert_pem: cert_pem.to_string(),
                key_pem: Zeroizing::new(key_pem.to_string()),
            },
        );
        state.secret_writes += 1;
        Ok(match plan {
            WritePlan::Create => WriteOutcome::Created,
            _ => WriteOutcome::Updated,
        })
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn get_authority_cert(&self, namespace: &str) -> Result<Option<AuthoritySecret>> {
        let mut state = self.state.lock();
        if state.failing_secret_reads > 0 {
            state.failing_secret_reads -= 1;
            return Err(Error::store(namespace, "secret read timed out"));
        }
        Ok(state
            .secrets
            .get(namespace)
            .filter(|s| !s.cert_pem.is_empty() && !s.key_pem.is_empty())
            .cloned())
    }

    async fn update_authority_cert(
        &self,
        cert_pem: &str,
        key_pem: &str,
        namespace: &str,
    ) -> Result<WriteOutcome> {
        let mut state = self.state.lock();
        Self::write_secret(&mut state, cert_pem, key_pem, namespace)
    }

    async fn update_authority_cert_if(
        &self,
        expected_cert_pem: Option<&str>,
        cert_pem: &str,
        key_pem: &str,
        namespace: &str,
    ) -> Result<WriteOutcome> {
        let mut state = self.state.lock();
        let current = state.secrets.get(namespace).map(|s| s.cert_pem.as_str());
        if current != expected_cert_pem {
            debug!(namespace, "Conditional secret write found different content");
            return Ok(WriteOutcome::Conflict);
        }
        Self::write_secret(&mut state, cert_pem, key_pem, namespace)
    }

    async fn update_authority_public_key(&self, cert_pem: &str) -> BroadcastReport {
        let mut state = self.state.lock();
        let mut report = BroadcastReport::default();

        if state.fail_listing {
            report.list_error = Some("namespace list unavailable".to_string());
            return report;
        }

        let namespaces: Vec<String> = state
            .namespaces
            .iter()
            .filter(|ns| ns.as_str() != RESERVED_NAMESPACE)
            .cloned()
            .collect();

        for namespace in namespaces {
            if state.failing_namespaces.contains(&namespace) {
                warn!(namespace = %namespace, "Injected trust record failure");
                report
                    .failed
                    .push((namespace, "trust record write rejected".to_string()));
                continue;
            }

            let outcome = match plan_write(
                state.trust_records.get(&namespace).map(String::as_str),
                cert_pem,
            ) {
                WritePlan::Skip => WriteOutcome::Unchanged,
                plan => {
                    state
                        .trust_records
                        .insert(namespace.clone(), cert_pem.to_string());
                    *state.trust_writes.entry(namespace.clone()).or_default() += 1;
                    if plan == WritePlan::Create {
                        WriteOutcome::Created
                    } else {
                        WriteOutcome::Updated
                    }
                }
            };
            report.record(&namespace, outcome);
        }

        report
    }

    async fn verify_service_account(&self, token: &str) -> bool {
        self.state.lock().allowed_tokens.contains(token)
    }
}
