//! Authority bootstrap and scheduled refresh
//!
//! At startup the persisted authority is reused when it is still valid;
//! otherwise a new one is generated and written over the record that was
//! read, never over one that changed since. Either way its certificate is
//! broadcast to every workload namespace before it is installed.
//!
//! A background task then checks the active authority on a fixed interval and
//! replaces it once it is due. Store failures never stop the CA: they are
//! logged and the next tick writes the current authority again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use meshca_common::trust_store::{TrustStore, WriteOutcome};
use meshca_infra::{AuthorityCert, AuthorityCertState, PkiError};

/// Longest wait between refresh checks
pub const MAX_REFRESH_INTERVAL: Duration = Duration::from_millis(10_000);

/// Wait between refresh checks: 1% of the authority lifetime, capped at 10s
pub fn refresh_interval(ca_validity: Duration) -> Duration {
    let millis = (ca_validity.as_millis() / 100).clamp(1, MAX_REFRESH_INTERVAL.as_millis());
    Duration::from_millis(millis as u64)
}

/// Read attempts before the authority secret is reported unreadable
const LOAD_ATTEMPTS: u32 = 3;

/// Wait between authority secret read attempts
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Authority secret as found in the store at startup
#[derive(Debug)]
pub enum PersistedAuthority {
    /// No secret record, or one missing its cert or key
    Absent,
    /// A parseable authority, possibly expired
    Found(AuthorityCert),
    /// A record whose contents do not parse
    Unusable {
        /// Certificate text as stored
        cert_pem: String,
    },
    /// The store could not be read
    Unreadable,
}

impl PersistedAuthority {
    /// Certificate the store was seen to hold
    fn stored_cert_pem(&self) -> Option<&str> {
        match self {
            PersistedAuthority::Found(cert) => Some(cert.cert_pem()),
            PersistedAuthority::Unusable { cert_pem } => Some(cert_pem),
            PersistedAuthority::Absent | PersistedAuthority::Unreadable => None,
        }
    }
}

/// Result of one refresh check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new authority was generated and installed
    Rotated {
        /// Generation of the new authority
        generation: u64,
    },
    /// The active authority was written to the store again after an
    /// earlier failure
    Resynced,
    /// Nothing to do
    Unchanged,
}

/// Drives the authority lifecycle against a [`TrustStore`]
pub struct AuthorityRotator {
    store: Arc<dyn TrustStore>,
    state: Arc<AuthorityCertState>,
    namespace: String,
    ca_validity: Duration,
    resync: AtomicBool,
}

impl AuthorityRotator {
    /// Create a rotator for the authority secret in `namespace`
    pub fn new(
        store: Arc<dyn TrustStore>,
        state: Arc<AuthorityCertState>,
        namespace: impl Into<String>,
        ca_validity: Duration,
    ) -> Self {
        Self {
            store,
            state,
            namespace: namespace.into(),
            ca_validity,
            resync: AtomicBool::new(false),
        }
    }

    /// Shared authority state
    pub fn state(&self) -> &Arc<AuthorityCertState> {
        &self.state
    }

    /// Whether the last persist or broadcast failed
    pub fn needs_resync(&self) -> bool {
        self.resync.load(Ordering::Acquire)
    }

    /// Read the persisted authority
    ///
    /// Retryable read errors are retried a few times before the store is
    /// reported unreadable.
    pub async fn load_persisted(&self) -> PersistedAuthority {
        let mut attempt = 1;
        let secret = loop {
            match self.store.get_authority_cert(&self.namespace).await {
                Ok(Some(secret)) => break secret,
                Ok(None) => return PersistedAuthority::Absent,
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!(
                        namespace = %self.namespace,
                        error = %e,
                        retryable,
                        attempt,
                        "Failed to read authority secret"
                    );
                    if !retryable || attempt >= LOAD_ATTEMPTS {
                        return PersistedAuthority::Unreadable;
                    }
                    attempt += 1;
                    tokio::time::sleep(LOAD_RETRY_DELAY).await;
                }
            }
        };

        match AuthorityCert::from_pem(&secret.cert_pem, &secret.key_pem) {
            Ok(cert) => PersistedAuthority::Found(cert),
            Err(e) => {
                warn!(
                    namespace = %self.namespace,
                    error = %e,
                    "Persisted authority is unusable, ignoring it"
                );
                PersistedAuthority::Unusable {
                    cert_pem: secret.cert_pem.clone(),
                }
            }
        }
    }

    /// Settle on an authority at startup and install it
    ///
    /// Returns the installed generation. Only certificate generation can
    /// fail; store errors are logged and retried by the refresh loop.
    pub async fn bootstrap(&self, loaded: PersistedAuthority) -> Result<u64, PkiError> {
        let (cert, persisted) = match loaded {
            PersistedAuthority::Found(cert) if cert.is_valid() => {
                info!(
                    namespace = %self.namespace,
                    not_after = cert.info().not_after,
                    "Load authority cert from store success"
                );
                (cert, true)
            }
            stale => {
                warn!(
                    namespace = %self.namespace,
                    "Load authority cert from store failed, generating a new one"
                );
                let cert = AuthorityCert::generate(self.state.root(), self.ca_validity)?;
                self.persist_replacement(cert, stale.stored_cert_pem())
                    .await
            }
        };

        info!("Writing ca to config maps");
        let broadcast = self.broadcast(&cert).await;
        self.resync.store(!(persisted && broadcast), Ordering::Release);

        Ok(self.state.install(cert))
    }

    /// Write a generated authority over exactly the record it replaces
    ///
    /// If the record changed since it was read and now holds a valid
    /// authority, that authority is adopted and `cert` is discarded.
    async fn persist_replacement(
        &self,
        cert: AuthorityCert,
        expected: Option<&str>,
    ) -> (AuthorityCert, bool) {
        match self
            .store
            .update_authority_cert_if(expected, cert.cert_pem(), cert.key_pem(), &self.namespace)
            .await
        {
            Ok(WriteOutcome::Conflict) => {
                warn!(
                    namespace = %self.namespace,
                    "Authority secret differs from what was read, reloading it"
                );
                match self.load_persisted().await {
                    PersistedAuthority::Found(stored) if stored.is_valid() => {
                        info!(
                            namespace = %self.namespace,
                            not_after = stored.info().not_after,
                            "Adopted persisted authority cert"
                        );
                        (stored, true)
                    }
                    _ => (cert, false),
                }
            }
            Ok(outcome) => {
                debug!(
                    namespace = %self.namespace,
                    ?outcome,
                    wrote = outcome.wrote(),
                    "Persisted authority secret"
                );
                (cert, true)
            }
            Err(e) => {
                error!(
                    namespace = %self.namespace,
                    error = %e,
                    "Failed to persist authority secret"
                );
                (cert, false)
            }
        }
    }

    /// One refresh check
    pub async fn refresh_if_needed(&self) -> Result<RefreshOutcome, PkiError> {
        let active = self.state.active();
        let due = active.as_ref().map_or(true, |cert| cert.needs_refresh());

        if due {
            info!("Authority cert is invalid, refresh it");
            let cert = AuthorityCert::generate(self.state.root(), self.ca_validity)?;
            let generation = self.state.install(cert.clone());
            let persisted = self.persist(&cert).await;
            let broadcast = self.broadcast(&cert).await;
            self.resync.store(!(persisted && broadcast), Ordering::Release);
            return Ok(RefreshOutcome::Rotated { generation });
        }

        if let Some(active) = active.filter(|_| self.needs_resync()) {
            info!("Retrying authority publication after an earlier failure");
            let persisted = self.persist(&active).await;
            let broadcast = self.broadcast(&active).await;
            self.resync.store(!(persisted && broadcast), Ordering::Release);
            return Ok(RefreshOutcome::Resynced);
        }

        Ok(RefreshOutcome::Unchanged)
    }

    async fn persist(&self, cert: &AuthorityCert) -> bool {
        match self
            .store
            .update_authority_cert(cert.cert_pem(), cert.key_pem(), &self.namespace)
            .await
        {
            Ok(outcome) => {
                debug!(
                    namespace = %self.namespace,
                    ?outcome,
                    wrote = outcome.wrote(),
                    "Persisted authority secret"
                );
                true
            }
            Err(e) => {
                error!(
                    namespace = %self.namespace,
                    error = %e,
                    "Failed to persist authority secret"
                );
                false
            }
        }
    }

    async fn broadcast(&self, cert: &AuthorityCert) -> bool {
        let report = self
            .store
            .update_authority_public_key(cert.cert_pem())
            .await;
        if report.is_success() {
            info!(
                created = report.created.len(),
                updated = report.updated.len(),
                unchanged = report.unchanged.len(),
                "Write ca to config maps success"
            );
            true
        } else {
            warn!(
                failed = report.failed.len(),
                list_error = ?report.list_error,
                written = report.writes(),
                "Write ca to config maps failed"
            );
            false
        }
    }

    /// Spawn the scheduled refresh loop
    ///
    /// The loop sleeps, checks, and repeats until `stop` is cancelled. A
    /// check that has started always completes.
    pub fn spawn_refresh_loop(self: Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let interval = refresh_interval(self.ca_validity);
        tokio::spawn(async move {
            info!(
                interval_ms = interval.as_millis() as u64,
                "Starting authority refresh loop"
            );
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match self.refresh_if_needed().await {
                    Ok(RefreshOutcome::Unchanged) => {}
                    Ok(outcome) => debug!(?outcome, "Refresh check finished"),
                    Err(e) => error!(error = %e, "Failed to generate authority cert"),
                }

                if stop.is_cancelled() {
                    break;
                }
            }
            info!("Authority refresh loop stopped");
        })
    }
}
