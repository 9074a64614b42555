//! In-memory authority state
//!
//! The active authority, the trusted set and a generation counter live in one
//! immutable [`AuthoritySnapshot`]. Installing a new authority publishes a new
//! snapshot with a single pointer swap, so handshakes and RPCs never observe a
//! trusted set that lacks the active authority.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::pki::{now_unix, AuthorityCert, RootCert};

/// What happens to historical authorities when a new one is installed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrustRetention {
    /// Keep every authority ever installed
    #[default]
    KeepAll,
    /// Drop historical authorities once they have expired
    DropExpired,
}

impl FromStr for TrustRetention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-all" => Ok(Self::KeepAll),
            "drop-expired" => Ok(Self::DropExpired),
            other => Err(format!(
                "unknown trust retention '{}', expected keep-all or drop-expired",
                other
            )),
        }
    }
}

impl fmt::Display for TrustRetention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::KeepAll => "keep-all",
            Self::DropExpired => "drop-expired",
        })
    }
}

/// One consistent view of the authority state
#[derive(Debug, Clone, Default)]
pub struct AuthoritySnapshot {
    generation: u64,
    active: Option<Arc<AuthorityCert>>,
    trusted: Vec<Arc<AuthorityCert>>,
}

impl AuthoritySnapshot {
    /// Counter bumped on every install; zero before the first one
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Authority that signs new certificates
    pub fn active(&self) -> Option<&Arc<AuthorityCert>> {
        self.active.as_ref()
    }

    /// Every authority still trusted, oldest first, active included
    pub fn trusted(&self) -> &[Arc<AuthorityCert>] {
        &self.trusted
    }

    /// PEMs of every trusted authority, oldest first
    pub fn trusted_pems(&self) -> Vec<String> {
        self.trusted
            .iter()
            .map(|cert| cert.cert_pem().to_string())
            .collect()
    }

    fn with_installed(&self, cert: Arc<AuthorityCert>, retention: TrustRetention) -> Self {
        let mut trusted = self.trusted.clone();
        if !trusted.iter().any(|t| t.cert_pem() == cert.cert_pem()) {
            trusted.push(cert.clone());
        }

        if retention == TrustRetention::DropExpired {
            let now = now_unix();
            trusted.retain(|t| t.cert_pem() == cert.cert_pem() || now <= t.info().not_after);
        }

        Self {
            generation: self.generation + 1,
            active: Some(cert),
            trusted,
        }
    }
}

/// Shared authority state for the rotator, the resolver and the RPC service
pub struct AuthorityCertState {
    root: Option<RootCert>,
    retention: TrustRetention,
    snapshot: ArcSwap<AuthoritySnapshot>,
}

impl AuthorityCertState {
    /// Create an empty state; nothing is trusted until the first install
    pub fn new(root: Option<RootCert>, retention: TrustRetention) -> Self {
        Self {
            root,
            retention,
            snapshot: ArcSwap::from_pointee(AuthoritySnapshot::default()),
        }
    }

    /// Root that signs new authorities, if one was configured
    pub fn root(&self) -> Option<&RootCert> {
        self.root.as_ref()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<AuthoritySnapshot> {
        self.snapshot.load_full()
    }

    /// Current active authority
    pub fn active(&self) -> Option<Arc<AuthorityCert>> {
        self.snapshot.load().active.clone()
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.snapshot.load().generation
    }

    /// Append `cert` to the trusted set and make it active in one step
    ///
    /// Returns the new generation.
    pub fn install(&self, cert: AuthorityCert) -> u64 {
        let cert = Arc::new(cert);
        let previous = self
            .snapshot
            .rcu(|current| current.with_installed(cert.clone(), self.retention));
        let generation = previous.generation + 1;

        info!(
            generation,
            not_after = cert.info().not_after,
            trusted = self.snapshot.load().trusted.len(),
            "Installed authority cert"
        );
        generation
    }
}

impl fmt::Debug for AuthorityCertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("AuthorityCertState")
            .field("root", &self.root.is_some())
            .field("retention", &self.retention)
            .field("generation", &snapshot.generation)
            .field("trusted", &snapshot.trusted.len())
            .finish()
    }
}
