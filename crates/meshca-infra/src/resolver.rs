//! SNI-driven server certificate resolution
//!
//! The secure listener presents a leaf for whatever hostname the client asks
//! for. Leaves are cached per hostname and tagged with the authority
//! generation that issued them; a rotation or an expired leaf causes a
//! re-issue on the next handshake for that name.
//!
//! Clients choose the cache keys, so the cache is bounded. Leaves from an
//! older generation or past `not_after` are dropped after each rotation and
//! whenever the cache is full. Names that still do not fit are served a
//! fresh leaf without caching it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};

use crate::authority::AuthorityCertState;
use crate::pki::{self, now_unix, AuthorityCert, ServerCert};

/// Default bound on cached hostnames
pub const DEFAULT_MAX_CACHED_LEAVES: usize = 1024;

/// Issues server leaves for a hostname under a given authority
#[cfg_attr(test, mockall::automock)]
pub trait LeafIssuer: Send + Sync {
    /// Issue a leaf for `hostname` signed by `authority`
    fn issue(&self, authority: &AuthorityCert, hostname: &str) -> pki::Result<ServerCert>;
}

/// Issues leaves directly from the authority with a fixed validity
#[derive(Debug, Clone)]
pub struct AuthorityLeafIssuer {
    validity: Duration,
}

impl AuthorityLeafIssuer {
    /// Issue leaves valid for `validity`
    pub fn new(validity: Duration) -> Self {
        Self { validity }
    }
}

impl LeafIssuer for AuthorityLeafIssuer {
    fn issue(&self, authority: &AuthorityCert, hostname: &str) -> pki::Result<ServerCert> {
        authority.issue_server_cert(hostname, self.validity)
    }
}

struct CachedLeaf {
    generation: u64,
    certified_key: Arc<CertifiedKey>,
    not_after: i64,
}

/// Resolver counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    /// Handshakes served from the cache
    pub hits: u64,
    /// Handshakes that needed a new leaf
    pub misses: u64,
    /// Leaves issued successfully
    pub issued: u64,
    /// Issuance failures (handshake aborted)
    pub failures: u64,
}

/// Per-handshake server certificate resolver
pub struct DynamicCertResolver {
    state: Arc<AuthorityCertState>,
    issuer: Box<dyn LeafIssuer>,
    default_name: String,
    cache: DashMap<String, CachedLeaf>,
    max_cached: usize,
    pruned_generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    issued: AtomicU64,
    failures: AtomicU64,
}

impl DynamicCertResolver {
    /// Create a resolver; `default_name` is used when the client sends no SNI
    pub fn new(
        state: Arc<AuthorityCertState>,
        issuer: Box<dyn LeafIssuer>,
        default_name: impl Into<String>,
    ) -> Self {
        Self {
            state,
            issuer,
            default_name: default_name.into(),
            cache: DashMap::new(),
            max_cached: DEFAULT_MAX_CACHED_LEAVES,
            pruned_generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            issued: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Bound the number of cached hostnames
    pub fn with_max_cached(mut self, max_cached: usize) -> Self {
        self.max_cached = max_cached;
        self
    }

    /// Return the leaf for `hostname`, issuing one if the cached leaf is
    /// missing, expired, or from an older authority generation
    pub fn resolve_name(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        let hostname = hostname.to_ascii_lowercase();
        let snapshot = self.state.snapshot();
        let Some(authority) = snapshot.active() else {
            warn!(hostname = %hostname, "No active authority, refusing handshake");
            self.failures.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let now = now_unix();
        let cached = self
            .cache
            .get(&hostname)
            .filter(|leaf| leaf.generation == snapshot.generation() && now < leaf.not_after)
            .map(|leaf| leaf.certified_key.clone());
        if let Some(certified_key) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(certified_key);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.issuer.issue(authority, &hostname) {
            Ok(leaf) => {
                self.issued.fetch_add(1, Ordering::Relaxed);
                debug!(
                    hostname = %hostname,
                    generation = snapshot.generation(),
                    not_after = leaf.not_after,
                    "Issued server cert"
                );
                self.store(
                    hostname,
                    CachedLeaf {
                        generation: snapshot.generation(),
                        certified_key: leaf.certified_key.clone(),
                        not_after: leaf.not_after,
                    },
                    now,
                );
                Some(leaf.certified_key)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(hostname = %hostname, error = %e, "Failed to issue server cert");
                None
            }
        }
    }

    fn store(&self, hostname: String, leaf: CachedLeaf, now: i64) {
        let generation = leaf.generation;
        if self.pruned_generation.swap(generation, Ordering::AcqRel) != generation {
            self.prune(generation, now);
        }

        if !self.cache.contains_key(&hostname) && self.cache.len() >= self.max_cached {
            self.prune(generation, now);
            if self.cache.len() >= self.max_cached {
                debug!(hostname = %hostname, "Server cert cache full, not caching");
                return;
            }
        }
        self.cache.insert(hostname, leaf);
    }

    fn prune(&self, generation: u64, now: i64) {
        let before = self.cache.len();
        self.cache
            .retain(|_, leaf| leaf.generation == generation && now < leaf.not_after);
        let pruned = before.saturating_sub(self.cache.len());
        if pruned > 0 {
            debug!(pruned, generation, "Pruned stale server certs");
        }
    }

    /// Resolve `hostnames` eagerly; returns how many succeeded
    pub fn prewarm<S: AsRef<str>>(&self, hostnames: &[S]) -> usize {
        hostnames
            .iter()
            .filter(|name| self.resolve_name(name.as_ref()).is_some())
            .count()
    }

    /// Number of cached hostnames
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            issued: self.issued.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("default_name", &self.default_name)
            .field("cached", &self.cache.len())
            .field("max_cached", &self.max_cached)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hostname = client_hello
            .server_name()
            .unwrap_or(self.default_name.as_str());
        self.resolve_name(hostname)
    }
}
