//! CA server lifecycle
//!
//! ```text
//! Created --init--> Initialized --start--> Serving --stop--> Stopped
//! ```
//!
//! `init` settles on an authority (loading, generating, persisting and
//! broadcasting as needed) and starts the refresh loop. `start` binds the two
//! gRPC listeners:
//!
//! - plain: no transport security, callers authenticate with a token
//! - secure: rustls with per-SNI server certificates and optional client
//!   certificates checked against the trusted set
//!
//! Both serve the certificate service and gRPC reflection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, info, warn};

use meshca_common::kube_client::KubeClientProvider;
use meshca_common::trust_store::{KubeTrustStore, TrustStore};
use meshca_infra::{
    server_config, AuthorityCertState, AuthorityLeafIssuer, DynamicCertResolver, MtlsError,
    PkiError, RootCert,
};

use crate::config::Options;
use crate::rotation::AuthorityRotator;
use crate::service::CertificateServiceImpl;

/// Upper bound on a single TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Completed handshakes waiting for the gRPC server
const TLS_BACKLOG: usize = 128;

/// Lifecycle phase of a [`CaServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, nothing running
    Created,
    /// Authority installed and refresh loop running
    Initialized,
    /// Listeners bound
    Serving,
    /// Refresh loop and listeners shut down
    Stopped,
}

/// Fatal server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// The cluster client could not be created or reached
    #[error("failed to initialize cluster client: {0}")]
    ClusterClient(#[source] meshca_common::Error),

    /// The configured root certificate could not be loaded
    #[error("failed to load root certificate: {0}")]
    RootCert(#[source] PkiError),

    /// No authority could be generated at startup
    #[error("failed to bootstrap authority: {0}")]
    Bootstrap(#[source] PkiError),

    /// TLS configuration error
    #[error(transparent)]
    Tls(#[from] MtlsError),

    /// Reflection service could not be built
    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    /// A listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying IO error
        source: io::Error,
    },

    /// A serve loop failed
    #[error("{listener} listener failed: {source}")]
    Serve {
        /// Which listener failed
        listener: &'static str,
        /// Underlying transport error
        source: tonic::transport::Error,
    },

    /// A server task panicked or was aborted
    #[error("{listener} listener task failed: {source}")]
    Join {
        /// Which listener failed
        listener: &'static str,
        /// Underlying join error
        source: tokio::task::JoinError,
    },

    /// An operation was called in the wrong phase
    #[error("expected phase {expected:?}, server is {actual:?}")]
    Phase {
        /// Phase the operation requires
        expected: Phase,
        /// Current phase
        actual: Phase,
    },
}

/// Running listeners
pub struct ServingHandles {
    /// Bound address of the plain listener
    pub plain_addr: SocketAddr,
    /// Bound address of the secure listener
    pub secure_addr: SocketAddr,
    plain: JoinHandle<Result<(), tonic::transport::Error>>,
    secure: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl ServingHandles {
    /// Wait for both listeners to finish
    ///
    /// Returns as soon as either listener fails; a clean return means both
    /// shut down after `stop`.
    pub async fn wait(self) -> Result<(), ServerError> {
        let Self { plain, secure, .. } = self;
        let plain = async move { serve_result("plain", plain.await) };
        let secure = async move { serve_result("secure", secure.await) };
        tokio::try_join!(plain, secure).map(|_| ())
    }
}

fn serve_result(
    listener: &'static str,
    joined: Result<Result<(), tonic::transport::Error>, tokio::task::JoinError>,
) -> Result<(), ServerError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(ServerError::Serve { listener, source }),
        Err(source) => Err(ServerError::Join { listener, source }),
    }
}

struct Running {
    state: Arc<AuthorityCertState>,
    store: Arc<dyn TrustStore>,
    resolver: Arc<DynamicCertResolver>,
    refresh: Option<JoinHandle<()>>,
}

/// The CA process: authority lifecycle plus the two gRPC listeners
pub struct CaServer {
    options: Options,
    phase: Phase,
    stop: CancellationToken,
    running: Option<Running>,
}

impl CaServer {
    /// Create a server; nothing runs until [`init`](Self::init)
    pub fn new(options: Options) -> Self {
        Self {
            options,
            phase: Phase::Created,
            stop: CancellationToken::new(),
            running: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Token cancelled by [`stop`](Self::stop)
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Shared authority state, once initialized
    pub fn state(&self) -> Option<&Arc<AuthorityCertState>> {
        self.running.as_ref().map(|r| &r.state)
    }

    /// Server certificate resolver, once initialized
    pub fn resolver(&self) -> Option<&Arc<DynamicCertResolver>> {
        self.running.as_ref().map(|r| &r.resolver)
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), ServerError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(ServerError::Phase {
                expected,
                actual: self.phase,
            })
        }
    }

    /// Connect to the cluster and initialize against the Kubernetes store
    pub async fn init(&mut self, provider: &dyn KubeClientProvider) -> Result<(), ServerError> {
        self.expect_phase(Phase::Created)?;
        let store = KubeTrustStore::connect(provider)
            .await
            .map_err(ServerError::ClusterClient)?;
        self.init_with_store(Arc::new(store)).await
    }

    /// Initialize against an already connected store
    pub async fn init_with_store(&mut self, store: Arc<dyn TrustStore>) -> Result<(), ServerError> {
        self.expect_phase(Phase::Created)?;

        let root = match (&self.options.root_cert, &self.options.root_key) {
            (Some(cert), Some(key)) => {
                let root = RootCert::from_files(cert, key).map_err(ServerError::RootCert)?;
                info!(
                    path = %cert.display(),
                    not_after = root.info().not_after,
                    "Loaded root certificate"
                );
                Some(root)
            }
            _ => None,
        };

        let state = Arc::new(AuthorityCertState::new(root, self.options.trust_retention));
        let rotator = Arc::new(AuthorityRotator::new(
            store.clone(),
            state.clone(),
            self.options.namespace.clone(),
            self.options.ca_validity(),
        ));

        let loaded = rotator.load_persisted().await;
        let generation = rotator
            .bootstrap(loaded)
            .await
            .map_err(ServerError::Bootstrap)?;
        let refresh = rotator.spawn_refresh_loop(self.stop.clone());

        let resolver = Arc::new(
            DynamicCertResolver::new(
                state.clone(),
                Box::new(AuthorityLeafIssuer::new(self.options.cert_validity())),
                self.options.service_dns(),
            )
            .with_max_cached(self.options.max_cached_server_certs),
        );
        let hostnames = self.options.prewarm_hostnames();
        let warmed = resolver.prewarm(&hostnames);
        if warmed < hostnames.len() {
            warn!(warmed, requested = hostnames.len(), "Some server certs failed to pre-warm");
        }

        info!(
            generation,
            namespace = %self.options.namespace,
            warmed,
            "CA initialized"
        );
        self.running = Some(Running {
            state,
            store,
            resolver,
            refresh: Some(refresh),
        });
        self.phase = Phase::Initialized;
        Ok(())
    }

    /// Bind the configured ports and start serving
    pub async fn start(&mut self) -> Result<ServingHandles, ServerError> {
        self.expect_phase(Phase::Initialized)?;
        let plain = bind(self.options.plain_addr()).await?;
        let secure = bind(self.options.secure_addr()).await?;
        self.start_with_listeners(plain, secure)
    }

    /// Start serving on already bound listeners
    pub fn start_with_listeners(
        &mut self,
        plain: TcpListener,
        secure: TcpListener,
    ) -> Result<ServingHandles, ServerError> {
        self.expect_phase(Phase::Initialized)?;
        let Some(running) = self.running.as_ref() else {
            return Err(ServerError::Phase {
                expected: Phase::Initialized,
                actual: self.phase,
            });
        };

        let plain_addr = local_addr(&plain)?;
        let secure_addr = local_addr(&secure)?;

        let service = CertificateServiceImpl::new(
            running.state.clone(),
            running.store.clone(),
            self.options.cert_validity(),
            !self.options.skip_token_verification,
        );

        let tls = server_config(
            running.state.clone(),
            running.resolver.clone(),
            self.options.client_cert_auth,
        )?;
        let plain_router = Server::builder()
            .add_service(service.clone().into_service())
            .add_service(reflection_builder().build_v1()?);
        let secure_router = Server::builder()
            .add_service(service.into_service())
            .add_service(reflection_builder().build_v1()?);

        let stop = self.stop.clone();
        let plain_task = tokio::spawn(async move {
            plain_router
                .serve_with_incoming_shutdown(TcpListenerStream::new(plain), stop.cancelled_owned())
                .await
        });
        info!(addr = %plain_addr, "Plain gRPC listener started");

        let (tx, rx) = mpsc::channel(TLS_BACKLOG);
        tokio::spawn(accept_tls(
            secure,
            TlsAcceptor::from(Arc::new(tls)),
            tx,
            self.stop.clone(),
        ));
        let stop = self.stop.clone();
        let secure_task = tokio::spawn(async move {
            secure_router
                .serve_with_incoming_shutdown(ReceiverStream::new(rx), stop.cancelled_owned())
                .await
        });
        info!(
            addr = %secure_addr,
            client_cert_auth = self.options.client_cert_auth,
            "Secure gRPC listener started"
        );

        self.phase = Phase::Serving;
        Ok(ServingHandles {
            plain_addr,
            secure_addr,
            plain: plain_task,
            secure: secure_task,
        })
    }

    /// Cancel the refresh loop and the listeners
    ///
    /// Waits for the refresh loop; listeners drain through
    /// [`ServingHandles::wait`]. Calling it twice is a no-op.
    pub async fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        info!("Stopping CA server");
        self.stop.cancel();

        if let Some(refresh) = self.running.as_mut().and_then(|r| r.refresh.take()) {
            if let Err(e) = refresh.await {
                warn!(error = %e, "Refresh loop ended abnormally");
            }
        }
        self.phase = Phase::Stopped;
    }
}

impl std::fmt::Debug for CaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaServer")
            .field("phase", &self.phase)
            .field("namespace", &self.options.namespace)
            .finish_non_exhaustive()
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr, ServerError> {
    listener.local_addr().map_err(|source| ServerError::Bind {
        addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        source,
    })
}

fn reflection_builder() -> tonic_reflection::server::Builder<'static> {
    tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(meshca_proto::FILE_DESCRIPTOR_SET)
}

/// Accept TCP connections and hand completed TLS sessions to tonic
///
/// Each handshake runs in its own task so a slow client cannot stall the
/// accept loop. Failed handshakes are logged and dropped.
async fn accept_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<io::Result<TlsStream<TcpStream>>>,
    stop: CancellationToken,
) {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => {
                    // receiver is gone once the server has shut down
                    let _ = tx.send(Ok(stream)).await;
                }
                Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed"),
                Err(_) => debug!(%peer, "TLS handshake timed out"),
            }
        });
    }
    debug!("TLS accept loop stopped");
}
