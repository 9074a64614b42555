//! Kubernetes client provider for dependency injection
//!
//! Provides trait-based access to kube::Client creation so the server can be
//! initialized against a fake store in tests.

use std::path::PathBuf;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::{Error, Result};

/// Default connection timeout for kube clients
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const CONTEXT: &str = "kube-client";

/// Trait for creating Kubernetes clients
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait KubeClientProvider: Send + Sync {
    /// Create a new Kubernetes client
    async fn create(&self) -> Result<kube::Client>;
}

/// Provider that creates clients from in-cluster config, falling back to the
/// local kubeconfig (`KUBECONFIG` or `~/.kube/config`)
#[derive(Clone, Default)]
pub struct InferredClientProvider;

#[async_trait::async_trait]
impl KubeClientProvider for InferredClientProvider {
    async fn create(&self) -> Result<kube::Client> {
        let mut config = kube::Config::infer()
            .await
            .map_err(|e| Error::internal_with_context(CONTEXT, e.to_string()))?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
        Ok(kube::Client::try_from(config)?)
    }
}

/// Provider that reads an explicit kubeconfig file
#[derive(Clone, Debug)]
pub struct KubeconfigClientProvider {
    path: PathBuf,
}

impl KubeconfigClientProvider {
    /// Create a provider for the kubeconfig at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl KubeClientProvider for KubeconfigClientProvider {
    async fn create(&self) -> Result<kube::Client> {
        let kubeconfig = Kubeconfig::read_from(&self.path).map_err(|e| {
            Error::internal_with_context(
                CONTEXT,
                format!("failed to read {}: {}", self.path.display(), e),
            )
        })?;
        let mut config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::internal_with_context(CONTEXT, e.to_string()))?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
        Ok(kube::Client::try_from(config)?)
    }
}

/// Pick the provider for an optional explicit kubeconfig path
pub fn provider_for(kubeconfig: Option<PathBuf>) -> Box<dyn KubeClientProvider> {
    match kubeconfig {
        Some(path) => Box::new(KubeconfigClientProvider::new(path)),
        None => Box::new(InferredClientProvider),
    }
}
