//! Kubernetes-backed trust store
//!
//! The authority secret is an Opaque Secret in the CA's own namespace; the
//! public trust record is a ConfigMap replicated into every other namespace.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{
    plan_secret_write, plan_write, AuthoritySecret, BroadcastReport, TrustStore, WriteOutcome,
    WritePlan,
};
use crate::error::is_conflict;
use crate::kube_client::KubeClientProvider;
use crate::{
    Error, Result, CA_CERT_KEY, CA_KEY_KEY, CA_SECRET, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    RESERVED_NAMESPACE, TRUST_CERT_KEY, TRUST_CONFIG_MAP,
};

/// Trust store backed by Secrets and ConfigMaps
#[derive(Clone)]
pub struct KubeTrustStore {
    client: Client,
}

impl KubeTrustStore {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create the client through `provider` and verify the API server answers
    ///
    /// Nothing in the CA works without the cluster, so callers treat an error
    /// here as fatal.
    pub async fn connect(provider: &dyn KubeClientProvider) -> Result<Self> {
        let client = provider.create().await?;
        let version = client.apiserver_version().await?;
        info!(
            version = %version.git_version,
            "Connected to Kubernetes API server"
        );
        Ok(Self::new(client))
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn write_secret(
        &self,
        existing: Option<Secret>,
        cert_pem: &str,
        key_pem: &str,
        namespace: &str,
    ) -> Result<WriteOutcome> {
        let secrets = self.secrets(namespace);

        let Some(mut secret) = existing else {
            secrets
                .create(
                    &PostParams::default(),
                    &authority_secret(namespace, cert_pem, key_pem),
                )
                .await?;
            info!(namespace, "Created authority secret");
            return Ok(WriteOutcome::Created);
        };

        let current_cert = secret_field(&secret, CA_CERT_KEY).unwrap_or_default();
        let current_key = Zeroizing::new(secret_field(&secret, CA_KEY_KEY).unwrap_or_default());
        if plan_secret_write(
            Some((current_cert.as_str(), current_key.as_str())),
            cert_pem,
            key_pem,
        ) == WritePlan::Skip
        {
            info!(namespace, "Authority secret is already the newest version");
            return Ok(WriteOutcome::Unchanged);
        }

        let data = secret.data.get_or_insert_with(BTreeMap::new);
        data.insert(
            CA_CERT_KEY.to_string(),
            ByteString(cert_pem.as_bytes().to_vec()),
        );
        data.insert(
            CA_KEY_KEY.to_string(),
            ByteString(key_pem.as_bytes().to_vec()),
        );

        // replace carries the resourceVersion we read, so a concurrent writer
        // surfaces as a 409 instead of being silently overwritten
        secrets
            .replace(CA_SECRET, &PostParams::default(), &secret)
            .await?;
        info!(namespace, "Updated authority secret");
        Ok(WriteOutcome::Updated)
    }

    async fn publish_trust_record(&self, namespace: &str, cert_pem: &str) -> Result<WriteOutcome> {
        let config_maps = self.config_maps(namespace);

        let Some(mut config_map) = config_maps.get_opt(TRUST_CONFIG_MAP).await? else {
            config_maps
                .create(&PostParams::default(), &trust_config_map(namespace, cert_pem))
                .await?;
            info!(namespace, "Created trust record");
            return Ok(WriteOutcome::Created);
        };

        let current = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(TRUST_CERT_KEY))
            .map(String::as_str);
        if plan_write(current, cert_pem) == WritePlan::Skip {
            debug!(namespace, "Trust record already up to date");
            return Ok(WriteOutcome::Unchanged);
        }

        config_map
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(TRUST_CERT_KEY.to_string(), cert_pem.to_string());
        config_maps
            .replace(TRUST_CONFIG_MAP, &PostParams::default(), &config_map)
            .await?;
        info!(namespace, "Updated trust record");
        Ok(WriteOutcome::Updated)
    }
}

#[async_trait]
impl TrustStore for KubeTrustStore {
    async fn get_authority_cert(&self, namespace: &str) -> Result<Option<AuthoritySecret>> {
        let Some(secret) = self.secrets(namespace).get_opt(CA_SECRET).await? else {
            debug!(namespace, "Authority secret not found");
            return Ok(None);
        };

        match (
            secret_field(&secret, CA_CERT_KEY),
            secret_field(&secret, CA_KEY_KEY),
        ) {
            (Some(cert_pem), Some(key_pem)) if !cert_pem.is_empty() && !key_pem.is_empty() => {
                Ok(Some(AuthoritySecret {
                    cert_pem,
                    key_pem: Zeroizing::new(key_pem),
                }))
            }
            _ => {
                warn!(namespace, "Authority secret is missing cert or key, ignoring it");
                Ok(None)
            }
        }
    }

    async fn update_authority_cert(
        &self,
        cert_pem: &str,
        key_pem: &str,
        namespace: &str,
    ) -> Result<WriteOutcome> {
        let existing = self.secrets(namespace).get_opt(CA_SECRET).await?;
        self.write_secret(existing, cert_pem, key_pem, namespace)
            .await
    }

    async fn update_authority_cert_if(
        &self,
        expected_cert_pem: Option<&str>,
        cert_pem: &str,
        key_pem: &str,
        namespace: &str,
    ) -> Result<WriteOutcome> {
        let existing = self.secrets(namespace).get_opt(CA_SECRET).await?;
        let current = existing
            .as_ref()
            .and_then(|secret| secret_field(secret, CA_CERT_KEY));
        if current.as_deref() != expected_cert_pem {
            warn!(namespace, "Authority secret changed underneath us, skipping write");
            return Ok(WriteOutcome::Conflict);
        }

        match self
            .write_secret(existing, cert_pem, key_pem, namespace)
            .await
        {
            Err(Error::Kube { ref source }) if is_conflict(source) => {
                warn!(namespace, "Authority secret write lost a race");
                Ok(WriteOutcome::Conflict)
            }
            other => other,
        }
    }

    async fn update_authority_public_key(&self, cert_pem: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = match namespaces.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Failed to list namespaces");
                report.list_error = Some(e.to_string());
                return report;
            }
        };

        for namespace in list.items {
            let Some(name) = namespace.metadata.name else {
                continue;
            };
            if name == RESERVED_NAMESPACE {
                continue;
            }

            match self.publish_trust_record(&name, cert_pem).await {
                Ok(outcome) => report.record(&name, outcome),
                Err(e) => {
                    warn!(namespace = %name, error = %e, "Failed to write trust record");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        report
    }

    async fn verify_service_account(&self, token: &str) -> bool {
        let reviews: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            metadata: ObjectMeta::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: None,
            },
            status: None,
        };

        let result = match reviews.create(&PostParams::default(), &review).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Failed to submit token review");
                return false;
            }
        };

        let status = result.status.unwrap_or_default();
        if let Some(error) = status.error.filter(|e| !e.is_empty()) {
            warn!(%error, "Token review rejected the token");
            return false;
        }
        if status.authenticated != Some(true) {
            warn!("Token review did not authenticate the token");
            return false;
        }

        debug!(
            user = ?status.user.and_then(|u| u.username),
            "Token review succeeded"
        );
        true
    }
}

fn secret_field(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .and_then(|value| String::from_utf8(value.0.clone()).ok())
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}

/// Build the authority Secret object
fn authority_secret(namespace: &str, cert_pem: &str, key_pem: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(CA_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([
            (
                CA_CERT_KEY.to_string(),
                ByteString(cert_pem.as_bytes().to_vec()),
            ),
            (
                CA_KEY_KEY.to_string(),
                ByteString(key_pem.as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    }
}

/// Build the public trust ConfigMap object
fn trust_config_map(namespace: &str, cert_pem: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(TRUST_CONFIG_MAP.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            TRUST_CERT_KEY.to_string(),
            cert_pem.to_string(),
        )])),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_secret_holds_cert_and_key() {
        let secret = authority_secret("mesh", "CERT", "KEY");
        assert_eq!(secret.metadata.name.as_deref(), Some(CA_SECRET));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("mesh"));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(secret_field(&secret, CA_CERT_KEY).as_deref(), Some("CERT"));
        assert_eq!(secret_field(&secret, CA_KEY_KEY).as_deref(), Some("KEY"));
    }

    #[test]
    fn trust_config_map_holds_only_the_certificate() {
        let config_map = trust_config_map("workloads", "CERT");
        let data = config_map.data.expect("data should be set");
        assert_eq!(data.len(), 1);
        assert_eq!(data.get(TRUST_CERT_KEY).map(String::as_str), Some("CERT"));
        assert_eq!(
            config_map
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(MANAGED_BY_LABEL))
                .map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
    }

    #[test]
    fn secret_field_rejects_non_utf8() {
        let mut secret = authority_secret("mesh", "CERT", "KEY");
        secret
            .data
            .as_mut()
            .expect("data should be set")
            .insert(CA_CERT_KEY.to_string(), ByteString(vec![0xff, 0xfe]));
        assert!(secret_field(&secret, CA_CERT_KEY).is_none());
        assert!(secret_field(&secret, "missing").is_none());
    }
}
