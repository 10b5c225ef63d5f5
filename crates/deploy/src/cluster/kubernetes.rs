//! Live cluster access: kubectl for apply/diff, the Kubernetes API for health.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{Api, DynamicObject};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiCapabilities, ApiResource, Scope};
use kube::{Client, Config};
use serde_json::Value;
use tracing::{debug, info};

use super::health::{self, UnitHealth};
use super::kubectl::Kubectl;
use super::{ApplyOutcome, ClusterApi, ClusterError, DiffOutcome};
use crate::store::{Manifest, ResourceRef};

/// Split `apiVersion` into group and version (`v1` has an empty group).
#[must_use]
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

fn encode<T: serde::Serialize>(resource: &ResourceRef, object: &T) -> Result<Value, ClusterError> {
    serde_json::to_value(object)
        .map_err(|e| ClusterError::Config(format!("failed to encode {resource}: {e}")))
}

/// [`ClusterApi`] backed by a real cluster.
pub struct KubeCluster {
    kubectl: Kubectl,
    client: Client,
    resources: Mutex<HashMap<String, (ApiResource, ApiCapabilities)>>,
}

impl KubeCluster {
    /// Connect using an explicit kubeconfig, or the inferred default config.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be read or the client cannot
    /// be created.
    pub async fn connect(
        kubectl: Kubectl,
        kubeconfig: Option<&Path>,
        context: Option<&str>,
    ) -> Result<Self, ClusterError> {
        let options = KubeConfigOptions {
            context: context.map(ToString::to_string),
            ..KubeConfigOptions::default()
        };

        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Config(format!(
                        "failed to read kubeconfig from {}: {e}",
                        path.display()
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ClusterError::Config(e.to_string()))?
            }
            None if context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        };

        info!(cluster = %config.cluster_url, "Connecting to cluster");
        let client = Client::try_from(config)?;
        Ok(Self::with_client(kubectl, client))
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn with_client(kubectl: Kubectl, client: Client) -> Self {
        Self {
            kubectl,
            client,
            resources: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying API client.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Resolve and cache the API resource for an `apiVersion`/`kind` pair.
    async fn resolve(
        &self,
        resource: &ResourceRef,
    ) -> Result<(ApiResource, ApiCapabilities), ClusterError> {
        let key = format!("{}/{}", resource.api_version, resource.kind);
        if let Some(found) = self
            .resources
            .lock()
            .ok()
            .and_then(|cache| cache.get(&key).cloned())
        {
            return Ok(found);
        }

        let (group, version) = split_api_version(&resource.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &resource.kind);
        let resolved = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| {
                debug!(error = %e, %key, "Discovery failed");
                ClusterError::UnknownResource {
                    api_version: resource.api_version.clone(),
                    kind: resource.kind.clone(),
                }
            })?;

        if let Ok(mut cache) = self.resources.lock() {
            cache.insert(key, resolved.clone());
        }
        Ok(resolved)
    }

    /// Health of one declared object.
    async fn resource_health(
        &self,
        resource: &ResourceRef,
        default_namespace: &str,
    ) -> Result<UnitHealth, ClusterError> {
        let (api_resource, capabilities) = self.resolve(resource).await?;
        let namespace = resource.namespace.as_deref().unwrap_or(default_namespace);
        let api: Api<DynamicObject> = match capabilities.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), namespace, &api_resource),
            Scope::Cluster => Api::all_with(self.client.clone(), &api_resource),
        };

        let Some(object) = api.get_opt(&resource.name).await? else {
            return Ok(UnitHealth::Progressing("not found".to_string()));
        };
        let value = encode(resource, &object)?;

        if resource.api_version == "v1" && resource.kind == "Service" {
            let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
            let endpoints = match endpoints.get_opt(&resource.name).await? {
                Some(endpoints) => Some(encode(resource, &endpoints)?),
                None => None,
            };
            return Ok(health::service(&value, endpoints.as_ref()));
        }
        Ok(health::evaluate(&resource.kind, &value))
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn apply(&self, manifest: &Manifest) -> Result<ApplyOutcome, ClusterError> {
        self.kubectl.apply(manifest).await
    }

    async fn diff(&self, manifest: &Manifest) -> Result<DiffOutcome, ClusterError> {
        self.kubectl.diff(manifest).await
    }

    async fn status(&self, manifest: &Manifest) -> Result<UnitHealth, ClusterError> {
        let mut parts = Vec::with_capacity(manifest.resources.len());
        for resource in &manifest.resources {
            let health = self
                .resource_health(resource, &manifest.unit.namespace)
                .await?;
            debug!(unit = %manifest.unit.name, %resource, ?health, "Resource health");
            parts.push((resource.to_string(), health));
        }
        Ok(UnitHealth::combine(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(
            split_api_version("traefik.io/v1alpha1"),
            ("traefik.io", "v1alpha1")
        );
    }
}
