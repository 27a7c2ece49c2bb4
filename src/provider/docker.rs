//! Docker-like backend: a flat namespace of containers, immediate-start semantics (the
//! create call returns once the backend acknowledges creation; there is no separate
//! wait-for-running phase), per-container stats pulled by instance id.

use super::backend::{BackendClient, FakeBackendClient};
use super::GenericProviderAdapter;
use crate::model::{ProviderKind, ResourceInfo, ResourceTags};
use async_trait::async_trait;
use std::collections::HashMap;

pub struct DockerBackendClient {
    inner: FakeBackendClient,
}

impl Default for DockerBackendClient {
    fn default() -> Self {
        Self {
            inner: FakeBackendClient::default(),
        }
    }
}

#[async_trait]
impl BackendClient for DockerBackendClient {
    async fn deploy(
        &self,
        normalized_id: &str,
        image: &str,
        env: &HashMap<String, String>,
        resources: &ResourceInfo,
    ) -> std::result::Result<(), String> {
        self.inner.deploy(normalized_id, image, env, resources).await
    }

    async fn terminate(&self, normalized_id: &str) -> std::result::Result<(), String> {
        self.inner.terminate(normalized_id).await
    }

    async fn instantaneous_usage(&self, normalized_id: &str) -> Option<ResourceInfo> {
        self.inner.instantaneous_usage(normalized_id).await
    }
}

pub type DockerAdapter = GenericProviderAdapter<DockerBackendClient>;

pub fn new_docker_adapter(
    id: impl Into<String>,
    name: impl Into<String>,
    address: impl Into<String>,
    total: ResourceInfo,
) -> DockerAdapter {
    new_docker_adapter_with_classifier(id, name, address, total, Vec::new())
}

pub fn new_docker_adapter_with_classifier(
    id: impl Into<String>,
    name: impl Into<String>,
    address: impl Into<String>,
    total: ResourceInfo,
    shortage_patterns: Vec<String>,
) -> DockerAdapter {
    GenericProviderAdapter::new(
        id,
        name,
        address,
        ProviderKind::Docker,
        ResourceTags {
            cpu: true,
            memory: true,
            gpu: false,
            camera: false,
        },
        total,
        DockerBackendClient::default(),
        shortage_patterns,
    )
}
