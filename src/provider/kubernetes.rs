//! Pod-like backend: two-phase create/wait-for-running, label-selector-shaped instance
//! lookup (folded into the normalized id here since there is no live apiserver), and a
//! metrics-service fallback on real-time usage when the cluster has none.

use super::backend::{BackendClient, FakeBackendClient};
use super::GenericProviderAdapter;
use crate::model::{ProviderKind, ResourceInfo, ResourceTags};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{sleep, Duration};

/// How long to poll for Ready before giving up inside the Deploy deadline.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READY_POLL_ATTEMPTS: u32 = 3;

pub struct KubernetesBackendClient {
    inner: FakeBackendClient,
    has_metrics_service: AtomicBool,
}

impl KubernetesBackendClient {
    pub fn new(has_metrics_service: bool) -> Self {
        Self {
            inner: FakeBackendClient::default(),
            has_metrics_service: AtomicBool::new(has_metrics_service),
        }
    }
}

impl Default for KubernetesBackendClient {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl BackendClient for KubernetesBackendClient {
    async fn deploy(
        &self,
        normalized_id: &str,
        image: &str,
        env: &HashMap<String, String>,
        resources: &ResourceInfo,
    ) -> std::result::Result<(), String> {
        self.inner.deploy(normalized_id, image, env, resources).await?;
        self.wait_until_ready(normalized_id).await
    }

    async fn terminate(&self, normalized_id: &str) -> std::result::Result<(), String> {
        self.inner.terminate(normalized_id).await
    }

    async fn instantaneous_usage(&self, normalized_id: &str) -> Option<ResourceInfo> {
        if self.has_metrics_service.load(Ordering::SeqCst) {
            self.inner.instantaneous_usage(normalized_id).await
        } else {
            // No metrics-server equivalent reachable: the adapter layer falls back to
            // the requested (not measured) quantity for this instance.
            None
        }
    }
}

impl KubernetesBackendClient {
    /// Polls until the workload reports Ready or the attempt budget is exhausted. In a
    /// real pod-like backend this watches pod status; here readiness follows immediately
    /// after creation, so the loop exists to preserve the two-phase shape and give the
    /// Deploy deadline (§5) somewhere to bite if a backend never becomes ready.
    async fn wait_until_ready(&self, normalized_id: &str) -> std::result::Result<(), String> {
        for _ in 0..READY_POLL_ATTEMPTS {
            if self.inner.instantaneous_usage(normalized_id).await.is_some() {
                return Ok(());
            }
            sleep(READY_POLL_INTERVAL).await;
        }
        Err(format!("workload {} did not become ready", normalized_id))
    }
}

pub type KubernetesAdapter = GenericProviderAdapter<KubernetesBackendClient>;

pub fn new_kubernetes_adapter(
    id: impl Into<String>,
    name: impl Into<String>,
    address: impl Into<String>,
    total: ResourceInfo,
    has_metrics_service: bool,
    has_gpu_device_plugin: bool,
) -> KubernetesAdapter {
    new_kubernetes_adapter_with_classifier(id, name, address, total, has_metrics_service, has_gpu_device_plugin, Vec::new())
}

pub fn new_kubernetes_adapter_with_classifier(
    id: impl Into<String>,
    name: impl Into<String>,
    address: impl Into<String>,
    total: ResourceInfo,
    has_metrics_service: bool,
    has_gpu_device_plugin: bool,
    shortage_patterns: Vec<String>,
) -> KubernetesAdapter {
    GenericProviderAdapter::new(
        id,
        name,
        address,
        ProviderKind::Kubernetes,
        ResourceTags {
            cpu: true,
            memory: true,
            gpu: has_gpu_device_plugin,
            camera: false,
        },
        total,
        KubernetesBackendClient::new(has_metrics_service),
        shortage_patterns,
    )
}
