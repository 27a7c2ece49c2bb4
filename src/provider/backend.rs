//! The backend-specific half of a provider adapter: the actual calls that create, wait for,
//! tear down, and measure a workload. Kept separate from `ProviderAdapter` so the session and
//! capacity-accounting logic in `GenericProviderAdapter` never branches on backend type.

use crate::model::ResourceInfo;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Create and start (docker-like), or create-and-wait-for-running (pod-like), the
    /// workload. Errors are raw backend text; the adapter layer maps them onto
    /// `OrchestratorError` via the configurable classifier.
    async fn deploy(
        &self,
        normalized_id: &str,
        image: &str,
        env: &HashMap<String, String>,
        resources: &ResourceInfo,
    ) -> std::result::Result<(), String>;

    async fn terminate(&self, normalized_id: &str) -> std::result::Result<(), String>;

    /// Best-effort instantaneous usage; `None` tells the caller to fall back to the
    /// requested (not measured) quantity, e.g. when the backend has no metrics service.
    async fn instantaneous_usage(&self, normalized_id: &str) -> Option<ResourceInfo>;
}

/// In-memory stand-in for a real Docker daemon or kube-apiserver. Used by tests and by
/// `serve` when no live backend endpoint is configured (§10.1's operational subcommands
/// still need *some* provider to exercise).
pub struct FakeBackendClient {
    fail_next_deploy: AtomicBool,
    running: Arc<RwLock<HashMap<String, ResourceInfo>>>,
}

impl Default for FakeBackendClient {
    fn default() -> Self {
        Self {
            fail_next_deploy: AtomicBool::new(false),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl FakeBackendClient {
    pub fn fail_next_deploy(&self) {
        self.fail_next_deploy.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendClient for FakeBackendClient {
    async fn deploy(
        &self,
        normalized_id: &str,
        _image: &str,
        _env: &HashMap<String, String>,
        resources: &ResourceInfo,
    ) -> std::result::Result<(), String> {
        if self.fail_next_deploy.swap(false, Ordering::SeqCst) {
            return Err("simulated backend rejection".to_string());
        }
        self.running.write().await.insert(normalized_id.to_string(), *resources);
        Ok(())
    }

    async fn terminate(&self, normalized_id: &str) -> std::result::Result<(), String> {
        self.running.write().await.remove(normalized_id);
        Ok(())
    }

    async fn instantaneous_usage(&self, normalized_id: &str) -> Option<ResourceInfo> {
        self.running.read().await.get(normalized_id).copied()
    }
}
