//! Pluggable provider lifecycle: the uniform contract every backend (container host, Pod
//! cluster) implements for the scheduler. Resource accounting lives here, in memory; backend
//! queries are advisory only.

pub mod backend;
pub mod docker;
pub mod kubernetes;
pub mod session;

use crate::error::{OrchestratorError, Result};
use crate::model::{Capacity, InstanceRecord, ProviderInfo, ProviderKind, ProviderStatus, ResourceInfo, ResourceTags};
use async_trait::async_trait;
use backend::BackendClient;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};

pub const DEPLOY_DEADLINE: Duration = Duration::from_secs(120);
pub const UNDEPLOY_DEADLINE: Duration = Duration::from_secs(120);
pub const HEALTH_CHECK_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_SESSION_TTL_S: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Ok,
    AlreadyConnected,
    Invalid,
}

/// The contract every adapter exposes to the scheduler, regardless of backend. Methods
/// accept `provider_id` for authentication; it may be empty only for `connect` and for
/// read-only capacity/available calls against an unclaimed provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    fn tags(&self) -> ResourceTags;

    async fn connect(&self, provider_id: &str) -> Result<ConnectOutcome>;
    async fn disconnect(&self, provider_id: &str) -> Result<()>;
    async fn get_capacity(&self, provider_id: Option<&str>) -> Result<Capacity>;
    async fn get_available(&self, provider_id: Option<&str>) -> Result<ResourceInfo>;
    async fn deploy(
        &self,
        provider_id: &str,
        instance_id: &str,
        image: &str,
        env: &HashMap<String, String>,
        resources: ResourceInfo,
    ) -> Result<()>;
    async fn undeploy(&self, provider_id: &str, instance_id: &str) -> Result<()>;
    async fn health_check(&self, provider_id: &str) -> Result<(Capacity, ResourceTags)>;
    async fn get_real_time_usage(&self, provider_id: &str) -> Result<ResourceInfo>;

    /// Snapshot for the orchestration API and the peer directory's advertised capacity.
    fn info(&self) -> ProviderInfo;
}

/// Pairs an adapter with the session manager gating external Deploy/Undeploy/HealthCheck
/// access to it. Both the orchestrator and the scheduler hold (cloned) copies of the same
/// pair, so a TTL-driven session change is visible wherever the provider is reached from.
#[derive(Clone)]
pub struct ProviderEntry {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub sessions: Arc<session::SessionManager>,
}

struct State {
    capacity: Capacity,
    session_provider_id: Option<String>,
    instances: HashMap<String, InstanceRecord>,
}

/// Shared implementation behind both the docker-like and pod-like adapters. Backend-specific
/// quirks (immediate start vs. wait-for-running, name normalization, device syntax) live
/// entirely behind the `BackendClient` the adapter is constructed with; everything above
/// that line — session handling, capacity accounting, instance bookkeeping — is identical.
pub struct GenericProviderAdapter<B: BackendClient> {
    id: String,
    name: String,
    address: String,
    kind: ProviderKind,
    tags: ResourceTags,
    backend: B,
    state: Arc<RwLock<State>>,
    shortage_patterns: Vec<String>,
}

impl<B: BackendClient> GenericProviderAdapter<B> {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        kind: ProviderKind,
        tags: ResourceTags,
        total: ResourceInfo,
        backend: B,
        shortage_patterns: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            kind,
            tags,
            backend,
            state: Arc::new(RwLock::new(State {
                capacity: Capacity::from_total(total),
                session_provider_id: None,
                instances: HashMap::new(),
            })),
            shortage_patterns,
        }
    }

    async fn authenticate(&self, provider_id: &str) -> Result<()> {
        let state = self.state.read().await;
        match &state.session_provider_id {
            Some(active) if active == provider_id => Ok(()),
            Some(_) => Err(OrchestratorError::Auth(format!(
                "provider {} has no active session for id {}",
                self.id, provider_id
            ))),
            None => Err(OrchestratorError::Auth(format!(
                "provider {} has no session; call Connect first",
                self.id
            ))),
        }
    }
}

/// Normalize a caller-supplied instance id to a backend-legal name: lowercase,
/// `[a-z0-9.-]`, bounded length. Non-legal characters collapse to `-`.
pub fn normalize_instance_id(raw: &str) -> String {
    const MAX_LEN: usize = 63;
    let mut out = String::with_capacity(raw.len());
    for c in raw.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    let trimmed: String = out.chars().take(MAX_LEN).collect();
    if trimmed.is_empty() {
        "instance".to_string()
    } else {
        trimmed
    }
}

#[async_trait]
impl<B: BackendClient> ProviderAdapter for GenericProviderAdapter<B> {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind.clone()
    }

    fn tags(&self) -> ResourceTags {
        self.tags
    }

    async fn connect(&self, provider_id: &str) -> Result<ConnectOutcome> {
        if provider_id.is_empty() {
            return Ok(ConnectOutcome::Invalid);
        }
        let mut state = self.state.write().await;
        match &state.session_provider_id {
            Some(active) if active == provider_id => Ok(ConnectOutcome::AlreadyConnected),
            Some(_) => Ok(ConnectOutcome::Invalid),
            None => {
                state.session_provider_id = Some(provider_id.to_string());
                Ok(ConnectOutcome::Ok)
            }
        }
    }

    async fn disconnect(&self, provider_id: &str) -> Result<()> {
        self.authenticate(provider_id).await?;
        let mut state = self.state.write().await;
        state.session_provider_id = None;
        Ok(())
    }

    async fn get_capacity(&self, provider_id: Option<&str>) -> Result<Capacity> {
        let state = self.state.read().await;
        if state.session_provider_id.is_some() {
            let pid = provider_id.ok_or_else(|| OrchestratorError::Auth("provider_id required once claimed".into()))?;
            if state.session_provider_id.as_deref() != Some(pid) {
                return Err(OrchestratorError::Auth(format!("provider {} claimed by a different session", self.id)));
            }
        }
        Ok(state.capacity)
    }

    async fn get_available(&self, provider_id: Option<&str>) -> Result<ResourceInfo> {
        Ok(self.get_capacity(provider_id).await?.available)
    }

    async fn deploy(
        &self,
        provider_id: &str,
        instance_id: &str,
        image: &str,
        env: &HashMap<String, String>,
        resources: ResourceInfo,
    ) -> Result<()> {
        self.authenticate(provider_id).await?;

        {
            let state = self.state.read().await;
            if !state.capacity.available.covers(&resources) {
                return Err(OrchestratorError::CapacityShortage {
                    requested: resources,
                    available: state.capacity.available,
                });
            }
        }

        let normalized = normalize_instance_id(instance_id);
        let outcome = timeout(DEPLOY_DEADLINE, self.backend.deploy(&normalized, image, env, &resources))
            .await
            .map_err(|_| OrchestratorError::Transport(format!("deploy timed out after {:?}", DEPLOY_DEADLINE)))?;

        if let Err(text) = outcome {
            let available = self.state.read().await.capacity.available;
            return Err(OrchestratorError::classify_backend_text(&text, &self.shortage_patterns, resources, available));
        }

        let mut state = self.state.write().await;
        // Re-check under the write lock: a concurrent deploy may have consumed the
        // headroom between our read above and taking this lock.
        if !state.capacity.available.covers(&resources) {
            // Backend already started the workload; best-effort unwind so accounting
            // does not record a reservation for work we did not commit to keeping.
            let _ = self.backend.terminate(&normalized).await;
            return Err(OrchestratorError::CapacityShortage {
                requested: resources,
                available: state.capacity.available,
            });
        }
        state.capacity.reserve(&resources);
        state.instances.insert(
            normalized.clone(),
            InstanceRecord {
                instance_id: instance_id.to_string(),
                normalized_id: normalized,
                provider_id: provider_id.to_string(),
                request: resources,
                image: image.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn undeploy(&self, provider_id: &str, instance_id: &str) -> Result<()> {
        self.authenticate(provider_id).await?;

        let normalized = normalize_instance_id(instance_id);
        let record = {
            let state = self.state.read().await;
            state
                .instances
                .get(&normalized)
                .cloned()
                .or_else(|| state.instances.values().find(|r| r.instance_id == instance_id).cloned())
        };
        let Some(record) = record else {
            // Idempotent: absent instance is a no-op success.
            return Ok(());
        };

        let outcome = timeout(UNDEPLOY_DEADLINE, self.backend.terminate(&record.normalized_id))
            .await
            .map_err(|_| OrchestratorError::Transport(format!("undeploy timed out after {:?}", UNDEPLOY_DEADLINE)))?;
        if let Err(text) = outcome {
            let available = self.state.read().await.capacity.available;
            return Err(OrchestratorError::classify_backend_text(&text, &self.shortage_patterns, record.request, available));
        }

        let mut state = self.state.write().await;
        state.instances.remove(&record.normalized_id);
        // Release from the InstanceRecord, not a re-read of the backend: a GPU the
        // backend cannot see is tracked only here, and this is the only place it's freed.
        state.capacity.release(&record.request);
        Ok(())
    }

    async fn health_check(&self, provider_id: &str) -> Result<(Capacity, ResourceTags)> {
        self.authenticate(provider_id).await?;
        timeout(HEALTH_CHECK_DEADLINE, async { Ok::<(), OrchestratorError>(()) })
            .await
            .map_err(|_| OrchestratorError::Transport("health check timed out".into()))??;
        let state = self.state.read().await;
        Ok((state.capacity, self.tags))
    }

    async fn get_real_time_usage(&self, provider_id: &str) -> Result<ResourceInfo> {
        self.authenticate(provider_id).await?;
        let state = self.state.read().await;
        let mut total = ResourceInfo::zero();
        for record in state.instances.values() {
            let usage = self
                .backend
                .instantaneous_usage(&record.normalized_id)
                .await
                .unwrap_or(record.request);
            total = total.saturating_add(&usage);
        }
        Ok(total)
    }

    fn info(&self) -> ProviderInfo {
        // Blocking read is unavoidable in a non-async getter; callers needing the live
        // snapshot elsewhere use the async accessors above. Kept synchronous so it can be
        // used from contexts (gossip digest assembly) that already hold other locks.
        let state = self.state.try_read();
        let (capacity, status, session) = match state {
            Ok(s) => (
                s.capacity,
                if s.session_provider_id.is_some() {
                    ProviderStatus::Connected
                } else {
                    ProviderStatus::Disconnected
                },
                s.session_provider_id.clone(),
            ),
            Err(_) => (Capacity::default(), ProviderStatus::Error, None),
        };
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            address: self.address.clone(),
            status,
            capacity,
            tags: self.tags,
            current_session_id: session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::FakeBackendClient;

    fn adapter() -> GenericProviderAdapter<FakeBackendClient> {
        GenericProviderAdapter::new(
            "p1",
            "local-docker",
            "unix:///var/run/docker.sock",
            ProviderKind::Docker,
            ResourceTags {
                cpu: true,
                memory: true,
                gpu: false,
                camera: false,
            },
            ResourceInfo::new(6000, 6 * 1024 * 1024 * 1024, 0),
            FakeBackendClient::default(),
            vec!["insufficient".to_string(), "no capacity".to_string()],
        )
    }

    /// `FakeBackendClient::fail_next_deploy` always fails with the text "simulated backend
    /// rejection"; whether that becomes a `CapacityShortage` or a `BackendFailure` depends
    /// entirely on the adapter's configured pattern list.
    #[tokio::test]
    async fn backend_failure_text_matching_a_configured_pattern_becomes_capacity_shortage() {
        let a = GenericProviderAdapter::new(
            "p1",
            "local-docker",
            "unix:///var/run/docker.sock",
            ProviderKind::Docker,
            ResourceTags {
                cpu: true,
                memory: true,
                gpu: false,
                camera: false,
            },
            ResourceInfo::new(6000, 6 * 1024 * 1024 * 1024, 0),
            FakeBackendClient::default(),
            vec!["rejection".to_string()],
        );
        a.connect("p1").await.unwrap();
        a.backend.fail_next_deploy();
        let err = a
            .deploy("p1", "x", "img", &HashMap::new(), ResourceInfo::new(100, 1024, 0))
            .await
            .unwrap_err();
        assert!(err.is_capacity_shortage());
    }

    #[tokio::test]
    async fn backend_failure_text_matching_no_pattern_stays_a_backend_failure() {
        let a = adapter();
        a.connect("p1").await.unwrap();
        a.backend.fail_next_deploy();
        let err = a
            .deploy("p1", "x", "img", &HashMap::new(), ResourceInfo::new(100, 1024, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::BackendFailure(_)));
    }

    #[tokio::test]
    async fn connect_is_idempotent_for_the_same_id() {
        let a = adapter();
        assert_eq!(a.connect("p1").await.unwrap(), ConnectOutcome::Ok);
        assert_eq!(a.connect("p1").await.unwrap(), ConnectOutcome::AlreadyConnected);
    }

    #[tokio::test]
    async fn connect_rejects_a_different_id_while_session_is_live() {
        let a = adapter();
        a.connect("p1").await.unwrap();
        assert_eq!(a.connect("someone-else").await.unwrap(), ConnectOutcome::Invalid);
    }

    #[tokio::test]
    async fn deploy_then_undeploy_restores_used_to_pre_deploy_value() {
        let a = adapter();
        a.connect("p1").await.unwrap();
        let before = a.get_capacity(Some("p1")).await.unwrap().used;
        a.deploy("p1", "web-1", "nginx:latest", &HashMap::new(), ResourceInfo::new(500, 256 * 1024 * 1024, 0))
            .await
            .unwrap();
        assert_ne!(a.get_capacity(Some("p1")).await.unwrap().used, before);
        a.undeploy("p1", "web-1").await.unwrap();
        assert_eq!(a.get_capacity(Some("p1")).await.unwrap().used, before);
    }

    #[tokio::test]
    async fn undeploy_is_idempotent() {
        let a = adapter();
        a.connect("p1").await.unwrap();
        a.undeploy("p1", "never-deployed").await.unwrap();
        a.undeploy("p1", "never-deployed").await.unwrap();
    }

    #[tokio::test]
    async fn deploy_exactly_at_available_succeeds_one_over_fails() {
        let a = adapter();
        a.connect("p1").await.unwrap();
        let available = a.get_available(Some("p1")).await.unwrap();
        a.deploy("p1", "fits-exactly", "x", &HashMap::new(), available).await.unwrap();
        a.undeploy("p1", "fits-exactly").await.unwrap();

        let over = ResourceInfo::new(available.cpu_mc + 1, available.memory_bytes, available.gpu_count);
        let err = a.deploy("p1", "too-big", "x", &HashMap::new(), over).await.unwrap_err();
        assert!(err.is_capacity_shortage());
    }

    #[tokio::test]
    async fn deploy_without_session_fails_auth() {
        let a = adapter();
        let err = a
            .deploy("p1", "x", "img", &HashMap::new(), ResourceInfo::new(1, 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Auth(_)));
    }
}
