//! Orchestrator façade: the `Node` struct wiring providers, sessions, the peer directory,
//! the scheduler, and the policy chain into a runnable whole, serving both sides of the
//! peer RPC contract and exposing the Deploy/Undeploy/ListProviders/AggregateView API.

use crate::directory::{GossipConfig, LocalNode, PeerDirectory};
use crate::error::{OrchestratorError, Result};
use crate::model::{AggregateView, Capacity, DeployRequest, InstanceHandle, ProviderInfo, ResourceInfo, ResourceTags};
use crate::policy::{Policy, PolicyChain};
use crate::provider::session::SessionManager;
use crate::provider::{ProviderAdapter, ProviderEntry};
use crate::rpc::loopback::{LoopbackPeerRpc, LoopbackRegistry, PeerRpcServer};
use crate::rpc::{CommitRequest, CommitResponse, GossipRequest, GossipResponse, ListRemoteProvidersResponse, PeerRpc, ProposeOutcome, ProposalWire, RemoteProviderSummary};
use crate::scheduler::{Scheduler, SchedulingOutcome};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use uuid::Uuid;

/// One orchestrator instance: a local node with its own providers, peer directory,
/// scheduler and policy chain, reachable by other `Node`s through whatever `PeerRpc`
/// transport it is registered against (the loopback transport for local multi-node runs).
pub struct Node {
    node_id: String,
    node_name: String,
    providers: Vec<ProviderEntry>,
    directory: Arc<PeerDirectory>,
    scheduler: Scheduler,
    stop_tx: watch::Sender<bool>,
}

impl Node {
    pub fn new(
        local: LocalNode,
        gossip_node_ttl_s: i64,
        providers: Vec<ProviderEntry>,
        policies: Vec<Box<dyn Policy>>,
        peer_rpc: Arc<dyn PeerRpc>,
        max_retries: u32,
    ) -> Self {
        let node_id = local.node_id.clone();
        let node_name = local.name.clone();
        let directory = Arc::new(PeerDirectory::new(local, gossip_node_ttl_s));
        let policy_chain = Arc::new(PolicyChain::new(policies));
        let scheduler = Scheduler::new(node_id.clone(), node_name.clone(), providers.clone(), directory.clone(), policy_chain, peer_rpc, max_retries);
        let (stop_tx, _rx) = watch::channel(false);
        Self {
            node_id,
            node_name,
            providers,
            directory,
            scheduler,
            stop_tx,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn directory(&self) -> Arc<PeerDirectory> {
        self.directory.clone()
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Signal every background task (gossip ticker, TTL sweeper, session reapers) to stop.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn spawn_background_tasks(self: &Arc<Self>, peer_rpc: Arc<dyn PeerRpc>, gossip: GossipConfig, sweep_period: Duration, session_check_interval: Duration) {
        tokio::spawn(crate::directory::gossip::run_gossip_ticker(self.directory.clone(), peer_rpc, gossip, self.stop_signal()));
        tokio::spawn(crate::directory::gossip::run_ttl_sweeper(self.directory.clone(), sweep_period, self.stop_signal()));
        for entry in &self.providers {
            tokio::spawn(entry.sessions.clone().run_reaper(session_check_interval, self.stop_signal()));
        }
    }

    fn find_provider(&self, provider_id: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.adapter.id() == provider_id)
    }

    /// Refresh the local node's advertised capacity from the live sum across providers,
    /// bumping the gossip version. Called after every Deploy/Undeploy that changes it.
    async fn refresh_advertised_capacity(&self) {
        let mut total = Capacity::default();
        let mut tags = ResourceTags::default();
        for entry in &self.providers {
            if let Ok(capacity) = entry.adapter.get_capacity(None).await {
                total.total = total.total.saturating_add(&capacity.total);
                total.used = total.used.saturating_add(&capacity.used);
                total.available = total.available.saturating_add(&capacity.available);
                tags = tags.or(&entry.adapter.tags());
            }
        }
        self.directory.update_local_capacity(total, tags).await;
    }

    // ---- Orchestration API (spec §4.6) ----

    pub async fn deploy(&self, request: DeployRequest) -> Result<(String, SchedulingOutcome)> {
        let outcome = self.scheduler.schedule(request).await;
        let target = match &outcome.target {
            Ok(t) => t.clone(),
            Err(e) => return Err(e.clone()),
        };
        self.refresh_advertised_capacity().await;
        let handle = InstanceHandle {
            node_id: target.node_id.clone(),
            provider_id: target.provider_id.clone(),
            instance_id: target.instance_id.clone(),
        };
        info!("orchestrator: deployed instance {} on node {} provider {}", target.instance_id, target.node_id, target.provider_id);
        Ok((handle.encode(), outcome))
    }

    /// Undeploy by opaque handle. Local handles route directly to the owning provider;
    /// handles naming another node are out of scope here (no wire transport), and are
    /// rejected with a transport error rather than silently ignored.
    pub async fn undeploy(&self, handle: &str) -> Result<()> {
        let decoded = InstanceHandle::decode(handle).ok_or_else(|| OrchestratorError::Transport("malformed instance handle".to_string()))?;
        if decoded.node_id != self.node_id {
            return Err(OrchestratorError::Transport(format!(
                "instance handle names node {}, not reachable from node {} without a wire transport",
                decoded.node_id, self.node_id
            )));
        }
        let entry = self
            .find_provider(&decoded.provider_id)
            .ok_or_else(|| OrchestratorError::BackendFailure(format!("unknown provider {}", decoded.provider_id)))?;
        let provider_session_id = entry.sessions.authorize().await?;
        entry.adapter.undeploy(&provider_session_id, &decoded.instance_id).await?;
        self.refresh_advertised_capacity().await;
        Ok(())
    }

    /// HealthCheck(provider_id) (spec §4.6): the liveness pulse that keeps a session alive
    /// past its last Connect/HealthCheck, re-establishing it if the reaper has not yet swept
    /// an expired one.
    pub async fn health_check(&self, provider_id: &str) -> Result<(Capacity, ResourceTags)> {
        let entry = self
            .find_provider(provider_id)
            .ok_or_else(|| OrchestratorError::BackendFailure(format!("unknown provider {}", provider_id)))?;
        entry.sessions.health_check().await
    }

    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        self.providers.iter().map(|p| p.adapter.info()).collect()
    }

    pub async fn aggregate_view(&self) -> AggregateView {
        self.directory.aggregate_view().await
    }

    /// Connect every configured provider under a generated session id, registering it with
    /// that provider's own session manager. Called once at startup before serving.
    pub async fn connect_all_providers(&self) -> Result<()> {
        for entry in &self.providers {
            let provider_id = format!("session-{}", Uuid::new_v4());
            entry.adapter.connect(&provider_id).await?;
            entry.sessions.set_provider_id(provider_id).await;
        }
        self.refresh_advertised_capacity().await;
        Ok(())
    }
}

#[async_trait]
impl PeerRpcServer for Node {
    async fn handle_propose_schedule(&self, resources: ResourceInfo) -> ProposeOutcome {
        for entry in &self.providers {
            let Ok(available) = entry.adapter.get_available(None).await else {
                continue;
            };
            if available.covers(&resources) {
                return ProposeOutcome::Proposal(ProposalWire {
                    node_id: self.node_id.clone(),
                    node_name: self.node_name.clone(),
                    provider_id: entry.adapter.id().to_string(),
                    available,
                });
            }
        }
        // No local capacity for any provider; this node still has an autonomous
        // scheduler, so the honest answer is a proposal for zero, not NoScheduler.
        ProposeOutcome::Proposal(ProposalWire {
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            provider_id: String::new(),
            available: ResourceInfo::zero(),
        })
    }

    async fn handle_commit_schedule(&self, request: CommitRequest) -> CommitResponse {
        let Some(entry) = self.find_provider(&request.provider_id) else {
            return CommitResponse {
                success: false,
                node_id: self.node_id.clone(),
                provider_id: request.provider_id,
                error: Some("unknown provider".to_string()),
            };
        };
        let session_id = match entry.sessions.authorize().await {
            Ok(id) => id,
            Err(e) => {
                return CommitResponse {
                    success: false,
                    node_id: self.node_id.clone(),
                    provider_id: request.provider_id,
                    error: Some(e.to_string()),
                };
            }
        };
        match entry
            .adapter
            .deploy(&session_id, &request.instance_id, &request.image, &request.env, request.resources)
            .await
        {
            Ok(()) => {
                self.refresh_advertised_capacity().await;
                CommitResponse {
                    success: true,
                    node_id: self.node_id.clone(),
                    provider_id: entry.adapter.id().to_string(),
                    error: None,
                }
            }
            Err(e) => {
                warn!("orchestrator: remote commit failed on node {}: {}", self.node_id, e);
                CommitResponse {
                    success: false,
                    node_id: self.node_id.clone(),
                    provider_id: request.provider_id,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn handle_list_remote_providers(&self, include_resources: bool) -> ListRemoteProvidersResponse {
        let mut providers = Vec::new();
        for entry in &self.providers {
            let available = if include_resources {
                entry.adapter.get_available(None).await.unwrap_or_else(|_| ResourceInfo::zero())
            } else {
                ResourceInfo::zero()
            };
            providers.push(RemoteProviderSummary {
                provider_id: entry.adapter.id().to_string(),
                name: entry.adapter.info().name,
                available,
                tags: entry.adapter.tags(),
            });
        }
        ListRemoteProvidersResponse {
            success: true,
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            providers,
            error: None,
        }
    }

    async fn handle_gossip(&self, request: GossipRequest) -> GossipResponse {
        let source = request.sender_node.node_id.clone();
        self.directory.integrate(request.sender_node, &source).await;

        let sender_node_latest = self.directory.local_snapshot().await;
        let known = self.directory.known_peers().await;
        let updates = known
            .into_iter()
            .filter(|p| request.known_digest.get(&p.node_id).copied().unwrap_or(0) < p.version)
            .collect();

        GossipResponse { sender_node_latest, updates }
    }
}

/// Register `node` under `address` in `registry` and hand back a `LoopbackPeerRpc` the
/// node can use to call its peers, all sharing the same registry.
pub async fn attach_loopback(registry: &Arc<LoopbackRegistry>, node: Arc<Node>, address: impl Into<String>) -> Arc<LoopbackPeerRpc> {
    registry.register(address, node as Arc<dyn PeerRpcServer>).await;
    Arc::new(LoopbackPeerRpc::new(registry.clone()))
}

/// Assembles a `Node` from a loaded `Config`. No remote wire transport exists (§1), so the
/// peer RPC the returned node is wired with is a fresh loopback registry containing only
/// itself; gossip has nothing to discover beyond what config-configured seed addresses
/// name (which, without a real transport, only resolve to other nodes sharing this process).
pub mod build {
    use super::*;
    use crate::config::{Config, PolicyConfig, ProviderConfig};
    use crate::policy::{NodeBlacklistPolicy, ProviderBlacklistPolicy, SafetyMarginPolicy};
    use crate::provider::docker::new_docker_adapter_with_classifier;
    use crate::provider::kubernetes::new_kubernetes_adapter_with_classifier;

    fn policy_from_config(config: &PolicyConfig) -> Option<Box<dyn Policy>> {
        match config {
            PolicyConfig::SafetyMargin { enable, r_cpu, r_memory, r_gpu } => {
                if !*enable {
                    return None;
                }
                let default = SafetyMarginPolicy::default();
                Some(Box::new(SafetyMarginPolicy {
                    r_cpu: r_cpu.unwrap_or(default.r_cpu),
                    r_memory: r_memory.unwrap_or(default.r_memory),
                    r_gpu: r_gpu.unwrap_or(default.r_gpu),
                }))
            }
            PolicyConfig::NodeBlacklist { enable, blocked } => {
                if !*enable {
                    return None;
                }
                Some(Box::new(NodeBlacklistPolicy { blocked: blocked.clone() }))
            }
            PolicyConfig::ProviderBlacklist { enable, blocked } => {
                if !*enable {
                    return None;
                }
                Some(Box::new(ProviderBlacklistPolicy { blocked: blocked.clone() }))
            }
        }
    }

    async fn provider_entry_from_config(config: &ProviderConfig, session_ttl_s: i64, shortage_patterns: &[String]) -> Result<ProviderEntry> {
        let total = config.total_resources()?;
        let adapter: Arc<dyn ProviderAdapter> = match config.kind.as_str() {
            "docker" => Arc::new(new_docker_adapter_with_classifier(
                config.id.clone(),
                config.name.clone(),
                config.address.clone(),
                total,
                shortage_patterns.to_vec(),
            )),
            "kubernetes" => Arc::new(new_kubernetes_adapter_with_classifier(
                config.id.clone(),
                config.name.clone(),
                config.address.clone(),
                total,
                config.has_metrics_service,
                config.has_gpu_device_plugin,
                shortage_patterns.to_vec(),
            )),
            other => return Err(OrchestratorError::FatalConfig(format!("unknown provider type {:?} for provider {}", other, config.id))),
        };
        let sessions = Arc::new(SessionManager::new(adapter.clone(), session_ttl_s));
        Ok(ProviderEntry { adapter, sessions })
    }

    /// Build a `Node` plus the pieces `serve` needs to run its background tasks, all wired
    /// against a fresh, self-registering loopback peer RPC.
    pub async fn node_from_config(config: &Config) -> Result<(Arc<Node>, Arc<LoopbackRegistry>, GossipConfig, Duration, Duration)> {
        let registry = LoopbackRegistry::new();
        let peer_rpc: Arc<dyn PeerRpc> = Arc::new(LoopbackPeerRpc::new(registry.clone()));

        let mut providers = Vec::new();
        for provider_config in &config.providers {
            providers.push(provider_entry_from_config(provider_config, config.session.ttl_s, &config.scheduler.local_error_classifier_patterns).await?);
        }

        let policies: Vec<Box<dyn Policy>> = config.policies.iter().filter_map(policy_from_config).collect();

        let local = LocalNode {
            node_id: config.local_node.id.clone(),
            name: config.local_node.name.clone(),
            address: config.local_node.address.clone(),
            scheduler_address: config.local_node.scheduler_address.clone(),
            domain_id: config.local_node.domain_id.clone(),
            capacity: Capacity::default(),
            tags: ResourceTags::default(),
            version: 1,
        };

        let node = Arc::new(Node::new(local, config.gossip.node_ttl_s, providers, policies, peer_rpc, config.scheduler.max_retries));
        node.connect_all_providers().await?;
        attach_loopback(&registry, node.clone(), config.local_node.scheduler_address.clone()).await;

        let gossip = GossipConfig {
            period_s: config.gossip.period_s,
            fanout: config.gossip.fanout,
            jitter: config.gossip.jitter,
            seed_addresses: config.gossip.seed_addresses.clone(),
        };
        let sweep_period = Duration::from_secs(config.gossip.period_s.max(1));
        let session_check_interval = Duration::from_secs(config.session.check_interval_s.max(1));

        Ok((node, registry, gossip, sweep_period, session_check_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PeerStatus, ResourceTags};
    use crate::policy::SafetyMarginPolicy;
    use crate::provider::docker::new_docker_adapter;
    use crate::provider::session::SessionManager;

    fn local_node(id: &str, addr: &str, sched_addr: &str) -> LocalNode {
        LocalNode {
            node_id: id.to_string(),
            name: id.to_string(),
            address: addr.to_string(),
            scheduler_address: sched_addr.to_string(),
            domain_id: "dom-a".to_string(),
            capacity: Capacity::default(),
            tags: ResourceTags::default(),
            version: 1,
        }
    }

    async fn single_provider_node(id: &str, addr: &str, sched_addr: &str, peer_rpc: Arc<dyn PeerRpc>) -> Arc<Node> {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(new_docker_adapter(
            format!("{}-docker", id),
            "local-docker",
            "unix:///var/run/docker.sock",
            ResourceInfo::new(4000, 4 * 1024 * 1024 * 1024, 0),
        ));
        let sessions = Arc::new(SessionManager::new(adapter.clone(), 90));
        let node = Node::new(
            local_node(id, addr, sched_addr),
            180,
            vec![ProviderEntry { adapter, sessions }],
            vec![Box::new(SafetyMarginPolicy { r_cpu: 1.0, r_memory: 1.0, r_gpu: 1.0 })],
            peer_rpc,
            3,
        );
        node.connect_all_providers().await.unwrap();
        Arc::new(node)
    }

    fn deploy_request(cpu: i64, mem: i64) -> DeployRequest {
        DeployRequest {
            runtime_env: "default".to_string(),
            image: "app:latest".to_string(),
            env: Default::default(),
            resources: ResourceInfo::new(cpu, mem, 0),
            required_tags: Default::default(),
        }
    }

    #[tokio::test]
    async fn deploy_locally_succeeds_and_produces_a_decodable_handle() {
        let registry = LoopbackRegistry::new();
        let peer_rpc: Arc<dyn PeerRpc> = Arc::new(LoopbackPeerRpc::new(registry.clone()));
        let node = single_provider_node("node-a", "10.0.0.1:7000", "10.0.0.1:7100", peer_rpc.clone()).await;
        registry.register("10.0.0.1:7100", node.clone() as Arc<dyn PeerRpcServer>).await;

        let (handle, outcome) = node.deploy(deploy_request(500, 256 * 1024 * 1024)).await.unwrap();
        assert!(outcome.target.is_ok());
        let decoded = InstanceHandle::decode(&handle).expect("handle decodes");
        assert_eq!(decoded.node_id, "node-a");

        node.undeploy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn deploy_delegates_to_a_peer_when_local_capacity_is_exhausted() {
        let registry = LoopbackRegistry::new();
        let peer_rpc: Arc<dyn PeerRpc> = Arc::new(LoopbackPeerRpc::new(registry.clone()));

        let node_a = single_provider_node("node-a", "10.0.0.1:7000", "10.0.0.1:7100", peer_rpc.clone()).await;
        let node_b = single_provider_node("node-b", "10.0.0.2:7000", "10.0.0.2:7100", peer_rpc.clone()).await;
        registry.register("10.0.0.1:7100", node_a.clone() as Arc<dyn PeerRpcServer>).await;
        registry.register("10.0.0.2:7100", node_b.clone() as Arc<dyn PeerRpcServer>).await;

        // node_a learns about node_b via a manual gossip round (no ticker running in this test).
        let sender = node_b.directory().local_snapshot().await;
        node_a.directory().integrate(sender, "10.0.0.2:7000").await;

        // Exhaust node_a's own local capacity first.
        let (_h, big) = node_a.deploy(deploy_request(4000, 4 * 1024 * 1024 * 1024)).await.unwrap();
        assert!(big.target.is_ok());

        let (handle, outcome) = node_a.deploy(deploy_request(500, 256 * 1024 * 1024)).await.unwrap();
        assert!(outcome.target.is_ok());
        let decoded = InstanceHandle::decode(&handle).expect("handle decodes");
        assert_eq!(decoded.node_id, "node-b");
    }

    #[tokio::test]
    async fn gossip_handler_integrates_sender_and_returns_fresher_updates() {
        let registry = LoopbackRegistry::new();
        let peer_rpc: Arc<dyn PeerRpc> = Arc::new(LoopbackPeerRpc::new(registry.clone()));
        let node = single_provider_node("node-a", "10.0.0.1:7000", "10.0.0.1:7100", peer_rpc.clone()).await;

        let mut remote = local_node("node-b", "10.0.0.2:7000", "10.0.0.2:7100");
        remote.version = 3;
        let remote_directory = PeerDirectory::new(remote, 180);
        let sender_node = remote_directory.local_snapshot().await;

        let response = node
            .handle_gossip(GossipRequest {
                sender_node,
                known_digest: Default::default(),
            })
            .await;
        assert_eq!(response.sender_node_latest.node_id, "node-a");
        assert!(node.directory().known_peers().await.iter().any(|p| p.node_id == "node-b"));

        let _ = PeerStatus::Online;
    }
}
