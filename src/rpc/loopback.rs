//! In-process stand-in for the peer RPC transport (explicitly out of scope to implement
//! for real, §1). Addresses are just keys into a shared registry of node handles; this is
//! enough to drive the scheduler and gossip ticker across multiple simulated nodes within
//! one test binary or one `serve` process running a local multi-node simulation.

use super::{CommitRequest, CommitResponse, GossipRequest, GossipResponse, ListRemoteProvidersResponse, PeerRpc, ProposeOutcome};
use crate::model::ResourceInfo;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Server-side of the peer RPC surface: what a node must expose so `LoopbackPeerRpc` can
/// reach it by address. Implemented by the orchestrator's `Node`.
#[async_trait]
pub trait PeerRpcServer: Send + Sync {
    async fn handle_propose_schedule(&self, resources: ResourceInfo) -> ProposeOutcome;
    async fn handle_commit_schedule(&self, request: CommitRequest) -> CommitResponse;
    async fn handle_list_remote_providers(&self, include_resources: bool) -> ListRemoteProvidersResponse;
    async fn handle_gossip(&self, request: GossipRequest) -> GossipResponse;
}

#[derive(Default)]
pub struct LoopbackRegistry {
    nodes: RwLock<HashMap<String, Arc<dyn PeerRpcServer>>>,
}

impl LoopbackRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, address: impl Into<String>, server: Arc<dyn PeerRpcServer>) {
        self.nodes.write().await.insert(address.into(), server);
    }

    async fn get(&self, address: &str) -> Result<Arc<dyn PeerRpcServer>> {
        self.nodes
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| anyhow!("no loopback peer registered at address {}", address))
    }
}

pub struct LoopbackPeerRpc {
    registry: Arc<LoopbackRegistry>,
}

impl LoopbackPeerRpc {
    pub fn new(registry: Arc<LoopbackRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PeerRpc for LoopbackPeerRpc {
    async fn propose_schedule(&self, peer_address: &str, resources: ResourceInfo) -> Result<ProposeOutcome> {
        let server = self.registry.get(peer_address).await?;
        Ok(server.handle_propose_schedule(resources).await)
    }

    async fn commit_schedule(&self, peer_address: &str, request: CommitRequest) -> Result<CommitResponse> {
        let server = self.registry.get(peer_address).await?;
        Ok(server.handle_commit_schedule(request).await)
    }

    async fn list_remote_providers(&self, peer_address: &str, include_resources: bool) -> Result<ListRemoteProvidersResponse> {
        let server = self.registry.get(peer_address).await?;
        Ok(server.handle_list_remote_providers(include_resources).await)
    }

    async fn gossip(&self, peer_address: &str, request: GossipRequest) -> Result<GossipResponse> {
        let server = self.registry.get(peer_address).await?;
        Ok(server.handle_gossip(request).await)
    }
}
