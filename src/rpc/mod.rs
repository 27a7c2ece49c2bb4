//! Peer RPC surface (§6): request/response types and the `PeerRpc` trait every transport
//! would implement. No wire transport is implemented here — that is explicitly out of
//! scope — but `LoopbackPeerRpc` exercises the full contract in-process, which is what the
//! gossip ticker and scheduler are built and tested against.

pub mod loopback;

use crate::model::{PeerNode, ResourceInfo};
use crate::policy::Proposal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProposeOutcome {
    Proposal(ProposalWire),
    NoScheduler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalWire {
    pub node_id: String,
    pub node_name: String,
    pub provider_id: String,
    pub available: ResourceInfo,
}

impl From<ProposalWire> for Proposal {
    fn from(p: ProposalWire) -> Self {
        Proposal {
            node_id: p.node_id,
            provider_id: p.provider_id,
            available: p.available,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub runtime_env: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub resources: ResourceInfo,
    pub provider_id: String,
    pub instance_id: String,
    pub upstream_zmq_address: Option<String>,
    pub upstream_store_address: Option<String>,
    pub upstream_logger_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {
    pub success: bool,
    pub node_id: String,
    pub provider_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteProviderSummary {
    pub provider_id: String,
    pub name: String,
    pub available: ResourceInfo,
    pub tags: crate::model::ResourceTags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRemoteProvidersResponse {
    pub success: bool,
    pub node_id: String,
    pub node_name: String,
    pub providers: Vec<RemoteProviderSummary>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipRequest {
    pub sender_node: PeerNode,
    pub known_digest: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipResponse {
    pub sender_node_latest: PeerNode,
    pub updates: Vec<PeerNode>,
}

/// The contract the scheduler and gossip ticker use to talk to a peer, addressed by that
/// peer's `scheduler_address` (for propose/commit/list) or `address` (for gossip).
#[async_trait]
pub trait PeerRpc: Send + Sync {
    async fn propose_schedule(&self, peer_address: &str, resources: ResourceInfo) -> anyhow::Result<ProposeOutcome>;
    async fn commit_schedule(&self, peer_address: &str, request: CommitRequest) -> anyhow::Result<CommitResponse>;
    async fn list_remote_providers(&self, peer_address: &str, include_resources: bool) -> anyhow::Result<ListRemoteProvidersResponse>;
    async fn gossip(&self, peer_address: &str, request: GossipRequest) -> anyhow::Result<GossipResponse>;
}
