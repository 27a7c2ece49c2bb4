//! Hierarchical Scheduler: local-first placement, then two-phase (propose/commit) peer
//! delegation evaluated against the policy chain, with an engine-select fallback for peers
//! without their own autonomous scheduler. Produces a per-request audit trail.

use crate::directory::PeerDirectory;
use crate::error::OrchestratorError;
use crate::model::DeployRequest;
use crate::policy::{PolicyChain, PolicyVerdict, Proposal};
use crate::provider::session::SessionManager;
use crate::provider::{ProviderAdapter, ProviderEntry};
use crate::rpc::{CommitRequest, PeerRpc, ProposeOutcome};
use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, serde::Serialize)]
pub enum AuditEvent {
    LocalInsufficient,
    LocalFailed { reason: String },
    Propose { node_id: String },
    PolicyAccept { node_id: String },
    PolicyReject { node_id: String, policy_name: String, reason: String },
    CommitSuccess { node_id: String, provider_id: String },
    CommitFailed { node_id: String, reason: String },
    EngineSelect { node_id: String, provider_id: String },
    NoScheduler { node_id: String },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditTrail {
    pub events: Vec<AuditEvent>,
}

impl AuditTrail {
    fn new() -> Self {
        Self { events: Vec::new() }
    }

    fn push(&mut self, event: AuditEvent) {
        self.events.push(event);
    }
}

#[derive(Debug, Clone)]
pub struct PlacementTarget {
    pub node_id: String,
    pub provider_id: String,
    pub instance_id: String,
}

#[derive(Debug)]
pub struct SchedulingOutcome {
    pub target: Result<PlacementTarget, OrchestratorError>,
    pub audit_trail: AuditTrail,
}

/// Holds references to the provider set, peer directory, and policy chain as capability
/// interfaces; the policy chain holds no back-reference to the scheduler.
pub struct Scheduler {
    local_node_id: String,
    local_node_name: String,
    providers: Vec<ProviderEntry>,
    directory: Arc<PeerDirectory>,
    policy_chain: Arc<PolicyChain>,
    peer_rpc: Arc<dyn PeerRpc>,
    max_retries: u32,
}

impl Scheduler {
    pub fn new(
        local_node_id: impl Into<String>,
        local_node_name: impl Into<String>,
        providers: Vec<ProviderEntry>,
        directory: Arc<PeerDirectory>,
        policy_chain: Arc<PolicyChain>,
        peer_rpc: Arc<dyn PeerRpc>,
        max_retries: u32,
    ) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            local_node_name: local_node_name.into(),
            providers,
            directory,
            policy_chain,
            peer_rpc,
            max_retries,
        }
    }

    /// Picks the local provider with the greatest headroom, lexicographic on
    /// `(available.cpu, available.memory, available.gpu)`.
    async fn best_local_provider(&self, request: &DeployRequest) -> Option<(Arc<dyn ProviderAdapter>, Arc<SessionManager>)> {
        let mut best: Option<(Arc<dyn ProviderAdapter>, Arc<SessionManager>, crate::model::ResourceInfo)> = None;
        for entry in &self.providers {
            if !entry.adapter.tags().satisfies(&request.required_tags) {
                continue;
            }
            let Ok(available) = entry.adapter.get_available(None).await else {
                continue;
            };
            if !available.covers(&request.resources) {
                continue;
            }
            let better = match &best {
                None => true,
                Some((_, _, best_avail)) => {
                    (available.cpu_mc, available.memory_bytes, available.gpu_count)
                        > (best_avail.cpu_mc, best_avail.memory_bytes, best_avail.gpu_count)
                }
            };
            if better {
                best = Some((entry.adapter.clone(), entry.sessions.clone(), available));
            }
        }
        best.map(|(a, s, _)| (a, s))
    }

    pub async fn schedule(&self, request: DeployRequest) -> SchedulingOutcome {
        let mut audit = AuditTrail::new();
        let instance_id = format!("inst-{}", Uuid::new_v4());

        // Stage 1: local placement.
        if let Some((provider, sessions)) = self.best_local_provider(&request).await {
            let deploy_result = match sessions.authorize().await {
                Ok(provider_id) => provider.deploy(&provider_id, &instance_id, &request.image, &request.env, request.resources).await,
                Err(e) => Err(e),
            };
            match deploy_result {
                Ok(()) => {
                    return SchedulingOutcome {
                        target: Ok(PlacementTarget {
                            node_id: self.local_node_id.clone(),
                            provider_id: provider.id().to_string(),
                            instance_id,
                        }),
                        audit_trail: audit,
                    };
                }
                Err(e) if e.is_capacity_shortage() => {
                    audit.push(AuditEvent::LocalInsufficient);
                }
                Err(e) => {
                    audit.push(AuditEvent::LocalFailed { reason: e.to_string() });
                    return SchedulingOutcome {
                        target: Err(e),
                        audit_trail: audit,
                    };
                }
            }
        } else {
            audit.push(AuditEvent::LocalInsufficient);
        }

        // Stage 2: peer delegation with policy (two-phase).
        let candidates = self.directory.find_available_nodes(request.resources, request.required_tags).await;
        for candidate in candidates {
            let mut attempts = 0;
            loop {
                attempts += 1;
                let propose = self.peer_rpc.propose_schedule(&candidate.scheduler_address, request.resources).await;
                let outcome = match propose {
                    Ok(o) => o,
                    Err(e) => {
                        audit.push(AuditEvent::CommitFailed {
                            node_id: candidate.node_id.clone(),
                            reason: e.to_string(),
                        });
                        break;
                    }
                };

                let proposal_wire = match outcome {
                    ProposeOutcome::NoScheduler => {
                        audit.push(AuditEvent::NoScheduler { node_id: candidate.node_id.clone() });
                        if let Some(target) = self.engine_select_fallback(&candidate, &request, &mut audit).await {
                            return SchedulingOutcome {
                                target: Ok(target),
                                audit_trail: audit,
                            };
                        }
                        break;
                    }
                    ProposeOutcome::Proposal(p) => p,
                };

                audit.push(AuditEvent::Propose { node_id: candidate.node_id.clone() });
                let proposal: Proposal = proposal_wire.clone().into();
                let verdict = self.policy_chain.evaluate(&request, &proposal);

                match verdict {
                    PolicyVerdict::Accept => {
                        audit.push(AuditEvent::PolicyAccept { node_id: candidate.node_id.clone() });
                        let commit_req = CommitRequest {
                            runtime_env: request.runtime_env.clone(),
                            image: request.image.clone(),
                            env: request.env.clone(),
                            resources: request.resources,
                            provider_id: proposal_wire.provider_id.clone(),
                            instance_id: instance_id.clone(),
                            upstream_zmq_address: None,
                            upstream_store_address: None,
                            upstream_logger_address: None,
                        };
                        match self.peer_rpc.commit_schedule(&candidate.scheduler_address, commit_req).await {
                            Ok(resp) if resp.success => {
                                audit.push(AuditEvent::CommitSuccess {
                                    node_id: candidate.node_id.clone(),
                                    provider_id: resp.provider_id.clone(),
                                });
                                return SchedulingOutcome {
                                    target: Ok(PlacementTarget {
                                        node_id: candidate.node_id.clone(),
                                        provider_id: resp.provider_id,
                                        instance_id,
                                    }),
                                    audit_trail: audit,
                                };
                            }
                            Ok(resp) => {
                                audit.push(AuditEvent::CommitFailed {
                                    node_id: candidate.node_id.clone(),
                                    reason: resp.error.unwrap_or_else(|| "commit failed".to_string()),
                                });
                                break;
                            }
                            Err(e) => {
                                audit.push(AuditEvent::CommitFailed {
                                    node_id: candidate.node_id.clone(),
                                    reason: e.to_string(),
                                });
                                break;
                            }
                        }
                    }
                    PolicyVerdict::Reject { retry, reason, policy_name } => {
                        audit.push(AuditEvent::PolicyReject {
                            node_id: candidate.node_id.clone(),
                            policy_name,
                            reason,
                        });
                        if retry && attempts < self.max_retries {
                            continue;
                        }
                        break;
                    }
                }
            }
        }

        // Stage 4: exhausted.
        warn!("scheduler: exhausted all candidates for request on node {}", self.local_node_id);
        SchedulingOutcome {
            target: Err(OrchestratorError::NoCapacity),
            audit_trail: audit,
        }
    }

    /// Stage 3: peer has no autonomous scheduler. Pick the best remote provider locally
    /// using the same tag + headroom rule, then commit directly to it.
    async fn engine_select_fallback(
        &self,
        candidate: &crate::model::PeerNode,
        request: &DeployRequest,
        audit: &mut AuditTrail,
    ) -> Option<PlacementTarget> {
        let listing = self
            .peer_rpc
            .list_remote_providers(&candidate.scheduler_address, true)
            .await
            .ok()?;
        if !listing.success {
            return None;
        }

        let mut best: Option<&crate::rpc::RemoteProviderSummary> = None;
        for provider in &listing.providers {
            if !provider.tags.satisfies(&request.required_tags) || !provider.available.covers(&request.resources) {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    (provider.available.cpu_mc, provider.available.memory_bytes, provider.available.gpu_count)
                        > (b.available.cpu_mc, b.available.memory_bytes, b.available.gpu_count)
                }
            };
            if better {
                best = Some(provider);
            }
        }

        let chosen = best?;
        let commit_req = CommitRequest {
            runtime_env: request.runtime_env.clone(),
            image: request.image.clone(),
            env: request.env.clone(),
            resources: request.resources,
            provider_id: chosen.provider_id.clone(),
            instance_id: format!("inst-{}", Uuid::new_v4()),
            upstream_zmq_address: None,
            upstream_store_address: None,
            upstream_logger_address: None,
        };
        let instance_id = commit_req.instance_id.clone();
        let resp = self
            .peer_rpc
            .commit_schedule(&candidate.scheduler_address, commit_req)
            .await
            .ok()?;
        if !resp.success {
            return None;
        }
        audit.push(AuditEvent::EngineSelect {
            node_id: candidate.node_id.clone(),
            provider_id: resp.provider_id.clone(),
        });
        info!(
            "scheduler: engine-select chose provider {} on node {} for {}",
            resp.provider_id, candidate.node_id, self.local_node_name
        );
        Some(PlacementTarget {
            node_id: candidate.node_id.clone(),
            provider_id: resp.provider_id,
            instance_id,
        })
    }
}
