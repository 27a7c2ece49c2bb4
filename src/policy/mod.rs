//! Policy chain: ordered accept/reject filters evaluated against a peer's proposal before
//! the scheduler commits to it.

use crate::model::{DeployRequest, ResourceInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A non-binding candidate placement returned by a peer before commit.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub node_id: String,
    pub provider_id: String,
    pub available: ResourceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Accept,
    Reject { retry: bool, reason: String, policy_name: String },
}

/// Policies are stateless; parameters are captured at construction.
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, request: &DeployRequest, proposal: &Proposal) -> PolicyVerdict;
}

/// Reject unless `proposal.available >= request.resources * margin` on every dimension.
/// Non-retryable: the same proposal will not satisfy the margin on a re-ask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyMarginPolicy {
    pub r_cpu: f64,
    pub r_memory: f64,
    pub r_gpu: f64,
}

impl Default for SafetyMarginPolicy {
    fn default() -> Self {
        Self {
            r_cpu: 1.2,
            r_memory: 1.2,
            r_gpu: 1.0,
        }
    }
}

impl Policy for SafetyMarginPolicy {
    fn name(&self) -> &str {
        "safety_margin"
    }

    fn evaluate(&self, request: &DeployRequest, proposal: &Proposal) -> PolicyVerdict {
        let need_cpu = (request.resources.cpu_mc as f64) * self.r_cpu;
        let need_mem = (request.resources.memory_bytes as f64) * self.r_memory;
        let need_gpu = (request.resources.gpu_count as f64) * self.r_gpu;

        let ok = (proposal.available.cpu_mc as f64) >= need_cpu
            && (proposal.available.memory_bytes as f64) >= need_mem
            && (proposal.available.gpu_count as f64) >= need_gpu;

        if ok {
            PolicyVerdict::Accept
        } else {
            // retry=true: the same candidate may be re-asked for a fresh proposal (its
            // available capacity can change between propose calls). This policy never
            // retries against the *same* proposal values, only against a new one.
            PolicyVerdict::Reject {
                retry: true,
                reason: format!(
                    "proposal.available {:?} does not clear margin (cpu x{}, mem x{}, gpu x{}) of request {:?}",
                    proposal.available, self.r_cpu, self.r_memory, self.r_gpu, request.resources
                ),
                policy_name: self.name().to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeBlacklistPolicy {
    pub blocked: HashSet<String>,
}

impl Policy for NodeBlacklistPolicy {
    fn name(&self) -> &str {
        "node_blacklist"
    }

    fn evaluate(&self, _request: &DeployRequest, proposal: &Proposal) -> PolicyVerdict {
        if self.blocked.contains(&proposal.node_id) {
            PolicyVerdict::Reject {
                retry: false,
                reason: format!("node {} is blacklisted", proposal.node_id),
                policy_name: self.name().to_string(),
            }
        } else {
            PolicyVerdict::Accept
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderBlacklistPolicy {
    pub blocked: HashSet<String>,
}

impl Policy for ProviderBlacklistPolicy {
    fn name(&self) -> &str {
        "provider_blacklist"
    }

    fn evaluate(&self, _request: &DeployRequest, proposal: &Proposal) -> PolicyVerdict {
        if self.blocked.contains(&proposal.provider_id) {
            PolicyVerdict::Reject {
                retry: false,
                reason: format!("provider {} is blacklisted", proposal.provider_id),
                policy_name: self.name().to_string(),
            }
        } else {
            PolicyVerdict::Accept
        }
    }
}

/// Evaluates policies in registration order; the first reject short-circuits.
pub struct PolicyChain {
    policies: Vec<Box<dyn Policy>>,
}

impl PolicyChain {
    pub fn new(policies: Vec<Box<dyn Policy>>) -> Self {
        Self { policies }
    }

    pub fn evaluate(&self, request: &DeployRequest, proposal: &Proposal) -> PolicyVerdict {
        for policy in &self.policies {
            let verdict = policy.evaluate(request, proposal);
            if matches!(verdict, PolicyVerdict::Reject { .. }) {
                return verdict;
            }
        }
        PolicyVerdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cpu: i64, mem: i64, gpu: i64) -> DeployRequest {
        DeployRequest {
            runtime_env: "default".to_string(),
            image: "app:latest".to_string(),
            env: Default::default(),
            resources: ResourceInfo::new(cpu, mem, gpu),
            required_tags: Default::default(),
        }
    }

    fn proposal(cpu: i64, mem: i64, gpu: i64) -> Proposal {
        Proposal {
            node_id: "n2".to_string(),
            provider_id: "p2".to_string(),
            available: ResourceInfo::new(cpu, mem, gpu),
        }
    }

    #[test]
    fn safety_margin_accepts_when_headroom_clears() {
        let policy = SafetyMarginPolicy::default();
        let req = request(2000, 1024 * 1024 * 1024, 1);
        let prop = proposal(3000, 3 * 1024 * 1024 * 1024, 1);
        assert_eq!(policy.evaluate(&req, &prop), PolicyVerdict::Accept);
    }

    #[test]
    fn safety_margin_rejects_when_headroom_is_short() {
        let policy = SafetyMarginPolicy::default();
        let req = request(2000, 1024 * 1024 * 1024, 0);
        let prop = proposal(2300, 2 * 1024 * 1024 * 1024, 0);
        let verdict = policy.evaluate(&req, &prop);
        assert!(matches!(verdict, PolicyVerdict::Reject { retry: true, .. }));
    }

    #[test]
    fn chain_short_circuits_on_first_reject() {
        let mut blocked = HashSet::new();
        blocked.insert("n2".to_string());
        let chain = PolicyChain::new(vec![
            Box::new(NodeBlacklistPolicy { blocked }),
            Box::new(SafetyMarginPolicy::default()),
        ]);
        let req = request(100, 100, 0);
        let prop = proposal(10_000, 10_000, 0);
        let verdict = chain.evaluate(&req, &prop);
        assert!(matches!(verdict, PolicyVerdict::Reject { policy_name, .. } if policy_name == "node_blacklist"));
    }

    #[test]
    fn chain_accepts_when_all_policies_accept() {
        let chain = PolicyChain::new(vec![
            Box::new(NodeBlacklistPolicy::default()),
            Box::new(ProviderBlacklistPolicy::default()),
            Box::new(SafetyMarginPolicy::default()),
        ]);
        let req = request(100, 100, 0);
        let prop = proposal(10_000, 10_000, 0);
        assert_eq!(chain.evaluate(&req, &prop), PolicyVerdict::Accept);
    }
}
