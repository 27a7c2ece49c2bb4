//! Core data model: resource accounting, provider and peer records, instances and sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `(cpu_mC, memory_bytes, gpu_count)`. CPU is expressed in millicores (1 core = 1000).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub cpu_mc: i64,
    pub memory_bytes: i64,
    pub gpu_count: i64,
}

impl ResourceInfo {
    pub fn new(cpu_mc: i64, memory_bytes: i64, gpu_count: i64) -> Self {
        Self {
            cpu_mc,
            memory_bytes,
            gpu_count,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Componentwise `self >= other`.
    pub fn covers(&self, other: &ResourceInfo) -> bool {
        self.cpu_mc >= other.cpu_mc
            && self.memory_bytes >= other.memory_bytes
            && self.gpu_count >= other.gpu_count
    }

    pub fn saturating_add(&self, other: &ResourceInfo) -> ResourceInfo {
        ResourceInfo {
            cpu_mc: self.cpu_mc.saturating_add(other.cpu_mc),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            gpu_count: self.gpu_count.saturating_add(other.gpu_count),
        }
    }

    pub fn saturating_sub(&self, other: &ResourceInfo) -> ResourceInfo {
        ResourceInfo {
            cpu_mc: (self.cpu_mc - other.cpu_mc).max(0),
            memory_bytes: (self.memory_bytes - other.memory_bytes).max(0),
            gpu_count: (self.gpu_count - other.gpu_count).max(0),
        }
    }
}

/// `{total, used, available}`, with `available = total - used` and `0 <= used <= total`
/// on every component, maintained as an invariant by the mutating methods below.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub total: ResourceInfo,
    pub used: ResourceInfo,
    pub available: ResourceInfo,
}

impl Capacity {
    pub fn from_total(total: ResourceInfo) -> Self {
        Self {
            total,
            used: ResourceInfo::zero(),
            available: total,
        }
    }

    /// Reserve `request` against `available`. Caller must have already checked
    /// `available.covers(request)`; this recomputes both fields from the invariant.
    pub fn reserve(&mut self, request: &ResourceInfo) {
        self.used = self.used.saturating_add(request);
        self.available = self.total.saturating_sub(&self.used);
    }

    /// Release a previously reserved request back into `available`.
    pub fn release(&mut self, request: &ResourceInfo) {
        self.used = self.used.saturating_sub(request);
        self.available = self.total.saturating_sub(&self.used);
    }
}

/// Boolean capabilities a backend can actually schedule against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTags {
    pub cpu: bool,
    pub memory: bool,
    pub gpu: bool,
    pub camera: bool,
}

impl ResourceTags {
    /// `self` has every capability `required` asks for.
    pub fn satisfies(&self, required: &ResourceTags) -> bool {
        (!required.cpu || self.cpu)
            && (!required.memory || self.memory)
            && (!required.gpu || self.gpu)
            && (!required.camera || self.camera)
    }

    pub fn or(&self, other: &ResourceTags) -> ResourceTags {
        ResourceTags {
            cpu: self.cpu || other.cpu,
            memory: self.memory || other.memory,
            gpu: self.gpu || other.gpu,
            camera: self.camera || other.camera,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Disconnected,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Docker,
    Kubernetes,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Docker => write!(f, "docker"),
            ProviderKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Snapshot of a provider as reported to callers (scheduler, orchestration API, gossip).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub address: String,
    pub status: ProviderStatus,
    pub capacity: Capacity,
    pub tags: ResourceTags,
    #[serde(default)]
    pub current_session_id: Option<String>,
}

/// A remote node known via gossip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerNode {
    pub node_id: String,
    pub name: String,
    pub address: String,
    pub scheduler_address: String,
    pub domain_id: String,
    pub capacity: Capacity,
    pub tags: ResourceTags,
    pub status: PeerStatus,
    pub last_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub discovered_at: DateTime<Utc>,
    pub source_peer: String,
    /// Monotonic per-node counter, advanced only by the owning node.
    pub version: u64,
    pub gossip_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Online,
    Offline,
    Error,
}

/// Componentwise sum of `{local_node} ∪ known_peers` restricted to online, non-stale nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateView {
    pub capacity: Capacity,
    pub tags: ResourceTags,
    pub counts_by_status: HashMap<String, u64>,
    pub node_count: u64,
}

/// One deployed workload, owned by the provider that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Opaque, stable within the owning session; the id the caller used to Deploy.
    pub instance_id: String,
    /// Backend-legal normalized name actually passed to the backend.
    pub normalized_id: String,
    pub provider_id: String,
    pub request: ResourceInfo,
    pub image: String,
    pub created_at: DateTime<Utc>,
}

/// `{provider_id, created_at, last_health_at}`; live while `now - last_health_at <= session_ttl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub provider_id: String,
    pub created_at: DateTime<Utc>,
    pub last_health_at: DateTime<Utc>,
}

impl Session {
    pub fn new(provider_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            provider_id: provider_id.into(),
            created_at: now,
            last_health_at: now,
        }
    }

    pub fn is_live(&self, session_ttl: chrono::Duration) -> bool {
        Utc::now() - self.last_health_at <= session_ttl
    }
}

/// Inbound placement request: the unit the scheduler reasons about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub runtime_env: String,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub resources: ResourceInfo,
    #[serde(default)]
    pub required_tags: ResourceTags,
}

/// `{node_id, provider_id, instance_id}`, base64-opaque to external callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub node_id: String,
    pub provider_id: String,
    pub instance_id: String,
}

impl InstanceHandle {
    pub fn encode(&self) -> String {
        let raw = format!("{}\0{}\0{}", self.node_id, self.provider_id, self.instance_id);
        data_encoding_base64(raw.as_bytes())
    }

    pub fn decode(handle: &str) -> Option<InstanceHandle> {
        let raw = data_decoding_base64(handle)?;
        let text = String::from_utf8(raw).ok()?;
        let mut parts = text.splitn(3, '\0');
        Some(InstanceHandle {
            node_id: parts.next()?.to_string(),
            provider_id: parts.next()?.to_string(),
            instance_id: parts.next()?.to_string(),
        })
    }
}

// Minimal base64 (standard alphabet, padded) so the handle encoding has no extra
// dependency beyond what the rest of the crate already carries.
fn data_encoding_base64(input: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((input.len() + 2) / 3 * 4);
    for chunk in input.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let n = ((b0 as u32) << 16) | ((b1 as u32) << 8) | (b2 as u32);
        out.push(ALPHABET[((n >> 18) & 0x3f) as usize] as char);
        out.push(ALPHABET[((n >> 12) & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[((n >> 6) & 0x3f) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(n & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

fn data_decoding_base64(input: &str) -> Option<Vec<u8>> {
    fn val(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some((c - b'A') as u32),
            b'a'..=b'z' => Some((c - b'a' + 26) as u32),
            b'0'..=b'9' => Some((c - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let input = input.trim_end_matches('=');
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 4 * 3 + 3);
    for chunk in bytes.chunks(4) {
        let vals: Vec<u32> = chunk.iter().filter_map(|&c| val(c)).collect();
        if vals.len() != chunk.len() {
            return None;
        }
        let n = vals.iter().enumerate().fold(0u32, |acc, (i, v)| acc | (v << (18 - 6 * i)));
        out.push((n >> 16) as u8);
        if vals.len() > 2 {
            out.push((n >> 8) as u8);
        }
        if vals.len() > 3 {
            out.push(n as u8);
        }
    }
    Some(out)
}
