//! YAML configuration loading (§10.3). A missing or malformed config file is a Fatal
//! configuration error, surfaced before any background task starts.

use crate::error::OrchestratorError;
use crate::model::ResourceInfo;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

fn default_gossip_period_s() -> u64 {
    30
}
fn default_fanout() -> usize {
    3
}
fn default_node_ttl_s() -> i64 {
    180
}
fn default_jitter() -> f64 {
    0.2
}
fn default_session_ttl_s() -> i64 {
    90
}
fn default_session_check_interval_s() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalNodeConfig {
    pub id: String,
    pub name: String,
    pub address: String,
    pub scheduler_address: String,
    #[serde(default)]
    pub domain_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GossipConfigOpts {
    #[serde(default = "default_gossip_period_s")]
    pub period_s: u64,
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    #[serde(default = "default_node_ttl_s")]
    pub node_ttl_s: i64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub seed_addresses: Vec<String>,
}

impl Default for GossipConfigOpts {
    fn default() -> Self {
        Self {
            period_s: default_gossip_period_s(),
            fanout: default_fanout(),
            node_ttl_s: default_node_ttl_s(),
            jitter: default_jitter(),
            seed_addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfigOpts {
    #[serde(default = "default_session_ttl_s")]
    pub ttl_s: i64,
    #[serde(default = "default_session_check_interval_s")]
    pub check_interval_s: u64,
}

impl Default for SessionConfigOpts {
    fn default() -> Self {
        Self {
            ttl_s: default_session_ttl_s(),
            check_interval_s: default_session_check_interval_s(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfigOpts {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub local_error_classifier_patterns: Vec<String>,
}

impl Default for SchedulerConfigOpts {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            local_error_classifier_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    SafetyMargin {
        #[serde(default = "default_true")]
        enable: bool,
        #[serde(default)]
        r_cpu: Option<f64>,
        #[serde(default)]
        r_memory: Option<f64>,
        #[serde(default)]
        r_gpu: Option<f64>,
    },
    NodeBlacklist {
        #[serde(default = "default_true")]
        enable: bool,
        #[serde(default)]
        blocked: HashSet<String>,
    },
    ProviderBlacklist {
        #[serde(default = "default_true")]
        enable: bool,
        #[serde(default)]
        blocked: HashSet<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    pub total_cpu: String,
    pub total_memory: String,
    #[serde(default)]
    pub total_gpu: i64,
    #[serde(default)]
    pub has_metrics_service: bool,
    #[serde(default)]
    pub has_gpu_device_plugin: bool,
}

impl ProviderConfig {
    pub fn total_resources(&self) -> Result<ResourceInfo, OrchestratorError> {
        let cpu_mc = crate::utils::resource_quantity::parse_cpu_str(&self.total_cpu)
            .ok_or_else(|| OrchestratorError::FatalConfig(format!("provider {}: invalid total_cpu {:?}", self.id, self.total_cpu)))?;
        let memory_bytes = crate::utils::resource_quantity::parse_memory_str(&self.total_memory)
            .ok_or_else(|| OrchestratorError::FatalConfig(format!("provider {}: invalid total_memory {:?}", self.id, self.total_memory)))?;
        Ok(ResourceInfo::new(cpu_mc, memory_bytes, self.total_gpu))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub local_node: LocalNodeConfig,
    #[serde(default)]
    pub gossip: GossipConfigOpts,
    #[serde(default)]
    pub session: SessionConfigOpts,
    #[serde(default)]
    pub scheduler: SchedulerConfigOpts,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, OrchestratorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::FatalConfig(format!("reading {}: {}", path.display(), e)))?;
        let config: Config = serde_yaml::from_str(&text)
            .map_err(|e| OrchestratorError::FatalConfig(format!("parsing {}: {}", path.display(), e)))?;
        if config.providers.is_empty() {
            return Err(OrchestratorError::FatalConfig("no providers configured".to_string()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_minimal_config_with_defaults_filled_in() {
        let yaml = r#"
local_node:
  id: node-a
  name: node-a
  address: "10.0.0.1:7000"
  scheduler_address: "10.0.0.1:7100"
  domain_id: dom-a
providers:
  - id: docker-1
    name: local-docker
    type: docker
    address: "unix:///var/run/docker.sock"
    total_cpu: "4000m"
    total_memory: "8Gi"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", yaml).unwrap();
        let config = Config::load(file.path()).expect("valid config loads");
        assert_eq!(config.gossip.period_s, 30);
        assert_eq!(config.gossip.fanout, 3);
        assert_eq!(config.session.ttl_s, 90);
        assert_eq!(config.providers.len(), 1);
        let total = config.providers[0].total_resources().unwrap();
        assert_eq!(total.cpu_mc, 4000);
        assert_eq!(total.memory_bytes, 8 * 1024 * 1024 * 1024);
    }

    #[test]
    fn missing_file_is_a_fatal_configuration_error() {
        let err = Config::load("/nonexistent/path/does-not-exist.yaml").unwrap_err();
        assert!(matches!(err, OrchestratorError::FatalConfig(_)));
    }

    #[test]
    fn config_with_no_providers_is_fatal() {
        let yaml = r#"
local_node:
  id: node-a
  name: node-a
  address: "10.0.0.1:7000"
  scheduler_address: "10.0.0.1:7100"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", yaml).unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, OrchestratorError::FatalConfig(_)));
    }
}
