use meshowler::config::Config;
use meshowler::error::OrchestratorError;
use meshowler::model::{DeployRequest, InstanceHandle, ResourceInfo};
use meshowler::orchestrator::build::node_from_config;
use std::io::Write;

fn write_config(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", yaml).unwrap();
    file
}

const SINGLE_DOCKER_NODE: &str = r#"
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
    total_memory: "4Gi"
"#;

#[tokio::test]
async fn deploy_list_and_undeploy_round_trip_through_config() {
    let file = write_config(SINGLE_DOCKER_NODE);
    let config = Config::load(file.path()).unwrap();
    let (node, _registry, _gossip, _sweep, _session) = node_from_config(&config).await.unwrap();

    let providers_before = node.list_providers().await;
    assert_eq!(providers_before.len(), 1);
    assert_eq!(providers_before[0].capacity.available.cpu_mc, 4000);

    let request = DeployRequest {
        runtime_env: "docker".to_string(),
        image: "app:latest".to_string(),
        env: Default::default(),
        resources: ResourceInfo::new(500, 256 * 1024 * 1024, 0),
        required_tags: Default::default(),
    };
    let (handle, outcome) = node.deploy(request).await.unwrap();
    assert!(outcome.target.is_ok());
    let decoded = InstanceHandle::decode(&handle).unwrap();
    assert_eq!(decoded.node_id, "node-a");

    let providers_after = node.list_providers().await;
    assert_eq!(providers_after[0].capacity.available.cpu_mc, 3500);

    node.undeploy(&handle).await.unwrap();
    let providers_restored = node.list_providers().await;
    assert_eq!(providers_restored[0].capacity.available.cpu_mc, 4000);
}

#[tokio::test]
async fn aggregate_view_reflects_the_single_configured_node() {
    let file = write_config(SINGLE_DOCKER_NODE);
    let config = Config::load(file.path()).unwrap();
    let (node, _registry, _gossip, _sweep, _session) = node_from_config(&config).await.unwrap();

    let view = node.aggregate_view().await;
    assert_eq!(view.node_count, 1);
    assert_eq!(view.capacity.total.cpu_mc, 4000);
}

#[tokio::test]
async fn deploy_over_capacity_returns_no_capacity_with_no_peers_configured() {
    let file = write_config(SINGLE_DOCKER_NODE);
    let config = Config::load(file.path()).unwrap();
    let (node, _registry, _gossip, _sweep, _session) = node_from_config(&config).await.unwrap();

    let request = DeployRequest {
        runtime_env: "docker".to_string(),
        image: "app:latest".to_string(),
        env: Default::default(),
        resources: ResourceInfo::new(5000, 256 * 1024 * 1024, 0),
        required_tags: Default::default(),
    };
    let outcome = node.deploy(request).await;
    assert!(outcome.is_err());
}

const SINGLE_DOCKER_NODE_SHORT_TTL: &str = r#"
local_node:
  id: node-a
  name: node-a
  address: "10.0.0.1:7000"
  scheduler_address: "10.0.0.1:7100"
  domain_id: dom-a
session:
  ttl_s: 1
  check_interval_s: 1
providers:
  - id: docker-1
    name: local-docker
    type: docker
    address: "unix:///var/run/docker.sock"
    total_cpu: "4000m"
    total_memory: "4Gi"
"#;

/// Spec scenario 6 at the orchestration API: a session that lapses its TTL refuses further
/// Deploys with Auth, and a HealthCheck against the still-connected provider re-establishes
/// it without a fresh Connect.
#[tokio::test]
async fn health_check_after_session_expiry_reestablishes_session_for_deploy() {
    let file = write_config(SINGLE_DOCKER_NODE_SHORT_TTL);
    let config = Config::load(file.path()).unwrap();
    let (node, _registry, _gossip, _sweep, _session) = node_from_config(&config).await.unwrap();

    let request = DeployRequest {
        runtime_env: "docker".to_string(),
        image: "app:latest".to_string(),
        env: Default::default(),
        resources: ResourceInfo::new(100, 1024 * 1024, 0),
        required_tags: Default::default(),
    };

    let (_handle, outcome) = node.deploy(request.clone()).await.unwrap();
    assert!(outcome.target.is_ok());

    // Let the session TTL lapse in real time; no reaper is running in this test, so the
    // adapter stays connected and only the session manager's own clock has gone stale.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

    let expired = node.deploy(request.clone()).await;
    assert!(matches!(expired, Err(OrchestratorError::Auth(_))));

    node.health_check("docker-1").await.unwrap();

    let (_handle2, outcome2) = node.deploy(request).await.unwrap();
    assert!(outcome2.target.is_ok());
}
