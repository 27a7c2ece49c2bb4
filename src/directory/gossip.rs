//! The gossip ticker and TTL sweeper: two independent long-lived tasks with cooperative
//! cancellation via a shared stop signal. Neither leaks mutable state beyond the directory
//! they both operate on.

use super::PeerDirectory;
use crate::rpc::{GossipRequest, PeerRpc};
use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Duration, Instant};

pub const GOSSIP_ROUND_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub period_s: u64,
    pub fanout: usize,
    pub jitter: f64,
    pub seed_addresses: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            period_s: 30,
            fanout: 3,
            jitter: 0.2,
            seed_addresses: Vec::new(),
        }
    }
}

fn jittered_period(base_s: u64, jitter: f64) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base_s as f64 * factor).max(1.0))
}

/// Push-pull gossip: each tick, contact `fanout` peers at random from the online set
/// (all of them if fewer are known) plus, until at least one peer has ever responded,
/// the bootstrap seed addresses.
pub async fn run_gossip_ticker(directory: Arc<PeerDirectory>, peer_rpc: Arc<dyn PeerRpc>, config: GossipConfig, mut stop: watch::Receiver<bool>) {
    let mut ever_responded = false;
    loop {
        let delay = jittered_period(config.period_s, config.jitter);
        let deadline = Instant::now() + delay;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
        if *stop.borrow() {
            break;
        }

        let mut targets = select_fanout_targets(&directory, config.fanout).await;
        if !ever_responded {
            for seed in &config.seed_addresses {
                if !targets.contains(seed) {
                    targets.push(seed.clone());
                }
            }
        }

        for address in targets {
            match gossip_round(&directory, peer_rpc.as_ref(), &address).await {
                Ok(()) => ever_responded = true,
                Err(e) => debug!("gossip: round with {} failed: {}", address, e),
            }
        }
    }
}

async fn select_fanout_targets(directory: &PeerDirectory, fanout: usize) -> Vec<String> {
    let peers = directory.known_peers().await;
    let mut addresses: Vec<String> = peers
        .into_iter()
        .filter(|p| p.status == crate::model::PeerStatus::Online)
        .map(|p| p.address)
        .collect();
    let mut rng = rand::thread_rng();
    addresses.shuffle(&mut rng);
    addresses.truncate(fanout);
    addresses
}

async fn gossip_round(directory: &Arc<PeerDirectory>, peer_rpc: &dyn PeerRpc, address: &str) -> anyhow::Result<()> {
    let sender_node = directory.local_snapshot().await;
    let known_digest = directory.digest().await;

    let response = timeout(
        GOSSIP_ROUND_DEADLINE,
        peer_rpc.gossip(address, GossipRequest { sender_node, known_digest }),
    )
    .await??;

    directory.integrate(response.sender_node_latest, address).await;
    for update in response.updates {
        directory.integrate(update, address).await;
    }
    Ok(())
}

/// TTL sweeper: periodically prunes nodes whose `last_seen` exceeds `node_ttl`.
pub async fn run_ttl_sweeper(directory: Arc<PeerDirectory>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut tick = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let pruned = directory.prune_stale().await;
                if !pruned.is_empty() {
                    warn!("ttl sweeper: pruned {} stale node(s)", pruned.len());
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
}
