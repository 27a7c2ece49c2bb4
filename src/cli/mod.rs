use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Cross-domain compute-resource orchestrator", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator daemon: loads config, connects providers, starts the gossip
    /// ticker, TTL sweeper and session reapers, and serves until interrupted.
    Serve {
        /// Orchestrator configuration file path
        #[arg(short, long, value_name = "PATH")]
        config: String,
    },
    /// Deploy a workload through the local node's scheduler.
    Deploy {
        #[arg(short, long, value_name = "PATH")]
        config: String,
        /// Runtime environment name (e.g. docker, kubernetes)
        #[arg(long = "runtime-env", value_name = "NAME")]
        runtime_env: String,
        /// Container image reference
        #[arg(long)]
        image: String,
        /// Requested CPU in millicores
        #[arg(long = "cpu-mc", value_name = "MILLICORES")]
        cpu_mc: i64,
        /// Requested memory in bytes
        #[arg(long = "memory-bytes", value_name = "BYTES")]
        memory_bytes: i64,
        /// Requested GPU count
        #[arg(long = "gpu-count", value_name = "COUNT", default_value_t = 0)]
        gpu_count: i64,
    },
    /// Release a previously deployed workload by its opaque instance handle.
    Undeploy {
        #[arg(short, long, value_name = "PATH")]
        config: String,
        /// Opaque instance handle returned by `deploy`
        #[arg(long)]
        handle: String,
    },
    /// List every provider known to the local node.
    ListProviders {
        #[arg(short, long, value_name = "PATH")]
        config: String,
    },
    /// Print the aggregate view across the local node and its known peers.
    AggregateView {
        #[arg(short, long, value_name = "PATH")]
        config: String,
    },
    /// Send a liveness pulse for one provider's session, re-establishing it if the reaper
    /// has not yet cleared an expired one.
    HealthCheck {
        #[arg(short, long, value_name = "PATH")]
        config: String,
        /// Provider id to check, as configured under `providers:` in the config file
        #[arg(long = "provider-id", value_name = "ID")]
        provider_id: String,
    },
}
