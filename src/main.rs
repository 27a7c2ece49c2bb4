use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use log::info;

use meshowler::cli::{Args, Commands};
use meshowler::config::Config;
use meshowler::model::{DeployRequest, ResourceInfo};
use meshowler::orchestrator::build::node_from_config;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Commands::Serve { config } => run_serve(config).await?,
        Commands::Deploy {
            config,
            runtime_env,
            image,
            cpu_mc,
            memory_bytes,
            gpu_count,
        } => run_deploy(config, runtime_env, image, cpu_mc, memory_bytes, gpu_count).await?,
        Commands::Undeploy { config, handle } => run_undeploy(config, handle).await?,
        Commands::ListProviders { config } => run_list_providers(config).await?,
        Commands::AggregateView { config } => run_aggregate_view(config).await?,
        Commands::HealthCheck { config, provider_id } => run_health_check(config, provider_id).await?,
    }

    Ok(())
}

async fn run_serve(config_path: String) -> Result<()> {
    println!("{}", "meshowler - compute orchestrator node".bright_cyan().bold());
    println!("{}", "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".bright_cyan());

    let config = Config::load(&config_path)?;
    info!("starting node {}", config.local_node.id);

    let (node, _registry, gossip, sweep_period, session_check_interval) = node_from_config(&config).await?;
    println!("✅ node {} online with {} provider(s)", config.local_node.id.bright_green(), config.providers.len());

    let peer_rpc = std::sync::Arc::new(meshowler::rpc::loopback::LoopbackPeerRpc::new(_registry.clone()));
    node.spawn_background_tasks(peer_rpc, gossip, sweep_period, session_check_interval).await;

    println!("🔁 gossip ticker, TTL sweeper and session reaper(s) running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    println!("\n🛑 shutting down node {}", config.local_node.id);
    node.shutdown();
    Ok(())
}

async fn run_deploy(config_path: String, runtime_env: String, image: String, cpu_mc: i64, memory_bytes: i64, gpu_count: i64) -> Result<()> {
    let config = Config::load(&config_path)?;
    let (node, _registry, _gossip, _sweep, _session) = node_from_config(&config).await?;

    let request = DeployRequest {
        runtime_env,
        image,
        env: Default::default(),
        resources: ResourceInfo::new(cpu_mc, memory_bytes, gpu_count),
        required_tags: Default::default(),
    };

    print!("🚀 deploying... ");
    match node.deploy(request).await {
        Ok((handle, outcome)) => {
            println!("{}", "✅ done".bright_green());
            println!("   handle: {}", handle.bright_cyan());
            println!("   audit trail: {} event(s)", outcome.audit_trail.events.len());
            Ok(())
        }
        Err(e) => {
            println!("{}", "❌ failed".bright_red());
            Err(e.into())
        }
    }
}

async fn run_undeploy(config_path: String, handle: String) -> Result<()> {
    let config = Config::load(&config_path)?;
    let (node, _registry, _gossip, _sweep, _session) = node_from_config(&config).await?;

    print!("🧹 undeploying {}... ", handle);
    match node.undeploy(&handle).await {
        Ok(()) => {
            println!("{}", "✅ done".bright_green());
            Ok(())
        }
        Err(e) => {
            println!("{}", "❌ failed".bright_red());
            Err(e.into())
        }
    }
}

async fn run_list_providers(config_path: String) -> Result<()> {
    let config = Config::load(&config_path)?;
    let (node, _registry, _gossip, _sweep, _session) = node_from_config(&config).await?;

    let providers = node.list_providers().await;
    println!("{}", "📋 providers:".bright_yellow().bold());
    for provider in providers {
        println!(
            "   {} [{}] available cpu_mc={} memory_bytes={} gpu={}",
            provider.name.bright_green(),
            provider.kind,
            provider.capacity.available.cpu_mc,
            provider.capacity.available.memory_bytes,
            provider.capacity.available.gpu_count
        );
    }
    Ok(())
}

async fn run_health_check(config_path: String, provider_id: String) -> Result<()> {
    let config = Config::load(&config_path)?;
    let (node, _registry, _gossip, _sweep, _session) = node_from_config(&config).await?;

    print!("💓 health check on {}... ", provider_id);
    match node.health_check(&provider_id).await {
        Ok((capacity, tags)) => {
            println!("{}", "✅ alive".bright_green());
            println!(
                "   available cpu_mc={} memory_bytes={} gpu={} (tags: cpu={} memory={} gpu={} camera={})",
                capacity.available.cpu_mc, capacity.available.memory_bytes, capacity.available.gpu_count, tags.cpu, tags.memory, tags.gpu, tags.camera
            );
            Ok(())
        }
        Err(e) => {
            println!("{}", "❌ failed".bright_red());
            Err(e.into())
        }
    }
}

async fn run_aggregate_view(config_path: String) -> Result<()> {
    let config = Config::load(&config_path)?;
    let (node, _registry, _gossip, _sweep, _session) = node_from_config(&config).await?;

    let view = node.aggregate_view().await;
    println!("{}", "📊 aggregate view:".bright_yellow().bold());
    println!("   nodes: {}", view.node_count);
    println!(
        "   capacity: cpu_mc={} memory_bytes={} gpu={} (available cpu_mc={} memory_bytes={} gpu={})",
        view.capacity.total.cpu_mc,
        view.capacity.total.memory_bytes,
        view.capacity.total.gpu_count,
        view.capacity.available.cpu_mc,
        view.capacity.available.memory_bytes,
        view.capacity.available.gpu_count
    );
    for (status, count) in &view.counts_by_status {
        println!("   {}: {}", status, count);
    }
    Ok(())
}
