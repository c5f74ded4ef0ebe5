//! playd — PlayOps control-plane API server.
//!
//! Wires the stores, provider drivers, placement optimizer, orchestrator,
//! and health supervisor together and serves the REST API.

mod config;
mod routes;

use clap::{Parser, Subcommand};
use config::ServerConfig;
use play_billing::RateTable;
use play_geo::Geocoder;
use play_orchestrator::{Orchestrator, OrchestratorConfig};
use play_persist::{HostStore, ProfileStore};
use play_placement::PlacementService;
use play_provision::{DriverRegistry, NimbusDriver, VoltgridDriver};
use play_supervisor::{Supervisor, SupervisorConfig};
use routes::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "playd")]
#[command(about = "PlayOps session control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and health supervisor
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/playd/config.json")]
        config: PathBuf,
    },

    /// Write a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/playd/config.json")]
        output: PathBuf,
    },

    /// Validate a config file and print the effective settings
    CheckConfig {
        #[arg(short, long, default_value = "/etc/playd/config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("playd=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run_server(config).await,
        Commands::InitConfig { output } => init_config(output),
        Commands::CheckConfig { config } => check_config(config),
    }
}

async fn run_server(config_path: PathBuf) -> anyhow::Result<()> {
    let mut config = match ServerConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "config file unavailable, starting from defaults");
            ServerConfig::default()
        }
    };
    config.apply_env_overrides();

    info!(
        state_path = %config.persistence.state_path.display(),
        voltgrid = config.providers.voltgrid.enabled,
        nimbus = config.providers.nimbus.enabled,
        "starting playd"
    );

    // Stores.
    let hosts = Arc::new(HostStore::open(
        &config.persistence.state_path,
        &config.persistence.hosts_collection,
    ));
    let profiles = Arc::new(ProfileStore::open(
        &config.persistence.state_path,
        &config.persistence.platforms_collection,
    ));

    // Rate table.
    let rates = Arc::new(match &config.billing.rate_table_path {
        Some(path) => RateTable::load(path)?,
        None => RateTable::builtin(),
    });

    // Provider drivers.
    let mut registry = DriverRegistry::new();
    if config.providers.voltgrid.enabled {
        registry.register(Arc::new(VoltgridDriver::new(
            &config.providers.voltgrid.api_base,
            &config.providers.voltgrid.api_token,
        )));
    }
    if config.providers.nimbus.enabled {
        registry.register(Arc::new(NimbusDriver::new(
            config.providers.nimbus.binary.clone(),
            config.providers.nimbus.config_path.clone(),
        )));
    }
    if registry.providers().is_empty() {
        warn!("no provider drivers enabled; session requests will be refused");
    }
    let registry = Arc::new(registry);

    // Placement.
    let geocoder = Arc::new(Geocoder::new(&config.services.gazetteer_endpoint));
    let placement = Arc::new(PlacementService::new(
        geocoder,
        &config.services.locator_endpoint,
        &config.services.locator_project,
    ));

    // Orchestrator.
    let client_cert_pem = match &config.orchestrator.client_cert_path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read client cert {}: {e}", path.display()))?,
        None => String::new(),
    };
    let orch = Arc::new(Orchestrator::new(
        hosts.clone(),
        profiles.clone(),
        registry.clone(),
        placement,
        rates.clone(),
        OrchestratorConfig {
            max_inflight_provisions: config.orchestrator.max_inflight_provisions,
            default_auto_stop_timeout_secs: config.orchestrator.default_auto_stop_timeout_secs,
            ssh_public_key: config.orchestrator.ssh_public_key.clone(),
            client_cert_pem,
            ..OrchestratorConfig::default()
        },
    ));

    // Supervisor, with the orchestrator as its transition capability.
    let supervisor = Arc::new(Supervisor::new(
        hosts.clone(),
        rates.clone(),
        registry,
        orch.clone(),
        SupervisorConfig {
            liveness_interval: Duration::from_secs(config.supervisor.liveness_interval_secs),
            liveness_jitter: config.supervisor.liveness_jitter,
            idle_threshold: Duration::from_secs(config.supervisor.idle_threshold_secs),
            sweep_interval: Duration::from_secs(config.supervisor.sweep_interval_secs),
            stopped_ttl: Duration::from_secs(config.supervisor.stopped_ttl_secs),
            monthly_soft_cap_usd: config.supervisor.monthly_soft_cap_usd,
            monthly_hard_cap_usd: config.supervisor.monthly_hard_cap_usd,
            strike_limit: config.supervisor.strike_limit,
            ..SupervisorConfig::default()
        },
    ));
    let supervisor_handle = supervisor.spawn();

    // API server.
    let state = AppState {
        orch,
        hosts,
        profiles,
        rates,
        monthly_soft_cap_usd: config.supervisor.monthly_soft_cap_usd,
        monthly_hard_cap_usd: config.supervisor.monthly_hard_cap_usd,
    };
    let router = routes::create_router(state, &config.api.cors_allowed_origins);

    let addr = format!("{}:{}", config.api.bind_addr, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    supervisor_handle.abort();
    Ok(())
}

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    let config = ServerConfig::default();
    config.save(&output)?;
    println!("Config written to {}", output.display());
    println!();
    println!("Edit provider credentials, then run:");
    println!("  playd run --config {}", output.display());
    Ok(())
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let mut config = ServerConfig::load(&path)?;
    config.apply_env_overrides();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
