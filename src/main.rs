//! SMI-S Block Driver
//!
//! Serves the block driver's REST API. In `--standalone` mode the driver
//! runs against an in-memory simulated array seeded from the configuration,
//! which is how the API is exercised without a provider.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smis_block_driver::{
    ApiServer, ApiServerConfig, BlockDriver, DriverConfig, DriverMetrics, Error, Protocol, Result,
    SimulatedArray,
};

const GIB: u64 = 1 << 30;

// =============================================================================
// CLI Arguments
// =============================================================================

/// SMI-S Block Driver - provisioning, masking and FAST tiering for block arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Driver configuration file (YAML)
    #[arg(long, env = "SMIS_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against a simulated array
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Capacity of each simulated pool, in GiB
    #[arg(long, env = "SIM_POOL_GB", default_value = "1024")]
    sim_pool_gb: u64,

    /// Polls a simulated job stays running
    #[arg(long, env = "SIM_JOB_LATENCY", default_value = "1")]
    sim_job_latency: u32,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting SMI-S Block Driver");
    info!("  Version: {}", smis_block_driver::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Standalone mode: {}", args.standalone);

    let config = match &args.config {
        Some(path) => DriverConfig::load(path)?,
        None if args.standalone => standalone_config()?,
        None => {
            return Err(Error::InvalidConfiguration(
                "--config is required outside standalone mode".into(),
            ))
        }
    };
    info!(
        "Backend {} on array {} (pool {}, FAST policy {:?}, {})",
        config.backend_name, config.array, config.pool, config.fast_policy, config.protocol
    );

    if !args.standalone {
        error!("No management transport is built in; use --standalone");
        return Err(Error::InvalidConfiguration(
            "no management client available outside standalone mode".into(),
        ));
    }

    let array = simulated_array(&config, &args);
    let metrics = Arc::new(DriverMetrics::new()?);
    let driver = BlockDriver::new(config, array, None, metrics);

    if let Err(e) = driver.check_for_setup_error().await {
        warn!("Setup check failed: {}", e);
    }

    let api_config = ApiServerConfig {
        rest_addr: args.api_addr.parse().map_err(|e| {
            Error::InvalidConfiguration(format!("Invalid REST API address: {}", e))
        })?,
        ..Default::default()
    };
    let api_server = Arc::new(ApiServer::new(api_config, driver));

    let signal_server = api_server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            signal_server.shutdown();
        }
    });

    api_server.run().await?;

    info!("Driver shutdown complete");
    Ok(())
}

// =============================================================================
// Standalone Array
// =============================================================================

fn standalone_config() -> Result<DriverConfig> {
    DriverConfig::from_yaml(
        r#"
array: "000197800123"
pool: SRP_1
port_groups: [OS-PG1]
protocol: iscsi
poll:
  interval_ms: 200
  timeout_secs: 60
"#,
    )
}

/// Simulated array holding the configured pool, policy and port groups
fn simulated_array(config: &DriverConfig, args: &Args) -> Arc<SimulatedArray> {
    let targets: Vec<String> = (0..2)
        .map(|port| match config.protocol {
            Protocol::Iscsi => format!("iqn.1992-04.com.emc:600009700bca30c{}", port),
            Protocol::Fc => format!("500009735000110{}", port),
        })
        .collect();
    let targets: Vec<&str> = targets.iter().map(String::as_str).collect();

    let mut builder = SimulatedArray::builder(&config.array)
        .pool(&config.pool, args.sim_pool_gb * GIB, 0)
        .job_latency(args.sim_job_latency)
        .sync_latency(args.sim_job_latency);
    for port_group in &config.port_groups {
        builder = builder.port_group(port_group, &targets);
    }
    if let Some(policy) = &config.fast_policy {
        builder = builder.tier_policy(policy, &[config.pool.as_str()]);
    }
    builder.build()
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = ["hyper=warn", "tower=warn", "tower_http=info", "axum=info"]
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
