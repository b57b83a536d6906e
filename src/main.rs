use clap::Parser;
use log::{error, info, warn};
use smart_village::config::{self, Config};
use smart_village::simulation::Village;
use tokio::signal;

#[derive(Parser)]
#[command(name = "smart-village")]
#[command(about = "Run the smart village: facility servers, actuators and supervisor")]
struct Cli {
    /// Address every facility server binds to
    #[arg(long, env = "VILLAGE_BIND_HOST")]
    bind_host: Option<String>,

    /// Seconds to run before shutting down (0 runs until Ctrl+C)
    #[arg(long, env = "SIMULATION_LIFETIME_SECS")]
    lifetime: Option<u64>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    // Load .env file before anything else
    config::load_dotenv();
    let cli = Cli::parse();

    init_logger();
    info!("Starting Smart Village");

    let mut config = Config::from_env();
    if let Some(host) = cli.bind_host {
        config.network.bind_host = host;
    }
    if let Some(lifetime) = cli.lifetime {
        config.simulation.lifetime_secs = lifetime;
    }

    info!("Configuration loaded:");
    info!("  Bind host: {}", config.network.bind_host);
    info!(
        "  Ports: lagoon {}, olympic {}, children {}, entrance {}, exit {}",
        config.network.relaxing_lagoon_port,
        config.network.olympic_pool_port,
        config.network.children_pool_port,
        config.network.entrance_port,
        config.network.exit_port
    );
    info!(
        "  Heating pump: below {} ramp to {}",
        config.heating_pump.low_threshold, config.heating_pump.ideal_value
    );
    info!(
        "  Chlorine mixer: below {} ramp to {}",
        config.chlorine_mixer.low_threshold, config.chlorine_mixer.ideal_value
    );

    let village = match Village::start(&config).await {
        Ok(village) => village,
        Err(e) => {
            error!("Failed to start the village: {}", e);
            std::process::exit(1);
        }
    };

    match config.lifetime() {
        Some(lifetime) => {
            info!("Running for {}s, press Ctrl+C to stop early", lifetime.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(lifetime) => info!("Simulation lifetime reached"),
                _ = wait_for_ctrl_c() => {}
            }
        }
        None => {
            info!("Running until Ctrl+C");
            wait_for_ctrl_c().await;
        }
    }

    let report = village.shutdown().await;

    for reading in &report.readings {
        info!(
            "  {} {}: {} after {} writes",
            reading.facility, reading.path, reading.state, reading.writes
        );
    }
    for actuator in &report.actuators {
        info!(
            "  {}: {} corrections, {} writes, {} failed",
            actuator.name,
            actuator.stats.corrections,
            actuator.stats.writes,
            actuator.stats.failed_writes
        );
    }
    for monitor in &report.monitors {
        match monitor.last_value {
            Some(value) => info!(
                "  {}: last {}, {} overrides",
                monitor.label, value, monitor.overrides
            ),
            None => warn!("  {}: never reported", monitor.label),
        }
    }

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to encode report: {}", e),
        }
    }

    info!("Smart Village stopped");
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
