//! One-shot client for poking at a running village.
//!
//! Usage:
//!   cargo run --bin village-probe -- get
//!   cargo run --bin village-probe -- --addr 127.0.0.1:5684 --path /ChlorineResource post 1.2
//!   cargo run --bin village-probe -- --addr 127.0.0.1:5686 --path /PresenceResource enter 9
//!   cargo run --bin village-probe -- observe --seconds 30
//!   cargo run --bin village-probe -- discover

use clap::{Parser, Subcommand};
use log::info;
use smart_village::coap::CoapClient;
use smart_village::member::MemberClient;
use smart_village::observe::{ResourceClient, observer_fn};
use smart_village::resource::IMMERSION_TEMP_PATH;
use smart_village::sensors::SensorState;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_ADDR: &str = "127.0.0.1:5683";

#[derive(Parser)]
#[command(name = "village-probe")]
#[command(about = "Read, write and observe smart village resources over CoAP")]
struct Cli {
    /// Server address
    #[arg(long, env = "PROBE_ADDR", default_value = DEFAULT_ADDR)]
    addr: String,

    /// Resource path
    #[arg(long, env = "PROBE_PATH", default_value = IMMERSION_TEMP_PATH)]
    path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the current state
    Get,
    /// Write a new value of the resource's own kind
    Post {
        value: f64,
    },
    /// Record a member passing a turnstile
    Enter {
        id: i32,
    },
    /// Print every change until the time is up
    Observe {
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
    /// List the resources hosted by the server
    Discover,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    smart_village::config::load_dotenv();
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let client = Arc::new(CoapClient::connect(cli.addr.as_str(), cli.path.clone()).await?);
    info!("Probing {}", client.describe());

    match cli.command {
        Commands::Get => {
            let state = client.get().await?;
            println!("{}", state);
        }
        Commands::Post { value } => {
            let kind = client.get().await?.kind;
            client.write_state(&SensorState::new(kind, value)).await?;
            println!("{}", client.get().await?);
        }
        Commands::Enter { id } => {
            let member = MemberClient::new("Probe", client.clone());
            member.enter(id).await?;
            println!("count={}", member.count().await?);
        }
        Commands::Observe { seconds } => {
            let subscription = client
                .observe(observer_fn(|state| println!("{}", state)))
                .await?;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            println!("{} updates received", subscription.delivered());
        }
        Commands::Discover => {
            for link in client.discover().await?.split(',') {
                println!("{}", link);
            }
        }
    }

    Ok(())
}
