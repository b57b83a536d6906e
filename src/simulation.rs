//! The whole village in one process.
//!
//! Binds the five facility servers, then drives them over CoAP exactly
//! like separate devices would: one heating pump and one chlorine mixer
//! per pool, the emergency supervisor over every pool resource and both
//! turnstiles, and the scripted member movements.

use crate::coap::{CoapClient, ResourceServer};
use crate::config::Config;
use crate::control::{
    ActuatorStats, ControlLoopActuator, EmergencySupervisor, MonitorReport, ThresholdPolicy,
};
use crate::error::Result;
use crate::member::{self, MemberClient};
use crate::observe::ResourceClient;
use crate::resource::{CHLORINE_PATH, IMMERSION_TEMP_PATH, ObservableResource, PRESENCE_PATH};
use crate::sensors::SensorState;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{info, warn};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const RELAXING_LAGOON: &str = "Relaxing Lagoon";
pub const OLYMPIC_POOL: &str = "Olympic Swimming Pool";
pub const CHILDREN_POOL: &str = "Children Pool";
pub const ENTRANCE: &str = "Entrance Turnstile";
pub const EXIT: &str = "Exit Turnstile";

struct Pool {
    name: &'static str,
    temperature: Arc<ObservableResource>,
    chlorine: Arc<ObservableResource>,
    addr: SocketAddr,
}

struct Turnstile {
    name: &'static str,
    counter: Arc<ObservableResource>,
    addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActuatorReport {
    pub name: String,
    pub stats: ActuatorStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadingReport {
    pub facility: String,
    pub path: String,
    pub state: SensorState,
    pub writes: u64,
}

/// What happened during one run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub readings: Vec<ReadingReport>,
    pub actuators: Vec<ActuatorReport>,
    pub monitors: Vec<MonitorReport>,
    pub passages_recorded: Option<usize>,
}

/// A running village. Stop it with [`Village::shutdown`].
pub struct Village {
    started_at: DateTime<Utc>,
    servers: Vec<ResourceServer>,
    pools: Vec<Pool>,
    turnstiles: Vec<Turnstile>,
    actuators: Vec<ControlLoopActuator>,
    supervisor: EmergencySupervisor,
    members: Option<JoinHandle<usize>>,
}

impl Village {
    pub async fn start(config: &Config) -> Result<Self> {
        let started_at = Utc::now();
        let net = &config.network;
        let host = net.bind_host.as_str();
        let mut servers = Vec::new();

        let mut pools = Vec::new();
        for (name, port) in [
            (RELAXING_LAGOON, net.relaxing_lagoon_port),
            (OLYMPIC_POOL, net.olympic_pool_port),
            (CHILDREN_POOL, net.children_pool_port),
        ] {
            let temperature = Arc::new(
                ObservableResource::immersion_temperature(config.readings.temperature)
                    .with_max_age(config.max_age()),
            );
            let chlorine = Arc::new(
                ObservableResource::chlorine(config.readings.chlorine)
                    .with_max_age(config.max_age()),
            );
            let server = ResourceServer::bind(
                name,
                (host, port),
                vec![temperature.clone(), chlorine.clone()],
            )
            .await?;
            pools.push(Pool {
                name,
                temperature,
                chlorine,
                addr: reachable(server.local_addr()),
            });
            servers.push(server);
        }

        let mut turnstiles = Vec::new();
        for (name, port) in [(ENTRANCE, net.entrance_port), (EXIT, net.exit_port)] {
            let counter = Arc::new(
                ObservableResource::presence_counter().with_max_age(config.max_age()),
            );
            let server = ResourceServer::bind(name, (host, port), vec![counter.clone()]).await?;
            turnstiles.push(Turnstile {
                name,
                counter,
                addr: reachable(server.local_addr()),
            });
            servers.push(server);
        }

        let mut actuators = Vec::new();
        for pool in &pools {
            actuators.push(
                start_actuator(
                    format!("{} HeatingPump", pool.name),
                    pool.addr,
                    IMMERSION_TEMP_PATH,
                    config.heating_pump,
                )
                .await?,
            );
            actuators.push(
                start_actuator(
                    format!("{} ChlorineMixer", pool.name),
                    pool.addr,
                    CHLORINE_PATH,
                    config.chlorine_mixer,
                )
                .await?,
            );
        }

        let mut supervisor = EmergencySupervisor::new();
        for pool in &pools {
            supervisor
                .watch(
                    format!("{} temperature", pool.name),
                    remote(pool.addr, IMMERSION_TEMP_PATH).await?,
                    config.supervisor.temperature,
                )
                .await?;
            supervisor
                .watch(
                    format!("{} chlorine", pool.name),
                    remote(pool.addr, CHLORINE_PATH).await?,
                    config.supervisor.chlorine,
                )
                .await?;
        }
        for turnstile in &turnstiles {
            supervisor
                .watch_presence(turnstile.name, remote(turnstile.addr, PRESENCE_PATH).await?)
                .await?;
        }

        let entrance = MemberClient::new(ENTRANCE, remote(turnstiles[0].addr, PRESENCE_PATH).await?);
        let exit = MemberClient::new(EXIT, remote(turnstiles[1].addr, PRESENCE_PATH).await?);
        let interval = config.member_interval();
        let members = tokio::spawn(async move {
            let scenario = member::default_scenario();
            let recorded = member::run_scenario(&entrance, &exit, &scenario, interval).await;
            info!("[Members] Scenario finished, {} passages recorded", recorded);
            recorded
        });

        info!(
            "[Village] Running: {} facilities, {} actuators, {} monitors",
            servers.len(),
            actuators.len(),
            supervisor.len()
        );

        Ok(Self {
            started_at,
            servers,
            pools,
            turnstiles,
            actuators,
            supervisor,
            members: Some(members),
        })
    }

    /// Current readings of every hosted resource.
    pub fn readings(&self) -> Vec<ReadingReport> {
        let pool_readings = self.pools.iter().flat_map(|pool| {
            [&pool.temperature, &pool.chlorine]
                .into_iter()
                .map(move |resource| reading(pool.name, resource))
        });
        let turnstile_readings = self
            .turnstiles
            .iter()
            .map(|turnstile| reading(turnstile.name, &turnstile.counter));
        pool_readings.chain(turnstile_readings).collect()
    }

    pub fn monitors(&self) -> Vec<MonitorReport> {
        self.supervisor.report()
    }

    pub fn members_finished(&self) -> bool {
        self.members.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Stop every consumer, then every server, and report.
    pub async fn shutdown(mut self) -> SimulationReport {
        info!("[Village] Shutting down");
        let passages_recorded = match self.members.take() {
            Some(task) if task.is_finished() => task.await.ok(),
            Some(task) => {
                task.abort();
                None
            }
            None => None,
        };

        let actuators = std::mem::take(&mut self.actuators)
            .into_iter()
            .map(|actuator| ActuatorReport {
                name: actuator.name().to_string(),
                stats: actuator.stop(),
            })
            .collect();
        self.supervisor.stop();
        let monitors = self.supervisor.report();
        let readings = self.readings();

        join_all(self.servers.iter_mut().map(|server| server.shutdown())).await;

        SimulationReport {
            started_at: self.started_at,
            stopped_at: Utc::now(),
            readings,
            actuators,
            monitors,
            passages_recorded,
        }
    }
}

fn reading(facility: &str, resource: &ObservableResource) -> ReadingReport {
    ReadingReport {
        facility: facility.to_string(),
        path: resource.path().to_string(),
        state: resource.read(),
        writes: resource.sequence(),
    }
}

/// Wildcard bind addresses are reached through loopback.
fn reachable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

async fn remote(addr: SocketAddr, path: &str) -> Result<Arc<dyn ResourceClient>> {
    Ok(Arc::new(CoapClient::connect(addr, path).await?))
}

async fn start_actuator(
    name: String,
    addr: SocketAddr,
    path: &str,
    policy: ThresholdPolicy,
) -> Result<ControlLoopActuator> {
    let client = remote(addr, path).await?;
    match ControlLoopActuator::start(name.clone(), client, policy).await {
        Ok(actuator) => Ok(actuator),
        Err(e) => {
            warn!("[{}] Could not start: {}", name, e);
            Err(e)
        }
    }
}
