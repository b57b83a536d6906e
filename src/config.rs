use crate::control::ThresholdPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in content.lines().filter_map(parse_env_line) {
        // Only set if not already set (env vars take precedence)
        if std::env::var(key).is_err() {
            // SAFETY: We're single-threaded at this point (called before any async runtime)
            unsafe { std::env::set_var(key, value) };
        }
    }
}

fn parse_env_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();

    // Skip empty lines and comments
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let mut value = value.trim();

    // Remove surrounding quotes if present
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        value = &value[1..value.len() - 1];
    }
    Some((key, value))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub readings: InitialReadings,
    pub heating_pump: ThresholdPolicy,
    pub chlorine_mixer: ThresholdPolicy,
    pub supervisor: SupervisorConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bind_host: String,
    pub relaxing_lagoon_port: u16,
    pub olympic_pool_port: u16,
    pub children_pool_port: u16,
    pub entrance_port: u16,
    pub exit_port: u16,
    /// Freshness hint attached to every GET response and notification.
    pub max_age_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialReadings {
    pub temperature: f64,
    pub chlorine: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub temperature: ThresholdPolicy,
    pub chlorine: ThresholdPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Zero runs until Ctrl+C.
    pub lifetime_secs: u64,
    pub member_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                bind_host: "127.0.0.1".to_string(),
                relaxing_lagoon_port: 5683,
                olympic_pool_port: 5684,
                children_pool_port: 5685,
                entrance_port: 5686,
                exit_port: 5687,
                max_age_secs: 10,
            },
            readings: InitialReadings {
                temperature: 17.0,
                chlorine: 0.0,
            },
            heating_pump: ThresholdPolicy::heating_pump(),
            chlorine_mixer: ThresholdPolicy::chlorine_mixer(),
            supervisor: SupervisorConfig {
                temperature: ThresholdPolicy::emergency_temperature(),
                chlorine: ThresholdPolicy::emergency_chlorine(),
            },
            simulation: SimulationConfig {
                lifetime_secs: 300,
                member_interval_ms: 1000,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup` onto the defaults. Unparsable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("VILLAGE_BIND_HOST") {
            config.network.bind_host = host;
        }
        let net = &mut config.network;
        overlay(&lookup, "RELAXING_LAGOON_PORT", &mut net.relaxing_lagoon_port);
        overlay(&lookup, "OLYMPIC_POOL_PORT", &mut net.olympic_pool_port);
        overlay(&lookup, "CHILDREN_POOL_PORT", &mut net.children_pool_port);
        overlay(&lookup, "ENTRANCE_TURNSTILE_PORT", &mut net.entrance_port);
        overlay(&lookup, "EXIT_TURNSTILE_PORT", &mut net.exit_port);
        overlay(&lookup, "RESOURCE_MAX_AGE_SECS", &mut net.max_age_secs);

        overlay(&lookup, "INITIAL_TEMPERATURE", &mut config.readings.temperature);
        overlay(&lookup, "INITIAL_CHLORINE", &mut config.readings.chlorine);

        // Policies
        overlay_policy(&lookup, "HEATING_PUMP", &mut config.heating_pump);
        overlay_policy(&lookup, "CHLORINE_MIXER", &mut config.chlorine_mixer);
        overlay_policy(&lookup, "SUPERVISOR_TEMPERATURE", &mut config.supervisor.temperature);
        overlay_policy(&lookup, "SUPERVISOR_CHLORINE", &mut config.supervisor.chlorine);

        overlay(&lookup, "SIMULATION_LIFETIME_SECS", &mut config.simulation.lifetime_secs);
        overlay(&lookup, "MEMBER_INTERVAL_MS", &mut config.simulation.member_interval_ms);

        config
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.network.max_age_secs as u64)
    }

    /// `None` when the simulation should run until interrupted.
    pub fn lifetime(&self) -> Option<Duration> {
        match self.simulation.lifetime_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn member_interval(&self) -> Duration {
        Duration::from_millis(self.simulation.member_interval_ms)
    }
}

fn overlay<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = lookup(key)
        && let Ok(value) = raw.trim().parse()
    {
        *target = value;
    }
}

/// `<PREFIX>_LOW`, `<PREFIX>_IDEAL` and `<PREFIX>_STEP`.
fn overlay_policy(
    lookup: &impl Fn(&str) -> Option<String>,
    prefix: &str,
    policy: &mut ThresholdPolicy,
) {
    overlay(lookup, &format!("{}_LOW", prefix), &mut policy.low_threshold);
    overlay(lookup, &format!("{}_IDEAL", prefix), &mut policy.ideal_value);
    if policy.step_size.is_some()
        && let Some(raw) = lookup(&format!("{}_STEP", prefix))
        && let Ok(step) = raw.trim().parse()
    {
        policy.step_size = Some(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_deployment() {
        let config = Config::default();
        assert_eq!(config.network.relaxing_lagoon_port, 5683);
        assert_eq!(config.network.exit_port, 5687);
        assert_eq!(config.max_age(), Duration::from_secs(10));
        assert_eq!(config.readings.temperature, 17.0);
        assert_eq!(config.heating_pump.step_size, Some(1.0));
        assert_eq!(config.supervisor.chlorine.low_threshold, 0.0);
        assert_eq!(config.lifetime(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_env_overlay() {
        let config = Config::from_lookup(lookup_from(&[
            ("VILLAGE_BIND_HOST", "0.0.0.0"),
            ("OLYMPIC_POOL_PORT", "6000"),
            ("HEATING_PUMP_LOW", "20"),
            ("HEATING_PUMP_STEP", "0.5"),
            ("SUPERVISOR_CHLORINE_STEP", "0.2"),
            ("CHILDREN_POOL_PORT", "not-a-port"),
            ("SIMULATION_LIFETIME_SECS", "0"),
        ]));
        assert_eq!(config.network.bind_host, "0.0.0.0");
        assert_eq!(config.network.olympic_pool_port, 6000);
        assert_eq!(config.network.children_pool_port, 5685);
        assert_eq!(config.heating_pump.low_threshold, 20.0);
        assert_eq!(config.heating_pump.step_size, Some(0.5));
        // Supervisor policies never ramp.
        assert_eq!(config.supervisor.chlorine.step_size, None);
        assert_eq!(config.lifetime(), None);
    }

    #[test]
    fn test_parse_env_line() {
        assert_eq!(parse_env_line("A=b c"), Some(("A", "b c")));
        assert_eq!(parse_env_line("A = \"quoted\""), Some(("A", "quoted")));
        assert_eq!(parse_env_line("# comment"), None);
        assert_eq!(parse_env_line("novalue"), None);
        assert_eq!(parse_env_line("Q=\""), Some(("Q", "\"")));
    }
}
