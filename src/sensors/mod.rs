//! Sensor readings exposed by the village resources.
//!
//! A [`SensorState`] is a plain snapshot: a kind tag plus a scalar value.
//! Resources own the mutable instance and hand out copies on every read
//! and every notification. Presence counters keep a [`PresenceLog`] of
//! identifiers instead and report its length as a `Count` reading.

pub mod presence_log;

pub use presence_log::PresenceLog;

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};

/// What a reading measures.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Immersion temperature in degrees Celsius.
    Temperature,
    /// Chlorine concentration in mg/l.
    Concentration,
    /// Number of entries recorded by a presence counter.
    Count,
}

/// Immutable snapshot of a resource's scalar state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorState {
    pub kind: SensorKind,
    pub value: f64,
}

impl SensorState {
    pub fn new(kind: SensorKind, value: f64) -> Self {
        Self { kind, value }
    }

    pub fn temperature(celsius: f64) -> Self {
        Self::new(SensorKind::Temperature, celsius)
    }

    pub fn concentration(value: f64) -> Self {
        Self::new(SensorKind::Concentration, value)
    }

    pub fn count(entries: usize) -> Self {
        Self::new(SensorKind::Count, entries as f64)
    }

    /// Same kind, different value. Used by actuators to build corrective writes.
    pub fn with_value(self, value: f64) -> Self {
        Self {
            kind: self.kind,
            value,
        }
    }
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SensorKind::Count => write!(f, "{}={}", self.kind, self.value as u64),
            _ => write!(f, "{}={:.2}", self.kind, self.value),
        }
    }
}
