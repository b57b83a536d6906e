//! Body encoding for resource requests and responses.
//!
//! Temperature and concentration travel as JSON objects with a single
//! field (`{"temperature":17.0}`, `{"concentration":1.5}`). Presence
//! counters answer GET with a bare integer count and accept POST bodies
//! holding a bare decimal identifier.

use crate::error::{Result, VillageError};
use crate::sensors::{SensorKind, SensorState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct TemperatureBody {
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConcentrationBody {
    concentration: f64,
}

/// Any body a resource may answer with, tried in declaration order.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireReading {
    Temperature(TemperatureBody),
    Concentration(ConcentrationBody),
    Count(u64),
}

/// Encode a reading the way resources serve it.
pub fn encode_state(state: &SensorState) -> Result<Vec<u8>> {
    let body = match state.kind {
        SensorKind::Temperature => serde_json::to_vec(&TemperatureBody {
            temperature: state.value,
        })?,
        SensorKind::Concentration => serde_json::to_vec(&ConcentrationBody {
            concentration: state.value,
        })?,
        SensorKind::Count => serde_json::to_vec(&(state.value as u64))?,
    };
    Ok(body)
}

/// Decode a write body into the shape a resource of `kind` expects.
pub fn decode_state(kind: SensorKind, body: &[u8]) -> Result<SensorState> {
    let value = match kind {
        SensorKind::Temperature => {
            serde_json::from_slice::<TemperatureBody>(body)
                .map_err(malformed)?
                .temperature
        }
        SensorKind::Concentration => {
            serde_json::from_slice::<ConcentrationBody>(body)
                .map_err(malformed)?
                .concentration
        }
        SensorKind::Count => serde_json::from_slice::<u64>(body).map_err(malformed)? as f64,
    };
    Ok(SensorState::new(kind, value))
}

/// Decode a response or notification body without knowing the kind up front.
pub fn decode_reading(body: &[u8]) -> Result<SensorState> {
    let reading = serde_json::from_slice::<WireReading>(body).map_err(malformed)?;
    Ok(match reading {
        WireReading::Temperature(t) => SensorState::temperature(t.temperature),
        WireReading::Concentration(c) => SensorState::concentration(c.concentration),
        WireReading::Count(n) => SensorState::new(SensorKind::Count, n as f64),
    })
}

pub fn encode_entry(id: i32) -> Vec<u8> {
    id.to_string().into_bytes()
}

/// Parse a presence POST body (bare decimal identifier, surrounding whitespace allowed).
pub fn decode_entry(body: &[u8]) -> Result<i32> {
    let text = std::str::from_utf8(body)
        .map_err(|e| VillageError::MalformedPayload(format!("identifier is not UTF-8: {}", e)))?;
    text.trim().parse::<i32>().map_err(|e| {
        VillageError::MalformedPayload(format!("invalid identifier {:?}: {}", text.trim(), e))
    })
}

fn malformed(e: serde_json::Error) -> VillageError {
    VillageError::MalformedPayload(e.to_string())
}
