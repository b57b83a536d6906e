//! Threshold-driven consumers of resource notifications.
//!
//! - [`ControlLoopActuator`]: ramps a single resource back to its ideal
//!   value in fixed increments whenever it drops below the threshold.
//! - [`EmergencySupervisor`]: watches many resources and resets any that
//!   drop below their threshold with a single override write.

pub mod actuator;
pub mod supervisor;

pub use actuator::{ActuatorStats, ControlLoop, ControlLoopActuator, Phase};
pub use supervisor::{EmergencySupervisor, MonitorKind, MonitorReport};

use crate::error::{Result, VillageError};
use serde::{Deserialize, Serialize};

/// Threshold configuration for one consumer. Not mutated at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub low_threshold: f64,
    pub ideal_value: f64,
    /// Increment per corrective write. Only actuators ramp.
    pub step_size: Option<f64>,
}

impl ThresholdPolicy {
    pub fn new(low_threshold: f64, ideal_value: f64) -> Self {
        Self {
            low_threshold,
            ideal_value,
            step_size: None,
        }
    }

    pub fn with_step(mut self, step_size: f64) -> Self {
        self.step_size = Some(step_size);
        self
    }

    /// A reading strictly below the threshold violates the policy.
    pub fn is_violated(&self, value: f64) -> bool {
        value < self.low_threshold
    }

    pub fn validate(&self) -> Result<()> {
        if !self.low_threshold.is_finite() || !self.ideal_value.is_finite() {
            return Err(VillageError::InvalidPolicy(
                "threshold and ideal value must be finite".to_string(),
            ));
        }
        if self.ideal_value < self.low_threshold {
            return Err(VillageError::InvalidPolicy(format!(
                "ideal value {} is below the threshold {}",
                self.ideal_value, self.low_threshold
            )));
        }
        if let Some(step) = self.step_size
            && !(step.is_finite() && step > 0.0)
        {
            return Err(VillageError::InvalidPolicy(format!(
                "step size must be positive, got {}",
                step
            )));
        }
        Ok(())
    }

    /// Heating pump defaults: ramp to 25 °C in 1 °C steps below 19 °C.
    pub fn heating_pump() -> Self {
        Self::new(19.0, 25.0).with_step(1.0)
    }

    /// Chlorine mixer defaults: ramp to 1.5 in 0.1 steps below 0.6.
    pub fn chlorine_mixer() -> Self {
        Self::new(0.6, 1.5).with_step(0.1)
    }

    /// Supervisor temperature override: reset to 25 °C below 17 °C.
    pub fn emergency_temperature() -> Self {
        Self::new(17.0, 25.0)
    }

    /// Supervisor chlorine override: reset to 1.5 below 0.
    pub fn emergency_chlorine() -> Self {
        Self::new(0.0, 1.5)
    }
}
