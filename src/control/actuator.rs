//! Ramp actuator (heating pump, chlorine mixer).
//!
//! The decision logic lives in [`ControlLoop`], a plain state machine:
//!
//! ```text
//! Idle --notification--> Evaluating --satisfied--> Idle
//!                            |
//!                        violated
//!                            v
//!                   Correcting { step } --ideal reached--> Idle
//! ```
//!
//! [`ControlLoopActuator`] drives it from a subscription. The whole
//! correction runs inside one notification callback, so further updates
//! for the same subscription queue up until the ramp is finished.
//!
//! Each successful write comes back as a notification of its own. The
//! loop remembers every value it wrote and swallows those echoes instead
//! of re-evaluating them, otherwise every intermediate step of a ramp
//! would trigger another ramp.

use super::ThresholdPolicy;
use crate::error::{Result, VillageError};
use crate::observe::{Observer, ResourceClient, Subscription};
use crate::resource::Notification;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const EPSILON: f64 = 1e-9;
const ECHO_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Evaluating,
    /// `step` counts the corrective writes computed so far in this ramp.
    Correcting { step: u32 },
}

/// Outcome of evaluating one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The update is the echo of one of our own writes.
    Echo,
    Satisfied,
    Violated,
}

#[derive(Debug, Clone)]
struct Ramp {
    start: f64,
    step: f64,
    target: f64,
    steps_taken: u32,
    last: f64,
}

impl Ramp {
    fn new(start: f64, step: f64, target: f64) -> Self {
        Self {
            start,
            step,
            target,
            steps_taken: 0,
            last: start,
        }
    }

    /// Next value toward the target, or `None` once the target was written.
    ///
    /// Values are computed from the start point rather than accumulated,
    /// and the final step is clamped to the target.
    fn advance(&mut self) -> Option<f64> {
        if self.last >= self.target - EPSILON {
            return None;
        }
        self.steps_taken += 1;
        let raw = quantize(self.start + self.step * f64::from(self.steps_taken));
        let value = if raw >= self.target - EPSILON {
            self.target
        } else {
            raw
        };
        self.last = value;
        Some(value)
    }
}

fn quantize(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Threshold state machine for one actuator.
#[derive(Debug)]
pub struct ControlLoop {
    policy: ThresholdPolicy,
    step: f64,
    phase: Phase,
    ramp: Option<Ramp>,
    echoes: VecDeque<f64>,
}

impl ControlLoop {
    pub fn new(policy: ThresholdPolicy) -> Result<Self> {
        policy.validate()?;
        let step = policy.step_size.ok_or_else(|| {
            VillageError::InvalidPolicy("an actuator needs a step size".to_string())
        })?;
        Ok(Self {
            policy,
            step,
            phase: Phase::Idle,
            ramp: None,
            echoes: VecDeque::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn policy(&self) -> &ThresholdPolicy {
        &self.policy
    }

    /// Compare a pushed value against the policy. A violation starts a ramp.
    pub fn evaluate(&mut self, value: f64) -> Verdict {
        if let Some(pos) = self
            .echoes
            .iter()
            .position(|echo| (echo - value).abs() < ECHO_TOLERANCE)
        {
            self.echoes.remove(pos);
            return Verdict::Echo;
        }

        self.phase = Phase::Evaluating;
        if !self.policy.is_violated(value) {
            self.phase = Phase::Idle;
            return Verdict::Satisfied;
        }

        self.ramp = Some(Ramp::new(value, self.step, self.policy.ideal_value));
        self.phase = Phase::Correcting { step: 0 };
        Verdict::Violated
    }

    /// Value for the next corrective write. Returns `None` and goes back
    /// to `Idle` once the ideal value has been issued.
    pub fn next_write(&mut self) -> Option<f64> {
        let next = self.ramp.as_mut().and_then(Ramp::advance);
        match next {
            Some(value) => {
                let step = self.ramp.as_ref().map_or(0, |ramp| ramp.steps_taken);
                self.phase = Phase::Correcting { step };
                Some(value)
            }
            None => {
                self.ramp = None;
                self.phase = Phase::Idle;
                None
            }
        }
    }

    /// Remember a value that was written successfully so its echo is skipped.
    pub fn record_write(&mut self, value: f64) {
        self.echoes.push_back(value);
    }

    /// Own writes whose echo has not come back yet.
    pub fn pending_echoes(&self) -> usize {
        self.echoes.len()
    }
}

/// Counters reported by an actuator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActuatorStats {
    pub corrections: u64,
    pub writes: u64,
    pub failed_writes: u64,
}

#[derive(Default)]
struct Counters {
    corrections: AtomicU64,
    writes: AtomicU64,
    failed_writes: AtomicU64,
}

struct ActuatorCore {
    name: String,
    client: Arc<dyn ResourceClient>,
    machine: Mutex<ControlLoop>,
    counters: Counters,
}

impl ActuatorCore {
    async fn correct(&self, notification: &Notification) {
        self.counters.corrections.fetch_add(1, Ordering::SeqCst);
        loop {
            let next = self.machine.lock().next_write();
            let Some(value) = next else {
                break;
            };
            let target = notification.state.with_value(value);
            match self.client.write_state(&target).await {
                Ok(()) => {
                    self.counters.writes.fetch_add(1, Ordering::SeqCst);
                    self.machine.lock().record_write(value);
                    info!(
                        "[{}] Posted new {} on {}",
                        self.name,
                        target,
                        self.client.describe()
                    );
                }
                Err(e) => {
                    self.counters.failed_writes.fetch_add(1, Ordering::SeqCst);
                    warn!("[{}] Failed to post {}: {}", self.name, target, e);
                }
            }
        }
        info!(
            "[{}] Correction finished on {}",
            self.name,
            self.client.describe()
        );
    }
}

#[async_trait]
impl Observer for ActuatorCore {
    async fn on_notification(&self, notification: Notification) {
        let verdict = self.machine.lock().evaluate(notification.state.value);
        match verdict {
            Verdict::Echo => {
                debug!("[{}] Echo of own write: {}", self.name, notification.state);
            }
            Verdict::Satisfied => {
                info!(
                    "[{}] Received {} from {}",
                    self.name,
                    notification.state,
                    self.client.describe()
                );
            }
            Verdict::Violated => {
                info!(
                    "[{}] Received {} from {} is below threshold",
                    self.name,
                    notification.state,
                    self.client.describe()
                );
                self.correct(&notification).await;
            }
        }
    }

    async fn on_transport_error(&self, path: &str, error: &VillageError) {
        error!(
            "[{}] Error occurred while observing {}: {}",
            self.name, path, error
        );
    }
}

/// Actuator bound to one resource through its own subscription.
pub struct ControlLoopActuator {
    core: Arc<ActuatorCore>,
    subscription: Subscription,
}

impl ControlLoopActuator {
    /// Subscribe to the resource behind `client` and start reacting.
    ///
    /// The initial notification carrying the current state is evaluated
    /// like any other, so a resource that is already below threshold is
    /// corrected right away.
    pub async fn start(
        name: impl Into<String>,
        client: Arc<dyn ResourceClient>,
        policy: ThresholdPolicy,
    ) -> Result<Self> {
        let machine = ControlLoop::new(policy)?;
        let name = name.into();
        info!(
            "[{}] Observing {} (threshold {}, ideal {}, step {})",
            name,
            client.describe(),
            policy.low_threshold,
            policy.ideal_value,
            machine.step
        );
        let core = Arc::new(ActuatorCore {
            name,
            client: client.clone(),
            machine: Mutex::new(machine),
            counters: Counters::default(),
        });
        let subscription = client.observe(core.clone()).await?;
        Ok(Self { core, subscription })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn phase(&self) -> Phase {
        self.core.machine.lock().phase()
    }

    pub fn stats(&self) -> ActuatorStats {
        let c = &self.core.counters;
        ActuatorStats {
            corrections: c.corrections.load(Ordering::SeqCst),
            writes: c.writes.load(Ordering::SeqCst),
            failed_writes: c.failed_writes.load(Ordering::SeqCst),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn stop(mut self) -> ActuatorStats {
        self.subscription.cancel();
        self.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::{LocalClient, observer_fn};
    use crate::resource::ObservableResource;
    use crate::sensors::SensorState;
    use std::time::Duration;

    fn ramp(policy: ThresholdPolicy, start: f64) -> Vec<f64> {
        let mut machine = ControlLoop::new(policy).unwrap();
        assert_eq!(machine.evaluate(start), Verdict::Violated);
        let mut values = Vec::new();
        while let Some(v) = machine.next_write() {
            values.push(v);
        }
        assert_eq!(machine.phase(), Phase::Idle);
        values
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_ramp_from_fifteen() {
        let values = ramp(ThresholdPolicy::new(19.0, 25.0).with_step(1.0), 15.0);
        let expected: Vec<f64> = (16..=25).map(f64::from).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_ramp_clamps_last_step() {
        let values = ramp(ThresholdPolicy::new(19.0, 25.0).with_step(4.0), 15.0);
        assert_eq!(values, vec![19.0, 23.0, 25.0]);

        let values = ramp(ThresholdPolicy::chlorine_mixer(), 0.55);
        assert_eq!(values.len(), 10);
        assert_eq!(values[0], 0.65);
        assert_eq!(*values.last().unwrap(), 1.5);
    }

    #[test]
    fn test_phases() {
        let mut machine = ControlLoop::new(ThresholdPolicy::heating_pump()).unwrap();
        assert_eq!(machine.phase(), Phase::Idle);
        assert_eq!(machine.evaluate(20.0), Verdict::Satisfied);
        assert_eq!(machine.phase(), Phase::Idle);

        assert_eq!(machine.evaluate(18.0), Verdict::Violated);
        assert_eq!(machine.phase(), Phase::Correcting { step: 0 });
        assert_eq!(machine.next_write(), Some(19.0));
        assert_eq!(machine.phase(), Phase::Correcting { step: 1 });
    }

    #[test]
    fn test_echoes_are_skipped_once() {
        let mut machine = ControlLoop::new(ThresholdPolicy::heating_pump()).unwrap();
        machine.evaluate(17.0);
        while let Some(v) = machine.next_write() {
            machine.record_write(v);
        }
        for v in 18..=25 {
            assert_eq!(machine.evaluate(f64::from(v)), Verdict::Echo);
        }
        // Same value again is an outside write now.
        assert_eq!(machine.evaluate(18.0), Verdict::Violated);
    }

    #[test]
    fn test_long_ramp_echoes_are_all_skipped() {
        let mut machine =
            ControlLoop::new(ThresholdPolicy::new(19.0, 25.0).with_step(0.05)).unwrap();
        assert_eq!(machine.evaluate(17.0), Verdict::Violated);
        let mut written = Vec::new();
        while let Some(v) = machine.next_write() {
            machine.record_write(v);
            written.push(v);
        }
        assert_eq!(written.len(), 160);
        assert_eq!(machine.pending_echoes(), 160);

        for v in written {
            assert_eq!(machine.evaluate(v), Verdict::Echo);
        }
        assert_eq!(machine.pending_echoes(), 0);
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[test]
    fn test_requires_step() {
        let err = ControlLoop::new(ThresholdPolicy::emergency_temperature()).unwrap_err();
        assert!(matches!(err, VillageError::InvalidPolicy(_)));
    }

    #[tokio::test]
    async fn test_actuator_converges_with_ten_writes() {
        let resource = Arc::new(ObservableResource::immersion_temperature(15.0));
        let client = LocalClient::new(resource.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _watch = client
            .observe(observer_fn(move |state| sink.lock().push(state.value)))
            .await
            .unwrap();

        let actuator = ControlLoopActuator::start(
            "HeatingPump",
            Arc::new(client),
            ThresholdPolicy::new(19.0, 25.0).with_step(1.0),
        )
        .await
        .unwrap();

        wait_for(|| actuator.subscription().delivered() == 11 && actuator.phase() == Phase::Idle)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            actuator.stats(),
            ActuatorStats {
                corrections: 1,
                writes: 10,
                failed_writes: 0
            }
        );
        assert_eq!(resource.read(), SensorState::temperature(25.0));
        assert_eq!(resource.sequence(), 10);

        wait_for(|| seen.lock().len() == 11).await;
        let expected: Vec<f64> = (15..=25).map(f64::from).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[tokio::test]
    async fn test_long_ramp_runs_once() {
        let resource = Arc::new(ObservableResource::chlorine(0.0));
        let actuator = ControlLoopActuator::start(
            "ChlorineMixer",
            Arc::new(LocalClient::new(resource.clone())),
            ThresholdPolicy::new(0.6, 1.5).with_step(0.01),
        )
        .await
        .unwrap();

        wait_for(|| actuator.subscription().delivered() == 151 && actuator.phase() == Phase::Idle)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            actuator.stats(),
            ActuatorStats {
                corrections: 1,
                writes: 150,
                failed_writes: 0
            }
        );
        assert_eq!(resource.sequence(), 150);
        assert_eq!(resource.read(), SensorState::concentration(1.5));
        assert_eq!(actuator.core.machine.lock().pending_echoes(), 0);
    }

    #[tokio::test]
    async fn test_no_correction_when_satisfied() {
        let resource = Arc::new(ObservableResource::chlorine(1.0));
        let actuator = ControlLoopActuator::start(
            "ChlorineMixer",
            Arc::new(LocalClient::new(resource.clone())),
            ThresholdPolicy::chlorine_mixer(),
        )
        .await
        .unwrap();

        wait_for(|| actuator.subscription().delivered() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(actuator.stats(), ActuatorStats::default());
        assert_eq!(resource.sequence(), 0);
    }

    #[tokio::test]
    async fn test_external_drop_triggers_new_ramp() {
        let resource = Arc::new(ObservableResource::immersion_temperature(20.0));
        let actuator = ControlLoopActuator::start(
            "HeatingPump",
            Arc::new(LocalClient::new(resource.clone())),
            ThresholdPolicy::heating_pump(),
        )
        .await
        .unwrap();
        wait_for(|| actuator.subscription().delivered() == 1).await;

        resource.write(SensorState::temperature(22.5)).unwrap();
        resource.write(SensorState::temperature(18.0)).unwrap();

        wait_for(|| resource.read() == SensorState::temperature(25.0)).await;
        wait_for(|| actuator.phase() == Phase::Idle && actuator.subscription().delivered() == 10)
            .await;
        assert_eq!(actuator.stats().writes, 7);
        assert_eq!(actuator.stats().corrections, 1);
    }

    /// Fails one chosen POST, passes everything else through.
    struct FlakyClient {
        inner: LocalClient,
        fail_on: u64,
        posts: AtomicU64,
    }

    #[async_trait]
    impl ResourceClient for FlakyClient {
        fn path(&self) -> &str {
            self.inner.path()
        }

        async fn get(&self) -> Result<crate::sensors::SensorState> {
            self.inner.get().await
        }

        async fn post(&self, body: &[u8]) -> Result<()> {
            let n = self.posts.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on {
                return Err(VillageError::WriteFailure("simulated loss".to_string()));
            }
            self.inner.post(body).await
        }

        async fn observe(&self, observer: Arc<dyn Observer>) -> Result<Subscription> {
            self.inner.observe(observer).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stop_ramp() {
        let resource = Arc::new(ObservableResource::immersion_temperature(15.0));
        let client = FlakyClient {
            inner: LocalClient::new(resource.clone()),
            fail_on: 3,
            posts: AtomicU64::new(0),
        };
        let actuator =
            ControlLoopActuator::start("HeatingPump", Arc::new(client), ThresholdPolicy::heating_pump())
                .await
                .unwrap();

        wait_for(|| actuator.subscription().delivered() == 10 && actuator.phase() == Phase::Idle)
            .await;

        let stats = actuator.stop();
        assert_eq!(stats.writes, 9);
        assert_eq!(stats.failed_writes, 1);
        assert_eq!(resource.read(), SensorState::temperature(25.0));
    }
}
