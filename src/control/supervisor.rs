//! Emergency supervisor ("expert manager").
//!
//! Watches temperature and chlorine at every pool plus the two turnstile
//! counters. A temperature or chlorine reading below its threshold is
//! answered with exactly one override write straight to the ideal value.
//! Turnstile counts are only recorded for reporting.

use super::ThresholdPolicy;
use crate::error::{Result, VillageError};
use crate::observe::{Observer, ResourceClient, Subscription};
use crate::resource::Notification;
use crate::sensors::SensorState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    Override,
    Presence,
}

/// Snapshot of one monitored resource.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub label: String,
    pub path: String,
    pub kind: MonitorKind,
    pub last_value: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub overrides: u64,
    pub failed_overrides: u64,
    pub terminal: bool,
}

#[derive(Default)]
struct LastReading {
    state: Option<SensorState>,
    at: Option<DateTime<Utc>>,
}

impl LastReading {
    fn record(&mut self, notification: &Notification) {
        self.state = Some(notification.state);
        self.at = Some(notification.at);
    }
}

struct OverrideWatch {
    label: String,
    client: Arc<dyn ResourceClient>,
    policy: ThresholdPolicy,
    last: Mutex<LastReading>,
    overrides: AtomicU64,
    failed: AtomicU64,
}

#[async_trait]
impl Observer for OverrideWatch {
    async fn on_notification(&self, notification: Notification) {
        self.last.lock().record(&notification);
        let state = notification.state;
        info!("[Supervisor] Received {} from {}", state, self.label);

        if !self.policy.is_violated(state.value) {
            return;
        }

        warn!(
            "[Supervisor] {} from {} is below threshold {}. Emergency override",
            state, self.label, self.policy.low_threshold
        );
        let target = state.with_value(self.policy.ideal_value);
        match self.client.write_state(&target).await {
            Ok(()) => {
                self.overrides.fetch_add(1, Ordering::SeqCst);
                info!("[Supervisor] Set {} to {}", self.label, target);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                error!("[Supervisor] Override of {} failed: {}", self.label, e);
            }
        }
    }

    async fn on_transport_error(&self, path: &str, error: &VillageError) {
        error!("[Supervisor] Error observing {} ({}): {}", self.label, path, error);
    }
}

struct PresenceWatch {
    label: String,
    last: Mutex<LastReading>,
}

#[async_trait]
impl Observer for PresenceWatch {
    async fn on_notification(&self, notification: Notification) {
        self.last.lock().record(&notification);
        info!(
            "[Supervisor] {}: {} people",
            self.label, notification.state.value as u64
        );
    }

    async fn on_transport_error(&self, path: &str, error: &VillageError) {
        error!("[Supervisor] Error observing {} ({}): {}", self.label, path, error);
    }
}

enum Watch {
    Override(Arc<OverrideWatch>),
    Presence(Arc<PresenceWatch>),
}

struct Monitor {
    label: String,
    path: String,
    watch: Watch,
    subscription: Subscription,
}

/// Independent override watches over many resources.
#[derive(Default)]
pub struct EmergencySupervisor {
    monitors: Vec<Monitor>,
}

impl EmergencySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch a measured quantity and override it when it drops below `policy`.
    pub async fn watch(
        &mut self,
        label: impl Into<String>,
        client: Arc<dyn ResourceClient>,
        policy: ThresholdPolicy,
    ) -> Result<()> {
        policy.validate()?;
        let label = label.into();
        let watch = Arc::new(OverrideWatch {
            label: label.clone(),
            client: client.clone(),
            policy,
            last: Mutex::new(LastReading::default()),
            overrides: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let subscription = client.observe(watch.clone()).await?;
        info!("[Supervisor] Monitoring {} at {}", label, client.describe());
        self.monitors.push(Monitor {
            label,
            path: client.path().to_string(),
            watch: Watch::Override(watch),
            subscription,
        });
        Ok(())
    }

    /// Watch a turnstile counter for reporting only.
    pub async fn watch_presence(
        &mut self,
        label: impl Into<String>,
        client: Arc<dyn ResourceClient>,
    ) -> Result<()> {
        let label = label.into();
        let watch = Arc::new(PresenceWatch {
            label: label.clone(),
            last: Mutex::new(LastReading::default()),
        });
        let subscription = client.observe(watch.clone()).await?;
        info!("[Supervisor] Counting {} at {}", label, client.describe());
        self.monitors.push(Monitor {
            label,
            path: client.path().to_string(),
            watch: Watch::Presence(watch),
            subscription,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    pub fn report(&self) -> Vec<MonitorReport> {
        self.monitors
            .iter()
            .map(|monitor| {
                let (kind, last, overrides, failed) = match &monitor.watch {
                    Watch::Override(w) => (
                        MonitorKind::Override,
                        &w.last,
                        w.overrides.load(Ordering::SeqCst),
                        w.failed.load(Ordering::SeqCst),
                    ),
                    Watch::Presence(w) => (MonitorKind::Presence, &w.last, 0, 0),
                };
                let last = last.lock();
                MonitorReport {
                    label: monitor.label.clone(),
                    path: monitor.path.clone(),
                    kind,
                    last_value: last.state.map(|s| s.value),
                    updated_at: last.at,
                    overrides,
                    failed_overrides: failed,
                    terminal: monitor.subscription.is_terminal(),
                }
            })
            .collect()
    }

    /// Cancel every watch.
    pub fn stop(&mut self) {
        for monitor in &mut self.monitors {
            monitor.subscription.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::{CoapClient, ResourceServer};
    use crate::observe::{LocalClient, observer_fn};
    use crate::resource::{IMMERSION_TEMP_PATH, ObservableResource, PRESENCE_PATH};
    use std::time::Duration;

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn local(resource: &Arc<ObservableResource>) -> Arc<dyn ResourceClient> {
        Arc::new(LocalClient::new(resource.clone()))
    }

    #[tokio::test]
    async fn test_override_is_single_shot() {
        let resource = Arc::new(ObservableResource::immersion_temperature(10.0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _watch = LocalClient::new(resource.clone())
            .observe(observer_fn(move |s| sink.lock().push(s.value)))
            .await
            .unwrap();

        let mut supervisor = EmergencySupervisor::new();
        supervisor
            .watch(
                "Relaxing Lagoon temperature",
                local(&resource),
                ThresholdPolicy::new(17.0, 25.0),
            )
            .await
            .unwrap();

        wait_for(|| supervisor.report()[0].last_value == Some(25.0)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(resource.sequence(), 1);
        assert_eq!(*seen.lock(), vec![10.0, 25.0]);
        let report = &supervisor.report()[0];
        assert_eq!(report.overrides, 1);
        assert_eq!(report.kind, MonitorKind::Override);
    }

    #[tokio::test]
    async fn test_monitors_are_independent() {
        let cold = Arc::new(ObservableResource::immersion_temperature(10.0));
        let warm = Arc::new(ObservableResource::immersion_temperature(20.0));
        let chlorine = Arc::new(ObservableResource::chlorine(0.2));

        let mut supervisor = EmergencySupervisor::new();
        let policy = ThresholdPolicy::emergency_temperature();
        supervisor.watch("cold", local(&cold), policy).await.unwrap();
        supervisor.watch("warm", local(&warm), policy).await.unwrap();
        supervisor
            .watch("chlorine", local(&chlorine), ThresholdPolicy::emergency_chlorine())
            .await
            .unwrap();

        wait_for(|| cold.read().value == 25.0).await;
        wait_for(|| supervisor.report().iter().all(|r| r.last_value.is_some())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(warm.sequence(), 0);
        assert_eq!(chlorine.sequence(), 0);
        let overrides: Vec<u64> = supervisor.report().iter().map(|r| r.overrides).collect();
        assert_eq!(overrides, vec![1, 0, 0]);
    }

    #[tokio::test]
    async fn test_presence_is_report_only() {
        let entrance = Arc::new(ObservableResource::presence_counter());
        let mut supervisor = EmergencySupervisor::new();
        supervisor
            .watch_presence("entrance", local(&entrance))
            .await
            .unwrap();

        entrance.add_entry(5).unwrap();
        entrance.add_entry(6).unwrap();

        wait_for(|| supervisor.report()[0].last_value == Some(2.0)).await;
        assert_eq!(entrance.sequence(), 2);
        assert_eq!(supervisor.report()[0].kind, MonitorKind::Presence);

        supervisor.stop();
        assert!(supervisor.report()[0].terminal);
        assert_eq!(entrance.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_watches_keep_receiving_over_coap() {
        let temp = Arc::new(ObservableResource::immersion_temperature(20.0));
        let entrance = Arc::new(ObservableResource::presence_counter());
        let pool = ResourceServer::bind("Pool", "127.0.0.1:0", vec![temp.clone()])
            .await
            .unwrap();
        let turnstile = ResourceServer::bind("Entrance", "127.0.0.1:0", vec![entrance.clone()])
            .await
            .unwrap();

        let mut supervisor = EmergencySupervisor::new();
        // Neither client is kept by the caller.
        supervisor
            .watch(
                "pool temperature",
                Arc::new(
                    CoapClient::connect(pool.local_addr(), IMMERSION_TEMP_PATH)
                        .await
                        .unwrap(),
                ),
                ThresholdPolicy::emergency_temperature(),
            )
            .await
            .unwrap();
        supervisor
            .watch_presence(
                "entrance",
                Arc::new(
                    CoapClient::connect(turnstile.local_addr(), PRESENCE_PATH)
                        .await
                        .unwrap(),
                ),
            )
            .await
            .unwrap();

        entrance.add_entry(5).unwrap();
        entrance.add_entry(6).unwrap();
        temp.write(SensorState::temperature(12.0)).unwrap();

        wait_for(|| supervisor.report()[1].last_value == Some(2.0)).await;
        wait_for(|| temp.read().value == 25.0).await;

        let report = supervisor.report();
        assert_eq!(report[0].overrides, 1);
        assert!(report.iter().all(|r| !r.terminal));
        assert_eq!(pool.observer_count(), 1);
        assert_eq!(turnstile.observer_count(), 1);
    }

    struct Unreachable;

    #[async_trait]
    impl ResourceClient for Unreachable {
        fn path(&self) -> &str {
            "/ImmersionTempResource"
        }

        async fn get(&self) -> Result<SensorState> {
            Err(VillageError::Connect("unreachable".to_string()))
        }

        async fn post(&self, _body: &[u8]) -> Result<()> {
            Err(VillageError::Connect("unreachable".to_string()))
        }

        async fn observe(&self, _observer: Arc<dyn Observer>) -> Result<Subscription> {
            Err(VillageError::Connect("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_connect_error_is_surfaced() {
        let mut supervisor = EmergencySupervisor::new();
        let err = supervisor
            .watch(
                "nowhere",
                Arc::new(Unreachable),
                ThresholdPolicy::emergency_temperature(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VillageError::Connect(_)));
        assert!(supervisor.is_empty());
    }
}
