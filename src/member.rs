//! Members passing through the entrance and exit turnstiles.

use crate::error::{Result, VillageError};
use crate::observe::{ResourceClient, Subscription, observer_fn};
use crate::resource::payload;
use crate::sensors::SensorKind;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;

/// Client of one presence counter.
pub struct MemberClient {
    name: String,
    client: Arc<dyn ResourceClient>,
}

impl MemberClient {
    pub fn new(name: impl Into<String>, client: Arc<dyn ResourceClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a member passing the turnstile.
    pub async fn enter(&self, id: i32) -> Result<()> {
        info!("[{}] Member {} passing", self.name, id);
        self.client.post(&payload::encode_entry(id)).await
    }

    /// Number of entries recorded so far.
    pub async fn count(&self) -> Result<usize> {
        let state = self.client.get().await?;
        if state.kind != SensorKind::Count {
            return Err(VillageError::UnexpectedResponse(format!(
                "{} reported {} instead of a count",
                self.client.describe(),
                state
            )));
        }
        Ok(state.value as usize)
    }

    /// Log every count change until the returned subscription is dropped.
    pub async fn watch(&self) -> Result<Subscription> {
        let name = self.name.clone();
        self.client
            .observe(observer_fn(move |state| {
                info!("[{}] {} people", name, state.value as u64);
            }))
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Turnstile {
    Entrance,
    Exit,
}

/// One scripted member movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Passage {
    pub turnstile: Turnstile,
    pub member: i32,
}

impl Passage {
    pub fn enter(member: i32) -> Self {
        Self {
            turnstile: Turnstile::Entrance,
            member,
        }
    }

    pub fn exit(member: i32) -> Self {
        Self {
            turnstile: Turnstile::Exit,
            member,
        }
    }
}

/// Members 5, 6 and 7 come in, 5 leaves, then 8 comes in.
pub fn default_scenario() -> Vec<Passage> {
    vec![
        Passage::enter(5),
        Passage::enter(6),
        Passage::enter(7),
        Passage::exit(5),
        Passage::enter(8),
    ]
}

/// Play `scenario` with `interval` between passages.
///
/// A failed passage is logged and skipped. Returns how many succeeded.
pub async fn run_scenario(
    entrance: &MemberClient,
    exit: &MemberClient,
    scenario: &[Passage],
    interval: Duration,
) -> usize {
    let mut recorded = 0;
    for (i, passage) in scenario.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        let turnstile = match passage.turnstile {
            Turnstile::Entrance => entrance,
            Turnstile::Exit => exit,
        };
        match turnstile.enter(passage.member).await {
            Ok(()) => recorded += 1,
            Err(e) => warn!(
                "[{}] Member {} could not pass: {}",
                turnstile.name(),
                passage.member,
                e
            ),
        }
    }
    recorded
}
