//! Client-side watching of resources.
//!
//! A consumer implements [`Observer`] and hands it to a [`ResourceClient`].
//! The client returns a [`Subscription`] whose task calls the observer for
//! every pushed update, one at a time and in the order received. Different
//! subscriptions run on different tasks and never wait on each other.
//!
//! Two clients exist: [`LocalClient`] talks to an in-process
//! [`ObservableResource`](crate::resource::ObservableResource), and
//! [`CoapClient`](crate::coap::CoapClient) talks to a resource served over UDP.

mod local;
mod subscription;

pub use local::LocalClient;
pub use subscription::Subscription;

use crate::error::{Result, VillageError};
use crate::resource::{Notification, payload};
use crate::sensors::SensorState;
use async_trait::async_trait;
use log::warn;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a subscription's delivery task receives.
#[derive(Debug, Clone)]
pub enum Delivery {
    Update(Notification),
    /// The connection to the resource is gone; the subscription ends.
    Lost(String),
}

/// Sending half handed to a resource (or transport) for one subscription.
pub type NotificationSink = mpsc::UnboundedSender<Delivery>;

/// Reaction logic run for each pushed update.
#[async_trait]
pub trait Observer: Send + Sync + 'static {
    async fn on_notification(&self, notification: Notification);

    /// Called once when the subscription becomes terminal because the
    /// connection was lost. No further notifications follow.
    async fn on_transport_error(&self, path: &str, error: &VillageError) {
        warn!("Error occurred while observing {}: {}", path, error);
    }
}

/// Adapts a plain closure into an [`Observer`].
pub struct FnObserver<F> {
    callback: F,
}

#[async_trait]
impl<F> Observer for FnObserver<F>
where
    F: Fn(SensorState) + Send + Sync + 'static,
{
    async fn on_notification(&self, notification: Notification) {
        (self.callback)(notification.state);
    }
}

pub fn observer_fn<F>(callback: F) -> Arc<dyn Observer>
where
    F: Fn(SensorState) + Send + Sync + 'static,
{
    Arc::new(FnObserver { callback })
}

/// Uniform access to one resource, local or remote.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    fn path(&self) -> &str;

    /// Human-readable location used in logs.
    fn describe(&self) -> String {
        self.path().to_string()
    }

    async fn get(&self) -> Result<SensorState>;

    /// Send an encoded write body.
    async fn post(&self, body: &[u8]) -> Result<()>;

    /// Open a long-lived watch. Fails with `Connect` when the resource
    /// cannot be reached.
    async fn observe(&self, observer: Arc<dyn Observer>) -> Result<Subscription>;

    async fn write_state(&self, state: &SensorState) -> Result<()> {
        let body = payload::encode_state(state)?;
        self.post(&body).await
    }
}
