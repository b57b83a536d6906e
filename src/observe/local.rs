//! In-process client for a resource living in the same address space.

use super::{Observer, ResourceClient, Subscription};
use crate::error::Result;
use crate::resource::ObservableResource;
use crate::sensors::SensorState;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Talks to an [`ObservableResource`] directly, without a transport.
#[derive(Clone)]
pub struct LocalClient {
    resource: Arc<ObservableResource>,
}

impl LocalClient {
    pub fn new(resource: Arc<ObservableResource>) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &Arc<ObservableResource> {
        &self.resource
    }
}

#[async_trait]
impl ResourceClient for LocalClient {
    fn path(&self) -> &str {
        self.resource.path()
    }

    fn describe(&self) -> String {
        format!("local{}", self.resource.path())
    }

    async fn get(&self) -> Result<SensorState> {
        Ok(self.resource.read())
    }

    async fn post(&self, body: &[u8]) -> Result<()> {
        self.resource.post(body).map(|_| ())
    }

    async fn observe(&self, observer: Arc<dyn Observer>) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.resource.subscribe(tx);
        let resource = Arc::downgrade(&self.resource);
        Ok(Subscription::spawn(
            self.resource.path(),
            observer,
            rx,
            move || {
                if let Some(resource) = resource.upgrade() {
                    resource.unsubscribe(id);
                }
            },
        ))
    }
}
