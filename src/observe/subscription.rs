//! Subscription handle and its delivery task.

use super::{Delivery, Observer};
use crate::error::VillageError;
use crate::sensors::SensorState;
use log::debug;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Detach = Box<dyn FnOnce() + Send + Sync>;

#[derive(Default)]
struct Shared {
    last_seen: Mutex<Option<SensorState>>,
    delivered: AtomicU64,
    terminal: AtomicBool,
}

/// An active watch on one resource.
///
/// Dropping the handle cancels the watch. Updates already queued when the
/// watch is cancelled are discarded; a callback that is already running
/// is allowed to finish.
pub struct Subscription {
    resource_path: String,
    shared: Arc<Shared>,
    detach: Option<Detach>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Start delivering everything that arrives on `rx` to `observer`.
    ///
    /// `detach` is run once when the subscription is cancelled and should
    /// remove the matching sink from the resource or transport.
    pub(crate) fn spawn(
        resource_path: impl Into<String>,
        observer: Arc<dyn Observer>,
        rx: mpsc::UnboundedReceiver<Delivery>,
        detach: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        let resource_path = resource_path.into();
        let shared = Arc::new(Shared::default());
        let task = tokio::spawn(deliver(
            resource_path.clone(),
            observer,
            rx,
            shared.clone(),
        ));
        Self {
            resource_path,
            shared,
            detach: Some(Box::new(detach)),
            task: Some(task),
        }
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    /// Last state handed to the observer.
    pub fn last_seen(&self) -> Option<SensorState> {
        *self.shared.last_seen.lock()
    }

    /// Number of updates handed to the observer so far.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// True once the watch was cancelled or its connection was lost.
    pub fn is_terminal(&self) -> bool {
        self.shared.terminal.load(Ordering::SeqCst)
    }

    /// Stop watching. Safe to call more than once.
    pub fn cancel(&mut self) {
        self.shared.terminal.store(true, Ordering::SeqCst);
        if let Some(detach) = self.detach.take() {
            debug!("[Observe] cancelling watch on {}", self.resource_path);
            detach();
        }
    }

    /// Wait for the delivery task to finish after a cancel or a lost connection.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("resource_path", &self.resource_path)
            .field("delivered", &self.delivered())
            .field("terminal", &self.is_terminal())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn deliver(
    path: String,
    observer: Arc<dyn Observer>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    shared: Arc<Shared>,
) {
    while let Some(delivery) = rx.recv().await {
        if shared.terminal.load(Ordering::SeqCst) {
            break;
        }
        match delivery {
            Delivery::Update(notification) => {
                *shared.last_seen.lock() = Some(notification.state);
                shared.delivered.fetch_add(1, Ordering::SeqCst);
                observer.on_notification(notification).await;
            }
            Delivery::Lost(reason) => {
                shared.terminal.store(true, Ordering::SeqCst);
                observer
                    .on_transport_error(&path, &VillageError::Transport(reason))
                    .await;
                break;
            }
        }
    }
    shared.terminal.store(true, Ordering::SeqCst);
    debug!("[Observe] delivery for {} finished", path);
}
