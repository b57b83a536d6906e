//! UDP server hosting a set of observable resources.

use super::message::{FORMAT_JSON, FORMAT_LINK, FORMAT_TEXT_PLAIN};
use super::{
    Code, EXCHANGE_LIFETIME, MAX_DATAGRAM, Message, MessageType, Retransmission, Transmitter,
    WELL_KNOWN_CORE, log_received,
};
use crate::error::Result;
use crate::observe::Delivery;
use crate::resource::{ObservableResource, SubscriberId, payload};
use crate::sensors::SensorState;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type ObserverKey = (SocketAddr, Vec<u8>);

struct CachedResponse {
    bytes: Vec<u8>,
    at: Instant,
}

/// A remote observer registered on one of the hosted resources.
struct RemoteObserver {
    path: String,
    subscriber: SubscriberId,
    resource: Arc<ObservableResource>,
    forwarder: JoinHandle<()>,
}

impl RemoteObserver {
    fn detach(self) {
        self.resource.unsubscribe(self.subscriber);
        self.forwarder.abort();
    }
}

struct ServerShared {
    name: String,
    resources: BTreeMap<String, Arc<ObservableResource>>,
    transmitter: Transmitter,
    exchanges: Mutex<HashMap<(SocketAddr, u16), CachedResponse>>,
    observers: Mutex<HashMap<ObserverKey, RemoteObserver>>,
    cancel: CancellationToken,
}

/// Serves GET, observe registration and POST for its resources until stopped.
pub struct ResourceServer {
    name: String,
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ResourceServer {
    pub async fn bind(
        name: impl Into<String>,
        addr: impl ToSocketAddrs,
        resources: Vec<Arc<ObservableResource>>,
    ) -> Result<Self> {
        Self::bind_with(name, addr, resources, Retransmission::default()).await
    }

    pub async fn bind_with(
        name: impl Into<String>,
        addr: impl ToSocketAddrs,
        resources: Vec<Arc<ObservableResource>>,
        retransmission: Retransmission,
    ) -> Result<Self> {
        let name = name.into();
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let cancel = CancellationToken::new();

        let resources: BTreeMap<String, Arc<ObservableResource>> = resources
            .into_iter()
            .map(|r| (r.path().to_string(), r))
            .collect();
        info!(
            "[CoAP] {} listening on {} ({})",
            name,
            local_addr,
            resources.keys().cloned().collect::<Vec<_>>().join(", ")
        );

        let shared = Arc::new(ServerShared {
            name: name.clone(),
            resources,
            transmitter: Transmitter::new(socket.clone(), retransmission),
            exchanges: Mutex::new(HashMap::new()),
            observers: Mutex::new(HashMap::new()),
            cancel: cancel.clone(),
        });
        let task = tokio::spawn(serve(shared.clone(), socket));

        Ok(Self {
            name,
            local_addr,
            shared,
            cancel,
            task: Some(task),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn resource(&self, path: &str) -> Option<&Arc<ObservableResource>> {
        self.shared.resources.get(path)
    }

    /// Number of remote observers currently registered.
    pub fn observer_count(&self) -> usize {
        self.shared.observers.lock().len()
    }

    /// Stop serving and drop every remote observer.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ResourceServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(shared: Arc<ServerShared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    log_received(&buf[..len], peer);
                    shared.handle_datagram(&buf[..len], peer).await;
                }
                Err(e) => {
                    error!("[CoAP] {} error receiving packet: {}", shared.name, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    let observers: Vec<RemoteObserver> = shared.observers.lock().drain().map(|(_, o)| o).collect();
    for observer in observers {
        observer.detach();
    }
    shared.transmitter.abandon_all();
    info!("[CoAP] {} stopped", shared.name);
}

impl ServerShared {
    async fn handle_datagram(self: &Arc<Self>, data: &[u8], peer: SocketAddr) {
        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("[CoAP] {} undecodable datagram from {}: {}", self.name, peer, e);
                // A confirmable we cannot parse is rejected with RST.
                if data.len() >= 4 && (data[0] >> 4) & 0x03 == 0 {
                    let mid = u16::from_be_bytes([data[2], data[3]]);
                    self.reply(&Message::empty(MessageType::Reset, mid), peer).await;
                }
                return;
            }
        };

        match message.mtype {
            MessageType::Acknowledgement | MessageType::Reset => {
                let mid = message.message_id;
                if !self.transmitter.complete(peer, message) {
                    debug!("[CoAP] {} unmatched reply mid={} from {}", self.name, mid, peer);
                }
            }
            MessageType::Confirmable if message.is_empty() => {
                // CoAP ping
                self.reply(&Message::empty(MessageType::Reset, message.message_id), peer)
                    .await;
            }
            _ if message.code.is_request() => self.handle_request(message, peer).await,
            _ => debug!("[CoAP] {} ignoring {} from {}", self.name, message, peer),
        }
    }

    async fn handle_request(self: &Arc<Self>, request: Message, peer: SocketAddr) {
        let confirmable = request.mtype == MessageType::Confirmable;
        let key = (peer, request.message_id);

        if confirmable {
            let cached = {
                let mut exchanges = self.exchanges.lock();
                exchanges.retain(|_, c| c.at.elapsed() < EXCHANGE_LIFETIME);
                exchanges.get(&key).map(|c| c.bytes.clone())
            };
            if let Some(bytes) = cached {
                debug!(
                    "[CoAP] {} duplicate mid={} from {}, replaying response",
                    self.name, request.message_id, peer
                );
                let _ = self.transmitter.send_bytes(&bytes, peer).await;
                return;
            }
        }

        debug!("[CoAP] {} {} from {}", self.name, request, peer);
        let (response, release) = self.respond(&request, peer);
        let bytes = response.encode();
        if confirmable {
            self.exchanges.lock().insert(
                key,
                CachedResponse {
                    bytes: bytes.clone(),
                    at: Instant::now(),
                },
            );
        }
        if let Err(e) = self.transmitter.send_bytes(&bytes, peer).await {
            warn!("[CoAP] {} failed to answer {}: {}", self.name, peer, e);
        }
        // Notifications only start once the registration response is out.
        if let Some(release) = release {
            let _ = release.send(());
        }
    }

    /// Build the response to `request`. A new observe registration also
    /// returns the trigger that starts its forwarder.
    fn respond(
        self: &Arc<Self>,
        request: &Message,
        peer: SocketAddr,
    ) -> (Message, Option<oneshot::Sender<()>>) {
        let mut response = if request.mtype == MessageType::Confirmable {
            Message::new(
                MessageType::Acknowledgement,
                Code::CONTENT,
                request.message_id,
                request.token.clone(),
            )
        } else {
            Message::new(
                MessageType::NonConfirmable,
                Code::CONTENT,
                self.transmitter.next_message_id(),
                request.token.clone(),
            )
        };

        let path = request.uri_path();
        if path == WELL_KNOWN_CORE {
            if request.code == Code::GET {
                response.set_content_format(FORMAT_LINK);
                response.payload = self.link_format().into_bytes();
            } else {
                set_error(&mut response, Code::METHOD_NOT_ALLOWED, &path);
            }
            return (response, None);
        }

        let Some(resource) = self.resources.get(&path) else {
            set_error(&mut response, Code::NOT_FOUND, &path);
            return (response, None);
        };

        let mut release = None;
        match request.code {
            Code::GET => match request.observe() {
                Some(0) => release = self.register(resource, request, peer, &mut response),
                Some(1) => {
                    self.deregister(&(peer, request.token.clone()));
                    fill_state(&resource.read(), resource, &mut response);
                }
                _ => fill_state(&resource.read(), resource, &mut response),
            },
            Code::POST => match resource.post(&request.payload) {
                Ok(ack) => {
                    debug!(
                        "[CoAP] {} {} changed to {} ({} notified)",
                        self.name, path, ack.state, ack.notified
                    );
                    response.code = Code::CHANGED;
                }
                Err(e) => {
                    warn!("[CoAP] {} rejected POST to {}: {}", self.name, path, e);
                    set_error(&mut response, Code::INTERNAL_SERVER_ERROR, &e.to_string());
                }
            },
            _ => set_error(&mut response, Code::METHOD_NOT_ALLOWED, &path),
        }
        (response, release)
    }

    fn register(
        self: &Arc<Self>,
        resource: &Arc<ObservableResource>,
        request: &Message,
        peer: SocketAddr,
        response: &mut Message,
    ) -> Option<oneshot::Sender<()>> {
        let key = (peer, request.token.clone());
        self.deregister(&key);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = resource.subscribe(tx);
        let initial = match rx.try_recv() {
            Ok(Delivery::Update(notification)) => notification,
            _ => {
                resource.unsubscribe(subscriber);
                fill_state(&resource.read(), resource, response);
                return None;
            }
        };

        fill_state(&initial.state, resource, response);
        response.set_observe(initial.sequence as u32);

        let (release, released) = oneshot::channel();
        let forwarder = tokio::spawn(forward(
            Arc::downgrade(self),
            key.clone(),
            resource.clone(),
            subscriber,
            released,
            rx,
        ));
        info!(
            "[CoAP] {} {} observed by {} (token {:02x?})",
            self.name,
            resource.path(),
            peer,
            request.token
        );
        self.observers.lock().insert(
            key,
            RemoteObserver {
                path: resource.path().to_string(),
                subscriber,
                resource: resource.clone(),
                forwarder,
            },
        );
        Some(release)
    }

    fn deregister(&self, key: &ObserverKey) {
        let removed = self.observers.lock().remove(key);
        if let Some(observer) = removed {
            info!(
                "[CoAP] {} {} no longer observed by {}",
                self.name, observer.path, key.0
            );
            observer.detach();
        }
    }

    /// Remove the entry for `key` if it still belongs to `subscriber`.
    fn abandon(&self, key: &ObserverKey, path: &str, subscriber: SubscriberId) {
        let mut observers = self.observers.lock();
        let owned = observers
            .get(key)
            .is_some_and(|o| o.subscriber == subscriber && o.path == path);
        if owned {
            observers.remove(key);
        }
    }

    fn link_format(&self) -> String {
        self.resources
            .values()
            .map(|r| format!("<{}>;title=\"{}\";ct={};obs", r.path(), r.title(), FORMAT_JSON))
            .collect::<Vec<_>>()
            .join(",")
    }

    async fn reply(&self, message: &Message, peer: SocketAddr) {
        if let Err(e) = self.transmitter.send(message, peer).await {
            warn!("[CoAP] {} failed to send to {}: {}", self.name, peer, e);
        }
    }
}

/// Push notifications for one remote observer as confirmables, in order.
async fn forward(
    server: Weak<ServerShared>,
    key: ObserverKey,
    resource: Arc<ObservableResource>,
    subscriber: SubscriberId,
    released: oneshot::Receiver<()>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) {
    if released.await.is_err() {
        return;
    }
    let peer = key.0;
    while let Some(delivery) = rx.recv().await {
        let Delivery::Update(notification) = delivery else {
            break;
        };
        let Some(server) = server.upgrade() else {
            break;
        };

        let mut message = Message::new(
            MessageType::Confirmable,
            Code::CONTENT,
            server.transmitter.next_message_id(),
            key.1.clone(),
        );
        fill_state(&notification.state, &resource, &mut message);
        message.set_observe(notification.sequence as u32);

        let outcome = tokio::select! {
            _ = server.cancel.cancelled() => break,
            outcome = server.transmitter.send_confirmable(&message, peer) => outcome,
        };
        let reason = match outcome {
            Ok(reply) if reply.mtype == MessageType::Reset => "reset by observer".to_string(),
            Ok(_) => continue,
            Err(e) => e.to_string(),
        };

        info!(
            "[CoAP] {} dropping observer {} of {}: {}",
            server.name,
            peer,
            resource.path(),
            reason
        );
        resource.unsubscribe(subscriber);
        server.abandon(&key, resource.path(), subscriber);
        break;
    }
}

fn fill_state(state: &SensorState, resource: &ObservableResource, message: &mut Message) {
    match payload::encode_state(state) {
        Ok(body) => {
            message.code = Code::CONTENT;
            message.set_content_format(FORMAT_JSON);
            message.set_max_age(resource.max_age().as_secs() as u32);
            message.payload = body;
        }
        Err(e) => set_error(message, Code::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn set_error(message: &mut Message, code: Code, diagnostic: &str) {
    message.code = code;
    message.set_content_format(FORMAT_TEXT_PLAIN);
    message.payload = diagnostic.as_bytes().to_vec();
}
