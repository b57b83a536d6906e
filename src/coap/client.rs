//! Client for one resource on a remote [`ResourceServer`](super::ResourceServer).

use super::{
    Code, MAX_DATAGRAM, Message, MessageType, Retransmission, Transmitter, WELL_KNOWN_CORE,
    log_received,
};
use crate::error::{Result, VillageError};
use crate::observe::{Delivery, NotificationSink, Observer, ResourceClient, Subscription};
use crate::resource::{Notification, payload};
use crate::sensors::SensorState;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Notifications older than this are accepted regardless of their sequence.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(128);
const SEQUENCE_HALF_RANGE: u32 = 1 << 23;

struct RemoteObservation {
    sink: NotificationSink,
    last: Option<(u32, Instant)>,
}

impl RemoteObservation {
    /// Reordering check for 24-bit observe sequence numbers.
    fn is_fresh(&self, sequence: u32) -> bool {
        let Some((last, at)) = self.last else {
            return true;
        };
        (last < sequence && sequence - last < SEQUENCE_HALF_RANGE)
            || (last > sequence && last - sequence > SEQUENCE_HALF_RANGE)
            || at.elapsed() > FRESHNESS_WINDOW
    }
}

#[derive(Default)]
struct Observations {
    by_token: Mutex<HashMap<Vec<u8>, RemoteObservation>>,
}

impl Observations {
    /// Hand a notification to the observation owning its token.
    /// Returns false for unknown tokens.
    fn route(&self, path: &str, message: &Message) -> bool {
        let mut by_token = self.by_token.lock();
        let Some(observation) = by_token.get_mut(&message.token) else {
            return false;
        };

        if message.code.is_error() || message.observe().is_none() {
            let reason = format!("observation of {} ended with {}", path, message.code);
            let _ = observation.sink.send(Delivery::Lost(reason));
            by_token.remove(&message.token);
            return true;
        }

        let sequence = message.observe().unwrap_or_default();
        if !observation.is_fresh(sequence) {
            debug!("[CoAP] stale notification {} for {} dropped", sequence, path);
            return true;
        }

        match payload::decode_reading(&message.payload) {
            Ok(state) => {
                observation.last = Some((sequence, Instant::now()));
                let notification = Notification {
                    path: path.to_string(),
                    sequence: sequence as u64,
                    state,
                    at: Utc::now(),
                };
                let _ = observation.sink.send(Delivery::Update(notification));
            }
            Err(e) => warn!("[CoAP] unreadable notification for {}: {}", path, e),
        }
        true
    }

    fn forget(&self, token: &[u8]) {
        self.by_token.lock().remove(token);
    }

    /// The socket failed: every live observation ends.
    fn socket_failed(&self, peer: SocketAddr, error: &std::io::Error) {
        error!("[CoAP] error receiving from {}: {}", peer, error);
        self.lose_all(&error.to_string());
    }

    fn lose_all(&self, reason: &str) {
        let lost: Vec<RemoteObservation> = self.by_token.lock().drain().map(|(_, o)| o).collect();
        for observation in lost {
            let _ = observation.sink.send(Delivery::Lost(reason.to_string()));
        }
    }
}

/// Socket side of a client: the receive loop and the observations it feeds.
///
/// Shared by the client and by every subscription opened through it, so
/// the loop keeps running until the last of them is gone.
struct Connection {
    transmitter: Arc<Transmitter>,
    observations: Arc<Observations>,
    receiver: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.receiver.abort();
        self.observations.lose_all("client closed");
    }
}

/// Reaches one resource path on one server.
pub struct CoapClient {
    peer: SocketAddr,
    path: String,
    connection: Arc<Connection>,
}

impl CoapClient {
    pub async fn connect(addr: impl ToSocketAddrs, path: impl Into<String>) -> Result<Self> {
        Self::connect_with(addr, path, Retransmission::default()).await
    }

    pub async fn connect_with(
        addr: impl ToSocketAddrs,
        path: impl Into<String>,
        retransmission: Retransmission,
    ) -> Result<Self> {
        let peer = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| VillageError::Connect(e.to_string()))?
            .next()
            .ok_or_else(|| VillageError::Connect("address resolved to nothing".to_string()))?;
        let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let path = path.into();

        let transmitter = Arc::new(Transmitter::new(socket.clone(), retransmission));
        let observations = Arc::new(Observations::default());
        let receiver = tokio::spawn(receive(
            socket,
            peer,
            path.clone(),
            transmitter.clone(),
            observations.clone(),
        ));
        debug!("[CoAP] client for coap://{}{} ready", peer, path);

        Ok(Self {
            peer,
            path,
            connection: Arc::new(Connection {
                transmitter,
                observations,
                receiver,
            }),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Fetch the server's CoRE link-format resource listing.
    pub async fn discover(&self) -> Result<String> {
        let reply = self.exchange(Code::GET, WELL_KNOWN_CORE, Vec::new()).await?;
        match reply.code {
            Code::CONTENT => Ok(String::from_utf8_lossy(&reply.payload).into_owned()),
            code => Err(self.unexpected(WELL_KNOWN_CORE, code, &reply)),
        }
    }

    async fn exchange(&self, code: Code, path: &str, payload: Vec<u8>) -> Result<Message> {
        let mut request = Message::request(
            MessageType::Confirmable,
            code,
            self.connection.transmitter.next_message_id(),
            new_token(),
            path,
        );
        request.payload = payload;
        let reply = self.connection.transmitter.send_confirmable(&request, self.peer).await?;
        if reply.mtype == MessageType::Reset {
            return Err(VillageError::Transport(format!(
                "{} reset the request for {}",
                self.peer, path
            )));
        }
        Ok(reply)
    }

    fn unexpected(&self, path: &str, code: Code, reply: &Message) -> VillageError {
        let diagnostic = String::from_utf8_lossy(&reply.payload);
        match code {
            Code::NOT_FOUND => VillageError::ResourceNotFound(format!("coap://{}{}", self.peer, path)),
            Code::METHOD_NOT_ALLOWED => VillageError::MethodNotAllowed(path.to_string()),
            Code::INTERNAL_SERVER_ERROR => VillageError::WriteFailure(diagnostic.into_owned()),
            code => VillageError::UnexpectedResponse(format!("{} {}", code, diagnostic)),
        }
    }
}

#[async_trait]
impl ResourceClient for CoapClient {
    fn path(&self) -> &str {
        &self.path
    }

    fn describe(&self) -> String {
        format!("coap://{}{}", self.peer, self.path)
    }

    async fn get(&self) -> Result<SensorState> {
        let reply = self.exchange(Code::GET, &self.path, Vec::new()).await?;
        match reply.code {
            Code::CONTENT => payload::decode_reading(&reply.payload),
            code => Err(self.unexpected(&self.path, code, &reply)),
        }
    }

    async fn post(&self, body: &[u8]) -> Result<()> {
        let reply = self.exchange(Code::POST, &self.path, body.to_vec()).await?;
        match reply.code {
            Code::CHANGED => Ok(()),
            code => Err(self.unexpected(&self.path, code, &reply)),
        }
    }

    async fn observe(&self, observer: Arc<dyn Observer>) -> Result<Subscription> {
        let token = new_token();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connection.observations.by_token.lock().insert(
            token.clone(),
            RemoteObservation {
                sink: tx,
                last: None,
            },
        );

        let mut request = Message::request(
            MessageType::Confirmable,
            Code::GET,
            self.connection.transmitter.next_message_id(),
            token.clone(),
            &self.path,
        );
        request.set_observe(0);

        let sent = self
            .connection
            .transmitter
            .send_confirmable(&request, self.peer)
            .await;
        let reply = match sent {
            Ok(reply) if reply.code.is_success() && reply.observe().is_some() => reply,
            Ok(reply) => {
                self.connection.observations.forget(&token);
                return Err(VillageError::Connect(format!(
                    "{} refused observation ({})",
                    self.describe(),
                    reply.code
                )));
            }
            Err(e) => {
                self.connection.observations.forget(&token);
                return Err(VillageError::Connect(format!("{}: {}", self.describe(), e)));
            }
        };
        self.connection.observations.route(&self.path, &reply);
        info!("[CoAP] observing {}", self.describe());

        let connection = self.connection.clone();
        let peer = self.peer;
        let mut deregister = Message::request(
            MessageType::NonConfirmable,
            Code::GET,
            connection.transmitter.next_message_id(),
            token.clone(),
            &self.path,
        );
        deregister.set_observe(1);

        // The detach closure owns the connection, so the watch outlives the client.
        Ok(Subscription::spawn(self.path.clone(), observer, rx, move || {
            connection.observations.forget(&token);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = connection.transmitter.send(&deregister, peer).await {
                        debug!("[CoAP] deregistration to {} failed: {}", peer, e);
                    }
                });
            }
        }))
    }
}

fn new_token() -> Vec<u8> {
    rand::random::<[u8; 8]>().to_vec()
}

async fn receive(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    path: String,
    transmitter: Arc<Transmitter>,
    observations: Arc<Observations>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                observations.socket_failed(peer, &e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if from != peer {
            debug!("[CoAP] ignoring datagram from unexpected peer {}", from);
            continue;
        }
        log_received(&buf[..len], from);

        let message = match Message::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                warn!("[CoAP] undecodable datagram from {}: {}", from, e);
                continue;
            }
        };

        match message.mtype {
            MessageType::Acknowledgement | MessageType::Reset => {
                let mid = message.message_id;
                if !transmitter.complete(from, message) {
                    debug!("[CoAP] unmatched reply mid={} from {}", mid, from);
                }
            }
            MessageType::Confirmable => {
                let known = observations.route(&path, &message);
                let reply = if known {
                    Message::empty(MessageType::Acknowledgement, message.message_id)
                } else {
                    debug!("[CoAP] rejecting {} with unknown token", message);
                    Message::empty(MessageType::Reset, message.message_id)
                };
                if let Err(e) = transmitter.send(&reply, from).await {
                    warn!("[CoAP] failed to answer {}: {}", from, e);
                }
            }
            MessageType::NonConfirmable => {
                if !observations.route(&path, &message) {
                    debug!("[CoAP] ignoring {} with unknown token", message);
                }
            }
        }
    }
}
