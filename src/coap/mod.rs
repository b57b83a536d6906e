//! CoAP transport for observable resources.
//!
//! [`ResourceServer`] hosts resources on a UDP socket, [`CoapClient`]
//! reaches one resource on a remote server. Both share [`Transmitter`],
//! which owns message ids and retransmits confirmable messages until the
//! peer acknowledges them.

pub mod client;
pub mod message;
pub mod server;

pub use client::CoapClient;
pub use message::{Code, Message, MessageType};
pub use server::ResourceServer;

use crate::error::{Result, VillageError};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

pub const DEFAULT_PORT: u16 = 5683;
pub const WELL_KNOWN_CORE: &str = "/.well-known/core";
pub const MAX_DATAGRAM: usize = 1152;

/// How long a server remembers a confirmable exchange for duplicate detection.
pub const EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);

/// Confirmable retransmission schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmission {
    /// Wait before the first retransmission; doubled on every retry.
    pub ack_timeout: Duration,
    pub max_retransmit: u32,
}

impl Default for Retransmission {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            max_retransmit: 4,
        }
    }
}

type ExchangeKey = (SocketAddr, u16);

/// Sends datagrams and matches ACK/RST replies to outstanding confirmables.
pub struct Transmitter {
    socket: Arc<UdpSocket>,
    retransmission: Retransmission,
    next_mid: AtomicU16,
    pending: Mutex<HashMap<ExchangeKey, oneshot::Sender<Message>>>,
}

impl Transmitter {
    pub fn new(socket: Arc<UdpSocket>, retransmission: Retransmission) -> Self {
        Self {
            socket,
            retransmission,
            next_mid: AtomicU16::new(rand::random()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn next_message_id(&self) -> u16 {
        self.next_mid.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn send(&self, message: &Message, peer: SocketAddr) -> Result<()> {
        trace!("[CoAP TX] {} to {}", message, peer);
        self.send_bytes(&message.encode(), peer).await
    }

    pub async fn send_bytes(&self, data: &[u8], peer: SocketAddr) -> Result<()> {
        debug!("[CoAP TX] {} bytes to {}", data.len(), peer);
        let preview_len = data.len().min(64);
        trace!("[CoAP TX] payload: {:02x?}", &data[..preview_len]);
        self.socket.send_to(data, peer).await?;
        Ok(())
    }

    /// Send a CON message and wait for the matching ACK or RST.
    ///
    /// Fails with `Transport` once every retransmission went unanswered.
    pub async fn send_confirmable(&self, message: &Message, peer: SocketAddr) -> Result<Message> {
        let key = (peer, message.message_id);
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(key, tx);

        let result = self.retransmit(message, peer, &mut rx).await;
        self.pending.lock().remove(&key);
        result
    }

    async fn retransmit(
        &self,
        message: &Message,
        peer: SocketAddr,
        rx: &mut oneshot::Receiver<Message>,
    ) -> Result<Message> {
        let mut timeout = self.retransmission.ack_timeout;
        for attempt in 0..=self.retransmission.max_retransmit {
            if attempt > 0 {
                debug!(
                    "[CoAP] retransmitting mid={} to {} (attempt {})",
                    message.message_id,
                    peer,
                    attempt + 1
                );
            }
            self.send(message, peer).await?;
            match tokio::time::timeout(timeout, &mut *rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => {
                    return Err(VillageError::Transport(format!(
                        "exchange mid={} with {} abandoned",
                        message.message_id, peer
                    )));
                }
                Err(_) => timeout *= 2,
            }
        }
        Err(VillageError::Transport(format!(
            "no reply from {} after {} attempts",
            peer,
            self.retransmission.max_retransmit + 1
        )))
    }

    /// Route an ACK or RST to the confirmable waiting for it.
    pub fn complete(&self, peer: SocketAddr, reply: Message) -> bool {
        let waiter = self.pending.lock().remove(&(peer, reply.message_id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Drop every outstanding confirmable; their senders see `Transport`.
    pub fn abandon_all(&self) {
        self.pending.lock().clear();
    }
}

/// Dump the first bytes of an inbound datagram.
pub(crate) fn log_received(data: &[u8], peer: SocketAddr) {
    debug!("[CoAP RX] {} bytes from {}", data.len(), peer);
    let preview_len = data.len().min(64);
    trace!("[CoAP RX] payload: {:02x?}", &data[..preview_len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Retransmission {
        Retransmission {
            ack_timeout: Duration::from_millis(20),
            max_retransmit: 2,
        }
    }

    #[tokio::test]
    async fn test_unanswered_confirmable_gives_up() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = silent.local_addr().unwrap();
        let transmitter = Transmitter::new(socket, fast());

        let request = Message::request(
            MessageType::Confirmable,
            Code::GET,
            transmitter.next_message_id(),
            vec![1],
            "/ImmersionTempResource",
        );
        let err = transmitter.send_confirmable(&request, peer).await.unwrap_err();
        assert!(matches!(err, VillageError::Transport(_)));

        // Original plus two retransmissions reached the peer.
        let mut buf = [0u8; MAX_DATAGRAM];
        for _ in 0..3 {
            let (len, _) = silent.recv_from(&mut buf).await.unwrap();
            assert_eq!(Message::decode(&buf[..len]).unwrap(), request);
        }
    }

    #[tokio::test]
    async fn test_complete_wakes_waiter() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = peer_socket.local_addr().unwrap();
        let transmitter = Arc::new(Transmitter::new(socket, Retransmission::default()));

        let request = Message::request(
            MessageType::Confirmable,
            Code::GET,
            42,
            Vec::new(),
            "/ChlorineResource",
        );
        let waiter = {
            let transmitter = transmitter.clone();
            let request = request.clone();
            tokio::spawn(async move { transmitter.send_confirmable(&request, peer).await })
        };

        let mut buf = [0u8; MAX_DATAGRAM];
        let _ = peer_socket.recv_from(&mut buf).await.unwrap();
        let ack = Message::empty(MessageType::Acknowledgement, 42);
        assert!(transmitter.complete(peer, ack.clone()));
        assert_eq!(waiter.await.unwrap().unwrap(), ack);
        assert!(!transmitter.complete(peer, ack));
    }
}
