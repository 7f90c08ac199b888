//! LAN discovery.
//!
//! Gateways answer a one-byte `D` datagram sent to the broadcast address with
//! `product:mac:code:firmware[:uuid]`. One socket is kept open at a time; a
//! reader task parses replies and stores the sender address on the gateway
//! with the matching uuid.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use protocol::DiscoveryReply;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::GatewayRegistry;

/// Probe datagram.
pub const DISCOVERY_PROBE: &[u8] = b"D";

/// Default discovery port.
pub const DISCOVERY_PORT: u16 = 30303;

/// A parsed reply and where it came from.
#[derive(Debug, Clone)]
pub struct DiscoveredGateway {
    pub reply: DiscoveryReply,
    pub from: SocketAddr,
    /// Registered gateway the reply was matched to.
    pub gateway_id: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct DiscoverySettings {
    /// Where the probe is sent.
    pub target: SocketAddr,
    /// Local address the socket binds to.
    pub bind: SocketAddr,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([255, 255, 255, 255], DISCOVERY_PORT)),
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

struct OpenSocket {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

pub struct DiscoveryBroadcaster {
    registry: Arc<GatewayRegistry>,
    settings: DiscoverySettings,
    slot: Mutex<Option<OpenSocket>>,
    replies: broadcast::Sender<DiscoveredGateway>,
}

impl DiscoveryBroadcaster {
    pub fn new(registry: Arc<GatewayRegistry>, settings: DiscoverySettings) -> Self {
        let (replies, _) = broadcast::channel(64);
        Self {
            registry,
            settings,
            slot: Mutex::new(None),
            replies,
        }
    }

    /// Parsed replies as they arrive.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveredGateway> {
        self.replies.subscribe()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Opens the socket, sends the probe and starts the reply reader.
    ///
    /// Returns `Ok(false)` without sending anything when a socket is already open.
    pub async fn auto_discover(&self) -> io::Result<bool> {
        let socket = {
            let mut slot = lock(&self.slot);
            if slot.is_some() {
                trace!("discovery socket already open");
                return Ok(false);
            }

            let std_socket = std::net::UdpSocket::bind(self.settings.bind)?;
            std_socket.set_broadcast(true)?;
            std_socket.set_nonblocking(true)?;
            let socket = Arc::new(UdpSocket::from_std(std_socket)?);

            let cancel = CancellationToken::new();
            let reader = tokio::spawn(read_replies(
                Arc::clone(&socket),
                Arc::clone(&self.registry),
                self.replies.clone(),
                cancel.clone(),
            ));
            *slot = Some(OpenSocket {
                socket: Arc::clone(&socket),
                cancel,
                reader,
            });
            socket
        };

        if let Err(e) = socket.send_to(DISCOVERY_PROBE, self.settings.target).await {
            warn!(target = %self.settings.target, error = %e, "discovery probe failed");
            self.close_socket();
            return Err(e);
        }
        debug!(target = %self.settings.target, "discovery probe sent");
        Ok(true)
    }

    /// Stops the reader and releases the socket. Idempotent.
    pub fn close_socket(&self) {
        if let Some(open) = lock(&self.slot).take() {
            open.cancel.cancel();
            open.reader.abort();
            drop(open.socket);
            debug!("discovery socket closed");
        }
    }
}

impl Drop for DiscoveryBroadcaster {
    fn drop(&mut self) {
        self.close_socket();
    }
}

async fn read_replies(
    socket: Arc<UdpSocket>,
    registry: Arc<GatewayRegistry>,
    replies: broadcast::Sender<DiscoveredGateway>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 512];
    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "discovery socket read failed");
                    break;
                }
            },
        };

        if &buf[..len] == DISCOVERY_PROBE {
            // our own broadcast looped back
            continue;
        }

        let text = String::from_utf8_lossy(&buf[..len]);
        let reply = match DiscoveryReply::parse(&text) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(%from, error = %e, "ignoring discovery datagram");
                continue;
            }
        };

        let address = from.ip().to_string();
        let gateway_id = reply
            .uuid
            .as_deref()
            .and_then(|uuid| registry.set_address_by_uuid(uuid, &address));
        info!(
            product = %reply.product,
            mac = %reply.mac,
            %address,
            gateway_id = ?gateway_id,
            "gateway discovered"
        );
        let _ = replies.send(DiscoveredGateway {
            reply,
            from,
            gateway_id,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
