use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::messaging::mailbox::Mailbox;
use crate::messaging::message::Message;

/// Inbound side of the transport: accepts connections for the lifetime of the session and
///  reads length-prefixed frames off each one until the remote end closes it. Every decoded
///  message goes to the inbound mailbox. Transport faults abandon the one connection they
///  happened on, never the listener.
pub struct Listener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, inbound: Arc<Mailbox>) -> anyhow::Result<Listener> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let accept_task = tokio::spawn(accept_loop(listener, inbound));
        Ok(Listener {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections. Connections already open keep draining until their
    ///  remote ends close them.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, inbound: Arc<Mailbox>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                trace!(?remote, "accepted inbound connection");
                tokio::spawn(read_loop(stream, remote, inbound.clone()));
            }
            Err(e) => {
                warn!("error accepting connection: {}", e);
            }
        }
    }
}

async fn read_loop(mut stream: TcpStream, remote: SocketAddr, inbound: Arc<Mailbox>) {
    loop {
        match Message::read_frame(&mut stream).await {
            Ok(Some(message)) => inbound.push(message),
            Ok(None) => break,
            Err(e) => {
                warn!(?remote, "dropping connection after malformed frame: {}", e);
                break;
            }
        }
    }
}

/// Cache of outbound connections, one slot per destination.
///
/// The slot is created atomically under the map lock, but the connection inside it is
///  provisioned lazily by whichever sender task locks the slot first - concurrent first use
///  of a destination never opens two parallel connections to it.
pub struct ConnectionCache {
    slots: Mutex<FxHashMap<SocketAddr, Arc<Mutex<Option<TcpStream>>>>>,
}

impl ConnectionCache {
    pub fn new() -> ConnectionCache {
        ConnectionCache {
            slots: Mutex::new(FxHashMap::default()),
        }
    }

    pub async fn slot(&self, destination: SocketAddr) -> Arc<Mutex<Option<TcpStream>>> {
        self.slots
            .lock()
            .await
            .entry(destination)
            .or_default()
            .clone()
    }

    /// Best-effort proactive close of one destination's cached connection.
    pub async fn close(&self, destination: SocketAddr) {
        let slot = self.slots.lock().await.remove(&destination);
        if let Some(slot) = slot {
            if let Some(mut stream) = slot.lock().await.take() {
                let _ = stream.shutdown().await;
            }
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.slots.lock().await.drain().collect();
        for (_, slot) in drained {
            if let Some(mut stream) = slot.lock().await.take() {
                let _ = stream.shutdown().await;
            }
        }
    }
}

/// Outbound side of the transport: pops the outbound mailbox in submission order and spawns
///  one short-lived sender task per message.
///
/// Ends when the mailbox is closed. All in-flight sender tasks are awaited *before* the
///  cached connections are closed, so a teardown never cuts off an acknowledgment that is
///  already queued.
pub fn spawn_outbound_dispatcher(
    outbound: Arc<Mailbox>,
    cache: Arc<ConnectionCache>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut senders: Vec<JoinHandle<()>> = Vec::new();

        while let Some(message) = outbound.pop().await {
            senders.retain(|s| !s.is_finished());

            let slot = cache.slot(message.recipient.endpoint()).await;
            senders.push(tokio::spawn(send_one(slot, message)));
        }

        for sender in senders {
            let _ = sender.await;
        }
        cache.close_all().await;
    })
}

async fn send_one(slot: Arc<Mutex<Option<TcpStream>>>, message: Message) {
    let mut guard = slot.lock().await;

    if guard.is_none() {
        match TcpStream::connect(message.recipient.endpoint()).await {
            Ok(stream) => *guard = Some(stream),
            Err(e) => {
                debug!(recipient = ?message.recipient, "could not connect, dropping message: {}", e);
                return;
            }
        }
    }

    if let Some(stream) = guard.as_mut() {
        if let Err(e) = message.write_frame(stream).await {
            warn!(recipient = ?message.recipient, "send failed, dropping connection: {}", e);
            *guard = None;
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::messaging::message::{CorrelationId, Verb};
    use crate::messaging::peer::Peer;

    use super::*;

    fn localhost() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    fn message_to(recipient: Peer, n: u64) -> Message {
        Message {
            verb: Verb::Token,
            sender: Peer::new("src", IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
            recipient,
            head: None,
            body: None,
            ack_idx: CorrelationId::new(0, n),
        }
    }

    #[tokio::test]
    async fn test_listener_delivers_frames_to_mailbox() {
        let inbound = Arc::new(Mailbox::new());
        let listener = Listener::bind(localhost(), inbound.clone()).await.unwrap();

        let recipient = Peer::new("dst", IpAddr::V4(Ipv4Addr::LOCALHOST), listener.local_addr().port());
        let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        message_to(recipient.clone(), 1).write_frame(&mut stream).await.unwrap();
        message_to(recipient, 2).write_frame(&mut stream).await.unwrap();
        drop(stream);

        let first = timeout(Duration::from_secs(1), inbound.pop()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(1), inbound.pop()).await.unwrap().unwrap();
        assert_eq!(first.ack_idx, CorrelationId::new(0, 1));
        assert_eq!(second.ack_idx, CorrelationId::new(0, 2));

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_cache_provisions_one_slot_per_destination() {
        let cache = Arc::new(ConnectionCache::new());
        let destination: SocketAddr = "127.0.0.1:4711".parse().unwrap();

        let (a, b) = tokio::join!(cache.slot(destination), cache.slot(destination));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_dispatcher_sends_and_reuses_connection() {
        let inbound = Arc::new(Mailbox::new());
        let listener = Listener::bind(localhost(), inbound.clone()).await.unwrap();
        let recipient = Peer::new("dst", IpAddr::V4(Ipv4Addr::LOCALHOST), listener.local_addr().port());

        let outbound = Arc::new(Mailbox::new());
        let cache = Arc::new(ConnectionCache::new());
        let dispatcher = spawn_outbound_dispatcher(outbound.clone(), cache.clone());

        outbound.push(message_to(recipient.clone(), 1));
        outbound.push(message_to(recipient.clone(), 2));

        let first = timeout(Duration::from_secs(1), inbound.pop()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(1), inbound.pop()).await.unwrap().unwrap();
        assert_eq!(first.ack_idx, CorrelationId::new(0, 1));
        assert_eq!(second.ack_idx, CorrelationId::new(0, 2));

        outbound.close();
        timeout(Duration::from_secs(1), dispatcher).await.unwrap().unwrap();
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_recipient_is_not_fatal() {
        let outbound = Arc::new(Mailbox::new());
        let cache = Arc::new(ConnectionCache::new());
        let dispatcher = spawn_outbound_dispatcher(outbound.clone(), cache);

        // nobody listens on this port; the message is silently abandoned
        outbound.push(message_to(Peer::new("gone", IpAddr::V4(Ipv4Addr::LOCALHOST), 9), 1));
        outbound.close();

        timeout(Duration::from_secs(1), dispatcher).await.unwrap().unwrap();
    }
}
