use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::messaging::ack::{Acknowledgment, AckTable, FanOutAck, SingleAck};
use crate::messaging::mailbox::Mailbox;
use crate::messaging::message::{CorrelationId, Message, Verb};
use crate::messaging::peer::Peer;

pub const ACK_IDX_HEADER: &str = "ackIdx";

/// Request/acknowledgment semantics on top of the outbound mailbox: callers get
///  synchronous "delivered and processed" behavior out of a transport that only ever fires
///  single frames.
///
/// The pending entry is registered *before* the message is enqueued, closing the race
///  between "recipient already acknowledged" and "sender starts waiting". There is no
///  timeout here - a blocked send is resumed by the matching ACKNOWLEDGED or by session
///  teardown; bounded waiting is a per-request policy of the caller.
pub struct ReliableLink {
    myself: Peer,
    outbound: Arc<Mailbox>,
    acks: AckTable,
    counter: AtomicU64,
}

impl ReliableLink {
    pub fn new(myself: Peer, outbound: Arc<Mailbox>) -> ReliableLink {
        ReliableLink {
            myself,
            outbound,
            acks: AckTable::new(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn myself(&self) -> &Peer {
        &self.myself
    }

    /// The counter alone makes two concurrent sends from this peer distinguishable; the
    ///  timestamp distinguishes sessions that reuse an endpoint.
    fn next_correlation_id(&self) -> CorrelationId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        CorrelationId::new(millis, counter)
    }

    /// Sends one message. With `require_ack` the call suspends until the recipient has
    ///  acknowledged processing.
    pub async fn send(
        &self,
        recipient: &Peer,
        verb: Verb,
        head: Option<FxHashMap<String, String>>,
        body: Option<String>,
        require_ack: bool,
    ) {
        let ack_idx = self.next_correlation_id();

        let ack: Option<Arc<dyn Acknowledgment>> = if require_ack {
            Some(Arc::new(SingleAck::new()))
        } else {
            None
        };
        if let Some(ack) = &ack {
            self.acks.register(ack_idx.clone(), ack.clone()).await;
        }

        self.outbound.push(Message {
            verb,
            sender: self.myself.clone(),
            recipient: recipient.clone(),
            head,
            body,
            ack_idx: ack_idx.clone(),
        });

        if let Some(ack) = ack {
            ack.request().await;
            self.acks.discard(&ack_idx).await;
        }
    }

    /// Fan-out: logically one send to many recipients, tracked by one shared correlation id.
    ///  With `require_ack` the call suspends until *every* recipient has acknowledged.
    pub async fn broadcast(
        &self,
        recipients: &[Peer],
        verb: Verb,
        head: Option<FxHashMap<String, String>>,
        body: Option<String>,
        require_ack: bool,
    ) {
        let ack_idx = self.next_correlation_id();

        let ack: Option<Arc<dyn Acknowledgment>> = if require_ack {
            Some(Arc::new(FanOutAck::new(recipients.len())))
        } else {
            None
        };
        if let Some(ack) = &ack {
            self.acks.register(ack_idx.clone(), ack.clone()).await;
        }

        for recipient in recipients {
            self.outbound.push(Message {
                verb,
                sender: self.myself.clone(),
                recipient: recipient.clone(),
                head: head.clone(),
                body: body.clone(),
                ack_idx: ack_idx.clone(),
            });
        }

        if let Some(ack) = ack {
            ack.request().await;
            self.acks.discard(&ack_idx).await;
        }
    }

    /// Replies ACKNOWLEDGED for a request-shaped message, echoing its correlation id in the
    ///  header.
    pub async fn reply_acknowledged(&self, request: &Message) {
        let mut head = FxHashMap::default();
        head.insert(ACK_IDX_HEADER.to_string(), request.ack_idx.0.clone());
        self.send(&request.sender, Verb::Acknowledged, Some(head), None, false)
            .await;
    }

    /// Sender-side handling of an incoming ACKNOWLEDGED frame: releases the waiter the
    ///  echoed correlation id belongs to.
    pub async fn on_acknowledged(&self, message: &Message) {
        let Some(idx) = message.head.as_ref().and_then(|h| h.get(ACK_IDX_HEADER)) else {
            warn!("ACKNOWLEDGED without {} header from {:?}", ACK_IDX_HEADER, message.sender);
            return;
        };
        self.acks.release(&CorrelationId(idx.clone())).await;
    }

    pub async fn pending_ack_count(&self) -> usize {
        self.acks.pending_count().await
    }
}
