use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::messaging::message::CorrelationId;

/// Lets a sending task suspend until the receiver side has confirmed processing of a
///  logically related message (or group of messages).
///
/// `release` may arrive *before* anybody calls `request` - the acknowledgment travels the
///  network faster than the sender reaches its wait in some interleavings - so both
///  implementations count state instead of signalling edges. There is at most one waiter
///  per acknowledgment.
#[async_trait]
pub trait Acknowledgment: Send + Sync + 'static {
    /// Suspends until the expected number of releases has arrived.
    async fn request(&self);

    fn release(&self);

    fn is_satisfied(&self) -> bool;
}

/// Exactly one release satisfies the waiter.
pub struct SingleAck {
    released: AtomicBool,
    notify: Notify,
}

impl SingleAck {
    pub fn new() -> SingleAck {
        SingleAck {
            released: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl Acknowledgment for SingleAck {
    async fn request(&self) {
        loop {
            if self.is_satisfied() {
                return;
            }
            self.notify.notified().await;
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_satisfied(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// One release per fan-out recipient; the waiter wakes only once all of them are in.
///  Surplus releases are tolerated and change nothing.
pub struct FanOutAck {
    remaining: AtomicI64,
    notify: Notify,
}

impl FanOutAck {
    pub fn new(expected: usize) -> FanOutAck {
        FanOutAck {
            remaining: AtomicI64::new(expected as i64),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl Acknowledgment for FanOutAck {
    async fn request(&self) {
        loop {
            if self.is_satisfied() {
                return;
            }
            self.notify.notified().await;
        }
    }

    fn release(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) <= 1 {
            self.notify.notify_one();
        }
    }

    fn is_satisfied(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) <= 0
    }
}

/// The pending-acknowledgment table: correlation id -> waiter. Mutated from both the
///  sending path (register / discard) and the receiving path (release), so all access goes
///  through per-call lock/insert/remove operations.
pub struct AckTable {
    pending: Mutex<FxHashMap<CorrelationId, Arc<dyn Acknowledgment>>>,
}

impl AckTable {
    pub fn new() -> AckTable {
        AckTable {
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    pub async fn register(&self, id: CorrelationId, ack: Arc<dyn Acknowledgment>) {
        self.pending.lock().await.insert(id, ack);
    }

    pub async fn discard(&self, id: &CorrelationId) {
        self.pending.lock().await.remove(id);
    }

    /// Receiving-path release: looks the waiter up, releases it, and drops the entry once
    ///  it is fully satisfied. Returns whether the id was known.
    pub async fn release(&self, id: &CorrelationId) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.get(id) {
            Some(ack) => {
                ack.release();
                if ack.is_satisfied() {
                    pending.remove(id);
                }
                true
            }
            None => {
                debug!("acknowledgment for unknown correlation id {:?}", id);
                false
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
