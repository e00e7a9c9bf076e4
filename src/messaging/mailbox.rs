use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::messaging::message::Message;

/// Unbounded, order-preserving queue decoupling transport tasks from protocol tasks.
///
/// `pop` suspends while the queue is empty. `close` enqueues a sentinel *behind* everything
///  pushed so far: a consumer sees every message that was submitted before the close, then
///  `None`. That makes "push the shutdown marker, keep draining" the natural teardown order.
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Option<Message>>,
    rx: Mutex<mpsc::UnboundedReceiver<Option<Message>>>,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        Mailbox {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, message: Message) {
        let _ = self.tx.send(Some(message));
    }

    pub fn close(&self) {
        let _ = self.tx.send(None);
    }

    pub async fn pop(&self) -> Option<Message> {
        self.rx.lock().await.recv().await.flatten()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Mailbox::new()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::messaging::message::{CorrelationId, Verb};
    use crate::messaging::peer::Peer;

    use super::*;

    fn message(n: u64) -> Message {
        let peer = Peer::new("x", "127.0.0.1".parse().unwrap(), 9000);
        Message {
            verb: Verb::Token,
            sender: peer.clone(),
            recipient: peer,
            head: None,
            body: None,
            ack_idx: CorrelationId::new(0, n),
        }
    }

    #[tokio::test]
    async fn test_fifo_then_close() {
        let mailbox = Mailbox::new();
        mailbox.push(message(1));
        mailbox.push(message(2));
        mailbox.close();

        assert_eq!(mailbox.pop().await.unwrap().ack_idx, CorrelationId::new(0, 1));
        assert_eq!(mailbox.pop().await.unwrap().ack_idx, CorrelationId::new(0, 2));
        assert!(mailbox.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let mailbox = std::sync::Arc::new(Mailbox::new());

        let consumer = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.push(message(7));

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.unwrap().ack_idx, CorrelationId::new(0, 7));
    }
}
