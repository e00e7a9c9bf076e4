use tokio::sync::{Mutex, Notify};

struct RingState {
    have_token: bool,
    want_cs: bool,
}

/// Per-peer half of the token-ring mutual exclusion protocol.
///
/// This is a pure state machine: it tracks token possession and the desire to enter the
///  critical section, but it never talks to the network itself. The methods that may cause
///  a TOKEN message (`release_cs`, `on_token_received`, `take_token_if_idle`) instead tell
///  the caller whether the token must now be forwarded to the ring successor; the session
///  layer, which knows the successor, does the sending.
///
/// Liveness contract: a peer holding the token without wanting the critical section must
///  forward it promptly - on seeding and after every `release_cs` - so the ring never
///  stalls on an unwanted token.
pub struct TokenRing {
    state: Mutex<RingState>,
    token_arrived: Notify,
}

impl TokenRing {
    /// `seeded` is true only for the first member of a freshly created ring, which starts
    ///  out as the token holder. Every later joiner starts tokenless and only ever
    ///  *receives* the token over the wire.
    pub fn new(seeded: bool) -> TokenRing {
        TokenRing {
            state: Mutex::new(RingState {
                have_token: seeded,
                want_cs: false,
            }),
            token_arrived: Notify::new(),
        }
    }

    /// Suspends the caller until the token is held locally. At most one local task may wait
    ///  here at a time; the session serializes its own tasks in front of this call.
    pub async fn request_cs(&self) {
        {
            let mut state = self.state.lock().await;
            state.want_cs = true;
            if state.have_token {
                return;
            }
        }
        loop {
            self.token_arrived.notified().await;
            if self.state.lock().await.have_token {
                return;
            }
        }
    }

    /// Clears the desire flag and gives up the token. Returns whether the caller must now
    ///  forward it to the ring successor.
    pub async fn release_cs(&self) -> bool {
        let mut state = self.state.lock().await;
        state.want_cs = false;
        if state.have_token {
            state.have_token = false;
            true
        } else {
            false
        }
    }

    /// Transport-side token arrival. Returns true when the token should travel on right
    ///  away because nobody here wants the critical section.
    pub async fn on_token_received(&self) -> bool {
        let mut state = self.state.lock().await;
        state.have_token = true;
        if state.want_cs {
            self.token_arrived.notify_one();
            false
        } else {
            state.have_token = false;
            true
        }
    }

    /// Seeding helper: takes the token for forwarding if it is held and idle, so a freshly
    ///  created ring starts circulating it immediately.
    pub async fn take_token_if_idle(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.have_token && !state.want_cs {
            state.have_token = false;
            true
        } else {
            false
        }
    }

    /// Re-takes a token that was taken for forwarding but has nowhere to go: a peer that is
    ///  its own ring successor keeps the token instead of looping it through the wire.
    pub async fn keep_token(&self) {
        let mut state = self.state.lock().await;
        state.have_token = true;
        self.token_arrived.notify_one();
    }

    /// Shutdown override: pretends the token is here and wakes a blocked waiter, so no task
    ///  stays parked in `request_cs` forever once the local game is over. This is a
    ///  deliberate liveness escape valve, not protocol traffic - it can transiently put a
    ///  second token into the ring, which is acceptable because this peer is about to
    ///  disconnect and will never forward it.
    pub async fn unlock(&self) {
        let mut state = self.state.lock().await;
        state.want_cs = false;
        state.have_token = true;
        self.token_arrived.notify_one();
    }

    pub async fn holds_token(&self) -> bool {
        self.state.lock().await.have_token
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_seeded_ring_offers_token_once() {
        let ring = TokenRing::new(true);
        assert!(ring.holds_token().await);
        assert!(ring.take_token_if_idle().await);
        assert!(!ring.take_token_if_idle().await);
        assert!(!ring.holds_token().await);
    }

    #[tokio::test]
    async fn test_joiner_starts_tokenless() {
        let ring = TokenRing::new(false);
        assert!(!ring.holds_token().await);
        assert!(!ring.take_token_if_idle().await);
    }

    #[tokio::test]
    async fn test_request_cs_blocks_until_token_arrives() {
        let ring = Arc::new(TokenRing::new(false));

        let waiter = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.request_cs().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        // token arrives while the CS is wanted: it is kept, the waiter wakes
        assert!(!ring.on_token_received().await);
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(ring.holds_token().await);
    }

    #[tokio::test]
    async fn test_idle_peer_forwards_arriving_token() {
        let ring = TokenRing::new(false);
        assert!(ring.on_token_received().await);
        assert!(!ring.holds_token().await);
    }

    #[tokio::test]
    async fn test_release_cs_forwards_exactly_once() {
        let ring = TokenRing::new(false);
        ring.request_cs_now_for_test().await;
        assert!(ring.release_cs().await);
        assert!(!ring.release_cs().await);
    }

    #[tokio::test]
    async fn test_kept_token_satisfies_a_later_request() {
        let ring = TokenRing::new(true);
        assert!(ring.take_token_if_idle().await);

        ring.keep_token().await;
        assert!(ring.holds_token().await);
        timeout(Duration::from_secs(1), ring.request_cs()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_frees_blocked_waiter_without_a_token_message() {
        let ring = Arc::new(TokenRing::new(false));

        let waiter = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.request_cs().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        ring.unlock().await;
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    impl TokenRing {
        /// test helper: become the in-CS token holder synchronously
        async fn request_cs_now_for_test(&self) {
            let mut state = self.state.lock().await;
            state.have_token = true;
            state.want_cs = true;
        }
    }
}
