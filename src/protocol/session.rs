use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::game::hazard::{BombBag, BombGenerator, BombLauncher, MeasurementSource};
use crate::game::world::{Direction, GameInfo, Position};
use crate::messaging::ack::{Acknowledgment, SingleAck};
use crate::messaging::mailbox::Mailbox;
use crate::messaging::message::Verb;
use crate::messaging::peer::Peer;
use crate::messaging::reliable::ReliableLink;
use crate::messaging::transport::{self, ConnectionCache, Listener};
use crate::protocol::dispatch;
use crate::registry::Registry;
use crate::ring::token_ring::TokenRing;

/// Collects one position per current member (plus the collecting peer's own) during a
///  ring-entry round. Replies may arrive in any order and any interleaving with the wait.
pub struct PositionRound {
    expected: usize,
    collected: Mutex<Vec<Position>>,
    complete: Notify,
}

impl PositionRound {
    pub fn new(expected: usize) -> PositionRound {
        PositionRound {
            expected,
            collected: Mutex::new(Vec::new()),
            complete: Notify::new(),
        }
    }

    pub async fn push(&self, position: Position) {
        let mut collected = self.collected.lock().await;
        collected.push(position);
        if collected.len() >= self.expected {
            self.complete.notify_one();
        }
    }

    pub async fn wait_all(&self) -> Vec<Position> {
        loop {
            {
                let collected = self.collected.lock().await;
                if collected.len() >= self.expected {
                    return collected.clone();
                }
            }
            self.complete.notified().await;
        }
    }
}

/// The joining peer's wait for a ring-entry verdict. The wait itself is unbounded; the
///  joiner wraps it in the 5-second entry deadline.
pub struct EntryWait {
    ack: SingleAck,
    succeeded: AtomicBool,
}

impl EntryWait {
    pub fn new() -> EntryWait {
        EntryWait {
            ack: SingleAck::new(),
            succeeded: AtomicBool::new(false),
        }
    }

    pub async fn wait(&self) {
        self.ack.request().await
    }

    pub fn verdict(&self, succeeded: bool) {
        self.succeeded.store(succeeded, Ordering::SeqCst);
        self.ack.release();
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded.load(Ordering::SeqCst)
    }
}

/// One peer's coordination state for one game: identity and neighbor pointers, the
///  mailboxes and acknowledgment table (via [ReliableLink]), the token ring, and the game
///  state the critical section guards (position, score, membership).
///
/// The session owns the background tasks - listener, outbound dispatcher, inbound message
///  dispatcher - and tears them down through mailbox sentinels so everything in flight
///  drains before any socket closes.
pub struct Session {
    link: ReliableLink,
    registry: Registry,

    game: RwLock<GameInfo>,
    prev: RwLock<Peer>,
    next: RwLock<Peer>,

    ring: RwLock<Option<Arc<TokenRing>>>,
    /// serializes this peer's own tasks in front of the distributed token
    cs_gate: Mutex<()>,

    inbound: Arc<Mailbox>,
    outbound: Arc<Mailbox>,
    connections: Arc<ConnectionCache>,
    listener: Listener,

    position: RwLock<Position>,
    position_round: Mutex<Option<Arc<PositionRound>>>,
    entry_wait: Mutex<Option<Arc<EntryWait>>>,

    score: AtomicU32,
    eaten: Mutex<Option<Peer>>,
    game_over: AtomicBool,

    bomb_bag: Arc<BombBag>,
    launcher: BombLauncher,
    generator: Mutex<Option<BombGenerator>>,
    bomb_hits: Mutex<Vec<Peer>>,

    outbound_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Binds the listener, starts the outbound and inbound dispatchers, and returns the
    ///  running session. The ring itself is only created by joining a game. A `myself`
    ///  port of 0 is replaced by the OS-assigned listener port.
    pub async fn start(
        mut myself: Peer,
        game: GameInfo,
        registry: Registry,
    ) -> anyhow::Result<Arc<Session>> {
        let inbound = Arc::new(Mailbox::new());
        let outbound = Arc::new(Mailbox::new());
        let connections = Arc::new(ConnectionCache::new());

        let listener = Listener::bind(myself.endpoint(), inbound.clone()).await?;
        myself.port = listener.local_addr().port();

        let outbound_task = transport::spawn_outbound_dispatcher(outbound.clone(), connections.clone());

        let grid = game.grid;
        let session = Arc::new(Session {
            link: ReliableLink::new(myself.clone(), outbound.clone()),
            registry,
            game: RwLock::new(game),
            prev: RwLock::new(myself.clone()),
            next: RwLock::new(myself),
            ring: RwLock::new(None),
            cs_gate: Mutex::new(()),
            inbound,
            outbound,
            connections,
            listener,
            position: RwLock::new(Position::new(grid)),
            position_round: Mutex::new(None),
            entry_wait: Mutex::new(None),
            score: AtomicU32::new(0),
            eaten: Mutex::new(None),
            game_over: AtomicBool::new(false),
            bomb_bag: Arc::new(BombBag::new()),
            launcher: BombLauncher::new(),
            generator: Mutex::new(None),
            bomb_hits: Mutex::new(Vec::new()),
            outbound_task: Mutex::new(Some(outbound_task)),
            dispatch_task: Mutex::new(None),
        });

        let dispatch_task = dispatch::spawn_dispatcher(session.clone());
        *session.dispatch_task.lock().await = Some(dispatch_task);

        Ok(session)
    }

    pub fn link(&self) -> &ReliableLink {
        &self.link
    }

    pub fn myself(&self) -> &Peer {
        self.link.myself()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionCache> {
        &self.connections
    }

    pub(crate) fn inbound(&self) -> &Arc<Mailbox> {
        &self.inbound
    }

    // ------------------------- game info and membership list -------------------------

    pub async fn game_name(&self) -> String {
        self.game.read().await.name.clone()
    }

    pub async fn grid(&self) -> u32 {
        self.game.read().await.grid
    }

    pub async fn target_score(&self) -> u32 {
        self.game.read().await.score
    }

    /// This peer's view of who else plays this game. Never contains the peer itself.
    pub async fn members(&self) -> Vec<Peer> {
        self.game.read().await.users.clone()
    }

    pub(crate) async fn replace_game(&self, game: GameInfo) {
        let myself = self.myself().clone();
        let mut current = self.game.write().await;
        *current = game;
        current.users.retain(|u| *u != myself);
    }

    pub(crate) async fn replace_members(&self, list: Vec<Peer>) {
        let myself = self.myself().clone();
        self.game.write().await.users = list.into_iter().filter(|u| *u != myself).collect();
    }

    // ------------------------------- neighbor pointers --------------------------------

    pub async fn prev(&self) -> Peer {
        self.prev.read().await.clone()
    }

    pub async fn next(&self) -> Peer {
        self.next.read().await.clone()
    }

    pub(crate) async fn set_prev(&self, peer: Peer) {
        *self.prev.write().await = peer;
    }

    pub(crate) async fn set_next(&self, peer: Peer) {
        *self.next.write().await = peer;
    }

    // --------------------------- token ring / critical section -----------------------

    /// Creates this peer's ring state. A seeded ring immediately offers its token for
    ///  forwarding so it starts circulating.
    pub(crate) async fn install_ring(&self, seeded: bool) -> Arc<TokenRing> {
        let ring = Arc::new(TokenRing::new(seeded));
        *self.ring.write().await = Some(ring.clone());
        if ring.take_token_if_idle().await {
            self.send_token().await;
        }
        ring
    }

    pub async fn ring(&self) -> Option<Arc<TokenRing>> {
        self.ring.read().await.clone()
    }

    /// Enters the game-wide critical section: the local gate first, then the distributed
    ///  token. The returned guard must go back through [Session::leave_cs] - except on the
    ///  game-over short-circuit, where dropping it releases only the local gate and
    ///  deliberately leaves the ring state untouched.
    pub async fn enter_cs(&self) -> MutexGuard<'_, ()> {
        let guard = self.cs_gate.lock().await;
        if let Some(ring) = self.ring().await {
            ring.request_cs().await;
        }
        guard
    }

    /// Leaves the critical section, forwarding the token if it is no longer wanted.
    pub async fn leave_cs(&self, guard: MutexGuard<'_, ()>) {
        if let Some(ring) = self.ring().await {
            if ring.release_cs().await {
                self.send_token().await;
            }
        }
        drop(guard);
    }

    pub(crate) async fn send_token(&self) {
        let next = self.next().await;
        if next == *self.myself() {
            // own successor: forwarding would only loop the message back through the wire,
            // so the token stays here until somebody else joins
            if let Some(ring) = self.ring().await {
                ring.keep_token().await;
            }
            return;
        }
        self.link.send(&next, Verb::Token, None, None, false).await;
    }

    // ------------------------------- position and score -------------------------------

    pub async fn position(&self) -> Position {
        self.position.read().await.clone()
    }

    pub(crate) async fn set_position(&self, position: Position) {
        *self.position.write().await = position;
    }

    pub(crate) async fn randomize_position(&self) -> Position {
        let mut position = self.position.write().await;
        position.randomize();
        position.clone()
    }

    pub(crate) async fn apply_move_locally(&self, direction: Direction) -> Position {
        let mut position = self.position.write().await;
        position.apply(direction);
        position.clone()
    }

    pub fn score(&self) -> u32 {
        self.score.load(Ordering::SeqCst)
    }

    pub(crate) fn add_score(&self, points: u32) {
        self.score.fetch_add(points, Ordering::SeqCst);
    }

    pub(crate) async fn set_eaten(&self, victim: Peer) {
        *self.eaten.lock().await = Some(victim);
    }

    pub(crate) async fn take_eaten(&self) -> Option<Peer> {
        self.eaten.lock().await.take()
    }

    // ------------------------------ entry / position rounds ---------------------------

    pub(crate) async fn open_position_round(&self, expected: usize) -> Arc<PositionRound> {
        let round = Arc::new(PositionRound::new(expected));
        *self.position_round.lock().await = Some(round.clone());
        round
    }

    pub(crate) async fn position_round(&self) -> Option<Arc<PositionRound>> {
        self.position_round.lock().await.clone()
    }

    pub(crate) async fn close_position_round(&self) {
        *self.position_round.lock().await = None;
    }

    pub(crate) async fn open_entry_wait(&self) -> Arc<EntryWait> {
        let wait = Arc::new(EntryWait::new());
        *self.entry_wait.lock().await = Some(wait.clone());
        wait
    }

    pub(crate) async fn entry_wait(&self) -> Option<Arc<EntryWait>> {
        self.entry_wait.lock().await.clone()
    }

    pub(crate) async fn close_entry_wait(&self) {
        *self.entry_wait.lock().await = None;
    }

    // ------------------------------------ hazards -------------------------------------

    pub fn bomb_bag(&self) -> &Arc<BombBag> {
        &self.bomb_bag
    }

    pub fn launcher(&self) -> &BombLauncher {
        &self.launcher
    }

    /// Starts the bomb generator on the given measurement stream.
    pub async fn start_hazards(&self, source: impl MeasurementSource) {
        let generator = BombGenerator::spawn(self.bomb_bag.clone(), source);
        *self.generator.lock().await = Some(generator);
    }

    /// Stops the background producers: the generator stops sampling and every armed fuse
    ///  is defused. Safe to call more than once.
    pub async fn stop_hazards(&self) {
        if let Some(generator) = self.generator.lock().await.as_ref() {
            generator.stop();
        }
        self.launcher.defuse_all();
    }

    pub(crate) async fn add_bomb_hit(&self, victim: Peer) {
        self.bomb_hits.lock().await.push(victim);
    }

    pub(crate) async fn take_bomb_hits(&self) -> Vec<Peer> {
        std::mem::take(&mut *self.bomb_hits.lock().await)
    }

    // ------------------------------------ teardown ------------------------------------

    pub fn is_game_over(&self) -> bool {
        self.game_over.load(Ordering::SeqCst)
    }

    pub(crate) fn set_game_over(&self) {
        self.game_over.store(true, Ordering::SeqCst);
    }

    /// Ends local protocol activity: wakes any waiter blocked on the critical section via
    ///  the ring's shutdown override and closes both mailboxes behind whatever is already
    ///  queued. Sockets close only after the outbound dispatcher has drained, so in-flight
    ///  acknowledgments still go out.
    pub async fn shutdown_local(&self) {
        if let Some(ring) = self.ring().await {
            ring.unlock().await;
        }
        self.outbound.close();
        self.inbound.close();
    }

    /// Final teardown: stops accepting connections and awaits the dispatcher tasks. Call
    ///  after [Session::shutdown_local] (or a protocol teardown) has ended the loops.
    pub async fn close(&self) {
        self.listener.shutdown();
        self.outbound.close();
        self.inbound.close();
        if let Some(task) = self.outbound_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(task) = self.dispatch_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::game::world::GameInfo;
    use crate::test_util::start_localhost_session;

    use super::*;

    // none of these tests talk to the registry, so an unreachable authority is fine
    async fn session() -> Arc<Session> {
        start_localhost_session("solo", GameInfo::new("arena", 10, 5), "127.0.0.1:9")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_singleton_ring_keeps_its_token() {
        let session = session().await;
        session.install_ring(true).await;

        // the seeded token has nowhere to go; repeated critical sections must not hang
        for _ in 0..3 {
            let guard = timeout(Duration::from_secs(1), session.enter_cs()).await.unwrap();
            session.leave_cs(guard).await;
        }
        assert!(session.ring().await.unwrap().holds_token().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_frees_a_blocked_cs_waiter() {
        let session = session().await;
        // tokenless: nobody will ever send a token to this peer
        session.install_ring(false).await;

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                let guard = session.enter_cs().await;
                drop(guard);
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        session.set_game_over();
        session.shutdown_local().await;

        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_ends_the_background_tasks() {
        let session = session().await;
        session.shutdown_local().await;
        timeout(Duration::from_secs(1), session.close()).await.unwrap();
    }

    #[tokio::test]
    async fn test_position_round_completes_in_any_arrival_order() {
        let round = Arc::new(PositionRound::new(2));

        let collector = {
            let round = round.clone();
            tokio::spawn(async move { round.wait_all().await })
        };

        round.push(Position { x: 1, y: 1, grid: 10 }).await;
        round.push(Position { x: 2, y: 2, grid: 10 }).await;

        let collected = timeout(Duration::from_secs(1), collector).await.unwrap().unwrap();
        assert_eq!(collected.len(), 2);
    }
}
