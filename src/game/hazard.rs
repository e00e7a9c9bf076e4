use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::game::play;
use crate::game::world::GridArea;
use crate::messaging::message::{Message, Verb};
use crate::protocol::session::Session;
use crate::protocol::{decode, encode, membership};

/// How long a launched bomb burns before it explodes.
pub const FUSE: Duration = Duration::from_secs(5);

pub const DEFAULT_SMOOTHING: f64 = 0.5;
pub const DEFAULT_OUTLIER_THRESHOLD: f64 = 10.0;

const SAMPLE_WINDOW: usize = 16;
const GENERATOR_TICK: Duration = Duration::from_secs(1);

/// A quadrant hazard: every member whose position is in the area at explosion time is hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bomb {
    pub area: GridArea,
}

/// Bombs earned but not yet launched.
pub struct BombBag {
    bombs: Mutex<Vec<Bomb>>,
}

impl BombBag {
    pub fn new() -> BombBag {
        BombBag {
            bombs: Mutex::new(Vec::new()),
        }
    }

    pub async fn push(&self, bomb: Bomb) {
        self.bombs.lock().await.push(bomb);
    }

    pub async fn pop(&self) -> Option<Bomb> {
        let mut bombs = self.bombs.lock().await;
        if bombs.is_empty() {
            None
        } else {
            Some(bombs.remove(0))
        }
    }

    pub async fn len(&self) -> usize {
        self.bombs.lock().await.len()
    }
}

/// A stream of sensor readings feeding the bomb generator. The seam exists so tests can
///  inject a deterministic stream.
pub trait MeasurementSource: Send + 'static {
    fn sample(&mut self) -> f64;
}

/// Accelerometer stand-in: a random walk with small jitter and the occasional hard spike
///  that the outlier detection is meant to catch.
pub struct SimulatedAccelerometer {
    value: f64,
}

impl SimulatedAccelerometer {
    pub fn new() -> SimulatedAccelerometer {
        SimulatedAccelerometer { value: 0.0 }
    }
}

impl MeasurementSource for SimulatedAccelerometer {
    fn sample(&mut self) -> f64 {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(0.02) {
            self.value += rng.gen_range(-40.0..40.0);
        } else {
            self.value += rng.gen_range(-1.0..1.0);
        }
        self.value
    }
}

/// Turns the measurement stream into bombs: once per tick the window average feeds an
///  exponential moving average, and a jump beyond the threshold counts as an outlier that
///  earns a bomb for the quadrant derived from the smoothed value.
pub struct BombGenerator {
    task: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl BombGenerator {
    pub fn spawn(bag: Arc<BombBag>, source: impl MeasurementSource) -> BombGenerator {
        Self::with_tuning(bag, source, DEFAULT_SMOOTHING, DEFAULT_OUTLIER_THRESHOLD)
    }

    pub fn with_tuning(
        bag: Arc<BombBag>,
        mut source: impl MeasurementSource,
        alpha: f64,
        threshold: f64,
    ) -> BombGenerator {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(GENERATOR_TICK);
            interval.tick().await;

            // warm up: the first window seeds the moving average
            let mut ema = window_average(&mut source);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let avg = window_average(&mut source);
                        let smoothed = ema + alpha * (avg - ema);
                        if (smoothed - ema).abs() > threshold {
                            let area = GridArea::from_index(smoothed.ceil().rem_euclid(4.0) as usize);
                            info!("outlier in the measurement stream - a {:?} bomb joins the bag", area);
                            bag.push(Bomb { area }).await;
                        }
                        ema = smoothed;
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        BombGenerator { task, stop }
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

fn window_average(source: &mut impl MeasurementSource) -> f64 {
    let sum: f64 = (0..SAMPLE_WINDOW).map(|_| source.sample()).sum();
    sum / SAMPLE_WINDOW as f64
}

/// Arms fuses for launched bombs and resolves their explosions. Defusing (at teardown)
///  extinguishes every armed fuse without an explosion.
pub struct BombLauncher {
    fuses: Mutex<Vec<JoinHandle<()>>>,
    defuse: watch::Sender<bool>,
}

impl BombLauncher {
    pub fn new() -> BombLauncher {
        let (defuse, _) = watch::channel(false);
        BombLauncher {
            fuses: Mutex::new(Vec::new()),
            defuse,
        }
    }

    /// Arms a [FUSE]-long fuse for a bomb this peer launched.
    pub async fn arm(&self, session: Arc<Session>, bomb: Bomb) {
        let mut defused = self.defuse.subscribe();
        let handle = tokio::spawn(async move {
            let area = bomb.area;
            tokio::select! {
                _ = tokio::time::sleep(FUSE) => explode(&session, bomb).await,
                _ = defused.changed() => debug!("{:?} bomb defused", area),
            }
        });

        let mut fuses = self.fuses.lock().await;
        fuses.retain(|f| !f.is_finished());
        fuses.push(handle);
    }

    /// Whether any own bomb is still armed. A peer must not leave while this is true - the
    ///  ring still expects its explosions.
    pub async fn fuses_burning(&self) -> bool {
        self.fuses.lock().await.iter().any(|f| !f.is_finished())
    }

    pub fn defuse_all(&self) {
        let _ = self.defuse.send(true);
    }
}

/// Resolves one own bomb under the critical section: announce the explosion to every
///  member as one acknowledged unicast each (the resolution must stay serialized), score
///  the hits, and handle being caught in the own blast.
pub(crate) async fn explode(session: &Arc<Session>, bomb: Bomb) {
    let guard = session.enter_cs().await;
    if session.is_game_over() {
        drop(guard);
        return;
    }

    info!("KABOOM - own {:?} bomb exploded", bomb.area);
    let members = session.members().await;
    for member in &members {
        session
            .link()
            .send(member, Verb::BombExplosion, None, encode(&bomb), true)
            .await;
    }

    let hits = session.take_bomb_hits().await;
    for hit in &hits {
        session.connections().close(hit.endpoint()).await;
    }

    if session.position().await.area() == bomb.area {
        session.set_game_over();
        session.stop_hazards().await;
        membership::leave(session, true).await;
        info!("hit by the own bomb - game over");
    } else {
        let points = hits.len().min(3) as u32;
        session.add_score(points);
        if points > 0 {
            info!("the bomb hit {} players, {} points scored", hits.len(), points);
        }
        if session.score() >= session.target_score().await {
            play::declare_victory(session).await;
        }
    }

    session.leave_cs(guard).await;
    if session.is_game_over() {
        session.shutdown_local().await;
    }
}

pub(crate) async fn on_bomb_launch(session: &Arc<Session>, message: &Message) {
    if !session.is_game_over() {
        if let Some(bomb) = message.body.as_deref().and_then(decode::<Bomb>) {
            info!(
                "{} launched a {:?} bomb - it explodes in {} seconds",
                message.sender.name,
                bomb.area,
                FUSE.as_secs()
            );
        }
    }
    session.link().reply_acknowledged(message).await;
}

/// BOMB_EXPLOSION: a member's bomb went off. Standing in the blast quadrant is terminal;
///  the victim leaves the ring inside the launcher's critical-section window and claims
///  its hit with BOMB_AREA_MATCH.
pub(crate) async fn on_bomb_explosion(session: &Arc<Session>, message: &Message) {
    if !session.is_game_over() {
        if let Some(bomb) = message.body.as_deref().and_then(decode::<Bomb>) {
            info!(
                "KABOOM - the {:?} bomb launched by {} exploded",
                bomb.area, message.sender.name
            );
            if session.position().await.area() == bomb.area {
                session.set_game_over();
                session.stop_hazards().await;
                membership::leave(session, true).await;
                info!("hit by {}'s {:?} bomb - game over", message.sender.name, bomb.area);
                session
                    .link()
                    .send(
                        &message.sender,
                        Verb::BombAreaMatch,
                        None,
                        message.body.clone(),
                        true,
                    )
                    .await;
            }
        }
    }

    session.link().reply_acknowledged(message).await;

    if session.is_game_over() {
        session.shutdown_local().await;
    }
}

pub(crate) async fn on_bomb_area_match(session: &Arc<Session>, message: &Message) {
    if !session.is_game_over() {
        session.add_bomb_hit(message.sender.clone()).await;
    }
    session.link().reply_acknowledged(message).await;
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::game::world::{GameInfo, Position};
    use crate::test_util::{start_localhost_session, StubRegistry};

    use super::*;

    /// a flat stream that jumps to a plateau after the warm-up window
    struct ScriptedSource {
        samples_taken: usize,
    }

    impl MeasurementSource for ScriptedSource {
        fn sample(&mut self) -> f64 {
            self.samples_taken += 1;
            if self.samples_taken <= SAMPLE_WINDOW {
                0.0
            } else {
                100.0
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_turns_outlier_into_bomb() {
        let bag = Arc::new(BombBag::new());
        let generator = BombGenerator::with_tuning(
            bag.clone(),
            ScriptedSource { samples_taken: 0 },
            0.5,
            10.0,
        );

        timeout(Duration::from_secs(30), async {
            while bag.len().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // warm-up ema 0, first tick avg 100 -> smoothed 50, ceil 50 % 4 == 2
        let bomb = bag.pop().await.unwrap();
        assert_eq!(bomb.area, GridArea::Blue);

        generator.stop();
        timeout(Duration::from_secs(5), async {
            while !generator.is_stopped() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_ignores_a_flat_stream() {
        struct Flat;
        impl MeasurementSource for Flat {
            fn sample(&mut self) -> f64 {
                42.0
            }
        }

        let bag = Arc::new(BombBag::new());
        let generator = BombGenerator::with_tuning(bag.clone(), Flat, 0.5, 10.0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bag.len().await, 0);
        generator.stop();
    }

    #[tokio::test]
    async fn test_bag_is_fifo() {
        let bag = BombBag::new();
        bag.push(Bomb { area: GridArea::Red }).await;
        bag.push(Bomb { area: GridArea::Blue }).await;

        assert_eq!(bag.pop().await.unwrap().area, GridArea::Red);
        assert_eq!(bag.pop().await.unwrap().area, GridArea::Blue);
        assert!(bag.pop().await.is_none());
    }

    async fn join_pair(stub: &StubRegistry, game: GameInfo) -> (Arc<Session>, Arc<Session>) {
        let a = start_localhost_session("alice", game.clone(), stub.authority())
            .await
            .unwrap();
        membership::join(&a).await.unwrap();

        let (_, view) = stub.registry().view_game(&game.name).await.unwrap();
        let b = start_localhost_session("bob", view.unwrap(), stub.authority())
            .await
            .unwrap();
        membership::join(&b).await.unwrap();

        (a, b)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_explosion_scores_hits_in_the_blast_quadrant() {
        let stub = StubRegistry::spawn(GameInfo::new("arena", 10, 5)).await.unwrap();
        let (a, b) = join_pair(&stub, GameInfo::new("arena", 10, 5)).await;

        a.set_position(Position { x: 0, y: 0, grid: 10 }).await;
        b.set_position(Position { x: 0, y: 9, grid: 10 }).await;

        explode(&a, Bomb { area: GridArea::Blue }).await;

        assert!(b.is_game_over());
        assert!(!a.is_game_over());
        assert_eq!(a.score(), 1);

        // the victim excised itself from ring and registry before claiming its hit
        assert!(a.members().await.is_empty());
        assert_eq!(stub.users(), vec![a.myself().clone()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_standing_in_the_own_blast_quadrant_is_terminal() {
        let stub = StubRegistry::spawn(GameInfo::new("arena", 10, 5)).await.unwrap();
        let (a, b) = join_pair(&stub, GameInfo::new("arena", 10, 5)).await;

        a.set_position(Position { x: 0, y: 9, grid: 10 }).await;
        b.set_position(Position { x: 0, y: 0, grid: 10 }).await;

        explode(&a, Bomb { area: GridArea::Blue }).await;

        assert!(a.is_game_over());
        assert!(!b.is_game_over());
        assert_eq!(a.score(), 0);
        assert!(b.members().await.is_empty());
        assert_eq!(stub.users(), vec![b.myself().clone()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_explosion_after_game_over_is_a_no_op() {
        let stub = StubRegistry::spawn(GameInfo::new("arena", 10, 5)).await.unwrap();
        let (a, b) = join_pair(&stub, GameInfo::new("arena", 10, 5)).await;

        a.set_position(Position { x: 0, y: 9, grid: 10 }).await;
        a.set_game_over();

        explode(&a, Bomb { area: GridArea::Blue }).await;

        assert_eq!(a.score(), 0);
        assert!(!b.is_game_over());
        assert_eq!(stub.users().len(), 2);
    }
}
