use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::game::world::{Direction, Position};
use crate::messaging::message::{Message, Verb};
use crate::protocol::session::Session;
use crate::protocol::{decode, encode, membership};

/// Applies one grid move under the critical section and tells the ring: every other member
///  checks the new cell against its own position, and a match means that member was eaten.
///  Eating scores a point; reaching the target score ends the game for everybody.
pub async fn apply_move(session: &Arc<Session>, direction: Direction) {
    let guard = session.enter_cs().await;
    if session.is_game_over() {
        drop(guard);
        return;
    }

    let position = session.apply_move_locally(direction).await;
    debug!("communicating the move to {}", position);
    let members = session.members().await;
    session
        .link()
        .broadcast(&members, Verb::PositionCheck, None, encode(&position), true)
        .await;

    if let Some(victim) = session.take_eaten().await {
        session.add_score(1);
        info!("you ate {} - score is now {}", victim.name, session.score());
        session.connections().close(victim.endpoint()).await;
    }

    if session.score() >= session.target_score().await {
        declare_victory(session).await;
    }

    session.leave_cs(guard).await;
    if session.is_game_over() {
        session.shutdown_local().await;
    }
}

/// Launches a bomb from the bag: announces it to the ring under the critical section and
///  arms its fuse. Returns whether a bomb was actually launched.
pub async fn launch_bomb(session: &Arc<Session>) -> bool {
    let guard = session.enter_cs().await;
    if session.is_game_over() {
        drop(guard);
        return false;
    }

    let Some(bomb) = session.bomb_bag().pop().await else {
        info!("the bomb bag is empty");
        session.leave_cs(guard).await;
        return false;
    };

    info!("launching a {:?} bomb", bomb.area);
    let members = session.members().await;
    session
        .link()
        .broadcast(&members, Verb::BombLaunch, None, encode(&bomb), true)
        .await;
    session.launcher().arm(session.clone(), bomb).await;

    session.leave_cs(guard).await;
    true
}

/// Voluntary quit. Refused while own launched bombs are still armed - their explosions
///  still need this peer. Otherwise announces the departure, leaves the ring and tears
///  down local protocol activity.
pub async fn quit(session: &Arc<Session>) -> bool {
    if session.launcher().fuses_burning().await {
        info!("cannot leave while own bombs are still armed");
        return false;
    }

    session.stop_hazards().await;

    let members = session.members().await;
    session
        .link()
        .broadcast(&members, Verb::GameUserLeft, None, None, true)
        .await;
    if !membership::leave(session, false).await {
        // the ring was not spliced; this peer is still a member
        return false;
    }

    info!("you left the game");
    session.shutdown_local().await;
    true
}

/// The winning branch: broadcasts the terminal verdict - one acknowledged unicast per
///  member, sent inside the critical section the caller holds so the terminal broadcast
///  stays serialized - and leaves the ring.
pub(crate) async fn declare_victory(session: &Arc<Session>) {
    session.set_game_over();
    session.stop_hazards().await;

    let members = session.members().await;
    let mut head = FxHashMap::default();
    head.insert(
        "output".to_string(),
        format!("{} reached the target score and won the game", session.myself().name),
    );
    for member in &members {
        session
            .link()
            .send(member, Verb::GameOver, Some(head.clone()), None, true)
            .await;
    }

    info!("you reached the target score and won");
    membership::leave(session, true).await;
}

/// POSITION_CHECK: another member moved onto a cell; if it is ours, we were eaten. The
///  eaten peer leaves the ring inside the checker's critical-section window - the checker
///  stays blocked on the acknowledgments until the excision is complete.
pub(crate) async fn on_position_check(session: &Arc<Session>, message: &Message) {
    if let Some(position) = message.body.as_deref().and_then(decode::<Position>) {
        if position == session.position().await {
            session.set_game_over();
            session.stop_hazards().await;
            membership::leave(session, true).await;
            info!("you were eaten by {} - game over", message.sender.name);
            session
                .link()
                .send(&message.sender, Verb::PositionMatch, None, None, true)
                .await;
        }
    }

    session.link().reply_acknowledged(message).await;

    if session.is_game_over() {
        session.shutdown_local().await;
    }
}

/// GAME_OVER: somebody won. The first such message flips local terminal state, stops the
///  producers and leaves the ring (covered by the winner's serialized terminal broadcast);
///  any further one only gets its acknowledgment.
pub(crate) async fn on_game_over(session: &Arc<Session>, message: &Message) {
    if !session.is_game_over() {
        session.set_game_over();
        session.stop_hazards().await;
        membership::leave(session, true).await;
        if let Some(output) = message.head.as_ref().and_then(|h| h.get("output")) {
            info!("{}", output);
        }
        info!("game over");
    }

    session.link().reply_acknowledged(message).await;
    session.shutdown_local().await;
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::game::hazard::Bomb;
    use crate::game::world::{GameInfo, GridArea, Position};
    use crate::protocol::membership;
    use crate::protocol::session::Session;
    use crate::test_util::{start_localhost_session, StubRegistry};

    use super::*;

    async fn join_pair(
        stub: &StubRegistry,
        game: GameInfo,
    ) -> (Arc<Session>, Arc<Session>) {
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

    fn at(x: u32, y: u32) -> Position {
        Position { x, y, grid: 10 }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_moving_onto_a_member_eats_it() {
        let stub = StubRegistry::spawn(GameInfo::new("arena", 10, 5)).await.unwrap();
        let (a, b) = join_pair(&stub, GameInfo::new("arena", 10, 5)).await;

        a.set_position(at(2, 2)).await;
        b.set_position(at(3, 2)).await;

        apply_move(&b, Direction::Left).await;

        assert!(a.is_game_over());
        assert!(!b.is_game_over());
        assert_eq!(b.score(), 1);
        assert_eq!(b.position().await, at(2, 2));

        // the eaten member excised itself from ring and registry
        assert!(b.members().await.is_empty());
        assert_eq!(stub.users(), vec![b.myself().clone()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_everybody_just_moves() {
        let stub = StubRegistry::spawn(GameInfo::new("arena", 10, 5)).await.unwrap();
        let (a, b) = join_pair(&stub, GameInfo::new("arena", 10, 5)).await;

        a.set_position(at(2, 2)).await;
        b.set_position(at(7, 7)).await;

        apply_move(&b, Direction::Down).await;

        assert!(!a.is_game_over());
        assert!(!b.is_game_over());
        assert_eq!(b.score(), 0);
        assert_eq!(b.position().await, at(7, 8));
        assert_eq!(b.members().await, vec![a.myself().clone()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reaching_the_target_score_ends_the_game_for_everybody() {
        let game = GameInfo::new("arena", 10, 1);
        let stub = StubRegistry::spawn(game.clone()).await.unwrap();

        let a = start_localhost_session("alice", game.clone(), stub.authority())
            .await
            .unwrap();
        membership::join(&a).await.unwrap();
        let (_, view) = stub.registry().view_game("arena").await.unwrap();
        let b = start_localhost_session("bob", view.unwrap(), stub.authority())
            .await
            .unwrap();
        membership::join(&b).await.unwrap();
        let (_, view) = stub.registry().view_game("arena").await.unwrap();
        let c = start_localhost_session("carol", view.unwrap(), stub.authority())
            .await
            .unwrap();
        membership::join(&c).await.unwrap();

        a.set_position(at(2, 2)).await;
        b.set_position(at(3, 2)).await;
        c.set_position(at(7, 7)).await;

        // bob eats alice, reaches the target score of 1 and wins; carol learns it from
        // the terminal broadcast
        apply_move(&b, Direction::Left).await;

        assert!(a.is_game_over());
        assert!(b.is_game_over());
        assert!(c.is_game_over());
        assert_eq!(b.score(), 1);
        assert!(stub.users().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_quit_is_refused_while_own_bombs_are_armed() {
        let stub = StubRegistry::spawn(GameInfo::new("arena", 10, 5)).await.unwrap();
        let a = start_localhost_session("alice", GameInfo::new("arena", 10, 5), stub.authority())
            .await
            .unwrap();
        membership::join(&a).await.unwrap();

        a.launcher().arm(a.clone(), Bomb { area: GridArea::Red }).await;
        assert!(!quit(&a).await);
        assert_eq!(stub.users().len(), 1);

        a.stop_hazards().await;
        timeout(Duration::from_secs(1), async {
            while a.launcher().fuses_burning().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(quit(&a).await);
        assert!(stub.users().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_moves_after_game_over_are_ignored() {
        let stub = StubRegistry::spawn(GameInfo::new("arena", 10, 5)).await.unwrap();
        let (_a, b) = join_pair(&stub, GameInfo::new("arena", 10, 5)).await;

        b.set_position(at(7, 7)).await;
        b.set_game_over();

        apply_move(&b, Direction::Down).await;
        assert_eq!(b.position().await, at(7, 7));
    }
}
