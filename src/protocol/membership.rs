use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::game::world::Position;
use crate::messaging::message::{Message, Verb};
use crate::messaging::peer::Peer;
use crate::protocol::session::Session;
use crate::protocol::{decode, encode};

/// How long a joining peer waits for a ring-entry verdict. Enforced with a monotonic
///  deadline around the wait, so a verdict that lands after the deadline is reported as a
///  timeout, never as success.
pub const RING_ENTRY_TIMEOUT: Duration = Duration::from_secs(5);

/// NEIGHBORS_UPDATE payload. An absent field leaves the receiver's pointer untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Peer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Peer>,
}

/// Typed outcome of a failed join attempt. Never a crash: the caller decides what to tell
///  the player.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum JoinError {
    /// the registry does not know the game (any more)
    GameNotExist,
    /// another member already plays under this display name
    NameTaken,
    /// a current member rejected the entry
    Rejected,
    /// no verdict arrived within [RING_ENTRY_TIMEOUT]
    Timeout,
    /// the registry answered with an unexpected result code
    Registry(Verb),
    /// the registry could not be reached at all
    RegistryUnavailable,
}

impl Display for JoinError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::GameNotExist => write!(f, "the game does not exist (any more)"),
            JoinError::NameTaken => write!(f, "the display name is already taken in this game"),
            JoinError::Rejected => write!(f, "a ring member rejected the entry"),
            JoinError::Timeout => write!(f, "no ring-entry verdict within the deadline"),
            JoinError::Registry(verb) => write!(f, "unexpected registry result: {:?}", verb),
            JoinError::RegistryUnavailable => write!(f, "the registry could not be reached"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Joins the game this session was started for.
///
/// The first member of a game seeds the ring with the token and draws its own start
///  position; every later joiner asks the current members for entry and waits (bounded)
///  for the verdict.
pub async fn join(session: &Arc<Session>) -> Result<(), JoinError> {
    if session.members().await.is_empty() {
        join_as_first(session).await
    } else {
        join_existing(session).await
    }
}

async fn join_as_first(session: &Arc<Session>) -> Result<(), JoinError> {
    let myself = session.myself().clone();
    session.set_prev(myself.clone()).await;
    session.set_next(myself).await;
    session.install_ring(true).await;

    let guard = session.enter_cs().await;

    let game_name = session.game_name().await;
    let result = match session
        .registry()
        .add_user_to_game(&game_name, session.myself())
        .await
    {
        Ok(Verb::Ok) => {
            let position = session.randomize_position().await;
            info!("created the ring for {:?}, starting at {}", game_name, position);
            Ok(())
        }
        Ok(Verb::GameNotExist) => Err(JoinError::GameNotExist),
        Ok(verb) => Err(JoinError::Registry(verb)),
        Err(e) => {
            warn!("registry unreachable while creating the ring: {}", e);
            Err(JoinError::RegistryUnavailable)
        }
    };

    session.leave_cs(guard).await;
    result
}

async fn join_existing(session: &Arc<Session>) -> Result<(), JoinError> {
    let game_name = session.game_name().await;

    // the local game info may be stale; the registry has the authoritative existence view
    let (verb, game) = session
        .registry()
        .view_game(&game_name)
        .await
        .map_err(|e| {
            warn!("registry unreachable while joining: {}", e);
            JoinError::RegistryUnavailable
        })?;
    let game = match (verb, game) {
        (Verb::Ok, Some(game)) => game,
        _ => return Err(JoinError::GameNotExist),
    };

    if game.users.iter().any(|u| u.name == session.myself().name) {
        return Err(JoinError::NameTaken);
    }

    session.replace_game(game).await;
    session.install_ring(false).await;

    let wait = session.open_entry_wait().await;
    let members = session.members().await;
    session
        .link()
        .broadcast(&members, Verb::RingEntryRequest, None, None, false)
        .await;

    let verdict = timeout(RING_ENTRY_TIMEOUT, wait.wait()).await;
    session.close_entry_wait().await;

    match verdict {
        Err(_) => Err(JoinError::Timeout),
        Ok(()) if wait.succeeded() => Ok(()),
        Ok(()) => Err(JoinError::Rejected),
    }
}

/// Handles RING_ENTRY_REQUEST on a current member, entirely under one critical-section
///  hold, so no concurrent entry can interleave the membership mutation.
///
/// Exactly one member performs the splice: everyone else receives the token later, finds
///  the requester already in its membership list and does nothing.
pub async fn grant_entry(session: &Arc<Session>, request: &Message) {
    let guard = session.enter_cs().await;
    if session.is_game_over() {
        // a stale request must not revive protocol activity; the gate is released, the
        // dead ring state stays as the shutdown override left it
        drop(guard);
        return;
    }

    let requester = request.sender.clone();
    if session.members().await.contains(&requester) {
        debug!("{:?} is already a member, nothing to do", requester);
        session.leave_cs(guard).await;
        return;
    }

    // the requester may have given up in the meantime; a refused connect means its
    // listener is gone and no reply would reach it
    if let Err(e) = TcpStream::connect(requester.endpoint()).await {
        debug!("ring-entry requester {:?} is not reachable ({}), ignoring", requester, e);
        session.leave_cs(guard).await;
        return;
    }

    let game_name = session.game_name().await;
    match session.registry().add_user_to_game(&game_name, &requester).await {
        Ok(Verb::Ok) => {
            admit(session, &requester).await;
        }
        Ok(verb) => {
            debug!("registry refused {:?} for {:?}: {:?}", requester, game_name, verb);
            session
                .link()
                .send(&requester, Verb::RingEntryFailed, None, None, false)
                .await;
        }
        Err(e) => {
            warn!("registry unreachable while admitting {:?}: {}", requester, e);
            session
                .link()
                .send(&requester, Verb::RingEntryFailed, None, None, false)
                .await;
        }
    }

    session.leave_cs(guard).await;
}

/// The successful branch of [grant_entry]: position bootstrap, neighbor splice, list
///  broadcast, verdict. Runs under the granter's critical-section hold.
async fn admit(session: &Arc<Session>, requester: &Peer) {
    let myself = session.myself().clone();
    let members = session.members().await;

    // collect every current member's position (plus our own) so the newcomer's start
    // cell collides with nobody
    let round = session.open_position_round(1 + members.len()).await;
    round.push(session.position().await).await;
    session
        .link()
        .broadcast(&members, Verb::PositionRequest, None, None, false)
        .await;
    let taken = round.wait_all().await;
    session.close_position_round().await;

    let mut position = Position::new(session.grid().await);
    loop {
        position.randomize();
        if !taken.contains(&position) {
            break;
        }
    }
    session
        .link()
        .send(requester, Verb::PositionUpdate, None, encode(&position), true)
        .await;

    // splice the newcomer in between us and our former successor
    let old_next = session.next().await;
    session
        .link()
        .send(
            requester,
            Verb::NeighborsUpdate,
            None,
            encode(&Neighbors {
                prev: Some(myself.clone()),
                next: Some(old_next.clone()),
            }),
            true,
        )
        .await;
    if old_next == myself {
        // singleton ring: the newcomer becomes both neighbors
        session.set_prev(requester.clone()).await;
    } else {
        session
            .link()
            .send(
                &old_next,
                Verb::NeighborsUpdate,
                None,
                encode(&Neighbors {
                    prev: Some(requester.clone()),
                    next: None,
                }),
                true,
            )
            .await;
    }
    session.set_next(requester.clone()).await;

    // one canonical list for everybody, ourselves and the newcomer included; each
    // recipient (this peer too, via loopback) stores it minus itself
    let mut list = members;
    list.push(requester.clone());
    list.push(myself);
    session
        .link()
        .broadcast(&list, Verb::UserListUpdate, None, encode(&list), true)
        .await;

    info!("{:?} entered the ring", requester);
    session
        .link()
        .send(requester, Verb::RingEntrySucceeded, None, None, false)
        .await;
}

/// Leaves the ring: deregisters with the registry, splices the own neighbors around the
///  gap, and broadcasts the updated list plus a socket-closure hint. With `in_cs` the
///  caller already holds the critical section (or is covered by the holder's, for the
///  terminal teardown paths) and no CS acquisition happens here.
pub async fn leave(session: &Arc<Session>, in_cs: bool) -> bool {
    let guard = if in_cs {
        None
    } else {
        Some(session.enter_cs().await)
    };

    let game_name = session.game_name().await;
    match session
        .registry()
        .remove_user_from_game(&game_name, &session.myself().name)
        .await
    {
        Ok(Verb::Ok) => {}
        Ok(verb) => {
            info!("registry refused the deregistration: {:?}", verb);
            if let Some(guard) = guard {
                session.leave_cs(guard).await;
            }
            return false;
        }
        Err(e) => {
            warn!("registry unreachable while leaving: {}", e);
            if let Some(guard) = guard {
                session.leave_cs(guard).await;
            }
            return false;
        }
    }

    let members = session.members().await;
    if !members.is_empty() {
        let prev = session.prev().await;
        let next = session.next().await;

        session
            .link()
            .send(
                &prev,
                Verb::NeighborsUpdate,
                None,
                encode(&Neighbors { prev: None, next: Some(next.clone()) }),
                true,
            )
            .await;
        session
            .link()
            .send(
                &next,
                Verb::NeighborsUpdate,
                None,
                encode(&Neighbors { prev: Some(prev), next: None }),
                true,
            )
            .await;

        session
            .link()
            .broadcast(&members, Verb::UserListUpdate, None, encode(&members), true)
            .await;
        session
            .link()
            .broadcast(&members, Verb::SocketClosure, None, None, false)
            .await;
    }

    if let Some(guard) = guard {
        session.leave_cs(guard).await;
    }
    true
}
