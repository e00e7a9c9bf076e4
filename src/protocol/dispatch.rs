use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::game::{hazard, play};
use crate::messaging::message::{Message, Verb};
use crate::messaging::peer::Peer;
use crate::protocol::membership::{self, Neighbors};
use crate::protocol::session::Session;
use crate::protocol::{decode, encode};

/// The inbound message dispatcher: pops one message at a time and runs its handler as an
///  independent task, so handlers for different messages proceed concurrently. Nothing here
///  serializes them - mutual exclusion for shared game state is the token ring's job.
///
/// Ends when the inbound mailbox is closed; handlers still running are awaited.
pub fn spawn_dispatcher(session: Arc<Session>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut handlers: Vec<JoinHandle<()>> = Vec::new();

        while let Some(message) = session.inbound().pop().await {
            handlers.retain(|h| !h.is_finished());

            let session = session.clone();
            handlers.push(tokio::spawn(async move {
                handle(session, message).await;
            }));
        }

        for handler in handlers {
            let _ = handler.await;
        }
    })
}

async fn handle(session: Arc<Session>, message: Message) {
    trace!(verb = ?message.verb, sender = ?message.sender, "dispatching");

    match message.verb {
        Verb::Token => on_token(&session).await,
        Verb::Acknowledged => session.link().on_acknowledged(&message).await,

        Verb::RingEntryRequest => membership::grant_entry(&session, &message).await,
        Verb::RingEntryFailed => on_entry_verdict(&session, false).await,
        Verb::RingEntrySucceeded => on_entry_verdict(&session, true).await,

        Verb::GameUserWelcome => {
            info!("a new player entered the game: welcome, {}!", message.sender.name);
            session.link().reply_acknowledged(&message).await;
        }
        Verb::GameUserLeft => {
            info!("{} left the game", message.sender.name);
            session.link().reply_acknowledged(&message).await;
        }

        Verb::NeighborsUpdate => on_neighbors_update(&session, &message).await,
        Verb::UserListUpdate => on_user_list_update(&session, &message).await,
        Verb::SocketClosure => {
            session.connections().close(message.sender.endpoint()).await;
        }

        Verb::PositionRequest => {
            let position = session.position().await;
            session
                .link()
                .send(&message.sender, Verb::PositionValue, None, encode(&position), false)
                .await;
        }
        Verb::PositionValue => on_position_value(&session, &message).await,
        Verb::PositionUpdate => {
            if let Some(position) = message.body.as_deref().and_then(decode) {
                session.set_position(position).await;
            }
            session.link().reply_acknowledged(&message).await;
        }
        Verb::PositionCheck => play::on_position_check(&session, &message).await,
        Verb::PositionMatch => {
            session.set_eaten(message.sender.clone()).await;
            session.link().reply_acknowledged(&message).await;
        }

        Verb::BombLaunch => hazard::on_bomb_launch(&session, &message).await,
        Verb::BombExplosion => hazard::on_bomb_explosion(&session, &message).await,
        Verb::BombAreaMatch => hazard::on_bomb_area_match(&session, &message).await,

        Verb::GameOver => play::on_game_over(&session, &message).await,

        other => {
            // registry result codes never travel peer to peer
            debug!("ignoring unexpected {:?} from {:?}", other, message.sender);
        }
    }
}

async fn on_token(session: &Arc<Session>) {
    match session.ring().await {
        Some(ring) => {
            if ring.on_token_received().await {
                session.send_token().await;
            }
        }
        None => warn!("received a token before joining a ring, dropping it"),
    }
}

async fn on_entry_verdict(session: &Arc<Session>, succeeded: bool) {
    match session.entry_wait().await {
        Some(wait) => wait.verdict(succeeded),
        None => {
            debug!("ring-entry verdict without a pending join attempt");
            return;
        }
    }

    if succeeded {
        // introduce ourselves to the ring we just became part of
        let members = session.members().await;
        session
            .link()
            .broadcast(&members, Verb::GameUserWelcome, None, None, true)
            .await;
    }
}

async fn on_neighbors_update(session: &Arc<Session>, message: &Message) {
    match &message.body {
        Some(body) => {
            if let Some(neighbors) = decode::<Neighbors>(body) {
                if let Some(prev) = neighbors.prev {
                    session.set_prev(prev).await;
                }
                if let Some(next) = neighbors.next {
                    session.set_next(next).await;
                }
            }
        }
        None => {
            // no payload: push the current pointer values outward so the cycle closes
            // around this peer
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
        }
    }

    session.link().reply_acknowledged(message).await;
}

async fn on_user_list_update(session: &Arc<Session>, message: &Message) {
    match &message.body {
        Some(body) => {
            if let Some(list) = decode::<Vec<Peer>>(body) {
                session.replace_members(list).await;
            }
        }
        None => {
            let members = session.members().await;
            session
                .link()
                .broadcast(&members, Verb::UserListUpdate, None, encode(&members), true)
                .await;
        }
    }

    session.link().reply_acknowledged(message).await;
}

async fn on_position_value(session: &Arc<Session>, message: &Message) {
    let Some(position) = message.body.as_deref().and_then(decode) else {
        return;
    };
    match session.position_round().await {
        Some(round) => round.push(position).await,
        None => debug!("position value without an open collection round"),
    }
}
