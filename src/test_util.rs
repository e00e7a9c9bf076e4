//! Helpers for multi-peer tests: localhost sessions on OS-assigned ports and an in-memory
//!  stand-in for the registry service. They are used for testing the protocol itself, but
//!  they are also exported so applications embedding the protocol can reuse them.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::game::world::GameInfo;
use crate::messaging::message::Verb;
use crate::messaging::peer::Peer;
use crate::protocol::session::Session;
use crate::registry::Registry;

pub fn localhost_peer(name: &str, port: u16) -> Peer {
    Peer::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Starts a session for `name` on an OS-assigned localhost port.
pub async fn start_localhost_session(
    name: &str,
    game: GameInfo,
    registry_authority: &str,
) -> anyhow::Result<Arc<Session>> {
    Session::start(
        localhost_peer(name, 0),
        game,
        Registry::new(registry_authority),
    )
    .await
}

#[derive(Serialize)]
struct StubResponse {
    #[serde(rename = "type")]
    verb: Verb,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

fn ok(body: Option<String>) -> StubResponse {
    StubResponse {
        verb: Verb::Ok,
        body,
    }
}

fn code(verb: Verb) -> StubResponse {
    StubResponse { verb, body: None }
}

/// In-memory stand-in speaking the registry's HTTP surface, tracking one game.
pub struct StubRegistry {
    authority: String,
    state: Arc<Mutex<GameInfo>>,
    accept_task: JoinHandle<()>,
}

impl StubRegistry {
    pub async fn spawn(game: GameInfo) -> anyhow::Result<StubRegistry> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let authority = format!("127.0.0.1:{}", listener.local_addr()?.port());
        let state = Arc::new(Mutex::new(game));

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(respond(state, request).await) }
                    });
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        Ok(StubRegistry {
            authority,
            state,
            accept_task,
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn registry(&self) -> Registry {
        Registry::new(self.authority.clone())
    }

    /// The game's current membership as the registry sees it.
    pub fn users(&self) -> Vec<Peer> {
        self.state.lock().expect("stub registry state poisoned").users.clone()
    }
}

impl Drop for StubRegistry {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn respond(state: Arc<Mutex<GameInfo>>, request: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().trim_start_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').collect();
    let payload = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let response = {
        let mut game = state.lock().expect("stub registry state poisoned");
        match (method.as_str(), segments.as_slice()) {
            ("POST", ["add_user"]) | ("POST", ["add_game"]) => ok(None),
            ("DELETE", ["user_list", _key]) => ok(None),

            ("GET", ["game_list"]) => {
                ok(serde_json::to_string(&vec![game.clone()]).ok())
            }
            ("GET", ["game_list", name]) => {
                if game.name == *name {
                    ok(serde_json::to_string(&*game).ok())
                } else {
                    code(Verb::GameNotExist)
                }
            }
            ("PUT", ["game_list", name]) => match serde_json::from_slice::<Peer>(&payload) {
                Ok(user) if game.name == *name => {
                    if game.users.contains(&user) {
                        code(Verb::GameUserDuplication)
                    } else {
                        game.users.push(user);
                        ok(None)
                    }
                }
                Ok(_) => code(Verb::GameNotExist),
                Err(_) => code(Verb::UserNotExist),
            },
            ("DELETE", ["game_list", name, user]) => {
                if game.name == *name {
                    game.users.retain(|u| u.name != *user);
                    ok(None)
                } else {
                    code(Verb::GameNotExist)
                }
            }

            _ => code(Verb::UserNotExist),
        }
    };

    let encoded =
        serde_json::to_string(&response).unwrap_or_else(|_| r#"{"type":"OK"}"#.to_string());
    Response::new(Full::new(Bytes::from(encoded)))
}
