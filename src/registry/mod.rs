use anyhow::anyhow;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::debug;

use crate::game::world::GameInfo;
use crate::messaging::message::Verb;
use crate::messaging::peer::Peer;

/// What the registry answers: a result code from the shared verb vocabulary, plus an
///  optional JSON body for the read operations.
#[derive(Debug, Deserialize)]
struct RegistryResponse {
    #[serde(rename = "type")]
    verb: Verb,
    #[serde(default)]
    body: Option<String>,
}

/// Client for the external lookup/registry service.
///
/// The registry only tracks existence - which games there are, which users are present in
///  them - never ring order or positions; those live with the peers. The core talks to it
///  exactly twice per membership change: register at ring join, deregister at ring leave.
///  Every call opens one http1 connection, sends one request and reads one response;
///  non-OK result codes are values for the caller to act on, only transport-level failure
///  is an error.
pub struct Registry {
    authority: String,
}

impl Registry {
    /// `authority` is the registry's `host:port`.
    pub fn new(authority: impl Into<String>) -> Registry {
        Registry {
            authority: authority.into(),
        }
    }

    async fn request(
        &self,
        method: Method,
        resource: &str,
        content: Option<String>,
    ) -> anyhow::Result<RegistryResponse> {
        let stream = TcpStream::connect(&self.authority).await?;
        let io = TokioIo::new(stream);
        let (mut sender, connection) = http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("registry connection ended with error: {}", e);
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(format!("/{}", resource))
            .header(hyper::header::HOST, &self.authority)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(Full::new(match content {
                Some(content) => Bytes::from(content),
                None => Bytes::new(),
            }))?;

        let response = sender.send_request(request).await?;
        let payload = response.into_body().collect().await?.to_bytes();
        if payload.is_empty() {
            return Err(anyhow!("registry returned an empty response"));
        }
        Ok(serde_json::from_slice(&payload)?)
    }

    fn user_key(user: &Peer) -> String {
        format!("{}-{}", user.address, user.port)
    }

    /// Registers a user with the registry at login time.
    pub async fn add_user(&self, user: &Peer) -> anyhow::Result<Verb> {
        let response = self
            .request(Method::POST, "add_user", Some(serde_json::to_string(user)?))
            .await?;
        Ok(response.verb)
    }

    /// Erases a user's registration at logout time.
    pub async fn remove_user(&self, user: &Peer) -> anyhow::Result<Verb> {
        let resource = format!("user_list/{}", Self::user_key(user));
        Ok(self.request(Method::DELETE, &resource, None).await?.verb)
    }

    pub async fn list_games(&self) -> anyhow::Result<Vec<GameInfo>> {
        let response = self.request(Method::GET, "game_list", None).await?;
        let body = response
            .body
            .ok_or_else(|| anyhow!("game list response without a body"))?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn add_game(&self, game: &GameInfo) -> anyhow::Result<Verb> {
        let response = self
            .request(Method::POST, "add_game", Some(serde_json::to_string(game)?))
            .await?;
        Ok(response.verb)
    }

    /// Fetches one game's current registry view. The game info is present exactly when the
    ///  result code is OK.
    pub async fn view_game(&self, name: &str) -> anyhow::Result<(Verb, Option<GameInfo>)> {
        let resource = format!("game_list/{}", name);
        let response = self.request(Method::GET, &resource, None).await?;
        let game = match (&response.verb, &response.body) {
            (Verb::Ok, Some(body)) => Some(serde_json::from_str(body)?),
            _ => None,
        };
        Ok((response.verb, game))
    }

    /// Records a user's membership in a game at ring-join time.
    pub async fn add_user_to_game(&self, game: &str, user: &Peer) -> anyhow::Result<Verb> {
        let resource = format!("game_list/{}", game);
        let response = self
            .request(Method::PUT, &resource, Some(serde_json::to_string(user)?))
            .await?;
        Ok(response.verb)
    }

    /// Erases a user's membership in a game at ring-leave time.
    pub async fn remove_user_from_game(&self, game: &str, user_name: &str) -> anyhow::Result<Verb> {
        let resource = format!("game_list/{}/{}", game, user_name);
        Ok(self.request(Method::DELETE, &resource, None).await?.verb)
    }
}

#[cfg(test)]
mod test {
    use std::net::IpAddr;

    use crate::test_util::StubRegistry;

    use super::*;

    fn peer(name: &str, port: u16) -> Peer {
        Peer::new(name, "127.0.0.1".parse::<IpAddr>().unwrap(), port)
    }

    #[tokio::test]
    async fn test_membership_round_trip() {
        let stub = StubRegistry::spawn(GameInfo::new("arena", 10, 5)).await.unwrap();
        let registry = Registry::new(stub.authority());

        let alice = peer("alice", 9001);
        assert_eq!(registry.add_user(&alice).await.unwrap(), Verb::Ok);
        assert_eq!(registry.add_user_to_game("arena", &alice).await.unwrap(), Verb::Ok);
        assert_eq!(
            registry.add_user_to_game("arena", &alice).await.unwrap(),
            Verb::GameUserDuplication
        );

        let (verb, game) = registry.view_game("arena").await.unwrap();
        assert_eq!(verb, Verb::Ok);
        assert_eq!(game.unwrap().users, vec![alice.clone()]);

        assert_eq!(
            registry.remove_user_from_game("arena", "alice").await.unwrap(),
            Verb::Ok
        );
        let (_, game) = registry.view_game("arena").await.unwrap();
        assert!(game.unwrap().users.is_empty());

        assert_eq!(registry.remove_user(&alice).await.unwrap(), Verb::Ok);
    }

    #[tokio::test]
    async fn test_unknown_game_is_a_typed_result() {
        let stub = StubRegistry::spawn(GameInfo::new("arena", 10, 5)).await.unwrap();
        let registry = Registry::new(stub.authority());

        let (verb, game) = registry.view_game("no_such_game").await.unwrap();
        assert_eq!(verb, Verb::GameNotExist);
        assert!(game.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_an_error_not_a_crash() {
        let registry = Registry::new("127.0.0.1:9");
        assert!(registry.add_user(&peer("alice", 9001)).await.is_err());
    }
}
