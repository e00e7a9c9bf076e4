use std::fmt::{Debug, Formatter};

use anyhow::bail;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messaging::peer::Peer;

/// Upper bound for a single wire frame. A length prefix beyond this is treated as a
///  malformed frame and the connection is dropped.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// The closed set of protocol verbs. The same enum doubles as the result code vocabulary
///  of the registry service, so a registry response and a peer message speak the same
///  language.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verb {
    Ok,

    Token,

    Acknowledged,

    UserNotExist,
    UserAddressportUnavailable,

    GameNameUnavailable,
    GameNotExist,
    GameUserDuplication,
    GameUserWelcome,
    GameUserLeft,
    GameOver,

    RingEntryRequest,
    RingEntryFailed,
    RingEntrySucceeded,

    NeighborsUpdate,
    UserListUpdate,
    SocketClosure,

    PositionRequest,
    PositionValue,
    PositionUpdate,
    PositionCheck,
    PositionMatch,

    BombLaunch,
    BombExplosion,
    BombAreaMatch,
}

/// Correlation id matching an acknowledgment back to the send it belongs to: a coarse
///  wall-clock timestamp plus a per-session counter, both zero-padded to the decimal width
///  of `u64::MAX` so ids are fixed-width on the wire.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new(timestamp_millis: u64, counter: u64) -> CorrelationId {
        CorrelationId(format!("{:020}.{:020}", timestamp_millis, counter))
    }
}

impl Debug for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable protocol message. The body is an opaque string whose encoding is specific
///  to the verb; it is decoded by the handler that knows the verb, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub verb: Verb,
    pub sender: Peer,
    pub recipient: Peer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<FxHashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "ackIdx")]
    pub ack_idx: CorrelationId,
}

impl Message {
    /// Writes this message as one length-prefixed JSON frame.
    pub async fn write_frame(&self, out: &mut (impl AsyncWrite + Unpin)) -> anyhow::Result<()> {
        let encoded = serde_json::to_vec(self)?;
        if encoded.len() > MAX_FRAME_SIZE {
            bail!(
                "message of {} bytes exceeds the frame limit of {} bytes",
                encoded.len(),
                MAX_FRAME_SIZE
            );
        }
        out.write_u32(encoded.len() as u32).await?;
        out.write_all(&encoded).await?;
        out.flush().await?;
        Ok(())
    }

    /// Reads one frame off the stream, `Ok(None)` signalling a clean end of stream.
    pub async fn read_frame(input: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<Option<Message>> {
        let len = match input.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME_SIZE {
            bail!(
                "frame of {} bytes exceeds the limit of {} bytes",
                len,
                MAX_FRAME_SIZE
            );
        }

        let mut buf = vec![0u8; len];
        input.read_exact(&mut buf).await?;
        Ok(Some(serde_json::from_slice(&buf)?))
    }
}
