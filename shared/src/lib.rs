//! Wire protocol and transport plumbing shared by the match server and client.
//!
//! Every websocket message is one JSON frame:
//!
//! ```json
//! {"type": "fire", "timestamp": "2024-05-01T12:00:00Z", "data": {"firing_id": "a", ...}}
//! ```
//!
//! The `type` tag selects how `data` is decoded, so an [`Event`] is always a
//! typed [`Payload`] once it has crossed the boundary. Frames with an unknown
//! tag or a payload that does not fit the tag are rejected by [`Event::decode`]
//! and never reach game code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod bus;
pub mod connection;
pub mod shutdown;

pub use bus::{EventBus, Subscription};
pub use connection::{Connection, ConnectionConfig, ConnectionId, Disconnect, Inbound, SendError};
pub use shutdown::{Shutdown, TaskSet};

pub const DEFAULT_BOARD_SIZE: u8 = 10;

/// Header carrying the player's identity during the websocket upgrade.
pub const PLAYER_ID_HEADER: &str = "x-player-id";
/// Header carrying the player's display name during the websocket upgrade.
pub const PLAYER_NAME_HEADER: &str = "x-player-name";

/// Opaque player identity, taken from the connection headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PlayerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Closed set of event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Join,
    Leave,
    GameStart,
    GameEnd,
    PlayerUpdateState,
    PlayerTurn,
    Fire,
    SendMessage,
    /// Chat typed locally on the client. Never crosses the transport.
    LocalMessage,
}

impl EventType {
    /// Tags that may appear on the wire.
    pub const WIRE: [EventType; 8] = [
        EventType::Join,
        EventType::Leave,
        EventType::GameStart,
        EventType::GameEnd,
        EventType::PlayerUpdateState,
        EventType::PlayerTurn,
        EventType::Fire,
        EventType::SendMessage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Join => "join",
            EventType::Leave => "leave",
            EventType::GameStart => "game-start",
            EventType::GameEnd => "game-end",
            EventType::PlayerUpdateState => "player-update-state",
            EventType::PlayerTurn => "player-turn",
            EventType::Fire => "fire",
            EventType::SendMessage => "send-message",
            EventType::LocalMessage => "local-message",
        }
    }

    pub fn is_local(self) -> bool {
        matches!(self, EventType::LocalMessage)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ProtocolError;

    /// Only wire tags parse; the local chat tag is unknown to the decoder.
    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        EventType::WIRE
            .iter()
            .copied()
            .find(|kind| kind.as_str() == tag)
            .ok_or_else(|| ProtocolError::UnknownType(tag.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("`{0}` events never leave the client")]
    LocalOnly(EventType),
}

/// Lifecycle of a match as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPhase {
    Waiting,
    Started,
    Ended,
}

/// One board cell as shown to a particular viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellView {
    /// Not yet fired at, contents hidden from this viewer.
    Unknown,
    Empty,
    Ship,
    Hit,
    Miss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: PlayerId,
    pub name: String,
    /// Ship cells not yet hit.
    pub remaining: u32,
    /// Rows of cells, indexed `board[y][x]`.
    pub board: Vec<Vec<CellView>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub player_id: PlayerId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeavePayload {
    pub player_id: PlayerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStartPayload {
    pub match_id: String,
    pub players: Vec<PlayerId>,
    pub board_size: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEndPayload {
    pub winner: Option<PlayerId>,
}

/// Full authoritative snapshot of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub phase: MatchPhase,
    pub turn: Option<PlayerId>,
    pub players: Vec<PlayerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnPayload {
    pub player_id: PlayerId,
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirePayload {
    pub firing_id: PlayerId,
    pub target_id: PlayerId,
    pub x: u8,
    pub y: u8,
}

/// Chat line or system notification. System notifications have no sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub from: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMessagePayload {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Join(JoinPayload),
    Leave(LeavePayload),
    GameStart(GameStartPayload),
    GameEnd(GameEndPayload),
    PlayerUpdateState(StatePayload),
    PlayerTurn(TurnPayload),
    Fire(FirePayload),
    SendMessage(ChatPayload),
    LocalMessage(LocalMessagePayload),
}

impl Payload {
    pub fn kind(&self) -> EventType {
        match self {
            Payload::Join(_) => EventType::Join,
            Payload::Leave(_) => EventType::Leave,
            Payload::GameStart(_) => EventType::GameStart,
            Payload::GameEnd(_) => EventType::GameEnd,
            Payload::PlayerUpdateState(_) => EventType::PlayerUpdateState,
            Payload::PlayerTurn(_) => EventType::PlayerTurn,
            Payload::Fire(_) => EventType::Fire,
            Payload::SendMessage(_) => EventType::SendMessage,
            Payload::LocalMessage(_) => EventType::LocalMessage,
        }
    }

    fn to_data(&self) -> Result<serde_json::Value, ProtocolError> {
        let data = match self {
            Payload::Join(p) => serde_json::to_value(p)?,
            Payload::Leave(p) => serde_json::to_value(p)?,
            Payload::GameStart(p) => serde_json::to_value(p)?,
            Payload::GameEnd(p) => serde_json::to_value(p)?,
            Payload::PlayerUpdateState(p) => serde_json::to_value(p)?,
            Payload::PlayerTurn(p) => serde_json::to_value(p)?,
            Payload::Fire(p) => serde_json::to_value(p)?,
            Payload::SendMessage(p) => serde_json::to_value(p)?,
            Payload::LocalMessage(_) => return Err(ProtocolError::LocalOnly(self.kind())),
        };
        Ok(data)
    }

    fn from_data(kind: EventType, data: serde_json::Value) -> Result<Self, ProtocolError> {
        let payload = match kind {
            EventType::Join => Payload::Join(serde_json::from_value(data)?),
            EventType::Leave => Payload::Leave(serde_json::from_value(data)?),
            EventType::GameStart => Payload::GameStart(serde_json::from_value(data)?),
            EventType::GameEnd => Payload::GameEnd(serde_json::from_value(data)?),
            EventType::PlayerUpdateState => {
                Payload::PlayerUpdateState(serde_json::from_value(data)?)
            }
            EventType::PlayerTurn => Payload::PlayerTurn(serde_json::from_value(data)?),
            EventType::Fire => Payload::Fire(serde_json::from_value(data)?),
            EventType::SendMessage => Payload::SendMessage(serde_json::from_value(data)?),
            EventType::LocalMessage => return Err(ProtocolError::LocalOnly(kind)),
        };
        Ok(payload)
    }
}

/// On-the-wire envelope. `data` stays untyped until the tag is known.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl Event {
    pub fn new(payload: Payload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventType {
        self.payload.kind()
    }

    /// System notification with no sender.
    pub fn notice(text: impl Into<String>) -> Self {
        Self::new(Payload::SendMessage(ChatPayload {
            from: None,
            text: text.into(),
        }))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let frame = Frame {
            kind: self.kind().as_str().to_string(),
            timestamp: self.timestamp,
            data: self.payload.to_data()?,
        };
        Ok(serde_json::to_string(&frame)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_frame(serde_json::from_str(text)?)
    }

    pub fn decode_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_frame(serde_json::from_slice(bytes)?)
    }

    fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let kind: EventType = frame.kind.parse()?;
        Ok(Self {
            timestamp: frame.timestamp,
            payload: Payload::from_data(kind, frame.data)?,
        })
    }
}
