//! WebSocket protocol message definitions
//!
//! Every frame is a JSON object `{type, timestamp, sequence, data}`. The
//! `type` tag maps onto the closed `ClientMsg` / `ServerMsg` enums; handlers
//! dispatch with an exhaustive `match`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::game::input::InputCommand;
use crate::game::physics::ArenaLayout;
use crate::game::snapshot::{WorldDelta, WorldSnapshot};
use crate::game::world::{DeathCause, Ship, ShipId};
use crate::session::manager::{MatchSummary, PhaseKind};

/// Every message kind in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ClientConnect,
    ServerWelcome,
    ConnectionError,
    PlayerInput,
    WorldStateDelta,
    WorldStateFull,
    ServerCorrection,
    MatchStart,
    MatchEnd,
    IntermissionStart,
    PlayerDeath,
    PlayerRespawn,
    ChatMessage,
    PingRequest,
    PingResponse,
}

impl MessageType {
    /// Kinds a client is allowed to send
    pub fn sent_by_client(self) -> bool {
        matches!(
            self,
            Self::ClientConnect
                | Self::PlayerInput
                | Self::ChatMessage
                | Self::PingRequest
                | Self::PingResponse
        )
    }

    /// Kinds the server is allowed to send
    pub fn sent_by_server(self) -> bool {
        !matches!(self, Self::ClientConnect | Self::PlayerInput)
    }

    /// A bad payload on these kinds is dropped instead of closing the connection
    pub fn tolerates_bad_payload(self) -> bool {
        matches!(self, Self::PlayerInput | Self::ChatMessage | Self::PingResponse)
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMsg {
    /// Handshake: reserve a handle or resume a retained session
    ClientConnect(ConnectRequest),
    PlayerInput(InputCommand),
    ChatMessage(ChatText),
    PingRequest(Ping),
    PingResponse(Ping),
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMsg {
    ServerWelcome(Welcome),
    ConnectionError(ErrorPayload),
    WorldStateDelta(WorldDelta),
    WorldStateFull(WorldSnapshot),
    ServerCorrection(Correction),
    MatchStart(PhaseInfo),
    MatchEnd(MatchSummary),
    IntermissionStart(PhaseInfo),
    PlayerDeath(DeathNotice),
    PlayerRespawn(RespawnNotice),
    ChatMessage(ChatLine),
    PingRequest(Ping),
    PingResponse(Ping),
}

impl ServerMsg {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::ServerWelcome(_) => MessageType::ServerWelcome,
            Self::ConnectionError(_) => MessageType::ConnectionError,
            Self::WorldStateDelta(_) => MessageType::WorldStateDelta,
            Self::WorldStateFull(_) => MessageType::WorldStateFull,
            Self::ServerCorrection(_) => MessageType::ServerCorrection,
            Self::MatchStart(_) => MessageType::MatchStart,
            Self::MatchEnd(_) => MessageType::MatchEnd,
            Self::IntermissionStart(_) => MessageType::IntermissionStart,
            Self::PlayerDeath(_) => MessageType::PlayerDeath,
            Self::PlayerRespawn(_) => MessageType::PlayerRespawn,
            Self::ChatMessage(_) => MessageType::ChatMessage,
            Self::PingRequest(_) => MessageType::PingRequest,
            Self::PingResponse(_) => MessageType::PingResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub handle: String,
    /// Session id from a previous `SERVER_WELCOME`, to resume after a drop
    #[serde(default)]
    pub resume_token: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: Uuid,
    pub ship_id: ShipId,
    pub handle: String,
    pub resumed: bool,
    pub tick: u64,
    pub tick_rate: u32,
    pub broadcast_rate: u32,
    pub phase: PhaseKind,
    pub phase_remaining_ms: u64,
    pub arena: ArenaLayout,
}

/// Error codes surfaced in `CONNECTION_ERROR`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    HandleConflict,
    InvalidHandle,
    SessionExpired,
    ProtocolError,
    HandshakeTimeout,
    Relegated,
    SessionReplaced,
    ServerUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Authoritative state of the receiver's own ship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub tick: u64,
    pub ship: Ship,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseInfo {
    pub phase: PhaseKind,
    pub duration_ms: u64,
    pub tick: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeathNotice {
    pub tick: u64,
    pub ship_id: ShipId,
    pub handle: String,
    pub killer: Option<String>,
    pub cause: DeathCause,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespawnNotice {
    pub tick: u64,
    pub ship_id: ShipId,
    pub handle: String,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatText {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLine {
    pub handle: String,
    pub text: String,
}

/// Heartbeat and latency ping; the responder echoes `t`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub t: u64,
}

/// Decoded frame with its envelope metadata
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub timestamp: u64,
    pub sequence: u64,
    pub message: T,
}

/// Malformed or out-of-place frames
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing or invalid envelope field `{0}`")]
    MissingField(&'static str),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("message type {0:?} is not valid in this direction")]
    WrongDirection(MessageType),
    #[error("invalid {kind:?} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
    #[error("unexpected {0:?} after handshake")]
    UnexpectedHandshake(MessageType),
}

impl ProtocolError {
    /// Fatal errors close the connection; the rest drop the frame
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidPayload { kind, .. } => !kind.tolerates_bad_payload(),
            _ => true,
        }
    }
}

/// Serialize a message into the wire envelope
pub fn encode<T: Serialize>(message: &T, timestamp: u64, sequence: u64) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(message)?;
    let object = value.as_object_mut().ok_or(ProtocolError::NotAnObject)?;
    object.insert("timestamp".to_string(), Value::from(timestamp));
    object.insert("sequence".to_string(), Value::from(sequence));
    Ok(serde_json::to_string(&value)?)
}

/// Decode a frame sent by a client
pub fn decode_client(text: &str) -> Result<Envelope<ClientMsg>, ProtocolError> {
    decode(text, MessageType::sent_by_client)
}

/// Decode a frame sent by the server
pub fn decode_server(text: &str) -> Result<Envelope<ServerMsg>, ProtocolError> {
    decode(text, MessageType::sent_by_server)
}

fn decode<T: DeserializeOwned>(
    text: &str,
    allowed: fn(MessageType) -> bool,
) -> Result<Envelope<T>, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;

    let raw_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("type"))?;
    let kind: MessageType = serde_json::from_value(Value::from(raw_type))
        .map_err(|_| ProtocolError::UnknownType(raw_type.to_string()))?;
    if !allowed(kind) {
        return Err(ProtocolError::WrongDirection(kind));
    }

    let timestamp = object
        .get("timestamp")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField("timestamp"))?;
    let sequence = object
        .get("sequence")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField("sequence"))?;

    let message = serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })?;

    Ok(Envelope {
        timestamp,
        sequence,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::input::InputKeys;
    use crate::game::world::World;

    #[test]
    fn player_input_decodes_from_wire_shape() {
        let text = r#"{"type":"PLAYER_INPUT","timestamp":1700,"sequence":4,
            "data":{"keys":9,"timestamp":1699,"sequence":12}}"#;
        let envelope = decode_client(text).unwrap();
        assert_eq!(envelope.sequence, 4);
        match envelope.message {
            ClientMsg::PlayerInput(cmd) => {
                assert_eq!(cmd.sequence, 12);
                assert!(cmd.keys.contains(InputKeys::THRUST));
                assert!(cmd.keys.contains(InputKeys::FIRE));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn encode_wraps_message_in_envelope() {
        let text = encode(&ServerMsg::PingRequest(Ping { t: 5 }), 1234, 9).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "PING_REQUEST");
        assert_eq!(value["timestamp"], 1234);
        assert_eq!(value["sequence"], 9);
        assert_eq!(value["data"]["t"], 5);

        let decoded = decode_server(&text).unwrap();
        assert_eq!(decoded.message.kind(), MessageType::PingRequest);
    }

    #[test]
    fn full_world_state_survives_the_wire() {
        let mut world = World::open_arena(3, 60);
        world.spawn_ship("Ace");
        world.spawn_ship("Bee");
        world.step(true);
        let snapshot = world.snapshot(77);

        let text = encode(&ServerMsg::WorldStateFull(snapshot.clone()), 77, 1).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value["data"]["ships"].is_array());

        match decode_server(&text).unwrap().message {
            ServerMsg::WorldStateFull(decoded) => {
                assert_eq!(decoded.ships.len(), 2);
                assert_eq!(decoded, snapshot);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_field_types_are_non_fatal_for_input() {
        let text = r#"{"type":"PLAYER_INPUT","timestamp":1,"sequence":1,
            "data":{"keys":"thrust","timestamp":1,"sequence":1}}"#;
        let err = decode_client(text).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn unknown_and_misdirected_types_are_fatal() {
        let unknown = decode_client(r#"{"type":"TELEPORT","timestamp":1,"sequence":1,"data":{}}"#);
        assert!(matches!(unknown, Err(ProtocolError::UnknownType(_))));

        let misdirected = decode_client(r#"{"type":"MATCH_END","timestamp":1,"sequence":1,"data":{}}"#);
        let err = misdirected.unwrap_err();
        assert!(matches!(err, ProtocolError::WrongDirection(MessageType::MatchEnd)));
        assert!(err.is_fatal());

        assert!(decode_client("not json").unwrap_err().is_fatal());
        assert!(matches!(
            decode_client(r#"{"type":"PING_REQUEST","sequence":1,"data":{"t":1}}"#),
            Err(ProtocolError::MissingField("timestamp"))
        ));
    }

    #[test]
    fn connect_request_resume_token_is_optional() {
        let text = r#"{"type":"CLIENT_CONNECT","timestamp":1,"sequence":0,"data":{"handle":"Ace"}}"#;
        match decode_client(text).unwrap().message {
            ClientMsg::ClientConnect(req) => {
                assert_eq!(req.handle, "Ace");
                assert!(req.resume_token.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
