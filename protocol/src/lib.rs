//! The wire protocol shared between the game server and its clients.
//! Every message is a UTF-8 JSON envelope `{ type, payload, timestamp, clientId? }`;
//! this crate is the only place that touches that format. The server builds
//! outgoing messages exclusively through [`OutgoingMessage`] and parses client
//! frames exclusively through [`parse_incoming`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// The buffer size for the per-connection outbound channels.
pub const OUTBOUND_BUFFER_SIZE: usize = 256;

// Client -> Server tags.

/// Join the game, optionally reclaiming a disconnected player id.
pub const CONNECT: &str = "CONNECT";
/// Graceful leave; the player enters the disconnected registry.
pub const DISCONNECT: &str = "DISCONNECT";
/// Request a one-step move.
pub const MOVE: &str = "MOVE";
/// Update the display name of the player.
pub const SET_PLAYER_NAME: &str = "SET_PLAYER_NAME";
/// Request a game reset.
pub const RESTART: &str = "RESTART";
/// Keepalive, answered with [`PONG`].
pub const PING: &str = "PING";

// Server -> Client tags.

/// Acknowledges a connect with the assigned ids and a full snapshot.
pub const CONNECT_ACK: &str = "CONNECT";
/// Periodic full-state broadcast.
pub const STATE_UPDATE: &str = "STATE_UPDATE";
/// A player joined or reconnected.
pub const PLAYER_JOINED: &str = "PLAYER_JOINED";
/// A player left or was disconnected.
pub const PLAYER_LEFT: &str = "PLAYER_LEFT";
/// A rejected action or server-side failure.
pub const ERROR: &str = "ERROR";
/// Keepalive reply.
pub const PONG: &str = "PONG";

/// The stable error codes carried in [`ErrorPayload::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedJson,
    MissingType,
    InvalidType,
    InvalidInput,
    NotConnected,
    UnknownClient,
    GraceExpired,
    GameNotRunning,
    InvalidMove,
    MoveFailedWall,
    MoveFailedEntity,
    MoveFailedPlayer,
    OutOfBounds,
    NoSuchPlayer,
    NoSuchEntity,
    EntityConflict,
    NoSpawnCell,
    PlayerAddFailed,
    InternalError,
    ServerShutdown,
}

/// Everything that can go wrong while interpreting a client frame.
/// Each variant maps onto exactly one wire [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    MalformedJson(String),
    #[error("message envelope carries no type tag")]
    MissingType,
    #[error("unknown message type `{0}`")]
    InvalidType(String),
    #[error("payload of `{tag}` does not match the expected shape: {detail}")]
    InvalidInput { tag: String, detail: String },
}

impl ProtocolError {
    /// The wire error code for this parse failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::MalformedJson(_) => ErrorCode::MalformedJson,
            ProtocolError::MissingType => ErrorCode::MissingType,
            ProtocolError::InvalidType(_) => ErrorCode::InvalidType,
            ProtocolError::InvalidInput { .. } => ErrorCode::InvalidInput,
        }
    }
}

/// The envelope every message travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    payload: Value,
    timestamp: u64,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
}

/// Milliseconds since the Unix epoch, used for envelope timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Client -> Server payloads
// ============================================================================

/// Payload of a [`CONNECT`] request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    /// A previously assigned player id, present on reconnect attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    /// The requested display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
}

/// Payload of a [`MOVE`] request. Deltas outside `{-1, 0, 1}` and the zero
/// move are rejected by the engine, not by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePayload {
    pub dx: i32,
    pub dy: i32,
}

/// Payload of a [`SET_PLAYER_NAME`] request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPlayerNamePayload {
    pub player_name: String,
}

/// A fully validated client message. All routing past the codec happens on
/// these variants, never on raw JSON fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingMessage {
    Connect(ConnectPayload),
    Disconnect,
    Move(MovePayload),
    SetPlayerName(SetPlayerNamePayload),
    Restart,
    Ping,
}

/// Parses and validates one client frame.
pub fn parse_incoming(text: &str) -> Result<IncomingMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| ProtocolError::MalformedJson(err.to_string()))?;
    let Some(object) = value.as_object() else {
        // Valid JSON, but there is no object to carry a type tag.
        return Err(ProtocolError::MissingType);
    };
    let tag = match object.get("type") {
        None | Some(Value::Null) => return Err(ProtocolError::MissingType),
        Some(Value::String(tag)) => tag.as_str(),
        Some(other) => return Err(ProtocolError::InvalidType(other.to_string())),
    };
    // A missing payload is treated as the empty object.
    let payload = object
        .get("payload")
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));

    match tag {
        CONNECT => decode_payload(tag, payload).map(IncomingMessage::Connect),
        DISCONNECT => Ok(IncomingMessage::Disconnect),
        MOVE => decode_payload(tag, payload).map(IncomingMessage::Move),
        SET_PLAYER_NAME => decode_payload(tag, payload).map(IncomingMessage::SetPlayerName),
        RESTART => Ok(IncomingMessage::Restart),
        PING => Ok(IncomingMessage::Ping),
        other => Err(ProtocolError::InvalidType(other.to_string())),
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    tag: &str,
    payload: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|err| ProtocolError::InvalidInput {
        tag: tag.to_string(),
        detail: err.to_string(),
    })
}

// ============================================================================
// Server -> Client payloads
// ============================================================================

/// The board part of a snapshot: dimensions plus the base characters only.
/// Players and entities never leak into `grid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardState {
    pub width: u32,
    pub height: u32,
    pub grid: Vec<Vec<char>>,
}

/// One player as seen in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub player_id: String,
    pub player_name: String,
    pub client_id: Option<String>,
    pub x: i32,
    pub y: i32,
}

/// One entity as seen in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub entity_id: String,
    pub entity_type: String,
    pub x: i32,
    pub y: i32,
    pub solid: bool,
    pub glyph: char,
    pub color: Option<u32>,
    pub z_order: i32,
}

/// Payload of a [`STATE_UPDATE`] broadcast and of the snapshot embedded in
/// the connect acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdatePayload {
    pub board: BoardState,
    pub players: Vec<PlayerState>,
    pub entities: Vec<EntityState>,
    pub score: i64,
    pub running: bool,
}

/// Payload of the [`CONNECT_ACK`] reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAckPayload {
    pub client_id: String,
    pub player_id: String,
    pub player_name: String,
    pub is_reconnection: bool,
    pub game_state: StateUpdatePayload,
}

/// Payload of a [`PLAYER_JOINED`] broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerJoinedPayload {
    pub client_id: String,
    pub player_id: String,
    pub player_name: String,
    pub x: i32,
    pub y: i32,
    pub is_reconnection: bool,
}

/// Payload of a [`PLAYER_LEFT`] broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeftPayload {
    pub player_id: String,
}

/// Free-form context attached to an error so clients can attribute it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_player_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_entity_id: Option<String>,
}

/// Payload of an [`ERROR`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub context: ErrorContext,
}

/// Every message the server can produce. Encoding these variants is the only
/// path by which the server produces wire bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    ConnectAck(ConnectAckPayload),
    StateUpdate(StateUpdatePayload),
    PlayerJoined(PlayerJoinedPayload),
    PlayerLeft(PlayerLeftPayload),
    Error(ErrorPayload),
    Pong,
}

impl OutgoingMessage {
    /// Shorthand for building an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>, context: ErrorContext) -> Self {
        OutgoingMessage::Error(ErrorPayload {
            code,
            message: message.into(),
            context,
        })
    }

    /// The error produced for a frame the codec rejected.
    pub fn parse_error(err: &ProtocolError) -> Self {
        OutgoingMessage::error(err.code(), err.to_string(), ErrorContext::default())
    }

    /// The type tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            OutgoingMessage::ConnectAck(_) => CONNECT_ACK,
            OutgoingMessage::StateUpdate(_) => STATE_UPDATE,
            OutgoingMessage::PlayerJoined(_) => PLAYER_JOINED,
            OutgoingMessage::PlayerLeft(_) => PLAYER_LEFT,
            OutgoingMessage::Error(_) => ERROR,
            OutgoingMessage::Pong => PONG,
        }
    }

    fn payload_value(&self) -> Value {
        let payload = match self {
            OutgoingMessage::ConnectAck(payload) => serde_json::to_value(payload),
            OutgoingMessage::StateUpdate(payload) => serde_json::to_value(payload),
            OutgoingMessage::PlayerJoined(payload) => serde_json::to_value(payload),
            OutgoingMessage::PlayerLeft(payload) => serde_json::to_value(payload),
            OutgoingMessage::Error(payload) => serde_json::to_value(payload),
            OutgoingMessage::Pong => Ok(Value::Object(Map::new())),
        };
        // None of the payload types contain a map with non-string keys, so
        // serialization cannot fail.
        payload.expect("wire payloads always serialize")
    }

    /// Serializes the message into one broadcast-ready wire frame.
    pub fn encode(&self) -> String {
        self.encode_envelope(None)
    }

    /// Serializes the message addressed to one client; the envelope carries
    /// its `clientId`.
    pub fn encode_for(&self, client_id: &str) -> String {
        self.encode_envelope(Some(client_id.to_string()))
    }

    fn encode_envelope(&self, client_id: Option<String>) -> String {
        let envelope = Envelope {
            kind: self.tag().to_string(),
            payload: self.payload_value(),
            timestamp: now_millis(),
            client_id,
        };
        serde_json::to_string(&envelope).expect("wire envelopes always serialize")
    }
}

/// Parses a server-built frame back into its variant. Used by clients and by
/// the round-trip tests; the server itself never reads its own output.
pub fn parse_outgoing(text: &str) -> Result<OutgoingMessage, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|err| ProtocolError::MalformedJson(err.to_string()))?;
    let tag = envelope.kind.as_str();
    match tag {
        CONNECT_ACK => decode_payload(tag, envelope.payload).map(OutgoingMessage::ConnectAck),
        STATE_UPDATE => decode_payload(tag, envelope.payload).map(OutgoingMessage::StateUpdate),
        PLAYER_JOINED => decode_payload(tag, envelope.payload).map(OutgoingMessage::PlayerJoined),
        PLAYER_LEFT => decode_payload(tag, envelope.payload).map(OutgoingMessage::PlayerLeft),
        ERROR => decode_payload(tag, envelope.payload).map(OutgoingMessage::Error),
        PONG => Ok(OutgoingMessage::Pong),
        other => Err(ProtocolError::InvalidType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> StateUpdatePayload {
        StateUpdatePayload {
            board: BoardState {
                width: 3,
                height: 2,
                grid: vec![vec!['#', '#', '#'], vec!['#', ' ', '#']],
            },
            players: vec![PlayerState {
                player_id: "p1".into(),
                player_name: "A".into(),
                client_id: Some("c1".into()),
                x: 1,
                y: 1,
            }],
            entities: vec![EntityState {
                entity_id: "e1".into(),
                entity_type: "chest".into(),
                x: 1,
                y: 0,
                solid: true,
                glyph: '?',
                color: Some(0x00ff_ab00),
                z_order: 2,
            }],
            score: 7,
            running: true,
        }
    }

    #[test]
    fn parses_connect_with_and_without_identity() {
        let msg = parse_incoming(r#"{"type":"CONNECT","payload":{"playerName":"A"},"timestamp":1}"#)
            .unwrap();
        assert_eq!(
            msg,
            IncomingMessage::Connect(ConnectPayload {
                player_id: None,
                player_name: Some("A".into()),
            })
        );

        let msg = parse_incoming(r#"{"type":"CONNECT","payload":{"playerId":"p1"},"timestamp":1}"#)
            .unwrap();
        assert_eq!(
            msg,
            IncomingMessage::Connect(ConnectPayload {
                player_id: Some("p1".into()),
                player_name: None,
            })
        );
    }

    #[test]
    fn parses_move_and_bare_tags() {
        let msg =
            parse_incoming(r#"{"type":"MOVE","payload":{"dx":-1,"dy":0},"timestamp":4}"#).unwrap();
        assert_eq!(msg, IncomingMessage::Move(MovePayload { dx: -1, dy: 0 }));

        assert_eq!(
            parse_incoming(r#"{"type":"PING","payload":{},"timestamp":4}"#).unwrap(),
            IncomingMessage::Ping
        );
        assert_eq!(
            parse_incoming(r#"{"type":"RESTART","timestamp":4}"#).unwrap(),
            IncomingMessage::Restart
        );
        assert_eq!(
            parse_incoming(r#"{"type":"DISCONNECT","payload":{},"timestamp":4}"#).unwrap(),
            IncomingMessage::Disconnect
        );
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_incoming("{not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedJson);
    }

    #[test]
    fn rejects_missing_and_non_string_type() {
        let err = parse_incoming(r#"{"payload":{},"timestamp":1}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingType);

        let err = parse_incoming(r#"[1,2,3]"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingType);

        let err = parse_incoming(r#"{"type":42,"payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidType);
    }

    #[test]
    fn rejects_unknown_type() {
        let err = parse_incoming(r#"{"type":"TELEPORT","payload":{}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidType("TELEPORT".into()));
    }

    #[test]
    fn rejects_payload_shape_mismatch() {
        // dx must be an integer.
        let err = parse_incoming(r#"{"type":"MOVE","payload":{"dx":"left","dy":0}}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        let err = parse_incoming(r#"{"type":"SET_PLAYER_NAME","payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn server_messages_survive_a_round_trip() {
        let messages = vec![
            OutgoingMessage::ConnectAck(ConnectAckPayload {
                client_id: "c1".into(),
                player_id: "p1".into(),
                player_name: "A".into(),
                is_reconnection: false,
                game_state: sample_snapshot(),
            }),
            OutgoingMessage::StateUpdate(sample_snapshot()),
            OutgoingMessage::PlayerJoined(PlayerJoinedPayload {
                client_id: "c1".into(),
                player_id: "p1".into(),
                player_name: "A".into(),
                x: 30,
                y: 12,
                is_reconnection: false,
            }),
            OutgoingMessage::PlayerLeft(PlayerLeftPayload {
                player_id: "p1".into(),
            }),
            OutgoingMessage::error(
                ErrorCode::MoveFailedWall,
                "movement blocked by a wall",
                ErrorContext {
                    action: Some("move".into()),
                    player_id: Some("p1".into()),
                    reason: Some("wall".into()),
                    ..ErrorContext::default()
                },
            ),
            OutgoingMessage::Pong,
        ];

        for message in messages {
            let encoded = message.encode();
            let parsed = parse_outgoing(&encoded).unwrap();
            assert_eq!(parsed, message);
        }
    }

    #[test]
    fn targeted_envelopes_carry_the_client_id() {
        let encoded = OutgoingMessage::Pong.encode_for("c7");
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["clientId"], "c7");
        assert_eq!(value["type"], "PONG");

        // Broadcast envelopes omit the field entirely.
        let encoded = OutgoingMessage::Pong.encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert!(value.get("clientId").is_none());
    }

    #[test]
    fn error_codes_use_screaming_snake_case_on_the_wire() {
        let encoded = OutgoingMessage::error(
            ErrorCode::ServerShutdown,
            "server is shutting down",
            ErrorContext::default(),
        )
        .encode();
        assert!(encoded.contains(r#""code":"SERVER_SHUTDOWN""#));
    }
}
