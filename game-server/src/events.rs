//! Game events and their delivery. The engine reports every collision, join
//! and leave as a [`GameEvent`]; [`dispatch_events`] translates them into
//! wire messages and enqueues them, targeted to one connection or broadcast
//! to all active ones.

use crate::registry::ConnectionRegistry;
use protocol::{
    ErrorCode, ErrorContext, OutgoingMessage, PlayerJoinedPayload, PlayerLeftPayload,
};

/// Who receives an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    /// Addressed to the one connection with this client id.
    Targeted(String),
    /// Addressed to every active connection.
    Broadcast,
}

/// What a rejected move bumped into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BumpKind {
    Wall,
    OutOfBounds,
    Entity { other_entity_id: String },
    Player { other_player_id: String },
}

impl BumpKind {
    /// The wire error code for this collision.
    pub fn code(&self) -> ErrorCode {
        match self {
            BumpKind::Wall => ErrorCode::MoveFailedWall,
            BumpKind::OutOfBounds => ErrorCode::OutOfBounds,
            BumpKind::Entity { .. } => ErrorCode::MoveFailedEntity,
            BumpKind::Player { .. } => ErrorCode::MoveFailedPlayer,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            BumpKind::Wall => "wall",
            BumpKind::OutOfBounds => "out_of_bounds",
            BumpKind::Entity { .. } => "entity",
            BumpKind::Player { .. } => "player",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            BumpKind::Wall => "movement blocked by a wall",
            BumpKind::OutOfBounds => "movement would leave the board",
            BumpKind::Entity { .. } => "movement blocked by a solid entity",
            BumpKind::Player { .. } => "movement blocked by another player",
        }
    }
}

/// The closed set of events the engine emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    /// A player joined or reconnected. Broadcast.
    PlayerJoined {
        client_id: String,
        player_id: String,
        player_name: String,
        x: i32,
        y: i32,
        is_reconnection: bool,
    },
    /// A player left or was disconnected. Broadcast.
    PlayerLeft { player_id: String },
    /// A move was rejected. Targeted at the moving player's connection.
    Bump {
        client_id: String,
        player_id: String,
        kind: BumpKind,
        attempted: (i32, i32),
        current: (i32, i32),
    },
}

impl GameEvent {
    pub fn scope(&self) -> EventScope {
        match self {
            GameEvent::PlayerJoined { .. } | GameEvent::PlayerLeft { .. } => EventScope::Broadcast,
            GameEvent::Bump { client_id, .. } => EventScope::Targeted(client_id.clone()),
        }
    }

    /// The wire message this event turns into.
    pub fn to_wire(&self) -> OutgoingMessage {
        match self {
            GameEvent::PlayerJoined {
                client_id,
                player_id,
                player_name,
                x,
                y,
                is_reconnection,
            } => OutgoingMessage::PlayerJoined(PlayerJoinedPayload {
                client_id: client_id.clone(),
                player_id: player_id.clone(),
                player_name: player_name.clone(),
                x: *x,
                y: *y,
                is_reconnection: *is_reconnection,
            }),
            GameEvent::PlayerLeft { player_id } => {
                OutgoingMessage::PlayerLeft(PlayerLeftPayload {
                    player_id: player_id.clone(),
                })
            }
            GameEvent::Bump {
                player_id, kind, ..
            } => {
                let mut context = ErrorContext {
                    action: Some("move".to_string()),
                    player_id: Some(player_id.clone()),
                    reason: Some(kind.reason().to_string()),
                    ..ErrorContext::default()
                };
                match kind {
                    BumpKind::Player { other_player_id } => {
                        context.other_player_id = Some(other_player_id.clone());
                    }
                    BumpKind::Entity { other_entity_id } => {
                        context.other_entity_id = Some(other_entity_id.clone());
                    }
                    BumpKind::Wall | BumpKind::OutOfBounds => {}
                }
                OutgoingMessage::error(kind.code(), kind.message(), context)
            }
        }
    }
}

/// Enqueues the wire form of each event, honoring its scope. Runs in the
/// publisher's task and never blocks; slow consumers are handled by the
/// broadcast ticker, which disconnects connections with a full queue.
pub fn dispatch_events(registry: &mut ConnectionRegistry, events: &[GameEvent]) {
    for event in events {
        let message = event.to_wire();
        match event.scope() {
            EventScope::Targeted(client_id) => {
                registry.send_to(&client_id, message.encode_for(&client_id));
            }
            EventScope::Broadcast => {
                registry.broadcast(&message.encode());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_events_become_targeted_errors() {
        let event = GameEvent::Bump {
            client_id: "c1".to_string(),
            player_id: "p1".to_string(),
            kind: BumpKind::Player {
                other_player_id: "p2".to_string(),
            },
            attempted: (6, 5),
            current: (5, 5),
        };
        assert_eq!(event.scope(), EventScope::Targeted("c1".to_string()));

        let OutgoingMessage::Error(payload) = event.to_wire() else {
            panic!("bump must map to an error message");
        };
        assert_eq!(payload.code, ErrorCode::MoveFailedPlayer);
        assert_eq!(payload.context.action.as_deref(), Some("move"));
        assert_eq!(payload.context.player_id.as_deref(), Some("p1"));
        assert_eq!(payload.context.reason.as_deref(), Some("player"));
        assert_eq!(payload.context.other_player_id.as_deref(), Some("p2"));
    }

    #[test]
    fn joins_and_leaves_broadcast() {
        let joined = GameEvent::PlayerJoined {
            client_id: "c1".to_string(),
            player_id: "p1".to_string(),
            player_name: "A".to_string(),
            x: 30,
            y: 12,
            is_reconnection: true,
        };
        assert_eq!(joined.scope(), EventScope::Broadcast);
        let OutgoingMessage::PlayerJoined(payload) = joined.to_wire() else {
            panic!("join must map to PLAYER_JOINED");
        };
        assert!(payload.is_reconnection);

        let left = GameEvent::PlayerLeft {
            player_id: "p1".to_string(),
        };
        assert_eq!(left.scope(), EventScope::Broadcast);
    }

    #[test]
    fn every_bump_kind_carries_its_code() {
        let kinds = [
            (BumpKind::Wall, ErrorCode::MoveFailedWall),
            (BumpKind::OutOfBounds, ErrorCode::OutOfBounds),
            (
                BumpKind::Entity {
                    other_entity_id: "e1".to_string(),
                },
                ErrorCode::MoveFailedEntity,
            ),
            (
                BumpKind::Player {
                    other_player_id: "p2".to_string(),
                },
                ErrorCode::MoveFailedPlayer,
            ),
        ];
        for (kind, code) in kinds {
            assert_eq!(kind.code(), code);
        }
    }
}
