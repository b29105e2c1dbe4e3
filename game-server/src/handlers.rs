//! Routing of validated client messages into the engine, and the replies
//! going back out. Join, leave and bump events are enqueued while the engine
//! lock of the triggering mutation is still held, so every connection sees
//! them before the first state update that reflects the change.

use crate::config::MovementBroadcast;
use crate::events::dispatch_events;
use crate::game::{GameError, MoveOutcome, RemoveReason};
use crate::state::AppState;
use protocol::{
    ConnectAckPayload, ConnectPayload, ErrorCode, ErrorContext, IncomingMessage, MovePayload,
    OutgoingMessage, SetPlayerNamePayload,
};
use std::sync::Arc;
use std::time::Instant;

/// Parses one text frame and routes it. Every failure is answered with
/// exactly one ERROR message; nothing here ever tears the connection down.
pub async fn handle_frame(state: &Arc<AppState>, client_id: &str, text: &str) {
    let message = match protocol::parse_incoming(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::debug!(client_id, %err, "rejected client frame");
            let reply = OutgoingMessage::parse_error(&err);
            let mut registry = state.registry.lock().await;
            registry.send_to(client_id, reply.encode_for(client_id));
            return;
        }
    };

    let now = Instant::now();
    state.registry.lock().await.touch(client_id, now);

    match message {
        IncomingMessage::Connect(payload) => handle_connect(state, client_id, payload, now).await,
        IncomingMessage::Disconnect => handle_disconnect(state, client_id, now).await,
        IncomingMessage::Move(payload) => handle_move(state, client_id, payload, now).await,
        IncomingMessage::SetPlayerName(payload) => {
            handle_set_player_name(state, client_id, payload, now).await
        }
        IncomingMessage::Restart => handle_restart(state, client_id).await,
        IncomingMessage::Ping => {
            let mut registry = state.registry.lock().await;
            registry.send_to(client_id, OutgoingMessage::Pong.encode_for(client_id));
        }
    }
}

/// Joins a new player, or restores a disconnected one when the request
/// carries a player id the engine still remembers within grace.
async fn handle_connect(
    state: &Arc<AppState>,
    client_id: &str,
    payload: ConnectPayload,
    now: Instant,
) {
    {
        let registry = state.registry.lock().await;
        if registry.player_of(client_id).is_some() {
            drop(registry);
            reply_error(
                state,
                client_id,
                ErrorCode::InvalidInput,
                "connection is already bound to a player",
                "connect",
            )
            .await;
            return;
        }
    }

    let mut game = state.game.lock().await;
    let known_player = payload
        .player_id
        .as_deref()
        .filter(|player_id| game.knows_disconnected_player(player_id));

    let result = match known_player {
        Some(player_id) => match game.restore_player(
            player_id,
            client_id,
            now,
            state.config.player_grace,
        ) {
            Ok((player, events)) => Ok((player, events, true)),
            Err(GameError::GraceExpired(player_id)) => {
                tracing::info!(player_id, "reconnect after grace, joining as a new player");
                game.add_player(payload.player_name, client_id, now)
                    .map(|(player, events)| (player, events, false))
            }
            Err(other) => Err(other),
        },
        None => game
            .add_player(payload.player_name, client_id, now)
            .map(|(player, events)| (player, events, false)),
    };

    match result {
        Err(err) => {
            drop(game);
            tracing::warn!(client_id, %err, "connect rejected");
            let code = match err.code() {
                ErrorCode::NoSpawnCell => ErrorCode::NoSpawnCell,
                _ => ErrorCode::PlayerAddFailed,
            };
            reply_error(state, client_id, code, err.to_string(), "connect").await;
        }
        Ok((player, events, is_reconnection)) => {
            let snapshot = game.snapshot();
            let mut registry = state.registry.lock().await;
            if registry
                .bind_player(client_id, &player.player_id, &player.player_name)
                .is_err()
            {
                // The transport vanished mid-handshake. Take the join back.
                tracing::warn!(client_id, "connect raced a disconnect, rolling back");
                let _ = game.remove_player(&player.player_id, RemoveReason::Quit, now);
                return;
            }
            let ack = OutgoingMessage::ConnectAck(ConnectAckPayload {
                client_id: client_id.to_string(),
                player_id: player.player_id.clone(),
                player_name: player.player_name.clone(),
                is_reconnection,
                game_state: snapshot,
            });
            registry.send_to(client_id, ack.encode_for(client_id));
            dispatch_events(&mut registry, &events);
            tracing::info!(
                client_id,
                player_id = %player.player_id,
                is_reconnection,
                "player joined"
            );
        }
    }
}

/// A graceful leave: the player enters the grace period immediately and the
/// connection is closed.
async fn handle_disconnect(state: &Arc<AppState>, client_id: &str, now: Instant) {
    let mut game = state.game.lock().await;
    let mut registry = state.registry.lock().await;
    let Some(player_id) = registry.player_of(client_id) else {
        registry.send_to(
            client_id,
            not_connected_reply("disconnect").encode_for(client_id),
        );
        return;
    };
    match game.remove_player(&player_id, RemoveReason::Disconnect, now) {
        Ok(events) => dispatch_events(&mut registry, &events),
        Err(err) => tracing::warn!(client_id, %err, "disconnect for an unknown player"),
    }
    registry.close(client_id);
    registry.mark_disconnected(client_id, now);
}

/// A one-step move request. Rejections come back as a targeted ERROR built
/// from the bump event; in immediate mode a success also publishes a fresh
/// snapshot to everyone.
async fn handle_move(state: &Arc<AppState>, client_id: &str, payload: MovePayload, now: Instant) {
    let player_id = { state.registry.lock().await.player_of(client_id) };
    let Some(player_id) = player_id else {
        reply_not_connected(state, client_id, "move").await;
        return;
    };

    let mut game = state.game.lock().await;
    match game.move_player(&player_id, payload.dx, payload.dy, now) {
        Err(err) => {
            drop(game);
            let reply = OutgoingMessage::error(
                err.code(),
                err.to_string(),
                ErrorContext {
                    action: Some("move".to_string()),
                    player_id: Some(player_id),
                    ..ErrorContext::default()
                },
            );
            let mut registry = state.registry.lock().await;
            registry.send_to(client_id, reply.encode_for(client_id));
        }
        Ok((outcome, events)) => {
            let mut registry = state.registry.lock().await;
            dispatch_events(&mut registry, &events);
            if matches!(outcome, MoveOutcome::Moved { .. })
                && state.config.movement_broadcast == MovementBroadcast::Immediate
            {
                let update = OutgoingMessage::StateUpdate(game.snapshot());
                registry.broadcast(&update.encode());
            }
        }
    }
}

/// Renames the player on both the engine and the connection record.
async fn handle_set_player_name(
    state: &Arc<AppState>,
    client_id: &str,
    payload: SetPlayerNamePayload,
    now: Instant,
) {
    let player_id = { state.registry.lock().await.player_of(client_id) };
    let Some(player_id) = player_id else {
        reply_not_connected(state, client_id, "set_player_name").await;
        return;
    };

    let mut game = state.game.lock().await;
    match game.set_player_name(&player_id, &payload.player_name, now) {
        Ok(()) => {
            let mut registry = state.registry.lock().await;
            let _ = registry.bind_player(client_id, &player_id, &payload.player_name);
        }
        Err(err) => {
            drop(game);
            let reply = OutgoingMessage::error(
                err.code(),
                err.to_string(),
                ErrorContext {
                    action: Some("set_player_name".to_string()),
                    player_id: Some(player_id),
                    ..ErrorContext::default()
                },
            );
            let mut registry = state.registry.lock().await;
            registry.send_to(client_id, reply.encode_for(client_id));
        }
    }
}

/// Resets the game and publishes the fresh state. Every identity is gone
/// afterwards, so all connections are unbound and must connect again.
async fn handle_restart(state: &Arc<AppState>, client_id: &str) {
    let bound = { state.registry.lock().await.player_of(client_id).is_some() };
    if !bound {
        reply_not_connected(state, client_id, "restart").await;
        return;
    }

    tracing::info!(client_id, "game restart requested");
    let mut game = state.game.lock().await;
    game.reset();
    let update = OutgoingMessage::StateUpdate(game.snapshot());
    let mut registry = state.registry.lock().await;
    registry.unbind_all();
    registry.broadcast(&update.encode());
}

/// Tears down the state of a connection whose transport ended: the
/// connection enters its grace registry and the bound player, if any, enters
/// the engine's. Safe to call twice; both transitions are idempotent.
pub async fn finalize_disconnect(state: &Arc<AppState>, client_id: &str) {
    let now = Instant::now();
    let mut game = state.game.lock().await;
    let mut registry = state.registry.lock().await;
    let player_id = registry.player_of(client_id);
    registry.mark_disconnected(client_id, now);
    if let Some(player_id) = player_id {
        match game.remove_player(&player_id, RemoveReason::Disconnect, now) {
            Ok(events) => dispatch_events(&mut registry, &events),
            // Already moved by an explicit DISCONNECT or by a ticker.
            Err(GameError::NoSuchPlayer(_)) => {}
            Err(err) => tracing::warn!(client_id, %err, "disconnect cleanup failed"),
        }
    }
}

fn not_connected_reply(action: &str) -> OutgoingMessage {
    OutgoingMessage::error(
        ErrorCode::NotConnected,
        "no player is bound to this connection",
        ErrorContext {
            action: Some(action.to_string()),
            ..ErrorContext::default()
        },
    )
}

async fn reply_not_connected(state: &Arc<AppState>, client_id: &str, action: &str) {
    let mut registry = state.registry.lock().await;
    registry.send_to(client_id, not_connected_reply(action).encode_for(client_id));
}

async fn reply_error(
    state: &Arc<AppState>,
    client_id: &str,
    code: ErrorCode,
    message: impl Into<String>,
    action: &str,
) {
    let reply = OutgoingMessage::error(
        code,
        message,
        ErrorContext {
            action: Some(action.to_string()),
            ..ErrorContext::default()
        },
    );
    let mut registry = state.registry.lock().await;
    registry.send_to(client_id, reply.encode_for(client_id));
}
