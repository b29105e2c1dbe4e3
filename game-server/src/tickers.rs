//! The periodic tasks: the state broadcast, the keepalive sweep and the
//! grace-period purge. Each ticker observes the shared shutdown signal and
//! exits when it fires.

use crate::events::dispatch_events;
use crate::game::RemoveReason;
use crate::state::AppState;
use protocol::OutgoingMessage;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawns the three tickers with the intervals from the configuration.
pub fn spawn_tickers(
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(broadcast_loop(state.clone(), shutdown.clone())),
        tokio::spawn(ping_loop(state.clone(), shutdown.clone())),
        tokio::spawn(purge_loop(state, shutdown)),
    ]
}

async fn broadcast_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.broadcast_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => broadcast_state(&state).await,
            _ = shutdown.changed() => return,
        }
    }
}

/// Publishes one snapshot to every active connection. The snapshot and the
/// recipient list are taken under their locks; the enqueue itself never
/// holds the engine lock, and the actual writes happen in the writer tasks.
pub async fn broadcast_state(state: &Arc<AppState>) {
    let snapshot = {
        let game = state.game.lock().await;
        game.snapshot()
    };
    let update = OutgoingMessage::StateUpdate(snapshot).encode();
    let stalled = {
        let mut registry = state.registry.lock().await;
        registry.broadcast(&update)
    };
    if !stalled.is_empty() {
        disconnect_clients(state, &stalled).await;
    }
}

async fn ping_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.ping_interval);
    // The immediate first tick would ping before anyone had a chance to talk.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => sweep_keepalive(&state).await,
            _ = shutdown.changed() => return,
        }
    }
}

/// Disconnects clients that stayed silent for a full ping interval, then
/// pings the rest.
async fn sweep_keepalive(state: &Arc<AppState>) {
    let now = Instant::now();
    let stale = {
        let registry = state.registry.lock().await;
        registry.stale_connections(now, state.config.ping_interval)
    };
    if !stale.is_empty() {
        tracing::info!(count = stale.len(), "disconnecting unresponsive clients");
        disconnect_clients(state, &stale).await;
    }
    let mut registry = state.registry.lock().await;
    registry.broadcast_pings();
}

async fn purge_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.purge_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                {
                    let mut game = state.game.lock().await;
                    game.purge_expired(now, state.config.player_grace);
                }
                {
                    let mut registry = state.registry.lock().await;
                    registry.purge(now, state.config.connection_grace);
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Moves the given connections and their players into the disconnected
/// registries and announces the departures.
async fn disconnect_clients(state: &Arc<AppState>, client_ids: &[String]) {
    let now = Instant::now();
    let mut game = state.game.lock().await;
    let mut registry = state.registry.lock().await;
    for client_id in client_ids {
        let player_id = registry.player_of(client_id);
        registry.close(client_id);
        registry.mark_disconnected(client_id, now);
        if let Some(player_id) = player_id {
            if let Ok(events) = game.remove_player(&player_id, RemoveReason::Disconnect, now) {
                dispatch_events(&mut registry, &events);
            }
        }
    }
}
