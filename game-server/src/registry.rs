//! The connection registry: one entry per WebSocket client, split into the
//! active and the disconnected registries the same way the engine splits its
//! players. Each active connection holds the bounded channel feeding its
//! writer task; no lock is ever held across a transport write.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

/// A frame handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A serialized wire message, sent as a text frame.
    Message(String),
    /// A transport-level keepalive ping.
    Ping,
    /// Close the socket and end the writer.
    Close,
}

/// One client connection and its identity association.
#[derive(Debug)]
pub struct Connection {
    pub client_id: String,
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub player_id: Option<String>,
    pub player_name: Option<String>,
}

/// Binding an identity onto a client that is not active.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("client `{0}` is not active")]
pub struct UnknownClient(pub String);

/// The two-state connection registry.
#[derive(Debug)]
pub struct ConnectionRegistry {
    active: HashMap<String, Connection>,
    disconnected: HashMap<String, (Connection, Instant)>,
    next_client_id: u64,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            active: HashMap::new(),
            disconnected: HashMap::new(),
            next_client_id: 1,
        }
    }

    /// Registers a freshly accepted transport and returns its client id.
    pub fn register(&mut self, outbound: mpsc::Sender<OutboundFrame>, now: Instant) -> String {
        let client_id = format!("c{}", self.next_client_id);
        self.next_client_id += 1;
        self.active.insert(
            client_id.clone(),
            Connection {
                client_id: client_id.clone(),
                outbound,
                connected_at: now,
                last_activity: now,
                player_id: None,
                player_name: None,
            },
        );
        client_id
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn connection(&self, client_id: &str) -> Option<&Connection> {
        self.active.get(client_id)
    }

    /// The player bound to an active connection, if any.
    pub fn player_of(&self, client_id: &str) -> Option<String> {
        self.active.get(client_id)?.player_id.clone()
    }

    /// Associates a player identity with an active connection.
    pub fn bind_player(
        &mut self,
        client_id: &str,
        player_id: &str,
        player_name: &str,
    ) -> Result<(), UnknownClient> {
        let Some(connection) = self.active.get_mut(client_id) else {
            return Err(UnknownClient(client_id.to_string()));
        };
        connection.player_id = Some(player_id.to_string());
        connection.player_name = Some(player_name.to_string());
        Ok(())
    }

    /// Refreshes the activity timestamp of an active connection.
    pub fn touch(&mut self, client_id: &str, now: Instant) {
        if let Some(connection) = self.active.get_mut(client_id) {
            connection.last_activity = now;
        }
    }

    /// Moves a connection into the disconnected registry. Idempotent; a
    /// client id that is already gone stays gone.
    pub fn mark_disconnected(&mut self, client_id: &str, now: Instant) {
        if let Some(connection) = self.active.remove(client_id) {
            self.disconnected
                .insert(client_id.to_string(), (connection, now));
        }
    }

    /// Promotes a disconnected connection back to active. The typical
    /// reconnect instead arrives on a fresh client id and goes through
    /// player restoration; this path only serves transports that kept
    /// their id.
    pub fn reclaim(&mut self, client_id: &str, now: Instant) -> Option<&Connection> {
        let (mut connection, _) = self.disconnected.remove(client_id)?;
        connection.last_activity = now;
        self.active.insert(client_id.to_string(), connection);
        self.active.get(client_id)
    }

    /// Drops disconnected entries older than the grace period. Dropping an
    /// entry releases its outbound channel, which ends the writer task.
    pub fn purge(&mut self, now: Instant, grace: Duration) -> usize {
        let before = self.disconnected.len();
        self.disconnected
            .retain(|_, (_, disconnected_at)| now.duration_since(*disconnected_at) <= grace);
        let removed = before - self.disconnected.len();
        if removed > 0 {
            tracing::info!(removed, "purged expired disconnected connections");
        }
        removed
    }

    /// Enqueues one message for one active connection. Failures are logged
    /// and the message is dropped; the transport's own close will follow
    /// through `mark_disconnected`.
    pub fn send_to(&mut self, client_id: &str, text: String) {
        let Some(connection) = self.active.get(client_id) else {
            tracing::debug!(client_id, "dropping message for inactive client");
            return;
        };
        if let Err(err) = connection.outbound.try_send(OutboundFrame::Message(text)) {
            tracing::warn!(client_id, ?err, "failed to enqueue targeted message");
        }
    }

    /// Enqueues one message for every active connection. Returns the clients
    /// whose outbound queue was full; the caller disconnects them instead of
    /// letting frames pile up.
    pub fn broadcast(&mut self, text: &str) -> Vec<String> {
        let mut stalled = Vec::new();
        for (client_id, connection) in &self.active {
            match connection
                .outbound
                .try_send(OutboundFrame::Message(text.to_string()))
            {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(client_id, "outbound queue full, flagging for disconnect");
                    stalled.push(client_id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // The writer is already gone; cleanup is on its way.
                    tracing::debug!(client_id, "broadcast to a closing connection skipped");
                }
            }
        }
        stalled
    }

    /// Enqueues a transport-level ping for every active connection.
    pub fn broadcast_pings(&mut self) {
        for connection in self.active.values() {
            let _ = connection.outbound.try_send(OutboundFrame::Ping);
        }
    }

    /// Active connections without any traffic for longer than `max_idle`.
    pub fn stale_connections(&self, now: Instant, max_idle: Duration) -> Vec<String> {
        self.active
            .values()
            .filter(|connection| now.duration_since(connection.last_activity) > max_idle)
            .map(|connection| connection.client_id.clone())
            .collect()
    }

    /// Best-effort farewell: enqueues the message and a close frame for
    /// every active connection. Used once, at shutdown.
    pub fn shutdown_all(&mut self, text: &str) {
        for connection in self.active.values() {
            let _ = connection
                .outbound
                .try_send(OutboundFrame::Message(text.to_string()));
            let _ = connection.outbound.try_send(OutboundFrame::Close);
        }
    }

    /// Clears the player association of every active connection. Used after
    /// a game reset, which forgets all player identities.
    pub fn unbind_all(&mut self) {
        for connection in self.active.values_mut() {
            connection.player_id = None;
            connection.player_name = None;
        }
    }

    /// Enqueues a close frame for one connection.
    pub fn close(&mut self, client_id: &str) {
        if let Some(connection) = self.active.get(client_id) {
            let _ = connection.outbound.try_send(OutboundFrame::Close);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        ConnectionRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        mpsc::Sender<OutboundFrame>,
        mpsc::Receiver<OutboundFrame>,
    ) {
        mpsc::channel(8)
    }

    #[test]
    fn registers_with_consecutive_ids() {
        let mut registry = ConnectionRegistry::new();
        let now = Instant::now();
        let (tx, _rx1) = channel();
        assert_eq!(registry.register(tx, now), "c1");
        let (tx, _rx2) = channel();
        assert_eq!(registry.register(tx, now), "c2");
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn binds_players_only_onto_active_connections() {
        let mut registry = ConnectionRegistry::new();
        let now = Instant::now();
        let (tx, _rx) = channel();
        let client_id = registry.register(tx, now);

        registry.bind_player(&client_id, "p1", "A").unwrap();
        assert_eq!(registry.player_of(&client_id), Some("p1".to_string()));

        assert_eq!(
            registry.bind_player("c99", "p2", "B"),
            Err(UnknownClient("c99".to_string()))
        );
    }

    #[test]
    fn mark_disconnected_is_idempotent_and_purge_expires() {
        let mut registry = ConnectionRegistry::new();
        let now = Instant::now();
        let (tx, _rx) = channel();
        let client_id = registry.register(tx, now);

        registry.mark_disconnected(&client_id, now);
        registry.mark_disconnected(&client_id, now);
        assert_eq!(registry.active_count(), 0);

        let grace = Duration::from_secs(60);
        // Still within grace: nothing to purge.
        assert_eq!(registry.purge(now + Duration::from_secs(59), grace), 0);
        let later = now + grace + Duration::from_secs(1);
        assert_eq!(registry.purge(later, grace), 1);
        assert_eq!(registry.purge(later, grace), 0);
    }

    #[test]
    fn reclaim_promotes_a_disconnected_connection() {
        let mut registry = ConnectionRegistry::new();
        let now = Instant::now();
        let (tx, _rx) = channel();
        let client_id = registry.register(tx, now);
        registry.bind_player(&client_id, "p1", "A").unwrap();
        registry.mark_disconnected(&client_id, now);

        let connection = registry.reclaim(&client_id, now).unwrap();
        assert_eq!(connection.player_id.as_deref(), Some("p1"));
        assert_eq!(registry.active_count(), 1);
        assert!(registry.reclaim("c99", now).is_none());
    }

    #[test]
    fn broadcast_reaches_active_connections_only() {
        let mut registry = ConnectionRegistry::new();
        let now = Instant::now();
        let (tx1, mut rx1) = channel();
        let c1 = registry.register(tx1, now);
        let (tx2, mut rx2) = channel();
        let c2 = registry.register(tx2, now);
        registry.mark_disconnected(&c2, now);

        let stalled = registry.broadcast("hello");
        assert!(stalled.is_empty());
        assert_eq!(
            rx1.try_recv().unwrap(),
            OutboundFrame::Message("hello".to_string())
        );
        assert!(rx2.try_recv().is_err());
        let _ = c1;
    }

    #[test]
    fn broadcast_flags_full_queues() {
        let mut registry = ConnectionRegistry::new();
        let now = Instant::now();
        let (tx, _rx) = mpsc::channel(1);
        let client_id = registry.register(tx, now);

        assert!(registry.broadcast("one").is_empty());
        let stalled = registry.broadcast("two");
        assert_eq!(stalled, vec![client_id]);
    }

    #[test]
    fn stale_connections_respect_touch() {
        let mut registry = ConnectionRegistry::new();
        let now = Instant::now();
        let (tx, _rx) = channel();
        let c1 = registry.register(tx, now);
        let (tx, _rx2) = channel();
        let c2 = registry.register(tx, now);

        let max_idle = Duration::from_secs(30);
        let later = now + Duration::from_secs(31);
        registry.touch(&c2, later);

        let stale = registry.stale_connections(later, max_idle);
        assert_eq!(stale, vec![c1]);
    }

    #[test]
    fn shutdown_enqueues_a_farewell_and_a_close() {
        let mut registry = ConnectionRegistry::new();
        let now = Instant::now();
        let (tx, mut rx) = channel();
        registry.register(tx, now);

        registry.shutdown_all("bye");
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundFrame::Message("bye".to_string())
        );
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Close);
    }
}
