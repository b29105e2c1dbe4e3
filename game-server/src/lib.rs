//! The authoritative server for the grid exploration game. Owns the
//! canonical board, players and entities, validates every move, broadcasts
//! periodic state snapshots over WebSocket and tolerates transient client
//! disconnects through a bounded grace period.

pub mod board;
pub mod config;
pub mod connection;
pub mod events;
pub mod game;
pub mod handlers;
pub mod movement;
pub mod registry;
pub mod state;
pub mod tickers;
