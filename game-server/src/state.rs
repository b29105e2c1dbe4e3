//! The process-wide application state: one game, one connection registry,
//! both created at startup and torn down at shutdown. The two mutexes are
//! always taken in the order game, then registry; no lock is held across a
//! transport write.

use crate::config::ServerConfig;
use crate::game::Game;
use crate::registry::ConnectionRegistry;
use tokio::sync::Mutex;

pub struct AppState {
    pub config: ServerConfig,
    pub game: Mutex<Game>,
    pub registry: Mutex<ConnectionRegistry>,
}

impl AppState {
    pub fn new(config: ServerConfig, game: Game) -> AppState {
        AppState {
            config,
            game: Mutex::new(game),
            registry: Mutex::new(ConnectionRegistry::new()),
        }
    }
}
