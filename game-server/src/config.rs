//! Server configuration from environment variables. Every knob has a
//! default; CLI parsing is intentionally absent. The log level is configured
//! separately through `RUST_LOG` when tracing is initialized.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// When movement results are broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementBroadcast {
    /// The state ticker alone publishes positions.
    Periodic,
    /// Every successful move additionally triggers a broadcast, on top of
    /// the ticker.
    Immediate,
}

/// A rejected environment value. Configuration problems are startup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("environment variable {name} has an invalid value `{value}`")]
pub struct ConfigError {
    pub name: String,
    pub value: String,
}

/// All runtime knobs of the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub broadcast_interval: Duration,
    pub ping_interval: Duration,
    pub purge_interval: Duration,
    pub connection_grace: Duration,
    pub player_grace: Duration,
    pub movement_broadcast: MovementBroadcast,
    /// Path of the RLE-JSON map file. Without one the built-in room is used.
    pub map_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            broadcast_interval: Duration::from_millis(250),
            ping_interval: Duration::from_millis(30_000),
            purge_interval: Duration::from_millis(30_000),
            connection_grace: Duration::from_millis(60_000),
            player_grace: Duration::from_millis(60_000),
            movement_broadcast: MovementBroadcast::Periodic,
            map_path: None,
        }
    }
}

impl ServerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<ServerConfig, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<ServerConfig, ConfigError> {
        let mut config = ServerConfig::default();
        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        if let Some(port) = parse_value("PORT", &lookup)? {
            config.port = port;
        }
        if let Some(millis) = parse_value("BROADCAST_INTERVAL_MS", &lookup)? {
            config.broadcast_interval = Duration::from_millis(millis);
        }
        if let Some(millis) = parse_value("PING_INTERVAL_MS", &lookup)? {
            config.ping_interval = Duration::from_millis(millis);
        }
        if let Some(millis) = parse_value("PURGE_INTERVAL_MS", &lookup)? {
            config.purge_interval = Duration::from_millis(millis);
        }
        if let Some(millis) = parse_value("CONNECTION_GRACE_MS", &lookup)? {
            config.connection_grace = Duration::from_millis(millis);
        }
        if let Some(millis) = parse_value("PLAYER_GRACE_MS", &lookup)? {
            config.player_grace = Duration::from_millis(millis);
        }
        if let Some(mode) = lookup("MOVEMENT_BROADCAST") {
            config.movement_broadcast = match mode.as_str() {
                "periodic" => MovementBroadcast::Periodic,
                "immediate" => MovementBroadcast::Immediate,
                _ => {
                    return Err(ConfigError {
                        name: "MOVEMENT_BROADCAST".to_string(),
                        value: mode,
                    })
                }
            };
        }
        config.map_path = lookup("MAP_PATH").map(PathBuf::from);
        Ok(config)
    }
}

fn parse_value<T: FromStr>(
    name: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    value.parse().map(Some).map_err(|_| ConfigError {
        name: name.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn empty_environment_yields_the_defaults() {
        let config = from_map(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.broadcast_interval, Duration::from_millis(250));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.player_grace, Duration::from_secs(60));
        assert_eq!(config.movement_broadcast, MovementBroadcast::Periodic);
        assert!(config.map_path.is_none());
    }

    #[test]
    fn values_override_the_defaults() {
        let config = from_map(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "4100"),
            ("BROADCAST_INTERVAL_MS", "100"),
            ("MOVEMENT_BROADCAST", "immediate"),
            ("MAP_PATH", "maps/dungeon.json"),
        ])
        .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 4100);
        assert_eq!(config.broadcast_interval, Duration::from_millis(100));
        assert_eq!(config.movement_broadcast, MovementBroadcast::Immediate);
        assert_eq!(config.map_path, Some(PathBuf::from("maps/dungeon.json")));
    }

    #[test]
    fn bad_values_are_startup_errors() {
        let err = from_map(&[("PORT", "not-a-port")]).unwrap_err();
        assert_eq!(err.name, "PORT");

        let err = from_map(&[("MOVEMENT_BROADCAST", "sometimes")]).unwrap_err();
        assert_eq!(err.name, "MOVEMENT_BROADCAST");
    }
}
