//! The game engine. Owns the board, the players in both lifecycle states,
//! the entities and the score, and exposes the state-mutating operations the
//! server loop routes into. Every operation runs under the engine-wide mutex
//! held by the caller, so the methods themselves are plain synchronous code.

use crate::board::{Board, BoardDescription, BoardError, Glyph};
use crate::events::{BumpKind, GameEvent};
use crate::movement::{validate_move, MoveVerdict};
use protocol::{BoardState, EntityState, PlayerState, StateUpdatePayload};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// One connected or recently disconnected character on the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub player_id: String,
    pub player_name: String,
    /// The owning connection. `None` while the player sits in the
    /// disconnected registry.
    pub client_id: Option<String>,
    pub x: i32,
    pub y: i32,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

/// A non-player object on the board. Owned by the engine; cells reference it
/// by id only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub entity_id: String,
    pub entity_type: String,
    pub x: i32,
    pub y: i32,
    pub solid: bool,
    pub glyph: Glyph,
    pub z_order: i32,
}

/// A player waiting out the grace period.
#[derive(Debug, Clone)]
struct DisconnectedPlayer {
    player: Player,
    disconnected_at: Instant,
}

/// Why a player leaves the active registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// The transport went away; the player may reconnect within grace.
    Disconnect,
    /// An explicit quit; the player is gone for good.
    Quit,
}

/// The two ways a valid move request can end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved { x: i32, y: i32 },
    /// The validator rejected the step; the details travel in the emitted
    /// bump event.
    Blocked,
}

/// Failures of the engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("the game is not running")]
    NotRunning,
    #[error("move delta ({dx}, {dy}) is not a single step")]
    InvalidDelta { dx: i32, dy: i32 },
    #[error("no such player `{0}`")]
    NoSuchPlayer(String),
    #[error("no such entity `{0}`")]
    NoSuchEntity(String),
    #[error("a solid occupant already holds ({x}, {y})")]
    EntityConflict { x: i32, y: i32 },
    #[error("position ({x}, {y}) is outside the board")]
    OutOfBounds { x: i32, y: i32 },
    #[error("no free spawn cell left on the board")]
    NoSpawnCell,
    #[error("the grace period for player `{0}` has expired")]
    GraceExpired(String),
}

impl GameError {
    /// The wire error code reported for this failure.
    pub fn code(&self) -> protocol::ErrorCode {
        use protocol::ErrorCode;
        match self {
            GameError::NotRunning => ErrorCode::GameNotRunning,
            GameError::InvalidDelta { .. } => ErrorCode::InvalidMove,
            GameError::NoSuchPlayer(_) => ErrorCode::NoSuchPlayer,
            GameError::NoSuchEntity(_) => ErrorCode::NoSuchEntity,
            GameError::EntityConflict { .. } => ErrorCode::EntityConflict,
            GameError::OutOfBounds { .. } => ErrorCode::OutOfBounds,
            GameError::NoSpawnCell => ErrorCode::NoSpawnCell,
            GameError::GraceExpired(_) => ErrorCode::GraceExpired,
        }
    }
}

/// The canonical game state.
#[derive(Debug, Clone)]
pub struct Game {
    /// The board as loaded at startup, kept for resets.
    pristine: Board,
    board: Board,
    active_players: HashMap<String, Player>,
    disconnected_players: HashMap<String, DisconnectedPlayer>,
    entities: HashMap<String, Entity>,
    score: i64,
    running: bool,
    next_player_id: u64,
    next_entity_id: u64,
}

impl Game {
    /// Builds the engine from a map description.
    pub fn new(description: &BoardDescription) -> Result<Game, BoardError> {
        let board = Board::from_description(description)?;
        Ok(Game {
            pristine: board.clone(),
            board,
            active_players: HashMap::new(),
            disconnected_players: HashMap::new(),
            entities: HashMap::new(),
            score: 0,
            running: true,
            next_player_id: 1,
            next_entity_id: 1,
        })
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn active_player(&self, player_id: &str) -> Option<&Player> {
        self.active_players.get(player_id)
    }

    /// Whether the player id sits in the disconnected registry, expired or
    /// not. Used by the connect handler to pick the restore path.
    pub fn knows_disconnected_player(&self, player_id: &str) -> bool {
        self.disconnected_players.contains_key(player_id)
    }

    /// The default placement hint: the board center.
    fn spawn_hint(&self) -> (i32, i32) {
        (
            self.board.width() as i32 / 2,
            self.board.height() as i32 / 2,
        )
    }

    /// True when a player may stand on the cell right now.
    fn cell_is_free(&self, x: i32, y: i32) -> bool {
        self.board.in_bounds(x, y)
            && !self.board.is_wall(x, y)
            && self.board.solid_entity_at(x, y, &self.entities).is_none()
            && !self
                .active_players
                .values()
                .any(|player| player.x == x && player.y == y)
    }

    /// Walks the outward square spiral from the hint and returns the first
    /// free cell. Deterministic: the same hint and board state always yield
    /// the same cell.
    fn find_free_cell(&self, hint_x: i32, hint_y: i32) -> Option<(i32, i32)> {
        spiral_order(hint_x, hint_y, self.board.width(), self.board.height())
            .into_iter()
            .find(|&(x, y)| self.cell_is_free(x, y))
    }

    /// Creates a new player at the first free cell around the board center.
    /// Without a requested name the player id doubles as the name.
    pub fn add_player(
        &mut self,
        player_name: Option<String>,
        client_id: &str,
        now: Instant,
    ) -> Result<(Player, Vec<GameEvent>), GameError> {
        let (hint_x, hint_y) = self.spawn_hint();
        let (x, y) = self
            .find_free_cell(hint_x, hint_y)
            .ok_or(GameError::NoSpawnCell)?;

        let player_id = format!("p{}", self.next_player_id);
        self.next_player_id += 1;
        let player_name = player_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| player_id.clone());
        let player = Player {
            player_id: player_id.clone(),
            player_name: player_name.clone(),
            client_id: Some(client_id.to_string()),
            x,
            y,
            connected_at: now,
            last_activity: now,
        };
        self.active_players.insert(player_id.clone(), player.clone());

        let events = vec![GameEvent::PlayerJoined {
            client_id: client_id.to_string(),
            player_id,
            player_name,
            x,
            y,
            is_reconnection: false,
        }];
        Ok((player, events))
    }

    /// Moves a disconnected player back into the active registry under a new
    /// connection. The recorded position is kept when still free; otherwise
    /// the spiral search decides. An expired entry is dropped and reported,
    /// the caller then adds a fresh player instead.
    pub fn restore_player(
        &mut self,
        player_id: &str,
        new_client_id: &str,
        now: Instant,
        grace: Duration,
    ) -> Result<(Player, Vec<GameEvent>), GameError> {
        let (old_x, old_y, expired) = match self.disconnected_players.get(player_id) {
            None => return Err(GameError::NoSuchPlayer(player_id.to_string())),
            Some(entry) => (
                entry.player.x,
                entry.player.y,
                now.duration_since(entry.disconnected_at) > grace,
            ),
        };
        if expired {
            // Same outcome the purge ticker would have produced.
            self.disconnected_players.remove(player_id);
            return Err(GameError::GraceExpired(player_id.to_string()));
        }
        let (x, y) = if self.cell_is_free(old_x, old_y) {
            (old_x, old_y)
        } else {
            self.find_free_cell(old_x, old_y)
                .ok_or(GameError::NoSpawnCell)?
        };

        let Some(entry) = self.disconnected_players.remove(player_id) else {
            return Err(GameError::NoSuchPlayer(player_id.to_string()));
        };
        let mut player = entry.player;
        player.client_id = Some(new_client_id.to_string());
        player.x = x;
        player.y = y;
        player.last_activity = now;
        self.active_players
            .insert(player_id.to_string(), player.clone());

        let events = vec![GameEvent::PlayerJoined {
            client_id: new_client_id.to_string(),
            player_id: player_id.to_string(),
            player_name: player.player_name.clone(),
            x,
            y,
            is_reconnection: true,
        }];
        Ok((player, events))
    }

    /// Takes a player out of the active registry. A disconnect keeps the
    /// player around for the grace period; a quit forgets it immediately.
    pub fn remove_player(
        &mut self,
        player_id: &str,
        reason: RemoveReason,
        now: Instant,
    ) -> Result<Vec<GameEvent>, GameError> {
        let Some(mut player) = self.active_players.remove(player_id) else {
            return Err(GameError::NoSuchPlayer(player_id.to_string()));
        };
        if reason == RemoveReason::Disconnect {
            player.client_id = None;
            self.disconnected_players.insert(
                player_id.to_string(),
                DisconnectedPlayer {
                    player,
                    disconnected_at: now,
                },
            );
        }
        Ok(vec![GameEvent::PlayerLeft {
            player_id: player_id.to_string(),
        }])
    }

    /// Applies a one-step move request. A verdict other than OK leaves the
    /// player in place and yields a targeted bump event.
    pub fn move_player(
        &mut self,
        player_id: &str,
        dx: i32,
        dy: i32,
        now: Instant,
    ) -> Result<(MoveOutcome, Vec<GameEvent>), GameError> {
        if !self.running {
            return Err(GameError::NotRunning);
        }
        if !(-1..=1).contains(&dx) || !(-1..=1).contains(&dy) || (dx == 0 && dy == 0) {
            return Err(GameError::InvalidDelta { dx, dy });
        }
        let Some(player) = self.active_players.get(player_id) else {
            return Err(GameError::NoSuchPlayer(player_id.to_string()));
        };

        let verdict = validate_move(&self.board, &self.entities, &self.active_players, player, dx, dy);
        let (current, attempted) = ((player.x, player.y), (player.x + dx, player.y + dy));
        let client_id = player.client_id.clone();

        let kind = match verdict {
            MoveVerdict::Ok => {
                let player = self
                    .active_players
                    .get_mut(player_id)
                    .ok_or_else(|| GameError::NoSuchPlayer(player_id.to_string()))?;
                player.x = attempted.0;
                player.y = attempted.1;
                player.last_activity = now;
                return Ok((
                    MoveOutcome::Moved {
                        x: attempted.0,
                        y: attempted.1,
                    },
                    Vec::new(),
                ));
            }
            MoveVerdict::OutOfBounds => BumpKind::OutOfBounds,
            MoveVerdict::Wall => BumpKind::Wall,
            MoveVerdict::Entity(other_entity_id) => BumpKind::Entity { other_entity_id },
            MoveVerdict::Player(other_player_id) => BumpKind::Player { other_player_id },
        };

        let mut events = Vec::new();
        if let Some(client_id) = client_id {
            events.push(GameEvent::Bump {
                client_id,
                player_id: player_id.to_string(),
                kind,
                attempted,
                current,
            });
        } else {
            tracing::warn!(player_id, "active player without a connection bumped");
        }
        Ok((MoveOutcome::Blocked, events))
    }

    /// Renames an active player.
    pub fn set_player_name(
        &mut self,
        player_id: &str,
        player_name: &str,
        now: Instant,
    ) -> Result<(), GameError> {
        let Some(player) = self.active_players.get_mut(player_id) else {
            return Err(GameError::NoSuchPlayer(player_id.to_string()));
        };
        player.player_name = player_name.to_string();
        player.last_activity = now;
        Ok(())
    }

    /// Creates an entity and pushes its reference into the target cell.
    pub fn spawn_entity(
        &mut self,
        entity_type: &str,
        x: i32,
        y: i32,
        solid: bool,
        glyph: Glyph,
        z_order: i32,
    ) -> Result<String, GameError> {
        if !self.board.in_bounds(x, y) {
            return Err(GameError::OutOfBounds { x, y });
        }
        if solid {
            // A solid entity may neither share a cell with another solid one
            // nor pin an active player in place.
            if self.board.solid_entity_at(x, y, &self.entities).is_some()
                || self
                    .active_players
                    .values()
                    .any(|player| player.x == x && player.y == y)
            {
                return Err(GameError::EntityConflict { x, y });
            }
        }

        let entity_id = format!("e{}", self.next_entity_id);
        self.next_entity_id += 1;
        match self.board.push_entity(&entity_id, x, y, solid, &self.entities) {
            Ok(()) => {}
            Err(BoardError::EntityConflict { x, y }) => {
                return Err(GameError::EntityConflict { x, y })
            }
            Err(_) => return Err(GameError::OutOfBounds { x, y }),
        }
        self.entities.insert(
            entity_id.clone(),
            Entity {
                entity_id: entity_id.clone(),
                entity_type: entity_type.to_string(),
                x,
                y,
                solid,
                glyph,
                z_order,
            },
        );
        Ok(entity_id)
    }

    /// Removes an entity from the map and from its cell queue. Unknown ids
    /// are reported but treated as a no-op.
    pub fn despawn_entity(&mut self, entity_id: &str) -> Result<(), GameError> {
        let Some(entity) = self.entities.remove(entity_id) else {
            tracing::warn!(entity_id, "despawn of an unknown entity ignored");
            return Err(GameError::NoSuchEntity(entity_id.to_string()));
        };
        self.board.remove_entity(entity_id, entity.x, entity.y);
        Ok(())
    }

    /// A read-only, point-in-time copy of everything a STATE_UPDATE needs.
    /// Players and entities are sorted by id so the wire form is stable.
    pub fn snapshot(&self) -> StateUpdatePayload {
        let mut players: Vec<PlayerState> = self
            .active_players
            .values()
            .map(|player| PlayerState {
                player_id: player.player_id.clone(),
                player_name: player.player_name.clone(),
                client_id: player.client_id.clone(),
                x: player.x,
                y: player.y,
            })
            .collect();
        players.sort_by(|a, b| a.player_id.cmp(&b.player_id));

        let mut entities: Vec<EntityState> = self
            .entities
            .values()
            .map(|entity| EntityState {
                entity_id: entity.entity_id.clone(),
                entity_type: entity.entity_type.clone(),
                x: entity.x,
                y: entity.y,
                solid: entity.solid,
                glyph: entity.glyph.character,
                color: entity.glyph.color,
                z_order: entity.z_order,
            })
            .collect();
        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        StateUpdatePayload {
            board: BoardState {
                width: self.board.width(),
                height: self.board.height(),
                grid: self.board.serialize_grid(),
            },
            players,
            entities,
            score: self.score,
            running: self.running,
        }
    }

    /// Drops disconnected players whose grace period has run out. Idempotent
    /// for a fixed `(now, grace)`.
    pub fn purge_expired(&mut self, now: Instant, grace: Duration) -> usize {
        let before = self.disconnected_players.len();
        self.disconnected_players
            .retain(|_, entry| now.duration_since(entry.disconnected_at) <= grace);
        let removed = before - self.disconnected_players.len();
        if removed > 0 {
            tracing::info!(removed, "purged expired disconnected players");
        }
        removed
    }

    /// Rebuilds the board from the startup description and forgets every
    /// player and entity. The caller broadcasts the resulting state.
    pub fn reset(&mut self) {
        self.board = self.pristine.clone();
        self.active_players.clear();
        self.disconnected_players.clear();
        self.entities.clear();
        self.score = 0;
        self.running = true;
    }
}

/// Enumerates cells in the outward square-spiral order starting at the hint:
/// right, down, left x2, up x2, right x3, and so on. Off-board positions are
/// skipped but the walk continues until the spiral has covered the board.
fn spiral_order(hint_x: i32, hint_y: i32, width: u32, height: u32) -> Vec<(i32, i32)> {
    const DIRECTIONS: [(i32, i32); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];
    let limit = 2 * width.max(height) as i32 + 1;
    let mut cells = Vec::new();
    let (mut x, mut y) = (hint_x, hint_y);
    let mut visit = |x: i32, y: i32, cells: &mut Vec<(i32, i32)>| {
        if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
            cells.push((x, y));
        }
    };
    visit(x, y, &mut cells);

    let mut direction = 0;
    let mut leg = 1;
    while leg <= limit {
        for _ in 0..2 {
            let (dx, dy) = DIRECTIONS[direction];
            for _ in 0..leg {
                x += dx;
                y += dy;
                visit(x, y, &mut cells);
            }
            direction = (direction + 1) % 4;
        }
        leg += 1;
    }
    cells
}
