//! The board model: a fixed-size grid of cells, each with a base tile and an
//! ordered queue of entity references. Also contains the run-length-encoded
//! JSON map format the server ingests at startup.

use crate::game::Entity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// The base character rendered for a wall cell.
pub const WALL_CHAR: char = '#';
/// The base character rendered for an empty floor cell.
pub const FLOOR_CHAR: char = ' ';

/// Board dimensions the server accepts. Maps with any other size are
/// rejected at startup.
pub const ALLOWED_DIMENSIONS: &[(u32, u32)] = &[(60, 25)];

/// An immutable character with an optional 24-bit color tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Glyph {
    pub character: char,
    pub color: Option<u32>,
}

/// The fixed visual content of a cell, ignoring players and entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaseTile {
    #[default]
    Floor,
    Wall,
}

impl BaseTile {
    /// Maps a glyph index of the map format onto a tile.
    pub fn from_index(index: u8) -> Option<BaseTile> {
        match index {
            0 => Some(BaseTile::Floor),
            1 => Some(BaseTile::Wall),
            _ => None,
        }
    }

    /// The glyph index used by the map format.
    pub fn index(&self) -> u8 {
        match self {
            BaseTile::Floor => 0,
            BaseTile::Wall => 1,
        }
    }

    /// The base character of this tile.
    pub fn character(&self) -> char {
        match self {
            BaseTile::Floor => FLOOR_CHAR,
            BaseTile::Wall => WALL_CHAR,
        }
    }
}

/// Everything that can go wrong while loading or mutating the board.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("board dimensions {width}x{height} are not on the allow-list")]
    BadDimensions { width: u32, height: u32 },
    #[error("map cells decode to {actual} tiles, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("unknown glyph index {0} in map cells")]
    UnknownGlyph(u8),
    #[error("run repeat count {0} is below the minimum of 2")]
    BadRepeat(u32),
    #[error("cell ({x}, {y}) already holds a solid entity")]
    EntityConflict { x: i32, y: i32 },
    #[error("position ({x}, {y}) is outside the board")]
    OutOfBounds { x: i32, y: i32 },
    #[error("failed to read map file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse map file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One run of the run-length-encoded cell sequence. `repeat` is omitted for
/// single-tile runs and must be at least 2 when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEntry {
    pub entity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<u32>,
}

/// The static map description consumed at startup: dimensions plus a
/// row-major run-length-encoded sequence of glyph indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardDescription {
    pub width: u32,
    pub height: u32,
    pub cells: Vec<RunEntry>,
}

impl BoardDescription {
    /// Expands the run-length encoding into one tile per cell.
    pub fn decode(&self) -> Result<Vec<BaseTile>, BoardError> {
        let mut tiles = Vec::with_capacity((self.width * self.height) as usize);
        for run in &self.cells {
            let tile = BaseTile::from_index(run.entity).ok_or(BoardError::UnknownGlyph(run.entity))?;
            let count = match run.repeat {
                None => 1,
                Some(repeat) if repeat >= 2 => repeat,
                Some(repeat) => return Err(BoardError::BadRepeat(repeat)),
            };
            for _ in 0..count {
                tiles.push(tile);
            }
        }
        Ok(tiles)
    }

    /// Re-encodes a tile sequence into the canonical run structure.
    pub fn encode(width: u32, height: u32, tiles: &[BaseTile]) -> BoardDescription {
        let mut cells: Vec<RunEntry> = Vec::new();
        for &tile in tiles {
            match cells.last_mut() {
                Some(run) if run.entity == tile.index() => {
                    run.repeat = Some(run.repeat.unwrap_or(1) + 1);
                }
                _ => cells.push(RunEntry {
                    entity: tile.index(),
                    repeat: None,
                }),
            }
        }
        BoardDescription {
            width,
            height,
            cells,
        }
    }

    /// The built-in map used when no map file is configured: a bordered
    /// 60x25 room with an empty interior.
    pub fn default_room() -> BoardDescription {
        let (width, height) = ALLOWED_DIMENSIONS[0];
        let mut tiles = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let border = y == 0 || y == height - 1 || x == 0 || x == width - 1;
                tiles.push(if border { BaseTile::Wall } else { BaseTile::Floor });
            }
        }
        BoardDescription::encode(width, height, &tiles)
    }
}

/// Reads and parses a map file. Dimension validation happens when the board
/// is built from the description.
pub async fn load_description(path: &Path) -> Result<BoardDescription, BoardError> {
    let json_content = tokio::fs::read_to_string(path).await?;
    let description = serde_json::from_str(&json_content)?;
    Ok(description)
}

/// One grid cell: the base tile plus the ordered entity queue. Cells hold
/// entity ids, never entity data; the engine's entity map is the owner.
#[derive(Debug, Clone, Default)]
pub struct Cell {
    pub base: BaseTile,
    pub entity_queue: Vec<String>,
}

/// The 2D grid. Dimensions are immutable after construction.
#[derive(Debug, Clone)]
pub struct Board {
    width: u32,
    height: u32,
    cells: Vec<Cell>,
}

impl Board {
    /// Builds the board from a map description, enforcing the dimension
    /// allow-list and the decoded cell count.
    pub fn from_description(description: &BoardDescription) -> Result<Board, BoardError> {
        if !ALLOWED_DIMENSIONS.contains(&(description.width, description.height)) {
            return Err(BoardError::BadDimensions {
                width: description.width,
                height: description.height,
            });
        }
        let tiles = description.decode()?;
        let expected = (description.width * description.height) as usize;
        if tiles.len() != expected {
            return Err(BoardError::LengthMismatch {
                expected,
                actual: tiles.len(),
            });
        }
        let cells = tiles
            .into_iter()
            .map(|base| Cell {
                base,
                entity_queue: Vec::new(),
            })
            .collect();
        Ok(Board {
            width: description.width,
            height: description.height,
            cells,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Checks if the position lies on the board.
    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }

    fn index(&self, x: i32, y: i32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    fn cell(&self, x: i32, y: i32) -> Option<&Cell> {
        if !self.in_bounds(x, y) {
            return None;
        }
        Some(&self.cells[self.index(x, y)])
    }

    /// The base tile at a position, if it is on the board.
    pub fn tile(&self, x: i32, y: i32) -> Option<BaseTile> {
        self.cell(x, y).map(|cell| cell.base)
    }

    /// The base character at a position, if it is on the board.
    pub fn base_char(&self, x: i32, y: i32) -> Option<char> {
        self.tile(x, y).map(|tile| tile.character())
    }

    /// True iff the base tile at the position is the wall sentinel.
    pub fn is_wall(&self, x: i32, y: i32) -> bool {
        matches!(self.tile(x, y), Some(BaseTile::Wall))
    }

    /// The id of the solid entity occupying the cell, if any. There is at
    /// most one.
    pub fn solid_entity_at<'a>(
        &'a self,
        x: i32,
        y: i32,
        entities: &HashMap<String, Entity>,
    ) -> Option<&'a str> {
        self.cell(x, y)?
            .entity_queue
            .iter()
            .find(|id| entities.get(*id).is_some_and(|entity| entity.solid))
            .map(|id| id.as_str())
    }

    /// The entity with display precedence at the cell: the topmost solid
    /// entity, else the topmost non-solid one. Topmost means highest
    /// `z_order`, with insertion order breaking ties.
    pub fn top_entity_at<'a>(
        &self,
        x: i32,
        y: i32,
        entities: &'a HashMap<String, Entity>,
    ) -> Option<&'a Entity> {
        let queue = &self.cell(x, y)?.entity_queue;
        let present: Vec<&Entity> = queue.iter().filter_map(|id| entities.get(id)).collect();
        let topmost = |solid: bool| {
            present
                .iter()
                .copied()
                .filter(|entity| entity.solid == solid)
                .fold(None::<&Entity>, |best, entity| match best {
                    Some(best) if best.z_order > entity.z_order => Some(best),
                    _ => Some(entity),
                })
        };
        topmost(true).or_else(|| topmost(false))
    }

    /// Pushes an entity reference into the cell queue. Fails when a solid
    /// entity is pushed into a cell that already holds one.
    pub fn push_entity(
        &mut self,
        entity_id: &str,
        x: i32,
        y: i32,
        solid: bool,
        entities: &HashMap<String, Entity>,
    ) -> Result<(), BoardError> {
        if !self.in_bounds(x, y) {
            return Err(BoardError::OutOfBounds { x, y });
        }
        if solid && self.solid_entity_at(x, y, entities).is_some() {
            return Err(BoardError::EntityConflict { x, y });
        }
        let index = self.index(x, y);
        self.cells[index].entity_queue.push(entity_id.to_string());
        Ok(())
    }

    /// Removes an entity reference from the cell queue. Idempotent on
    /// absence and on out-of-bounds positions.
    pub fn remove_entity(&mut self, entity_id: &str, x: i32, y: i32) {
        if !self.in_bounds(x, y) {
            return;
        }
        let index = self.index(x, y);
        self.cells[index].entity_queue.retain(|id| id != entity_id);
    }

    /// The height x width matrix of base characters. Entities and players
    /// never appear here.
    pub fn serialize_grid(&self) -> Vec<Vec<char>> {
        (0..self.height as i32)
            .map(|y| {
                (0..self.width as i32)
                    .map(|x| self.cells[self.index(x, y)].base.character())
                    .collect()
            })
            .collect()
    }
}
