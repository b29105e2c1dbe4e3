//! The movement validator: a pure function over the board, the entities and
//! the active players. The engine consults it for every move request.

use crate::board::Board;
use crate::game::{Entity, Player};
use std::collections::HashMap;

/// The result of validating one single-step move. Checks run in a fixed
/// order: bounds, wall, solid entity, other active player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveVerdict {
    Ok,
    OutOfBounds,
    Wall,
    Entity(String),
    Player(String),
}

/// Decides whether `player` may step by `(dx, dy)`. The player's own cell is
/// excluded from the other-player check, so only other occupants block.
pub fn validate_move(
    board: &Board,
    entities: &HashMap<String, Entity>,
    players: &HashMap<String, Player>,
    player: &Player,
    dx: i32,
    dy: i32,
) -> MoveVerdict {
    let (nx, ny) = (player.x + dx, player.y + dy);
    if !board.in_bounds(nx, ny) {
        return MoveVerdict::OutOfBounds;
    }
    if board.is_wall(nx, ny) {
        return MoveVerdict::Wall;
    }
    if let Some(entity_id) = board.solid_entity_at(nx, ny, entities) {
        return MoveVerdict::Entity(entity_id.to_string());
    }
    if let Some(other) = players
        .values()
        .find(|other| other.player_id != player.player_id && other.x == nx && other.y == ny)
    {
        return MoveVerdict::Player(other.player_id.clone());
    }
    MoveVerdict::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{BoardDescription, Glyph};
    use std::time::Instant;

    fn player(id: &str, x: i32, y: i32) -> Player {
        let now = Instant::now();
        Player {
            player_id: id.to_string(),
            player_name: id.to_string(),
            client_id: Some(format!("c-{id}")),
            x,
            y,
            connected_at: now,
            last_activity: now,
        }
    }

    fn fixture() -> (Board, HashMap<String, Entity>, HashMap<String, Player>) {
        let mut board = Board::from_description(&BoardDescription::default_room()).unwrap();
        let mut entities = HashMap::new();
        entities.insert(
            "e1".to_string(),
            Entity {
                entity_id: "e1".to_string(),
                entity_type: "boulder".to_string(),
                x: 10,
                y: 10,
                solid: true,
                glyph: Glyph {
                    character: 'O',
                    color: None,
                },
                z_order: 0,
            },
        );
        board.push_entity("e1", 10, 10, true, &entities).unwrap();

        let mut players = HashMap::new();
        players.insert("p1".to_string(), player("p1", 5, 5));
        players.insert("p2".to_string(), player("p2", 6, 5));
        (board, entities, players)
    }

    #[test]
    fn open_floor_is_ok() {
        let (board, entities, players) = fixture();
        let verdict = validate_move(&board, &entities, &players, &players["p1"], 0, 1);
        assert_eq!(verdict, MoveVerdict::Ok);
    }

    #[test]
    fn walls_block() {
        let (board, entities, players) = fixture();
        let mover = player("p3", 1, 1);
        let verdict = validate_move(&board, &entities, &players, &mover, -1, 0);
        assert_eq!(verdict, MoveVerdict::Wall);
    }

    #[test]
    fn board_edges_are_out_of_bounds() {
        let (board, entities, players) = fixture();
        for (x, y, dx, dy) in [(0, 5, -1, 0), (59, 5, 1, 0), (5, 0, 0, -1), (5, 24, 0, 1)] {
            let mover = player("p9", x, y);
            let verdict = validate_move(&board, &entities, &players, &mover, dx, dy);
            assert_eq!(verdict, MoveVerdict::OutOfBounds, "from ({x}, {y})");
        }
    }

    #[test]
    fn solid_entities_block_and_name_the_blocker() {
        let (board, entities, players) = fixture();
        let mover = player("p3", 9, 10);
        let verdict = validate_move(&board, &entities, &players, &mover, 1, 0);
        assert_eq!(verdict, MoveVerdict::Entity("e1".to_string()));
    }

    #[test]
    fn other_players_block_and_name_the_blocker() {
        let (board, entities, players) = fixture();
        let verdict = validate_move(&board, &entities, &players, &players["p1"], 1, 0);
        assert_eq!(verdict, MoveVerdict::Player("p2".to_string()));
    }

    #[test]
    fn wall_outranks_an_entity_on_the_same_cell() {
        // An entity sitting on a wall cell must still report the wall,
        // because the checks run bounds -> wall -> entity -> player.
        let (mut board, mut entities, players) = fixture();
        entities.insert(
            "e2".to_string(),
            Entity {
                entity_id: "e2".to_string(),
                entity_type: "boulder".to_string(),
                x: 0,
                y: 5,
                solid: true,
                glyph: Glyph {
                    character: 'O',
                    color: None,
                },
                z_order: 0,
            },
        );
        board.push_entity("e2", 0, 5, true, &entities).unwrap();
        let mover = player("p3", 1, 5);
        let verdict = validate_move(&board, &entities, &players, &mover, -1, 0);
        assert_eq!(verdict, MoveVerdict::Wall);
    }
}
