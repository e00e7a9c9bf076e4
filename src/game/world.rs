use std::fmt::{Display, Formatter};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::messaging::peer::Peer;

/// Quadrants of the playing grid, split along the half lines.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GridArea {
    /// north-west
    Green,
    /// north-east
    Red,
    /// south-west
    Blue,
    /// south-east
    Yellow,
}

impl GridArea {
    pub fn from_index(index: usize) -> GridArea {
        match index % 4 {
            0 => GridArea::Green,
            1 => GridArea::Red,
            2 => GridArea::Blue,
            _ => GridArea::Yellow,
        }
    }
}

/// One cell on the square grid. Moves wrap around at the edges, so the world is a torus.
///
/// Two positions are equal when their coordinates match; the grid length is carried along
///  for the wrap-around arithmetic but all members of one game share it anyway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub x: u32,
    pub y: u32,
    pub grid: u32,
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}
impl Eq for Position {}

impl Position {
    pub fn new(grid: u32) -> Position {
        Position { x: 0, y: 0, grid }
    }

    pub fn randomize(&mut self) {
        let mut rng = rand::thread_rng();
        self.x = rng.gen_range(0..self.grid);
        self.y = rng.gen_range(0..self.grid);
    }

    pub fn area(&self) -> GridArea {
        let half = self.grid / 2;
        match (self.x < half, self.y < half) {
            (true, true) => GridArea::Green,
            (false, true) => GridArea::Red,
            (true, false) => GridArea::Blue,
            (false, false) => GridArea::Yellow,
        }
    }

    pub fn apply(&mut self, direction: Direction) {
        match direction {
            Direction::Up => self.y = if self.y > 0 { self.y - 1 } else { self.grid - 1 },
            Direction::Down => self.y = (self.y + 1) % self.grid,
            Direction::Left => self.x = if self.x > 0 { self.x - 1 } else { self.grid - 1 },
            Direction::Right => self.x = (self.x + 1) % self.grid,
        }
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, {} ({:?} area)", self.x, self.y, self.area())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// One game instance as the registry and the peers know it. `score` is the target score
///  that ends the game; `users` is the membership list, which a peer's local copy never
///  includes itself in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameInfo {
    pub name: String,
    pub grid: u32,
    pub score: u32,
    #[serde(default)]
    pub users: Vec<Peer>,
}

impl GameInfo {
    pub fn new(name: impl Into<String>, grid: u32, score: u32) -> GameInfo {
        GameInfo {
            name: name.into(),
            grid,
            score,
            users: Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 0, GridArea::Green)]
    #[case(9, 0, GridArea::Red)]
    #[case(0, 9, GridArea::Blue)]
    #[case(9, 9, GridArea::Yellow)]
    #[case(4, 4, GridArea::Green)]
    #[case(5, 4, GridArea::Red)]
    #[case(4, 5, GridArea::Blue)]
    #[case(5, 5, GridArea::Yellow)]
    fn test_area_quadrants(#[case] x: u32, #[case] y: u32, #[case] expected: GridArea) {
        let position = Position { x, y, grid: 10 };
        assert_eq!(position.area(), expected);
    }

    #[rstest]
    #[case(Direction::Up, 0, 0, 0, 9)]
    #[case(Direction::Down, 0, 9, 0, 0)]
    #[case(Direction::Left, 0, 0, 9, 0)]
    #[case(Direction::Right, 9, 0, 0, 0)]
    fn test_moves_wrap_at_the_edges(
        #[case] direction: Direction,
        #[case] x: u32,
        #[case] y: u32,
        #[case] expected_x: u32,
        #[case] expected_y: u32,
    ) {
        let mut position = Position { x, y, grid: 10 };
        position.apply(direction);
        assert_eq!(position, Position { x: expected_x, y: expected_y, grid: 10 });
    }

    #[rstest]
    fn test_equality_ignores_grid() {
        assert_eq!(Position { x: 1, y: 2, grid: 10 }, Position { x: 1, y: 2, grid: 20 });
        assert_ne!(Position { x: 1, y: 2, grid: 10 }, Position { x: 2, y: 1, grid: 10 });
    }

    #[rstest]
    fn test_randomize_stays_on_the_grid() {
        let mut position = Position::new(4);
        for _ in 0..100 {
            position.randomize();
            assert!(position.x < 4 && position.y < 4);
        }
    }
}
