//! Board rules for a single player: occupancy, shots taken, remaining ship cells.
//!
//! Everything here is synchronous and owned by the match event loop, so there
//! is no locking. Snapshots for the wire are produced per viewer so a player
//! never learns where the opponent's untouched ships are.

use shared::{CellView, PlayerId, PlayerSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Empty,
    Ship,
    /// Ship cell that has been hit.
    Hit,
    /// Empty cell that has been fired at.
    Miss,
}

/// Result of a shot at one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shot {
    Hit,
    Miss,
    /// The cell was already resolved; the shot is wasted.
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("ship does not fit on the board")]
    OutOfBounds,
    #[error("ship overlaps another ship")]
    Overlaps,
    #[error("ship has no length")]
    Empty,
}

/// Square grid indexed `cells[y][x]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    size: u8,
    cells: Vec<Vec<Cell>>,
}

impl Board {
    pub fn new(size: u8) -> Self {
        Self {
            size,
            cells: vec![vec![Cell::Empty; size as usize]; size as usize],
        }
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn in_bounds(&self, x: u8, y: u8) -> bool {
        x < self.size && y < self.size
    }

    pub fn cell(&self, x: u8, y: u8) -> Option<Cell> {
        self.cells
            .get(y as usize)
            .and_then(|row| row.get(x as usize))
            .copied()
    }

    /// Places a ship of `length` cells starting at (`x`, `y`).
    pub fn place_ship(
        &mut self,
        x: u8,
        y: u8,
        length: u8,
        orientation: Orientation,
    ) -> Result<(), PlacementError> {
        if length == 0 {
            return Err(PlacementError::Empty);
        }
        let cells: Vec<(usize, usize)> = (0..length as usize)
            .map(|i| match orientation {
                Orientation::Horizontal => (x as usize + i, y as usize),
                Orientation::Vertical => (x as usize, y as usize + i),
            })
            .collect();

        let size = self.size as usize;
        if cells.iter().any(|&(cx, cy)| cx >= size || cy >= size) {
            return Err(PlacementError::OutOfBounds);
        }
        if cells.iter().any(|&(cx, cy)| self.cells[cy][cx] != Cell::Empty) {
            return Err(PlacementError::Overlaps);
        }
        for (cx, cy) in cells {
            self.cells[cy][cx] = Cell::Ship;
        }
        Ok(())
    }

    /// Number of ship cells not yet hit.
    pub fn ship_cells(&self) -> u32 {
        let count = self
            .cells
            .iter()
            .flatten()
            .filter(|&&cell| cell == Cell::Ship)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Resolves a shot. Callers check bounds first; an out-of-range cell is a
    /// wasted shot.
    pub fn fire(&mut self, x: u8, y: u8) -> Shot {
        let Some(cell) = self
            .cells
            .get_mut(y as usize)
            .and_then(|row| row.get_mut(x as usize))
        else {
            return Shot::Repeat;
        };
        match *cell {
            Cell::Ship => {
                *cell = Cell::Hit;
                Shot::Hit
            }
            Cell::Empty => {
                *cell = Cell::Miss;
                Shot::Miss
            }
            Cell::Hit | Cell::Miss => Shot::Repeat,
        }
    }

    /// Board as seen by its owner, or by the opponent when `reveal_ships` is
    /// false.
    pub fn view(&self, reveal_ships: bool) -> Vec<Vec<CellView>> {
        self.cells
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| match (cell, reveal_ships) {
                        (Cell::Hit, _) => CellView::Hit,
                        (Cell::Miss, _) => CellView::Miss,
                        (Cell::Ship, true) => CellView::Ship,
                        (Cell::Empty, true) => CellView::Empty,
                        (Cell::Ship | Cell::Empty, false) => CellView::Unknown,
                    })
                    .collect()
            })
            .collect()
    }
}

/// Game-facing state of one seated player.
#[derive(Debug, Clone)]
pub struct PlayerModel {
    pub id: PlayerId,
    pub name: String,
    pub board: Board,
    remaining: u32,
}

impl PlayerModel {
    pub fn new(id: PlayerId, name: impl Into<String>, board: Board) -> Self {
        let remaining = board.ship_cells();
        Self {
            id,
            name: name.into(),
            board,
            remaining,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_dead(&self) -> bool {
        self.remaining == 0
    }

    /// Applies an incoming shot and keeps the remaining counter in step.
    pub fn receive_fire(&mut self, x: u8, y: u8) -> Shot {
        let shot = self.board.fire(x, y);
        if shot == Shot::Hit {
            self.remaining = self.remaining.saturating_sub(1);
        }
        shot
    }

    pub fn snapshot(&self, viewer: &PlayerId) -> PlayerSnapshot {
        PlayerSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            remaining: self.remaining,
            board: self.board.view(&self.id == viewer),
        }
    }
}
