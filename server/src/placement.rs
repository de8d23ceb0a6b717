//! Fleet layout for new players.
//!
//! The match engine only needs a filled [`Board`]; how the ships end up on it
//! is pluggable. [`RandomPlacement`] is used in production, [`FixedLayout`]
//! gives tests a board they can aim at.

use crate::board::{Board, Orientation, PlacementError};
use rand::Rng;

pub trait Placement: Send + Sync {
    fn place(&self, size: u8, fleet: &[u8]) -> Result<Board, PlacementError>;
}

/// Random non-overlapping placement, retrying each ship a bounded number of times.
#[derive(Debug, Clone, Copy)]
pub struct RandomPlacement {
    pub attempts: usize,
}

impl Default for RandomPlacement {
    fn default() -> Self {
        Self { attempts: 200 }
    }
}

impl Placement for RandomPlacement {
    fn place(&self, size: u8, fleet: &[u8]) -> Result<Board, PlacementError> {
        let mut rng = rand::thread_rng();
        let mut board = Board::new(size);

        for &length in fleet {
            if length == 0 {
                return Err(PlacementError::Empty);
            }
            if length > size {
                return Err(PlacementError::OutOfBounds);
            }

            let mut placed = false;
            for _ in 0..self.attempts {
                let orientation = if rng.gen::<bool>() {
                    Orientation::Horizontal
                } else {
                    Orientation::Vertical
                };
                let (max_x, max_y) = match orientation {
                    Orientation::Horizontal => (size - length, size - 1),
                    Orientation::Vertical => (size - 1, size - length),
                };
                let x = rng.gen_range(0..=max_x);
                let y = rng.gen_range(0..=max_y);
                if board.place_ship(x, y, length, orientation).is_ok() {
                    placed = true;
                    break;
                }
            }
            if !placed {
                return Err(PlacementError::Overlaps);
            }
        }

        Ok(board)
    }
}

/// Ships laid out in fixed rows, one ship per row starting at column 0.
///
/// Ship `i` occupies row `i * 2` so that the cells are easy to hit from a test.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLayout;

impl Placement for FixedLayout {
    fn place(&self, size: u8, fleet: &[u8]) -> Result<Board, PlacementError> {
        let mut board = Board::new(size);
        for (i, &length) in fleet.iter().enumerate() {
            let row = u8::try_from(i * 2).map_err(|_| PlacementError::OutOfBounds)?;
            board.place_ship(0, row, length, Orientation::Horizontal)?;
        }
        Ok(board)
    }
}
