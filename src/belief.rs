//! The per-cell categorical belief over hidden states.
//!
//! A [`BeliefGrid`] holds one categorical distribution per grid cell, stored
//! cell-major: `data[cell * n_state + s]` with `cell = y * width + x`. Every
//! update the filters perform must leave each cell non-negative and summing
//! to one within a small tolerance; [`BeliefGrid::is_normalized`] checks the
//! invariant and is used heavily in tests.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, FilterResult};

/// Tolerance used when checking the per-cell distribution invariant.
pub const NORMALIZATION_TOLERANCE: f32 = 1e-5;

/// A grid of per-cell categorical distributions over hidden states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefGrid {
    width: usize,
    height: usize,
    n_state: usize,
    data: Vec<f32>,
}

impl BeliefGrid {
    /// Creates a grid with the uniform distribution at every cell.
    #[must_use]
    pub fn uniform(width: usize, height: usize, n_state: usize) -> Self {
        let p = 1.0 / n_state as f32;
        Self {
            width,
            height,
            n_state,
            data: vec![p; width * height * n_state],
        }
    }

    /// Creates a grid with an independent random distribution at every cell,
    /// drawn as the softmax of uniform noise.
    #[must_use]
    pub fn random(width: usize, height: usize, n_state: usize) -> Self {
        let mut rng = rand::rng();
        let mut data = vec![0.0_f32; width * height * n_state];
        for cell in data.chunks_mut(n_state) {
            let mut sum = 0.0;
            for p in cell.iter_mut() {
                *p = rng.random::<f32>().exp();
                sum += *p;
            }
            for p in cell.iter_mut() {
                *p /= sum;
            }
        }
        Self {
            width,
            height,
            n_state,
            data,
        }
    }

    /// Wraps an existing cell-major buffer.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::ShapeMismatch`] if the buffer length is not
    /// `width * height * n_state`.
    pub fn from_data(
        width: usize,
        height: usize,
        n_state: usize,
        data: Vec<f32>,
    ) -> FilterResult<Self> {
        let expected = width * height * n_state;
        if data.len() != expected {
            return Err(FilterError::shape("belief data", expected, data.len()));
        }
        Ok(Self {
            width,
            height,
            n_state,
            data,
        })
    }

    /// Grid width in cells.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Grid height in cells.
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of hidden-state classes per cell.
    #[must_use]
    pub fn n_state(&self) -> usize {
        self.n_state
    }

    /// Total number of cells.
    #[must_use]
    pub fn cells(&self) -> usize {
        self.width * self.height
    }

    /// The distribution at a cell index (`cell = y * width + x`).
    #[must_use]
    pub fn cell(&self, cell: usize) -> &[f32] {
        &self.data[cell * self.n_state..(cell + 1) * self.n_state]
    }

    /// Mutable access to the distribution at a cell index.
    pub fn cell_mut(&mut self, cell: usize) -> &mut [f32] {
        &mut self.data[cell * self.n_state..(cell + 1) * self.n_state]
    }

    /// The full cell-major buffer.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the full cell-major buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Checks the distribution invariant: every cell non-negative and
    /// summing to one within `tolerance`.
    #[must_use]
    pub fn is_normalized(&self, tolerance: f32) -> bool {
        self.data.chunks(self.n_state).all(|cell| {
            let sum: f32 = cell.iter().sum();
            (sum - 1.0).abs() <= tolerance && cell.iter().all(|&p| p >= -tolerance)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_grid_is_normalized() {
        let grid = BeliefGrid::uniform(4, 4, 3);
        assert_eq!(grid.cells(), 16);
        assert!(grid.is_normalized(NORMALIZATION_TOLERANCE));
        for cell in 0..grid.cells() {
            for &p in grid.cell(cell) {
                assert!((p - 1.0 / 3.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_random_grid_is_normalized() {
        let grid = BeliefGrid::random(7, 5, 4);
        assert!(grid.is_normalized(NORMALIZATION_TOLERANCE));
    }

    #[test]
    fn test_from_data_rejects_wrong_length() {
        assert!(BeliefGrid::from_data(4, 4, 3, vec![0.0; 10]).is_err());
        assert!(BeliefGrid::from_data(2, 2, 3, vec![1.0 / 3.0; 12]).is_ok());
    }

    #[test]
    fn test_is_normalized_detects_violation() {
        let mut grid = BeliefGrid::uniform(2, 2, 3);
        grid.cell_mut(1)[0] = 0.9;
        assert!(!grid.is_normalized(NORMALIZATION_TOLERANCE));
    }

    #[test]
    fn test_cell_indexing() {
        let mut grid = BeliefGrid::uniform(3, 2, 2);
        grid.cell_mut(4).copy_from_slice(&[0.25, 0.75]);
        assert_eq!(grid.cell(4), &[0.25, 0.75]);
        // Other cells untouched.
        assert_eq!(grid.cell(3), &[0.5, 0.5]);
    }
}
