//! Trajectory memory: windowed sampling of stored observation streams.
//!
//! The learned filter trains against fixed-length windows of historical
//! (observation, state, mask) frames. [`TrajectoryMemory`] is the sampling
//! contract the trainer consumes; [`ReplayBuffer`] is a ring-buffer
//! implementation that keeps the most recent frames and samples contiguous,
//! time-aligned windows uniformly at random. Storage and eviction beyond
//! this are the producing driver's concern.

use std::collections::VecDeque;

use rand::Rng;

use crate::error::{FilterError, FilterResult};

/// One sampled training window: `n_window` consecutive timesteps of
/// time-aligned cell-major grids (same index = same timestep).
#[derive(Debug, Clone)]
pub struct TrajectoryWindow {
    /// Observation grids, `n_obs` entries per cell.
    pub observations: Vec<Vec<f32>>,
    /// Ground-truth state grids, `n_state` entries per cell.
    pub states: Vec<Vec<f32>>,
    /// Sensor-coverage masks, one entry per cell (0 or 1).
    pub masks: Vec<Vec<f32>>,
}

impl TrajectoryWindow {
    /// Window length in timesteps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether the window holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// Source of batched training windows.
pub trait TrajectoryMemory {
    /// Samples `n_batch` independent windows of exactly `n_window`
    /// consecutive timesteps each.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InsufficientHistory`] if the memory holds
    /// fewer than `n_window` frames.
    fn sample(&mut self, n_batch: usize, n_window: usize) -> FilterResult<Vec<TrajectoryWindow>>;
}

/// Ring buffer of (observation, state, mask) frames with uniform window
/// sampling.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    capacity: usize,
    observations: VecDeque<Vec<f32>>,
    states: VecDeque<Vec<f32>>,
    masks: VecDeque<Vec<f32>>,
}

impl ReplayBuffer {
    /// Creates a buffer holding at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            observations: VecDeque::with_capacity(capacity),
            states: VecDeque::with_capacity(capacity),
            masks: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends one frame, evicting the oldest when full.
    pub fn push(&mut self, observation: Vec<f32>, state: Vec<f32>, mask: Vec<f32>) {
        if self.observations.len() == self.capacity {
            self.observations.pop_front();
            self.states.pop_front();
            self.masks.pop_front();
        }
        self.observations.push_back(observation);
        self.states.push_back(state);
        self.masks.push_back(mask);
    }

    /// Number of stored frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

impl TrajectoryMemory for ReplayBuffer {
    fn sample(&mut self, n_batch: usize, n_window: usize) -> FilterResult<Vec<TrajectoryWindow>> {
        if n_window == 0 || self.len() < n_window {
            return Err(FilterError::InsufficientHistory {
                required: n_window.max(1),
                available: self.len(),
            });
        }
        let mut rng = rand::rng();
        let max_start = self.len() - n_window;
        let mut windows = Vec::with_capacity(n_batch);
        for _ in 0..n_batch {
            let start = rng.random_range(0..=max_start);
            let slice = |deque: &VecDeque<Vec<f32>>| -> Vec<Vec<f32>> {
                (start..start + n_window).map(|i| deque[i].clone()).collect()
            };
            windows.push(TrajectoryWindow {
                observations: slice(&self.observations),
                states: slice(&self.states),
                masks: slice(&self.masks),
            });
        }
        Ok(windows)
    }
}
