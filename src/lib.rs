//! # grid-belief-filter-rs
//!
//! Recursive Bayesian belief filtering over 2-D grids, with a fixed-diffusion
//! transition model and a learned encoder/GRU/decoder transition model.
//!
//! ## Overview
//!
//! A spatial process (fire spread, contamination, crowd occupancy) evolves
//! over a `width x height` grid of cells, each in one of `n_state` discrete
//! hidden states. A sensor sweeps the grid and reports, for a masked subset
//! of cells, a noisy per-cell observation with `n_obs` channels. The filters
//! maintain one categorical distribution per cell and update it recursively:
//!
//! ```text
//!              observation y_k, mask m_k
//!                        │
//!                        ▼
//!     prior u_k ──▶ likelihood fusion ──▶ posterior (sensed cells)
//!                        │
//!                        ▼
//!               transition model ──▶ next prior u_{k+1}
//! ```
//!
//! Both filters share the fusion step (Bayes' rule per cell, with a
//! keep-prior policy for degenerate normalizers). They differ in the
//! transition:
//!
//! - [`FixedBayesianFilter`](fixed::FixedBayesianFilter) convolves the
//!   posterior with a hand-specified 3x3 [`TransitionKernel`](fixed::TransitionKernel)
//!   and renormalizes. No learnable parameters.
//! - [`LearnedDynamicsFilter`](dynamics::LearnedDynamicsFilter) summarizes
//!   the observation with a convolutional encoder, advances a GRU hidden
//!   state, and decodes the next prior with a transposed convolution. It
//!   trains online from a [`TrajectoryMemory`](memory::TrajectoryMemory) by
//!   masked one-step-ahead prediction of future observations; no ground
//!   truth is required.
//!
//! ## Quick start
//!
//! ```rust
//! use grid_belief_filter_rs::config::GridConfig;
//! use grid_belief_filter_rs::fixed::{FixedBayesianFilter, TransitionKernel};
//! use grid_belief_filter_rs::observation::ObservationMatrix;
//!
//! # fn main() -> Result<(), grid_belief_filter_rs::error::FilterError> {
//! let grid = GridConfig::new(8, 8, 3, 3);
//! let observation = ObservationMatrix::identity(3);
//! let kernel = TransitionKernel::diffusion(3, 0.9)?;
//! let mut filter = FixedBayesianFilter::new(&grid, observation, kernel)?;
//!
//! // One sweep: one-hot observations for every cell.
//! let mut obs = vec![0.0_f32; grid.cells() * grid.n_obs];
//! for cell in obs.chunks_mut(grid.n_obs) {
//!     cell[0] = 1.0;
//! }
//! let belief = filter.bayesian_update(&obs)?;
//! assert!(belief.is_normalized(1e-5));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`] - Grid, architecture, and training configuration
//! - [`error`] - Error types for contract violations
//! - [`belief`] - Per-cell categorical belief grids
//! - [`observation`] - State-to-observation confusion matrices
//! - [`fixed`] - Fixed-diffusion Bayesian filter
//! - [`dynamics`] - Learned encoder/GRU/decoder filter and its trainer
//! - [`gru`] - Gated recurrent unit with hand-rolled backpropagation
//! - [`optimizer`] - Adam over flat parameter slices
//! - [`memory`] - Trajectory replay and windowed sampling
//! - [`checkpoint`] - Serializable parameter sets

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]
// Precision-loss casts are routine in this numerical code.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_range_loop)]

// Core types
pub mod belief;
pub mod config;
pub mod error;
pub mod observation;

// Filters
pub mod dynamics;
pub mod fixed;

// Learned-filter machinery
pub mod gru;
pub mod memory;
pub mod optimizer;

// Parameter save/restore
pub mod checkpoint;

// Shared internals
mod fusion;
mod nn;

// Re-exports for convenient access
pub use belief::BeliefGrid;
pub use checkpoint::ParameterSet;
pub use config::{DynamicsConfig, GridConfig, TrainingConfig};
pub use dynamics::{LearnedDynamicsFilter, RecurrentState, TrainingLosses};
pub use error::{FilterError, FilterResult};
pub use fixed::{FixedBayesianFilter, TransitionKernel};
pub use fusion::EPS;
pub use memory::{ReplayBuffer, TrajectoryMemory, TrajectoryWindow};
pub use observation::ObservationMatrix;
