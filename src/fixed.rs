//! The fixed-transition Bayesian filter.
//!
//! [`FixedBayesianFilter`] fuses each observation into its belief with the
//! shared likelihood-fusion step, then models state evolution with a fixed
//! spatially local linear operator: a hand-specified `n_state -> n_state`
//! 3x3 convolution applied with stride 1 and zero padding, so mass spreads
//! to the 8-neighborhood (and, if the kernel says so, across state
//! channels). After the transition each cell is renormalized across state
//! channels to restore a valid distribution.
//!
//! The transition weights are constants supplied at construction via
//! [`TransitionKernel`]; nothing here is learned.

use serde::{Deserialize, Serialize};

use crate::belief::BeliefGrid;
use crate::config::GridConfig;
use crate::error::{FilterError, FilterResult};
use crate::fusion::{fuse_grid, EPS};
use crate::nn::{cells_to_planes, conv2d_forward, planes_to_cells, ConvShape};
use crate::observation::ObservationMatrix;

/// Kernel side length of the fixed transition operator.
pub const TRANSITION_KERNEL_SIZE: usize = 3;

/// Fixed transition weights: an `[n_state, n_state, 3, 3]` convolution
/// kernel with zero bias.
///
/// Kernels are expected to be non-negative; the update does not clamp
/// negative intermediate values before renormalizing, so a kernel with
/// negative taps can drive per-cell values outside `[0, 1]`. The provided
/// constructors only build non-negative kernels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionKernel {
    n_state: usize,
    /// Row-major `[out_state, in_state, ky, kx]`.
    weights: Vec<f32>,
}

impl TransitionKernel {
    /// Wraps externally supplied kernel weights.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::ShapeMismatch`] if `weights` is not
    /// `n_state * n_state * 9` long, or [`FilterError::InvalidConfig`] if
    /// any weight is non-finite.
    pub fn from_weights(n_state: usize, weights: Vec<f32>) -> FilterResult<Self> {
        let k2 = TRANSITION_KERNEL_SIZE * TRANSITION_KERNEL_SIZE;
        let expected = n_state * n_state * k2;
        if weights.len() != expected {
            return Err(FilterError::shape("transition kernel", expected, weights.len()));
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(FilterError::InvalidConfig(
                "transition kernel weights must be finite".into(),
            ));
        }
        Ok(Self { n_state, weights })
    }

    /// The identity transition: each state channel keeps its own center tap,
    /// no spatial or cross-channel mixing. Useful for testing pure fusion.
    #[must_use]
    pub fn identity(n_state: usize) -> Self {
        let k2 = TRANSITION_KERNEL_SIZE * TRANSITION_KERNEL_SIZE;
        let mut weights = vec![0.0_f32; n_state * n_state * k2];
        for s in 0..n_state {
            // Center tap of the (s, s) kernel.
            weights[(s * n_state + s) * k2 + 4] = 1.0;
        }
        Self { n_state, weights }
    }

    /// A same-channel local diffusion: each state keeps `retain` of its own
    /// mass in place and spreads `1 - retain` evenly over the 8-neighborhood.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidConfig`] unless `0 < retain <= 1`.
    pub fn diffusion(n_state: usize, retain: f32) -> FilterResult<Self> {
        if !(retain > 0.0 && retain <= 1.0) {
            return Err(FilterError::InvalidConfig(format!(
                "diffusion retain must lie in (0, 1], got {retain}"
            )));
        }
        let k2 = TRANSITION_KERNEL_SIZE * TRANSITION_KERNEL_SIZE;
        let spread = (1.0 - retain) / 8.0;
        let mut weights = vec![0.0_f32; n_state * n_state * k2];
        for s in 0..n_state {
            let base = (s * n_state + s) * k2;
            for tap in 0..k2 {
                weights[base + tap] = if tap == 4 { retain } else { spread };
            }
        }
        Ok(Self { n_state, weights })
    }

    /// Number of state channels.
    #[must_use]
    pub fn n_state(&self) -> usize {
        self.n_state
    }

    /// The raw kernel weights, `[out_state, in_state, ky, kx]` row-major.
    #[must_use]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }
}

/// Recursive Bayesian filter with a fixed diffusion transition.
#[derive(Debug, Clone)]
pub struct FixedBayesianFilter {
    width: usize,
    height: usize,
    n_state: usize,
    n_obs: usize,
    observation: ObservationMatrix,
    kernel: TransitionKernel,
    belief: BeliefGrid,
    /// Scratch buffers reused across updates.
    likelihood: Vec<f32>,
    fused: Vec<f32>,
}

impl FixedBayesianFilter {
    /// Creates a filter with a uniform initial belief.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidConfig`] if the grid configuration is
    /// invalid or the observation matrix / kernel arities disagree with it.
    pub fn new(
        grid: &GridConfig,
        observation: ObservationMatrix,
        kernel: TransitionKernel,
    ) -> FilterResult<Self> {
        grid.validate()?;
        if observation.n_state() != grid.n_state || observation.n_obs() != grid.n_obs {
            return Err(FilterError::InvalidConfig(format!(
                "observation matrix is {}x{}, grid expects {}x{}",
                observation.n_state(),
                observation.n_obs(),
                grid.n_state,
                grid.n_obs
            )));
        }
        if kernel.n_state() != grid.n_state {
            return Err(FilterError::InvalidConfig(format!(
                "transition kernel has {} state channels, grid expects {}",
                kernel.n_state(),
                grid.n_state
            )));
        }
        let cells = grid.cells();
        Ok(Self {
            width: grid.width,
            height: grid.height,
            n_state: grid.n_state,
            n_obs: grid.n_obs,
            observation,
            kernel,
            belief: BeliefGrid::uniform(grid.width, grid.height, grid.n_state),
            likelihood: vec![0.0; cells * grid.n_state],
            fused: vec![0.0; cells * grid.n_state],
        })
    }

    /// The current belief.
    #[must_use]
    pub fn belief(&self) -> &BeliefGrid {
        &self.belief
    }

    /// Replaces the belief, e.g. to seed a known prior.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::ShapeMismatch`] if the grid dimensions differ.
    pub fn set_belief(&mut self, belief: BeliefGrid) -> FilterResult<()> {
        let expected = self.width * self.height * self.n_state;
        if belief.data().len() != expected {
            return Err(FilterError::shape("belief", expected, belief.data().len()));
        }
        self.belief = belief;
        Ok(())
    }

    /// Resets the belief to uniform.
    pub fn reset(&mut self) {
        self.belief = BeliefGrid::uniform(self.width, self.height, self.n_state);
    }

    /// One recursive Bayesian update: likelihood fusion, fixed diffusion
    /// transition, per-cell renormalization.
    ///
    /// `obs` is cell-major with `n_obs` entries per cell. The updated belief
    /// replaces the filter's internal grid and is returned by reference.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::ShapeMismatch`] if `obs` is mis-sized.
    pub fn bayesian_update(&mut self, obs: &[f32]) -> FilterResult<&BeliefGrid> {
        let cells = self.width * self.height;
        let expected = cells * self.n_obs;
        if obs.len() != expected {
            return Err(FilterError::shape("observation", expected, obs.len()));
        }

        // Likelihood per cell, then the shared fusion step.
        for (cell, y) in obs.chunks(self.n_obs).enumerate() {
            let out = &mut self.likelihood[cell * self.n_state..(cell + 1) * self.n_state];
            self.observation.likelihood_into(y, out);
        }
        fuse_grid(self.belief.data(), &self.likelihood, &mut self.fused, self.n_state);

        // Fixed diffusion transition over the posterior.
        let planes = cells_to_planes(&self.fused, self.n_state, self.height, self.width);
        let shape = ConvShape {
            in_c: self.n_state,
            out_c: self.n_state,
            k: TRANSITION_KERNEL_SIZE,
            stride: 1,
            pad: 1,
            h: self.height,
            w: self.width,
        };
        let zero_bias = vec![0.0_f32; self.n_state];
        let diffused = conv2d_forward(self.kernel.weights(), &zero_bias, &planes, shape);

        // Renormalize across state channels; the kernel may shift mass
        // between channels and across the zero-padded border.
        let mut next = planes_to_cells(&diffused, self.n_state, self.height, self.width);
        for cell in next.chunks_mut(self.n_state) {
            let sum: f32 = cell.iter().sum();
            let denom = if sum.abs() < EPS { EPS } else { sum };
            for p in cell.iter_mut() {
                *p /= denom;
            }
        }
        self.belief.data_mut().copy_from_slice(&next);
        Ok(&self.belief)
    }
}
