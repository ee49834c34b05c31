//! The state-to-observation model.
//!
//! An [`ObservationMatrix`] is an `n_state x n_obs` matrix whose rows are
//! conditional distributions P(observation | state). The fixed filter builds
//! one from externally supplied rows, normalized once at construction; the
//! learned filter keeps free logits as a trainable parameter and row-softmaxes
//! them on every use ([`ObservationMatrix::from_logits`]).
//!
//! Both directions of the matrix are needed:
//! - `likelihood`: given an observation vector `y`, the relative plausibility
//!   of each hidden state, `b[s] = sum_y O[s][y] * y[y]`;
//! - `project`: given a belief, the expected observation,
//!   `o[y] = sum_s O[s][y] * b[s]` (used by the training objective).

use serde::{Deserialize, Serialize};

use crate::error::{FilterError, FilterResult};
use crate::fusion::EPS;

/// A row-stochastic `n_state x n_obs` observation matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationMatrix {
    n_state: usize,
    n_obs: usize,
    /// Row-major, `rows[s * n_obs + y] = P(y | s)`.
    rows: Vec<f32>,
}

impl ObservationMatrix {
    /// Builds a matrix from raw non-negative rows, normalizing each row to
    /// sum to one.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::ShapeMismatch`] if `rows` is not
    /// `n_state * n_obs` long, and [`FilterError::InvalidConfig`] if any
    /// entry is negative or non-finite, or a row has no mass to normalize.
    pub fn from_rows(n_state: usize, n_obs: usize, mut rows: Vec<f32>) -> FilterResult<Self> {
        let expected = n_state * n_obs;
        if rows.len() != expected {
            return Err(FilterError::shape("observation matrix", expected, rows.len()));
        }
        for row in rows.chunks_mut(n_obs) {
            let mut sum = 0.0;
            for &p in row.iter() {
                if !p.is_finite() || p < 0.0 {
                    return Err(FilterError::InvalidConfig(format!(
                        "observation matrix entries must be finite and non-negative, got {p}"
                    )));
                }
                sum += p;
            }
            if sum < EPS {
                return Err(FilterError::InvalidConfig(
                    "observation matrix row has no mass to normalize".into(),
                ));
            }
            for p in row.iter_mut() {
                *p /= sum;
            }
        }
        Ok(Self {
            n_state,
            n_obs,
            rows,
        })
    }

    /// Builds a matrix by row-softmaxing free logits. This is the learned
    /// variant's normalization, applied on every use of the parameter.
    #[must_use]
    pub fn from_logits(n_state: usize, n_obs: usize, logits: &[f32]) -> Self {
        debug_assert_eq!(logits.len(), n_state * n_obs);
        let mut rows = vec![0.0_f32; n_state * n_obs];
        for (row, src) in rows.chunks_mut(n_obs).zip(logits.chunks(n_obs)) {
            softmax_into(src, row);
        }
        Self {
            n_state,
            n_obs,
            rows,
        }
    }

    /// The identity-like matrix for `n_state == n_obs` (noiseless sensing).
    #[must_use]
    pub fn identity(n: usize) -> Self {
        let mut rows = vec![0.0_f32; n * n];
        for s in 0..n {
            rows[s * n + s] = 1.0;
        }
        Self {
            n_state: n,
            n_obs: n,
            rows,
        }
    }

    /// Number of hidden-state classes (rows).
    #[must_use]
    pub fn n_state(&self) -> usize {
        self.n_state
    }

    /// Number of observation channels (columns).
    #[must_use]
    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    /// The normalized row-major entries.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.rows
    }

    /// Likelihood of each hidden state given one cell's observation vector:
    /// `out[s] = sum_y O[s][y] * y[y]`.
    pub fn likelihood_into(&self, y: &[f32], out: &mut [f32]) {
        debug_assert_eq!(y.len(), self.n_obs);
        debug_assert_eq!(out.len(), self.n_state);
        for (s, o) in out.iter_mut().enumerate() {
            let row = &self.rows[s * self.n_obs..(s + 1) * self.n_obs];
            *o = row.iter().zip(y.iter()).map(|(&w, &v)| w * v).sum();
        }
    }

    /// Expected observation under a belief: `out[y] = sum_s O[s][y] * b[s]`.
    pub fn project_into(&self, belief: &[f32], out: &mut [f32]) {
        debug_assert_eq!(belief.len(), self.n_state);
        debug_assert_eq!(out.len(), self.n_obs);
        out.fill(0.0);
        for (s, &b) in belief.iter().enumerate() {
            let row = &self.rows[s * self.n_obs..(s + 1) * self.n_obs];
            for (o, &w) in out.iter_mut().zip(row.iter()) {
                *o += w * b;
            }
        }
    }
}

/// Numerically stable softmax into a preallocated slice.
pub(crate) fn softmax_into(logits: &[f32], out: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for (o, &x) in out.iter_mut().zip(logits.iter()) {
        *o = (x - max).exp();
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
}
