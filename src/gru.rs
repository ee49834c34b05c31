//! Single-step gated recurrent unit with forward, cached forward, and
//! backward passes.
//!
//! The GRU carries the filter's temporal summary of the observation stream.
//! Implements the standard equations:
//!
//! ```text
//! z = sigmoid(W_z·x + U_z·h + b_z)        update gate
//! r = sigmoid(W_r·x + U_r·h + b_r)        reset gate
//! h~ = tanh(W_h·x + U_h·(r⊙h) + b_h)      candidate
//! h' = (1-z)⊙h + z⊙h~                     new hidden state
//! ```
//!
//! The backward pass returns gradients for every weight matrix, the gradient
//! with respect to the previous hidden state (so windows can be
//! backpropagated end to end), and the gradient with respect to the input
//! (so the upstream encoder trains too). All of it is checked against finite
//! differences in the tests.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Numerically stable sigmoid.
#[inline]
fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Derivative of sigmoid given the sigmoid output `s`.
#[inline]
fn sigmoid_deriv(s: f32) -> f32 {
    s * (1.0 - s)
}

/// Derivative of tanh given the tanh output `t`.
#[inline]
fn tanh_deriv(t: f32) -> f32 {
    1.0 - t * t
}

/// Row-major matrix-vector product: `out[i] = sum_j mat[i*cols + j] * v[j]`.
fn matvec(mat: &[f32], v: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0_f32; rows];
    for i in 0..rows {
        let row = &mat[i * cols..(i + 1) * cols];
        out[i] = row.iter().zip(v.iter()).map(|(&m, &x)| m * x).sum();
    }
    out
}

/// Transposed product: `out[j] = sum_i mat[i*cols + j] * v[i]`.
fn matvec_t(mat: &[f32], v: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0_f32; cols];
    for i in 0..rows {
        let row = &mat[i * cols..(i + 1) * cols];
        for j in 0..cols {
            out[j] += row[j] * v[i];
        }
    }
    out
}

/// GRU cell weights. Matrices are row-major `[hidden_dim, input_dim]` for
/// `w_*` and `[hidden_dim, hidden_dim]` for `u_*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GruCell {
    /// Input dimension.
    pub input_dim: usize,
    /// Hidden dimension.
    pub hidden_dim: usize,
    /// Input weights, update gate.
    pub w_z: Vec<f32>,
    /// Input weights, reset gate.
    pub w_r: Vec<f32>,
    /// Input weights, candidate.
    pub w_h: Vec<f32>,
    /// Recurrent weights, update gate.
    pub u_z: Vec<f32>,
    /// Recurrent weights, reset gate.
    pub u_r: Vec<f32>,
    /// Recurrent weights, candidate.
    pub u_h: Vec<f32>,
    /// Bias, update gate.
    pub b_z: Vec<f32>,
    /// Bias, reset gate.
    pub b_r: Vec<f32>,
    /// Bias, candidate.
    pub b_h: Vec<f32>,
}

/// Cached intermediates from one forward step, consumed by
/// [`GruCell::backward`].
#[derive(Debug, Clone)]
pub struct GruStepCache {
    input: Vec<f32>,
    h_prev: Vec<f32>,
    z: Vec<f32>,
    r: Vec<f32>,
    h_candidate: Vec<f32>,
}

/// Gradients for every GRU weight matrix.
#[derive(Debug, Clone)]
pub struct GruGradients {
    /// Gradient of `w_z`.
    pub dw_z: Vec<f32>,
    /// Gradient of `w_r`.
    pub dw_r: Vec<f32>,
    /// Gradient of `w_h`.
    pub dw_h: Vec<f32>,
    /// Gradient of `u_z`.
    pub du_z: Vec<f32>,
    /// Gradient of `u_r`.
    pub du_r: Vec<f32>,
    /// Gradient of `u_h`.
    pub du_h: Vec<f32>,
    /// Gradient of `b_z`.
    pub db_z: Vec<f32>,
    /// Gradient of `b_r`.
    pub db_r: Vec<f32>,
    /// Gradient of `b_h`.
    pub db_h: Vec<f32>,
}

impl GruGradients {
    /// Zero-initialized gradients for the given dimensions.
    #[must_use]
    pub fn zeros(input_dim: usize, hidden_dim: usize) -> Self {
        Self {
            dw_z: vec![0.0; hidden_dim * input_dim],
            dw_r: vec![0.0; hidden_dim * input_dim],
            dw_h: vec![0.0; hidden_dim * input_dim],
            du_z: vec![0.0; hidden_dim * hidden_dim],
            du_r: vec![0.0; hidden_dim * hidden_dim],
            du_h: vec![0.0; hidden_dim * hidden_dim],
            db_z: vec![0.0; hidden_dim],
            db_r: vec![0.0; hidden_dim],
            db_h: vec![0.0; hidden_dim],
        }
    }

    /// Adds `other` into `self`. Used when gradients from several timesteps
    /// of one window are combined.
    pub fn accumulate(&mut self, other: &Self) {
        let pairs: [(&mut Vec<f32>, &Vec<f32>); 9] = [
            (&mut self.dw_z, &other.dw_z),
            (&mut self.dw_r, &other.dw_r),
            (&mut self.dw_h, &other.dw_h),
            (&mut self.du_z, &other.du_z),
            (&mut self.du_r, &other.du_r),
            (&mut self.du_h, &other.du_h),
            (&mut self.db_z, &other.db_z),
            (&mut self.db_r, &other.db_r),
            (&mut self.db_h, &other.db_h),
        ];
        for (dst, src) in pairs {
            for (d, &s) in dst.iter_mut().zip(src.iter()) {
                *d += s;
            }
        }
    }
}

impl GruCell {
    /// Creates a GRU cell with Xavier-style uniform initialization and zero
    /// biases.
    #[must_use]
    pub fn new(input_dim: usize, hidden_dim: usize) -> Self {
        let mut rng = rand::rng();
        let input_scale = (6.0 / (input_dim + hidden_dim) as f32).sqrt();
        let recurrent_scale = (6.0 / (2.0 * hidden_dim as f32)).sqrt();

        let mut xavier = |size: usize, scale: f32| -> Vec<f32> {
            (0..size).map(|_| rng.random_range(-scale..scale)).collect()
        };

        Self {
            input_dim,
            hidden_dim,
            w_z: xavier(hidden_dim * input_dim, input_scale),
            w_r: xavier(hidden_dim * input_dim, input_scale),
            w_h: xavier(hidden_dim * input_dim, input_scale),
            u_z: xavier(hidden_dim * hidden_dim, recurrent_scale),
            u_r: xavier(hidden_dim * hidden_dim, recurrent_scale),
            u_h: xavier(hidden_dim * hidden_dim, recurrent_scale),
            b_z: vec![0.0; hidden_dim],
            b_r: vec![0.0; hidden_dim],
            b_h: vec![0.0; hidden_dim],
        }
    }

    /// One forward step without caching (inference path).
    #[must_use]
    pub fn step(&self, input: &[f32], hidden: &[f32]) -> Vec<f32> {
        self.step_with_cache(input, hidden).0
    }

    /// One forward step, returning the new hidden state and the cache needed
    /// by [`GruCell::backward`].
    #[must_use]
    pub fn step_with_cache(&self, input: &[f32], hidden: &[f32]) -> (Vec<f32>, GruStepCache) {
        let h_dim = self.hidden_dim;
        let i_dim = self.input_dim;
        debug_assert_eq!(input.len(), i_dim);
        debug_assert_eq!(hidden.len(), h_dim);

        let mut z = matvec(&self.w_z, input, h_dim, i_dim);
        let z_h = matvec(&self.u_z, hidden, h_dim, h_dim);
        for i in 0..h_dim {
            z[i] = sigmoid(z[i] + z_h[i] + self.b_z[i]);
        }

        let mut r = matvec(&self.w_r, input, h_dim, i_dim);
        let r_h = matvec(&self.u_r, hidden, h_dim, h_dim);
        for i in 0..h_dim {
            r[i] = sigmoid(r[i] + r_h[i] + self.b_r[i]);
        }

        let r_times_h: Vec<f32> = r.iter().zip(hidden.iter()).map(|(&ri, &hi)| ri * hi).collect();
        let mut h_candidate = matvec(&self.w_h, input, h_dim, i_dim);
        let h_rec = matvec(&self.u_h, &r_times_h, h_dim, h_dim);
        for i in 0..h_dim {
            h_candidate[i] = (h_candidate[i] + h_rec[i] + self.b_h[i]).tanh();
        }

        let h_new: Vec<f32> = (0..h_dim)
            .map(|i| (1.0 - z[i]) * hidden[i] + z[i] * h_candidate[i])
            .collect();

        let cache = GruStepCache {
            input: input.to_vec(),
            h_prev: hidden.to_vec(),
            z,
            r,
            h_candidate,
        };
        (h_new, cache)
    }

    /// Backpropagates `dL/dh_new` through one cached step.
    ///
    /// Returns `(gradients, dh_prev, dx)`:
    /// - `gradients`: weight gradients for this step
    /// - `dh_prev`: gradient w.r.t. the previous hidden state (chained to
    ///   the preceding timestep)
    /// - `dx`: gradient w.r.t. the step input (chained into the encoder)
    #[must_use]
    pub fn backward(&self, cache: &GruStepCache, dh_new: &[f32]) -> (GruGradients, Vec<f32>, Vec<f32>) {
        let h_dim = self.hidden_dim;
        let i_dim = self.input_dim;

        let mut grads = GruGradients::zeros(i_dim, h_dim);

        // h_new = (1-z)·h_prev + z·h_cand
        let mut dz: Vec<f32> = (0..h_dim)
            .map(|i| dh_new[i] * (cache.h_candidate[i] - cache.h_prev[i]))
            .collect();
        let dh_cand: Vec<f32> = (0..h_dim).map(|i| dh_new[i] * cache.z[i]).collect();

        // h_cand = tanh(pre_h)
        let d_pre_h: Vec<f32> = (0..h_dim)
            .map(|i| dh_cand[i] * tanh_deriv(cache.h_candidate[i]))
            .collect();

        // W_h, U_h, b_h
        for i in 0..h_dim {
            for j in 0..i_dim {
                grads.dw_h[i * i_dim + j] = d_pre_h[i] * cache.input[j];
            }
        }
        let r_h: Vec<f32> = (0..h_dim).map(|i| cache.r[i] * cache.h_prev[i]).collect();
        for i in 0..h_dim {
            for j in 0..h_dim {
                grads.du_h[i * h_dim + j] = d_pre_h[i] * r_h[j];
            }
        }
        grads.db_h.copy_from_slice(&d_pre_h);

        // r via U_h·(r⊙h_prev)
        let d_rh = matvec_t(&self.u_h, &d_pre_h, h_dim, h_dim);
        let dr: Vec<f32> = (0..h_dim).map(|i| d_rh[i] * cache.h_prev[i]).collect();

        // z = sigmoid(pre_z)
        for i in 0..h_dim {
            dz[i] *= sigmoid_deriv(cache.z[i]);
        }
        for i in 0..h_dim {
            for j in 0..i_dim {
                grads.dw_z[i * i_dim + j] = dz[i] * cache.input[j];
            }
        }
        for i in 0..h_dim {
            for j in 0..h_dim {
                grads.du_z[i * h_dim + j] = dz[i] * cache.h_prev[j];
            }
        }
        grads.db_z.copy_from_slice(&dz);

        // r = sigmoid(pre_r)
        let d_pre_r: Vec<f32> = (0..h_dim)
            .map(|i| dr[i] * sigmoid_deriv(cache.r[i]))
            .collect();
        for i in 0..h_dim {
            for j in 0..i_dim {
                grads.dw_r[i * i_dim + j] = d_pre_r[i] * cache.input[j];
            }
        }
        for i in 0..h_dim {
            for j in 0..h_dim {
                grads.du_r[i * h_dim + j] = d_pre_r[i] * cache.h_prev[j];
            }
        }
        grads.db_r.copy_from_slice(&d_pre_r);

        // dh_prev: four contributions.
        let mut dh_prev = vec![0.0_f32; h_dim];
        for i in 0..h_dim {
            dh_prev[i] += dh_new[i] * (1.0 - cache.z[i]); // through h_new directly
            dh_prev[i] += d_rh[i] * cache.r[i]; // through r⊙h_prev
        }
        let dh_from_z = matvec_t(&self.u_z, &dz, h_dim, h_dim);
        let dh_from_r = matvec_t(&self.u_r, &d_pre_r, h_dim, h_dim);
        for i in 0..h_dim {
            dh_prev[i] += dh_from_z[i] + dh_from_r[i];
        }

        // dx: through all three input projections.
        let mut dx = matvec_t(&self.w_z, &dz, h_dim, i_dim);
        let dx_r = matvec_t(&self.w_r, &d_pre_r, h_dim, i_dim);
        let dx_h = matvec_t(&self.w_h, &d_pre_h, h_dim, i_dim);
        for j in 0..i_dim {
            dx[j] += dx_r[j] + dx_h[j];
        }

        (grads, dh_prev, dx)
    }
}
