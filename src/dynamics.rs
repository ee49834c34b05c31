//! The learned-transition filter: encoder → GRU → decoder dynamics trained
//! against future masked observations.
//!
//! [`LearnedDynamicsFilter`] shares the fixed filter's likelihood-fusion
//! step but replaces the hand-specified diffusion with a learned pipeline:
//! the observation grid is summarized by a small convolutional encoder, a
//! single-step GRU advances a carried [`RecurrentState`], and a transposed-
//! convolution decoder emits the next-step prior belief (cropped to the grid
//! and per-cell softmaxed).
//!
//! # Inference (`step`)
//!
//! Fuses the observation into the current prior, blends fused and prior
//! cells by the sensor mask (unsensed cells keep the prior untouched),
//! advances the recurrent state, and decodes the next prior. The returned
//! grid is the masked blend; the decoded prior is internal state for the
//! next call and no gradients are tracked.
//!
//! # Training (`update`)
//!
//! Samples `n_batch` windows of `n_window` aligned frames, runs each window
//! through encoder/GRU/decoder from a freshly randomized hidden state, and
//! projects every predicted belief into observation space through the
//! row-softmaxed observation matrix. The prediction at time `t` is scored
//! against the true observation at `t + 1`, restricted to cells the sensor
//! actually covered at `t + 1`, with a masked binary cross-entropy. One Adam
//! step updates every learnable tensor jointly — encoder, GRU, decoder, and
//! observation logits — using hand-rolled backpropagation through the whole
//! window (checked against finite differences in the tests).
//!
//! An entropy regularizer over the predicted observations is always computed
//! and reported but only enters the optimized objective when
//! [`TrainingConfig::entropy_term_enabled`] is set.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::belief::BeliefGrid;
use crate::config::{DynamicsConfig, GridConfig, TrainingConfig};
use crate::error::{FilterError, FilterResult};
use crate::fusion::{fuse_grid, EPS};
use crate::gru::{GruCell, GruGradients, GruStepCache};
use crate::nn::{
    axpy, cells_to_planes, channel_softmax_backward, channel_softmax_forward, conv2d_backward,
    conv2d_forward, conv_transpose2d_backward, conv_transpose2d_forward, crop_planes,
    crop_planes_backward, linear_backward, linear_forward, planes_to_cells, relu_backward,
    relu_forward, ConvShape, DeconvShape,
};
use crate::memory::{TrajectoryMemory, TrajectoryWindow};
use crate::observation::ObservationMatrix;
use crate::optimizer::Adam;

/// The GRU hidden vector carried by the learned filter.
///
/// Reset semantics: randomized at construction and by [`RecurrentState::reset`];
/// carried detached across consecutive inference steps; every training window
/// starts from its own fresh random state and never touches the filter's
/// inference state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentState {
    hidden: Vec<f32>,
}

impl RecurrentState {
    /// A fresh state with entries drawn uniformly from `[0, 1)`.
    #[must_use]
    pub fn random(dim: usize) -> Self {
        let mut rng = rand::rng();
        Self {
            hidden: (0..dim).map(|_| rng.random::<f32>()).collect(),
        }
    }

    /// Re-randomizes the state in place.
    pub fn reset(&mut self) {
        let mut rng = rand::rng();
        for h in &mut self.hidden {
            *h = rng.random::<f32>();
        }
    }

    /// Hidden dimension.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.hidden.len()
    }

    /// The hidden vector.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.hidden
    }
}

/// Loss report returned by [`LearnedDynamicsFilter::update`].
///
/// `total` is the value actually optimized; `prediction` and `entropy` are
/// its components (entropy contributes to `total` only when enabled). A
/// non-finite value is returned as-is so the training driver can decide
/// whether to halt.
#[derive(Debug, Clone)]
pub struct TrainingLosses {
    /// The optimized objective.
    pub total: f32,
    /// Masked one-step-ahead binary cross-entropy.
    pub prediction: f32,
    /// Entropy regularizer over predicted observations (reported even when
    /// it is not part of `total`).
    pub entropy: f32,
    /// Snapshot of the normalized observation matrix, for diagnostics.
    pub observation_matrix: ObservationMatrix,
}

/// Names of the learnable tensors, in slot order. Shared by the optimizer
/// slots and the serialized parameter set.
pub(crate) const PARAM_NAMES: [&str; 18] = [
    "enc_conv_w",
    "enc_conv_b",
    "enc_lin_w",
    "enc_lin_b",
    "gru_w_z",
    "gru_w_r",
    "gru_w_h",
    "gru_u_z",
    "gru_u_r",
    "gru_u_h",
    "gru_b_z",
    "gru_b_r",
    "gru_b_h",
    "dec_lin_w",
    "dec_lin_b",
    "dec_deconv_w",
    "dec_deconv_b",
    "obs_logits",
];

/// Gradients for every learnable tensor, in the same slot order as
/// [`DynamicsNetwork::param_slots_mut`].
pub(crate) struct NetworkGradients {
    enc_conv_w: Vec<f32>,
    enc_conv_b: Vec<f32>,
    enc_lin_w: Vec<f32>,
    enc_lin_b: Vec<f32>,
    gru: GruGradients,
    dec_lin_w: Vec<f32>,
    dec_lin_b: Vec<f32>,
    dec_deconv_w: Vec<f32>,
    dec_deconv_b: Vec<f32>,
    obs_logits: Vec<f32>,
}

impl NetworkGradients {
    fn zeros(net: &DynamicsNetwork) -> Self {
        Self {
            enc_conv_w: vec![0.0; net.enc_conv_w.len()],
            enc_conv_b: vec![0.0; net.enc_conv_b.len()],
            enc_lin_w: vec![0.0; net.enc_lin_w.len()],
            enc_lin_b: vec![0.0; net.enc_lin_b.len()],
            gru: GruGradients::zeros(net.arch.encoding_dim, net.arch.hidden_dim),
            dec_lin_w: vec![0.0; net.dec_lin_w.len()],
            dec_lin_b: vec![0.0; net.dec_lin_b.len()],
            dec_deconv_w: vec![0.0; net.dec_deconv_w.len()],
            dec_deconv_b: vec![0.0; net.dec_deconv_b.len()],
            obs_logits: vec![0.0; net.obs_logits.len()],
        }
    }

    /// Gradient slices in slot order.
    pub(crate) fn slots(&self) -> Vec<&Vec<f32>> {
        vec![
            &self.enc_conv_w,
            &self.enc_conv_b,
            &self.enc_lin_w,
            &self.enc_lin_b,
            &self.gru.dw_z,
            &self.gru.dw_r,
            &self.gru.dw_h,
            &self.gru.du_z,
            &self.gru.du_r,
            &self.gru.du_h,
            &self.gru.db_z,
            &self.gru.db_r,
            &self.gru.db_h,
            &self.dec_lin_w,
            &self.dec_lin_b,
            &self.dec_deconv_w,
            &self.dec_deconv_b,
            &self.obs_logits,
        ]
    }
}

/// Cached encoder intermediates for one timestep.
struct EncoderCache {
    planes: Vec<f32>,
    conv_pre: Vec<f32>,
    conv_act: Vec<f32>,
}

/// Cached decoder intermediates for one timestep.
struct DecoderCache {
    hidden: Vec<f32>,
    lin_pre: Vec<f32>,
    lin_act: Vec<f32>,
    /// Channel-major predicted belief planes (post-softmax).
    probs: Vec<f32>,
}

/// Forward pass over one window: caches for backpropagation plus the
/// predicted observations (cell-major, one grid per scored timestep).
struct WindowForward {
    enc: Vec<EncoderCache>,
    gru: Vec<GruStepCache>,
    dec: Vec<DecoderCache>,
    preds: Vec<Vec<f32>>,
}

/// Forward pass over a whole batch with the scalar losses.
pub(crate) struct ForwardPass {
    windows: Vec<WindowForward>,
    mask_count: f32,
    entry_count: usize,
    pub(crate) prediction: f32,
    pub(crate) entropy: f32,
}

/// Masked binary cross-entropy between one predicted and one target
/// observation grid.
///
/// Sums `-(t·ln(p + EPS) + (1-t)·ln(1-p + EPS))` over the `n_obs` entries of
/// every cell whose mask is set; cells with mask 0 contribute exactly
/// nothing. Returns `(sum, masked_cell_count)`; the caller normalizes by the
/// total mask count of the batch.
pub(crate) fn masked_bce(pred: &[f32], target: &[f32], mask: &[f32], n_obs: usize) -> (f32, f32) {
    let mut sum = 0.0_f32;
    let mut count = 0.0_f32;
    for (cell, &m) in mask.iter().enumerate() {
        if m <= 0.0 {
            continue;
        }
        count += m;
        for j in cell * n_obs..(cell + 1) * n_obs {
            let p = pred[j];
            let t = target[j];
            sum -= t * (p + EPS).ln() + (1.0 - t) * (1.0 - p + EPS).ln();
        }
    }
    (sum, count)
}

/// Shannon-entropy accumulator: returns `sum(p·ln p)` with the `p → 0` limit
/// taken as 0.
pub(crate) fn entropy_sum(pred: &[f32]) -> f32 {
    pred.iter()
        .map(|&p| if p > 0.0 { p * p.ln() } else { 0.0 })
        .sum()
}

/// The learnable encoder/GRU/decoder pipeline plus observation logits.
pub(crate) struct DynamicsNetwork {
    grid: GridConfig,
    arch: DynamicsConfig,
    enc_shape: ConvShape,
    dec_shape: DeconvShape,
    /// Flattened encoder conv output size.
    enc_flat: usize,
    /// Flattened decoder linear output size.
    dec_flat: usize,

    pub(crate) enc_conv_w: Vec<f32>,
    pub(crate) enc_conv_b: Vec<f32>,
    pub(crate) enc_lin_w: Vec<f32>,
    pub(crate) enc_lin_b: Vec<f32>,
    pub(crate) gru: GruCell,
    pub(crate) dec_lin_w: Vec<f32>,
    pub(crate) dec_lin_b: Vec<f32>,
    pub(crate) dec_deconv_w: Vec<f32>,
    pub(crate) dec_deconv_b: Vec<f32>,
    pub(crate) obs_logits: Vec<f32>,
}

impl DynamicsNetwork {
    pub(crate) fn new(grid: GridConfig, arch: DynamicsConfig) -> Self {
        let enc_shape = ConvShape {
            in_c: grid.n_obs,
            out_c: arch.encoder_channels,
            k: 3,
            stride: 2,
            pad: 1,
            h: grid.height,
            w: grid.width,
        };
        let (half_h, half_w) = (enc_shape.out_h(), enc_shape.out_w());
        let dec_shape = DeconvShape {
            in_c: arch.decoder_channels,
            out_c: grid.n_state,
            k: 3,
            stride: 2,
            h: half_h,
            w: half_w,
        };
        let enc_flat = arch.encoder_channels * half_h * half_w;
        let dec_flat = arch.decoder_channels * half_h * half_w;

        let mut rng = rand::rng();
        let mut xavier = |n: usize, fan_in: usize, fan_out: usize| -> Vec<f32> {
            let scale = (6.0 / (fan_in + fan_out) as f32).sqrt();
            (0..n).map(|_| rng.random_range(-scale..scale)).collect()
        };

        let enc_conv_w = xavier(
            arch.encoder_channels * grid.n_obs * 9,
            grid.n_obs * 9,
            arch.encoder_channels * 9,
        );
        let enc_lin_w = xavier(arch.encoding_dim * enc_flat, enc_flat, arch.encoding_dim);
        let dec_lin_w = xavier(dec_flat * arch.hidden_dim, arch.hidden_dim, dec_flat);
        let dec_deconv_w = xavier(
            arch.decoder_channels * grid.n_state * 9,
            arch.decoder_channels * 9,
            grid.n_state * 9,
        );
        let obs_logits = {
            let n = grid.n_state * grid.n_obs;
            (0..n).map(|_| rng.random_range(-0.5..0.5)).collect()
        };

        Self {
            grid,
            arch,
            enc_shape,
            dec_shape,
            enc_flat,
            dec_flat,
            enc_conv_w,
            enc_conv_b: vec![0.0; arch.encoder_channels],
            enc_lin_w,
            enc_lin_b: vec![0.0; arch.encoding_dim],
            gru: GruCell::new(arch.encoding_dim, arch.hidden_dim),
            dec_lin_w,
            dec_lin_b: vec![0.0; dec_flat],
            dec_deconv_w,
            dec_deconv_b: vec![0.0; grid.n_state],
            obs_logits,
        }
    }

    pub(crate) fn grid(&self) -> &GridConfig {
        &self.grid
    }

    pub(crate) fn arch(&self) -> &DynamicsConfig {
        &self.arch
    }

    /// The row-softmaxed observation matrix for the current logits.
    pub(crate) fn observation_matrix(&self) -> ObservationMatrix {
        ObservationMatrix::from_logits(self.grid.n_state, self.grid.n_obs, &self.obs_logits)
    }

    /// Shared views of every learnable tensor, in slot order.
    pub(crate) fn param_slots(&self) -> Vec<&Vec<f32>> {
        vec![
            &self.enc_conv_w,
            &self.enc_conv_b,
            &self.enc_lin_w,
            &self.enc_lin_b,
            &self.gru.w_z,
            &self.gru.w_r,
            &self.gru.w_h,
            &self.gru.u_z,
            &self.gru.u_r,
            &self.gru.u_h,
            &self.gru.b_z,
            &self.gru.b_r,
            &self.gru.b_h,
            &self.dec_lin_w,
            &self.dec_lin_b,
            &self.dec_deconv_w,
            &self.dec_deconv_b,
            &self.obs_logits,
        ]
    }

    /// Mutable views of every learnable tensor, in slot order.
    pub(crate) fn param_slots_mut(&mut self) -> Vec<&mut Vec<f32>> {
        vec![
            &mut self.enc_conv_w,
            &mut self.enc_conv_b,
            &mut self.enc_lin_w,
            &mut self.enc_lin_b,
            &mut self.gru.w_z,
            &mut self.gru.w_r,
            &mut self.gru.w_h,
            &mut self.gru.u_z,
            &mut self.gru.u_r,
            &mut self.gru.u_h,
            &mut self.gru.b_z,
            &mut self.gru.b_r,
            &mut self.gru.b_h,
            &mut self.dec_lin_w,
            &mut self.dec_lin_b,
            &mut self.dec_deconv_w,
            &mut self.dec_deconv_b,
            &mut self.obs_logits,
        ]
    }

    /// Shapes of every learnable tensor, in slot order.
    pub(crate) fn param_shapes(&self) -> Vec<Vec<usize>> {
        let (s, y) = (self.grid.n_state, self.grid.n_obs);
        let (e, h) = (self.arch.encoding_dim, self.arch.hidden_dim);
        vec![
            vec![self.arch.encoder_channels, y, 3, 3],
            vec![self.arch.encoder_channels],
            vec![e, self.enc_flat],
            vec![e],
            vec![h, e],
            vec![h, e],
            vec![h, e],
            vec![h, h],
            vec![h, h],
            vec![h, h],
            vec![h],
            vec![h],
            vec![h],
            vec![self.dec_flat, h],
            vec![self.dec_flat],
            vec![self.arch.decoder_channels, s, 3, 3],
            vec![s],
            vec![s, y],
        ]
    }

    // ─── Encoder ────────────────────────────────────────────────────────

    fn encode_cached(&self, obs_cells: &[f32]) -> (Vec<f32>, EncoderCache) {
        let planes = cells_to_planes(obs_cells, self.grid.n_obs, self.grid.height, self.grid.width);
        let conv_pre = conv2d_forward(&self.enc_conv_w, &self.enc_conv_b, &planes, self.enc_shape);
        let conv_act = relu_forward(&conv_pre);
        let feature = linear_forward(
            &self.enc_lin_w,
            &self.enc_lin_b,
            &conv_act,
            self.arch.encoding_dim,
            self.enc_flat,
        );
        (
            feature,
            EncoderCache {
                planes,
                conv_pre,
                conv_act,
            },
        )
    }

    fn encode(&self, obs_cells: &[f32]) -> Vec<f32> {
        self.encode_cached(obs_cells).0
    }

    fn encode_backward(&self, cache: &EncoderCache, dfeature: &[f32], grads: &mut NetworkGradients) {
        let (dlw, dlb, dflat) = linear_backward(
            &self.enc_lin_w,
            &cache.conv_act,
            dfeature,
            self.arch.encoding_dim,
            self.enc_flat,
        );
        axpy(&mut grads.enc_lin_w, &dlw);
        axpy(&mut grads.enc_lin_b, &dlb);
        let dconv_pre = relu_backward(&cache.conv_pre, &dflat);
        let (dcw, dcb, _dplanes) =
            conv2d_backward(&self.enc_conv_w, &cache.planes, &dconv_pre, self.enc_shape);
        axpy(&mut grads.enc_conv_w, &dcw);
        axpy(&mut grads.enc_conv_b, &dcb);
    }

    // ─── Decoder ────────────────────────────────────────────────────────

    fn decode_cached(&self, hidden: &[f32]) -> (Vec<f32>, DecoderCache) {
        let lin_pre = linear_forward(
            &self.dec_lin_w,
            &self.dec_lin_b,
            hidden,
            self.dec_flat,
            self.arch.hidden_dim,
        );
        let lin_act = relu_forward(&lin_pre);
        let full = conv_transpose2d_forward(&self.dec_deconv_w, &self.dec_deconv_b, &lin_act, self.dec_shape);
        let logits = crop_planes(
            &full,
            self.grid.n_state,
            self.dec_shape.out_h(),
            self.dec_shape.out_w(),
            self.grid.height,
            self.grid.width,
        );
        let probs = channel_softmax_forward(&logits, self.grid.n_state, self.grid.cells());
        (
            probs.clone(),
            DecoderCache {
                hidden: hidden.to_vec(),
                lin_pre,
                lin_act,
                probs,
            },
        )
    }

    fn decode(&self, hidden: &[f32]) -> Vec<f32> {
        self.decode_cached(hidden).0
    }

    fn decode_backward(
        &self,
        cache: &DecoderCache,
        dprobs: &[f32],
        grads: &mut NetworkGradients,
    ) -> Vec<f32> {
        let dlogits =
            channel_softmax_backward(&cache.probs, dprobs, self.grid.n_state, self.grid.cells());
        let dfull = crop_planes_backward(
            &dlogits,
            self.grid.n_state,
            self.dec_shape.out_h(),
            self.dec_shape.out_w(),
            self.grid.height,
            self.grid.width,
        );
        let (ddw, ddb, dlin_act) =
            conv_transpose2d_backward(&self.dec_deconv_w, &cache.lin_act, &dfull, self.dec_shape);
        axpy(&mut grads.dec_deconv_w, &ddw);
        axpy(&mut grads.dec_deconv_b, &ddb);
        let dlin_pre = relu_backward(&cache.lin_pre, &dlin_act);
        let (dlw, dlb, dhidden) = linear_backward(
            &self.dec_lin_w,
            &cache.hidden,
            &dlin_pre,
            self.dec_flat,
            self.arch.hidden_dim,
        );
        axpy(&mut grads.dec_lin_w, &dlw);
        axpy(&mut grads.dec_lin_b, &dlb);
        dhidden
    }

    // ─── Training forward / backward ────────────────────────────────────

    /// Runs the batch forward, caching everything the backward pass needs
    /// and computing the scalar losses. `h0s` supplies the initial hidden
    /// state of each window.
    pub(crate) fn forward_windows(
        &self,
        windows: &[TrajectoryWindow],
        h0s: &[Vec<f32>],
    ) -> ForwardPass {
        let cells = self.grid.cells();
        let n_obs = self.grid.n_obs;
        let n_state = self.grid.n_state;
        let observation = self.observation_matrix();
        let o = observation.as_slice();

        let mut out_windows = Vec::with_capacity(windows.len());
        let mut bce_sum = 0.0_f32;
        let mut mask_count = 0.0_f32;
        let mut entropy_acc = 0.0_f32;
        let mut entry_count = 0_usize;

        for (window, h0) in windows.iter().zip(h0s.iter()) {
            let t_len = window.len();
            let scored = t_len - 1;
            let mut fwd = WindowForward {
                enc: Vec::with_capacity(scored),
                gru: Vec::with_capacity(scored),
                dec: Vec::with_capacity(scored),
                preds: Vec::with_capacity(scored),
            };
            let mut hidden = h0.clone();

            for t in 0..t_len {
                if t < scored {
                    let (feature, enc_cache) = self.encode_cached(&window.observations[t]);
                    let (h_new, gru_cache) = self.gru.step_with_cache(&feature, &hidden);
                    hidden = h_new;
                    let (probs, dec_cache) = self.decode_cached(&hidden);

                    // Project the predicted belief into observation space.
                    let mut pred = vec![0.0_f32; cells * n_obs];
                    for cell in 0..cells {
                        for y in 0..n_obs {
                            let mut acc = 0.0;
                            for s in 0..n_state {
                                acc += o[s * n_obs + y] * probs[s * cells + cell];
                            }
                            pred[cell * n_obs + y] = acc;
                        }
                    }

                    // One-step-ahead masked scoring against t + 1.
                    let (sum, count) =
                        masked_bce(&pred, &window.observations[t + 1], &window.masks[t + 1], n_obs);
                    bce_sum += sum;
                    mask_count += count;
                    entropy_acc += entropy_sum(&pred);
                    entry_count += pred.len();

                    fwd.enc.push(enc_cache);
                    fwd.gru.push(gru_cache);
                    fwd.dec.push(dec_cache);
                    fwd.preds.push(pred);
                } else {
                    // The tail step still runs through the recurrent unit;
                    // nothing downstream consumes it, so no caches.
                    let feature = self.encode(&window.observations[t]);
                    hidden = self.gru.step(&feature, &hidden);
                }
            }
            out_windows.push(fwd);
        }

        let prediction = if mask_count > 0.0 { bce_sum / mask_count } else { 0.0 };
        let entropy = if entry_count > 0 {
            -(entropy_acc / entry_count as f32)
        } else {
            0.0
        };

        ForwardPass {
            windows: out_windows,
            mask_count,
            entry_count,
            prediction,
            entropy,
        }
    }

    /// Backpropagates the batch losses through every cached window.
    pub(crate) fn backward_windows(
        &self,
        windows: &[TrajectoryWindow],
        pass: &ForwardPass,
        entropy_enabled: bool,
        entropy_weight: f32,
    ) -> NetworkGradients {
        let cells = self.grid.cells();
        let n_obs = self.grid.n_obs;
        let n_state = self.grid.n_state;
        let observation = self.observation_matrix();
        let o = observation.as_slice();
        let hidden_dim = self.arch.hidden_dim;

        let mut grads = NetworkGradients::zeros(self);
        // Gradient w.r.t. the normalized matrix, pushed through the row
        // softmax once at the end.
        let mut d_obs_rows = vec![0.0_f32; n_state * n_obs];

        for (window, fwd) in windows.iter().zip(pass.windows.iter()) {
            let scored = fwd.preds.len();
            let mut dh_carry = vec![0.0_f32; hidden_dim];

            for t in (0..scored).rev() {
                let pred = &fwd.preds[t];
                let target = &window.observations[t + 1];
                let mask = &window.masks[t + 1];

                // d(loss)/d(pred).
                let mut dpred = vec![0.0_f32; pred.len()];
                if pass.mask_count > 0.0 {
                    for (cell, &m) in mask.iter().enumerate() {
                        if m <= 0.0 {
                            continue;
                        }
                        for j in cell * n_obs..(cell + 1) * n_obs {
                            let p = pred[j];
                            let tv = target[j];
                            dpred[j] =
                                -(tv / (p + EPS) - (1.0 - tv) / (1.0 - p + EPS)) / pass.mask_count;
                        }
                    }
                }
                if entropy_enabled && pass.entry_count > 0 {
                    let scale = entropy_weight / pass.entry_count as f32;
                    for (d, &p) in dpred.iter_mut().zip(pred.iter()) {
                        if p > 0.0 {
                            *d += -(p.ln() + 1.0) * scale;
                        }
                    }
                }

                // Through the observation projection.
                let probs = &fwd.dec[t].probs;
                let mut dprobs = vec![0.0_f32; n_state * cells];
                for cell in 0..cells {
                    for y in 0..n_obs {
                        let g = dpred[cell * n_obs + y];
                        if g == 0.0 {
                            continue;
                        }
                        for s in 0..n_state {
                            dprobs[s * cells + cell] += o[s * n_obs + y] * g;
                            d_obs_rows[s * n_obs + y] += g * probs[s * cells + cell];
                        }
                    }
                }

                // Decoder, GRU (chained across time), encoder.
                let mut dh = self.decode_backward(&fwd.dec[t], &dprobs, &mut grads);
                axpy(&mut dh, &dh_carry);
                let (gru_grads, dh_prev, dfeature) = self.gru.backward(&fwd.gru[t], &dh);
                grads.gru.accumulate(&gru_grads);
                self.encode_backward(&fwd.enc[t], &dfeature, &mut grads);
                dh_carry = dh_prev;
            }
        }

        // Row-softmax backward into the logits.
        for s in 0..n_state {
            let row = &o[s * n_obs..(s + 1) * n_obs];
            let drow = &d_obs_rows[s * n_obs..(s + 1) * n_obs];
            let dot: f32 = row.iter().zip(drow.iter()).map(|(&p, &d)| p * d).sum();
            for y in 0..n_obs {
                grads.obs_logits[s * n_obs + y] = row[y] * (drow[y] - dot);
            }
        }

        grads
    }

    /// One joint Adam step over every learnable tensor.
    pub(crate) fn apply_gradients(&mut self, grads: &NetworkGradients, optimizer: &mut Adam) {
        optimizer.begin_step();
        let grad_slots = grads.slots();
        for (slot, param) in self.param_slots_mut().into_iter().enumerate() {
            optimizer.update_slot(slot, param, grad_slots[slot]);
        }
    }
}

/// Recursive Bayesian filter with a learned encoder/GRU/decoder transition.
pub struct LearnedDynamicsFilter {
    grid: GridConfig,
    training: TrainingConfig,
    network: DynamicsNetwork,
    optimizer: Adam,
    prior: BeliefGrid,
    state: RecurrentState,
    /// Scratch buffers reused across steps.
    likelihood: Vec<f32>,
    posterior: Vec<f32>,
}

impl LearnedDynamicsFilter {
    /// Creates a filter with a random softmax prior and a random recurrent
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidConfig`] if any configuration is
    /// invalid.
    pub fn new(
        grid: GridConfig,
        arch: DynamicsConfig,
        training: TrainingConfig,
    ) -> FilterResult<Self> {
        grid.validate()?;
        arch.validate()?;
        training.validate()?;
        let cells = grid.cells();
        Ok(Self {
            grid,
            training,
            network: DynamicsNetwork::new(grid, arch),
            optimizer: Adam::new(
                training.learning_rate,
                training.beta1,
                training.beta2,
                training.adam_eps,
            ),
            prior: BeliefGrid::random(grid.width, grid.height, grid.n_state),
            state: RecurrentState::random(arch.hidden_dim),
            likelihood: vec![0.0; cells * grid.n_state],
            posterior: vec![0.0; cells * grid.n_state],
        })
    }

    /// The prior belief the next `step` will fuse against.
    #[must_use]
    pub fn prior(&self) -> &BeliefGrid {
        &self.prior
    }

    /// The carried recurrent state.
    #[must_use]
    pub fn recurrent_state(&self) -> &RecurrentState {
        &self.state
    }

    /// Replaces the prior belief.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::ShapeMismatch`] if the grid dimensions differ.
    pub fn set_prior(&mut self, prior: BeliefGrid) -> FilterResult<()> {
        let expected = self.grid.cells() * self.grid.n_state;
        if prior.data().len() != expected {
            return Err(FilterError::shape("prior", expected, prior.data().len()));
        }
        self.prior = prior;
        Ok(())
    }

    /// Re-randomizes the prior and the recurrent state, as at construction.
    pub fn reset(&mut self) {
        self.prior = BeliefGrid::random(self.grid.width, self.grid.height, self.grid.n_state);
        self.state.reset();
    }

    /// The current row-softmaxed observation matrix.
    #[must_use]
    pub fn observation_matrix(&self) -> ObservationMatrix {
        self.network.observation_matrix()
    }

    /// One inference step: fuse, blend by mask, advance the recurrent state,
    /// decode the next prior.
    ///
    /// Returns the masked blend of prior (unsensed cells) and fused
    /// posterior (sensed cells); the decoded next prior is internal state,
    /// distinct from the return value.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::ShapeMismatch`] if `obs` or `mask` is
    /// mis-sized.
    pub fn step(&mut self, obs: &[f32], mask: &[f32]) -> FilterResult<BeliefGrid> {
        let cells = self.grid.cells();
        let (n_state, n_obs) = (self.grid.n_state, self.grid.n_obs);
        if obs.len() != cells * n_obs {
            return Err(FilterError::shape("observation", cells * n_obs, obs.len()));
        }
        if mask.len() != cells {
            return Err(FilterError::shape("mask", cells, mask.len()));
        }

        // Likelihood fusion against the current prior.
        let observation = self.network.observation_matrix();
        for (cell, y) in obs.chunks(n_obs).enumerate() {
            let out = &mut self.likelihood[cell * n_state..(cell + 1) * n_state];
            observation.likelihood_into(y, out);
        }
        let informative = fuse_grid(self.prior.data(), &self.likelihood, &mut self.posterior, n_state);
        tracing::trace!(informative_cells = informative, "likelihood fusion");

        // Masked blend: unsensed cells keep the prior untouched.
        let mut estimate = vec![0.0_f32; cells * n_state];
        for cell in 0..cells {
            let m = mask[cell];
            for s in 0..n_state {
                let idx = cell * n_state + s;
                estimate[idx] =
                    self.prior.data()[idx] * (1.0 - m) + self.posterior[idx] * m;
            }
        }

        // Learned transition: encode, advance the recurrent state, decode
        // the next prior.
        let feature = self.network.encode(obs);
        self.state.hidden = self.network.gru.step(&feature, &self.state.hidden);
        let probs = self.network.decode(&self.state.hidden);
        let next_prior = planes_to_cells(&probs, n_state, self.grid.height, self.grid.width);
        self.prior.data_mut().copy_from_slice(&next_prior);

        BeliefGrid::from_data(self.grid.width, self.grid.height, n_state, estimate)
    }

    /// One training update: sample windows, run them forward from fresh
    /// random hidden states, backpropagate the masked one-step-ahead loss
    /// through the whole window, and apply a single joint Adam step.
    ///
    /// A batch whose target masks are all zero carries no training signal:
    /// the prediction loss is 0 and only the (possibly disabled) entropy
    /// term can contribute. Non-finite losses are returned as-is.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidConfig`] if `n_window < 2` or
    /// `n_batch == 0`, [`FilterError::InsufficientHistory`] if the memory is
    /// too short, and [`FilterError::ShapeMismatch`] if a sampled window
    /// does not match the configured grid.
    pub fn update<M: TrajectoryMemory + ?Sized>(
        &mut self,
        memory: &mut M,
        n_batch: usize,
        n_window: usize,
    ) -> FilterResult<TrainingLosses> {
        if n_window < 2 {
            return Err(FilterError::InvalidConfig(
                "n_window must be at least 2 for one-step-ahead scoring".into(),
            ));
        }
        if n_batch == 0 {
            return Err(FilterError::InvalidConfig("n_batch must be positive".into()));
        }

        let windows = memory.sample(n_batch, n_window)?;
        self.validate_windows(&windows, n_window)?;

        // Each window is an independent episode: fresh random initial state.
        let h0s: Vec<Vec<f32>> = (0..windows.len())
            .map(|_| RecurrentState::random(self.network.arch().hidden_dim).hidden)
            .collect();

        let pass = self.network.forward_windows(&windows, &h0s);
        let grads = self.network.backward_windows(
            &windows,
            &pass,
            self.training.entropy_term_enabled,
            self.training.entropy_weight,
        );
        self.network.apply_gradients(&grads, &mut self.optimizer);

        let total = if self.training.entropy_term_enabled {
            pass.prediction + self.training.entropy_weight * pass.entropy
        } else {
            pass.prediction
        };
        tracing::debug!(
            total,
            prediction = pass.prediction,
            entropy = pass.entropy,
            step = self.optimizer.timestep(),
            "dynamics update"
        );

        Ok(TrainingLosses {
            total,
            prediction: pass.prediction,
            entropy: pass.entropy,
            observation_matrix: self.network.observation_matrix(),
        })
    }

    fn validate_windows(&self, windows: &[TrajectoryWindow], n_window: usize) -> FilterResult<()> {
        let cells = self.grid.cells();
        for window in windows {
            if window.len() != n_window
                || window.states.len() != n_window
                || window.masks.len() != n_window
            {
                return Err(FilterError::shape("window length", n_window, window.len()));
            }
            for t in 0..n_window {
                if window.observations[t].len() != cells * self.grid.n_obs {
                    return Err(FilterError::shape(
                        "window observation",
                        cells * self.grid.n_obs,
                        window.observations[t].len(),
                    ));
                }
                if window.states[t].len() != cells * self.grid.n_state {
                    return Err(FilterError::shape(
                        "window state",
                        cells * self.grid.n_state,
                        window.states[t].len(),
                    ));
                }
                if window.masks[t].len() != cells {
                    return Err(FilterError::shape("window mask", cells, window.masks[t].len()));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn network(&self) -> &DynamicsNetwork {
        &self.network
    }

    pub(crate) fn network_mut(&mut self) -> &mut DynamicsNetwork {
        &mut self.network
    }
}
