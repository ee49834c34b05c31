//! Hand-rolled layer math for the learned dynamics network.
//!
//! Everything here operates on flat `f32` slices with explicit shapes: no
//! tensor framework, no hidden allocation strategy, no device. Each layer
//! provides a forward pass and a backward pass that returns fresh gradient
//! buffers; callers accumulate them with [`axpy`]. The backward passes are
//! verified against central finite differences in the test module, which is
//! the only trustworthy way to keep manual gradients honest.
//!
//! # Layouts
//!
//! - Cell-major grids: `data[cell * channels + c]`, `cell = y * width + x`
//!   (the belief/observation layout used at the API surface).
//! - Channel-major planes: `data[c * h * w + y * w + x]` (the convolution
//!   layout used internally).
//! - Conv2d weights: `[out_c, in_c, k, k]` row-major.
//! - ConvTranspose2d weights: `[in_c, out_c, k, k]` row-major.
//! - Linear weights: `[out_dim, in_dim]` row-major.

/// Adds `src` into `dst` elementwise. Gradient accumulation helper.
pub(crate) fn axpy(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d += s;
    }
}

/// Reorders a cell-major grid into channel-major planes.
pub(crate) fn cells_to_planes(src: &[f32], channels: usize, h: usize, w: usize) -> Vec<f32> {
    let cells = h * w;
    debug_assert_eq!(src.len(), cells * channels);
    let mut out = vec![0.0_f32; src.len()];
    for cell in 0..cells {
        for c in 0..channels {
            out[c * cells + cell] = src[cell * channels + c];
        }
    }
    out
}

/// Reorders channel-major planes into a cell-major grid.
pub(crate) fn planes_to_cells(src: &[f32], channels: usize, h: usize, w: usize) -> Vec<f32> {
    let cells = h * w;
    debug_assert_eq!(src.len(), cells * channels);
    let mut out = vec![0.0_f32; src.len()];
    for cell in 0..cells {
        for c in 0..channels {
            out[cell * channels + c] = src[c * cells + cell];
        }
    }
    out
}

// ─── Linear ─────────────────────────────────────────────────────────────────

/// `y = W·x + b` with `W` stored `[out_dim, in_dim]` row-major.
pub(crate) fn linear_forward(
    w: &[f32],
    b: &[f32],
    x: &[f32],
    out_dim: usize,
    in_dim: usize,
) -> Vec<f32> {
    debug_assert_eq!(w.len(), out_dim * in_dim);
    debug_assert_eq!(b.len(), out_dim);
    debug_assert_eq!(x.len(), in_dim);
    let mut y = vec![0.0_f32; out_dim];
    for i in 0..out_dim {
        let row = &w[i * in_dim..(i + 1) * in_dim];
        y[i] = row.iter().zip(x.iter()).map(|(&wv, &xv)| wv * xv).sum::<f32>() + b[i];
    }
    y
}

/// Backward of [`linear_forward`]: returns `(dW, db, dx)`.
pub(crate) fn linear_backward(
    w: &[f32],
    x: &[f32],
    dy: &[f32],
    out_dim: usize,
    in_dim: usize,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let mut dw = vec![0.0_f32; out_dim * in_dim];
    let mut dx = vec![0.0_f32; in_dim];
    for i in 0..out_dim {
        let g = dy[i];
        let row = &w[i * in_dim..(i + 1) * in_dim];
        let drow = &mut dw[i * in_dim..(i + 1) * in_dim];
        for j in 0..in_dim {
            drow[j] = g * x[j];
            dx[j] += row[j] * g;
        }
    }
    (dw, dy.to_vec(), dx)
}

// ─── ReLU ───────────────────────────────────────────────────────────────────

/// Elementwise `max(x, 0)`.
pub(crate) fn relu_forward(x: &[f32]) -> Vec<f32> {
    x.iter().map(|&v| v.max(0.0)).collect()
}

/// Backward of ReLU given the pre-activation values.
pub(crate) fn relu_backward(pre: &[f32], dy: &[f32]) -> Vec<f32> {
    pre.iter()
        .zip(dy.iter())
        .map(|(&x, &g)| if x > 0.0 { g } else { 0.0 })
        .collect()
}

// ─── Conv2d ─────────────────────────────────────────────────────────────────

/// Shape bundle for a square-kernel 2-D convolution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConvShape {
    pub in_c: usize,
    pub out_c: usize,
    pub k: usize,
    pub stride: usize,
    pub pad: usize,
    pub h: usize,
    pub w: usize,
}

impl ConvShape {
    /// Output height of the forward convolution.
    pub fn out_h(&self) -> usize {
        (self.h + 2 * self.pad - self.k) / self.stride + 1
    }

    /// Output width of the forward convolution.
    pub fn out_w(&self) -> usize {
        (self.w + 2 * self.pad - self.k) / self.stride + 1
    }
}

/// Zero-padded strided 2-D convolution over channel-major planes.
pub(crate) fn conv2d_forward(w: &[f32], b: &[f32], x: &[f32], s: ConvShape) -> Vec<f32> {
    let (oh, ow) = (s.out_h(), s.out_w());
    debug_assert_eq!(w.len(), s.out_c * s.in_c * s.k * s.k);
    debug_assert_eq!(b.len(), s.out_c);
    debug_assert_eq!(x.len(), s.in_c * s.h * s.w);
    let mut y = vec![0.0_f32; s.out_c * oh * ow];
    for o in 0..s.out_c {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut acc = b[o];
                for i in 0..s.in_c {
                    for ky in 0..s.k {
                        let iy = (oy * s.stride + ky) as isize - s.pad as isize;
                        if iy < 0 || iy >= s.h as isize {
                            continue;
                        }
                        for kx in 0..s.k {
                            let ix = (ox * s.stride + kx) as isize - s.pad as isize;
                            if ix < 0 || ix >= s.w as isize {
                                continue;
                            }
                            let wv = w[((o * s.in_c + i) * s.k + ky) * s.k + kx];
                            let xv = x[i * s.h * s.w + iy as usize * s.w + ix as usize];
                            acc += wv * xv;
                        }
                    }
                }
                y[o * oh * ow + oy * ow + ox] = acc;
            }
        }
    }
    y
}

/// Backward of [`conv2d_forward`]: returns `(dW, db, dx)`.
pub(crate) fn conv2d_backward(
    w: &[f32],
    x: &[f32],
    dy: &[f32],
    s: ConvShape,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let (oh, ow) = (s.out_h(), s.out_w());
    debug_assert_eq!(dy.len(), s.out_c * oh * ow);
    let mut dw = vec![0.0_f32; s.out_c * s.in_c * s.k * s.k];
    let mut db = vec![0.0_f32; s.out_c];
    let mut dx = vec![0.0_f32; s.in_c * s.h * s.w];
    for o in 0..s.out_c {
        for oy in 0..oh {
            for ox in 0..ow {
                let g = dy[o * oh * ow + oy * ow + ox];
                if g == 0.0 {
                    continue;
                }
                db[o] += g;
                for i in 0..s.in_c {
                    for ky in 0..s.k {
                        let iy = (oy * s.stride + ky) as isize - s.pad as isize;
                        if iy < 0 || iy >= s.h as isize {
                            continue;
                        }
                        for kx in 0..s.k {
                            let ix = (ox * s.stride + kx) as isize - s.pad as isize;
                            if ix < 0 || ix >= s.w as isize {
                                continue;
                            }
                            let widx = ((o * s.in_c + i) * s.k + ky) * s.k + kx;
                            let xidx = i * s.h * s.w + iy as usize * s.w + ix as usize;
                            dw[widx] += g * x[xidx];
                            dx[xidx] += g * w[widx];
                        }
                    }
                }
            }
        }
    }
    (dw, db, dx)
}

// ─── ConvTranspose2d ────────────────────────────────────────────────────────

/// Shape bundle for a square-kernel 2-D transposed convolution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeconvShape {
    pub in_c: usize,
    pub out_c: usize,
    pub k: usize,
    pub stride: usize,
    pub h: usize,
    pub w: usize,
}

impl DeconvShape {
    /// Output height: `(h - 1) * stride + k` (no padding).
    pub fn out_h(&self) -> usize {
        (self.h - 1) * self.stride + self.k
    }

    /// Output width: `(w - 1) * stride + k` (no padding).
    pub fn out_w(&self) -> usize {
        (self.w - 1) * self.stride + self.k
    }
}

/// Transposed convolution (fractionally strided upsampling) over
/// channel-major planes. Weights are `[in_c, out_c, k, k]`.
pub(crate) fn conv_transpose2d_forward(
    w: &[f32],
    b: &[f32],
    x: &[f32],
    s: DeconvShape,
) -> Vec<f32> {
    let (oh, ow) = (s.out_h(), s.out_w());
    debug_assert_eq!(w.len(), s.in_c * s.out_c * s.k * s.k);
    debug_assert_eq!(b.len(), s.out_c);
    debug_assert_eq!(x.len(), s.in_c * s.h * s.w);
    let mut y = vec![0.0_f32; s.out_c * oh * ow];
    for o in 0..s.out_c {
        let plane = &mut y[o * oh * ow..(o + 1) * oh * ow];
        for v in plane.iter_mut() {
            *v = b[o];
        }
    }
    for i in 0..s.in_c {
        for iy in 0..s.h {
            for ix in 0..s.w {
                let xv = x[i * s.h * s.w + iy * s.w + ix];
                if xv == 0.0 {
                    continue;
                }
                for o in 0..s.out_c {
                    for ky in 0..s.k {
                        let oy = iy * s.stride + ky;
                        for kx in 0..s.k {
                            let ox = ix * s.stride + kx;
                            let wv = w[((i * s.out_c + o) * s.k + ky) * s.k + kx];
                            y[o * oh * ow + oy * ow + ox] += xv * wv;
                        }
                    }
                }
            }
        }
    }
    y
}

/// Backward of [`conv_transpose2d_forward`]: returns `(dW, db, dx)`.
pub(crate) fn conv_transpose2d_backward(
    w: &[f32],
    x: &[f32],
    dy: &[f32],
    s: DeconvShape,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let (oh, ow) = (s.out_h(), s.out_w());
    debug_assert_eq!(dy.len(), s.out_c * oh * ow);
    let mut dw = vec![0.0_f32; s.in_c * s.out_c * s.k * s.k];
    let mut db = vec![0.0_f32; s.out_c];
    let mut dx = vec![0.0_f32; s.in_c * s.h * s.w];
    for o in 0..s.out_c {
        let plane = &dy[o * oh * ow..(o + 1) * oh * ow];
        db[o] = plane.iter().sum();
    }
    for i in 0..s.in_c {
        for iy in 0..s.h {
            for ix in 0..s.w {
                let xv = x[i * s.h * s.w + iy * s.w + ix];
                let mut dxv = 0.0_f32;
                for o in 0..s.out_c {
                    for ky in 0..s.k {
                        let oy = iy * s.stride + ky;
                        for kx in 0..s.k {
                            let ox = ix * s.stride + kx;
                            let widx = ((i * s.out_c + o) * s.k + ky) * s.k + kx;
                            let g = dy[o * oh * ow + oy * ow + ox];
                            dw[widx] += xv * g;
                            dxv += w[widx] * g;
                        }
                    }
                }
                dx[i * s.h * s.w + iy * s.w + ix] = dxv;
            }
        }
    }
    (dw, db, dx)
}

// ─── Crop ───────────────────────────────────────────────────────────────────

/// Crops channel-major planes to the top-left `h x w` window.
pub(crate) fn crop_planes(
    src: &[f32],
    channels: usize,
    src_h: usize,
    src_w: usize,
    h: usize,
    w: usize,
) -> Vec<f32> {
    debug_assert!(src_h >= h && src_w >= w);
    let mut out = vec![0.0_f32; channels * h * w];
    for c in 0..channels {
        for y in 0..h {
            let src_row = c * src_h * src_w + y * src_w;
            let dst_row = c * h * w + y * w;
            out[dst_row..dst_row + w].copy_from_slice(&src[src_row..src_row + w]);
        }
    }
    out
}

/// Backward of [`crop_planes`]: scatters gradients back into the uncropped
/// shape, zero elsewhere.
pub(crate) fn crop_planes_backward(
    dy: &[f32],
    channels: usize,
    src_h: usize,
    src_w: usize,
    h: usize,
    w: usize,
) -> Vec<f32> {
    let mut out = vec![0.0_f32; channels * src_h * src_w];
    for c in 0..channels {
        for y in 0..h {
            let src_row = c * src_h * src_w + y * src_w;
            let dst_row = c * h * w + y * w;
            out[src_row..src_row + w].copy_from_slice(&dy[dst_row..dst_row + w]);
        }
    }
    out
}

// ─── Per-cell channel softmax ───────────────────────────────────────────────

/// Softmax across the channel axis at every spatial location of
/// channel-major planes (the per-cell state normalization of the decoder).
pub(crate) fn channel_softmax_forward(x: &[f32], channels: usize, cells: usize) -> Vec<f32> {
    debug_assert_eq!(x.len(), channels * cells);
    let mut y = vec![0.0_f32; x.len()];
    for cell in 0..cells {
        let mut max = f32::NEG_INFINITY;
        for c in 0..channels {
            max = max.max(x[c * cells + cell]);
        }
        let mut sum = 0.0;
        for c in 0..channels {
            let e = (x[c * cells + cell] - max).exp();
            y[c * cells + cell] = e;
            sum += e;
        }
        for c in 0..channels {
            y[c * cells + cell] /= sum;
        }
    }
    y
}

/// Backward of [`channel_softmax_forward`] given the softmax outputs `p`:
/// `dx_c = p_c * (dy_c - sum_c' dy_c' * p_c')` per cell.
pub(crate) fn channel_softmax_backward(
    p: &[f32],
    dy: &[f32],
    channels: usize,
    cells: usize,
) -> Vec<f32> {
    let mut dx = vec![0.0_f32; p.len()];
    for cell in 0..cells {
        let mut dot = 0.0_f32;
        for c in 0..channels {
            dot += dy[c * cells + cell] * p[c * cells + cell];
        }
        for c in 0..channels {
            let idx = c * cells + cell;
            dx[idx] = p[idx] * (dy[idx] - dot);
        }
    }
    dx
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const FD_EPS: f32 = 1e-3;
    const FD_TOL: f32 = 2e-2;

    fn random_vec(n: usize) -> Vec<f32> {
        let mut rng = rand::rng();
        (0..n).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    /// Relative-ish agreement check for finite-difference comparisons.
    fn assert_close(analytic: f32, numeric: f32) {
        let denom = analytic.abs().max(numeric.abs()).max(1.0);
        assert!(
            (analytic - numeric).abs() / denom < FD_TOL,
            "gradient mismatch: analytic {analytic}, numeric {numeric}"
        );
    }

    #[test]
    fn test_plane_cell_roundtrip() {
        let cells = random_vec(5 * 4 * 3);
        let planes = cells_to_planes(&cells, 3, 5, 4);
        let back = planes_to_cells(&planes, 3, 5, 4);
        assert_eq!(cells, back);
    }

    #[test]
    fn test_linear_known_values() {
        let w = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
        let b = vec![0.5, -0.5];
        let y = linear_forward(&w, &b, &[1.0, 1.0, 1.0], 2, 3);
        assert_eq!(y, vec![6.5, 14.5]);
    }

    #[test]
    fn test_linear_backward_finite_differences() {
        let (out_dim, in_dim) = (3, 4);
        let w = random_vec(out_dim * in_dim);
        let b = random_vec(out_dim);
        let x = random_vec(in_dim);
        let probe = random_vec(out_dim);

        // Scalar loss: probe · y.
        let loss = |w: &[f32], b: &[f32], x: &[f32]| -> f32 {
            linear_forward(w, b, x, out_dim, in_dim)
                .iter()
                .zip(probe.iter())
                .map(|(&y, &p)| y * p)
                .sum()
        };

        let (dw, db, dx) = linear_backward(&w, &x, &probe, out_dim, in_dim);

        for idx in 0..w.len() {
            let mut wp = w.clone();
            let mut wm = w.clone();
            wp[idx] += FD_EPS;
            wm[idx] -= FD_EPS;
            let numeric = (loss(&wp, &b, &x) - loss(&wm, &b, &x)) / (2.0 * FD_EPS);
            assert_close(dw[idx], numeric);
        }
        for idx in 0..b.len() {
            let mut bp = b.clone();
            let mut bm = b.clone();
            bp[idx] += FD_EPS;
            bm[idx] -= FD_EPS;
            let numeric = (loss(&w, &bp, &x) - loss(&w, &bm, &x)) / (2.0 * FD_EPS);
            assert_close(db[idx], numeric);
        }
        for idx in 0..x.len() {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[idx] += FD_EPS;
            xm[idx] -= FD_EPS;
            let numeric = (loss(&w, &b, &xp) - loss(&w, &b, &xm)) / (2.0 * FD_EPS);
            assert_close(dx[idx], numeric);
        }
    }

    #[test]
    fn test_conv2d_output_shape() {
        let s = ConvShape {
            in_c: 3,
            out_c: 8,
            k: 3,
            stride: 2,
            pad: 1,
            h: 5,
            w: 4,
        };
        assert_eq!(s.out_h(), 3);
        assert_eq!(s.out_w(), 2);
        let w = random_vec(s.out_c * s.in_c * 9);
        let b = random_vec(s.out_c);
        let x = random_vec(s.in_c * s.h * s.w);
        let y = conv2d_forward(&w, &b, &x, s);
        assert_eq!(y.len(), 8 * 3 * 2);
    }

    #[test]
    fn test_conv2d_identity_kernel_same_padding() {
        // 1x1 channel map, 3x3 kernel with center tap 1: identity.
        let s = ConvShape {
            in_c: 1,
            out_c: 1,
            k: 3,
            stride: 1,
            pad: 1,
            h: 3,
            w: 3,
        };
        let mut w = vec![0.0_f32; 9];
        w[4] = 1.0;
        let x = random_vec(9);
        let y = conv2d_forward(&w, &[0.0], &x, s);
        assert_eq!(y, x);
    }

    #[test]
    fn test_conv2d_backward_finite_differences() {
        let s = ConvShape {
            in_c: 2,
            out_c: 2,
            k: 3,
            stride: 2,
            pad: 1,
            h: 4,
            w: 4,
        };
        let w = random_vec(s.out_c * s.in_c * 9);
        let b = random_vec(s.out_c);
        let x = random_vec(s.in_c * s.h * s.w);
        let probe = random_vec(s.out_c * s.out_h() * s.out_w());

        let loss = |w: &[f32], x: &[f32]| -> f32 {
            conv2d_forward(w, &b, x, s)
                .iter()
                .zip(probe.iter())
                .map(|(&y, &p)| y * p)
                .sum()
        };

        let (dw, db, dx) = conv2d_backward(&w, &x, &probe, s);

        for idx in (0..w.len()).step_by(3) {
            let mut wp = w.clone();
            let mut wm = w.clone();
            wp[idx] += FD_EPS;
            wm[idx] -= FD_EPS;
            assert_close(dw[idx], (loss(&wp, &x) - loss(&wm, &x)) / (2.0 * FD_EPS));
        }
        for idx in 0..x.len() {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[idx] += FD_EPS;
            xm[idx] -= FD_EPS;
            assert_close(dx[idx], (loss(&w, &xp) - loss(&w, &xm)) / (2.0 * FD_EPS));
        }
        // Bias gradient is the probe sum per output channel.
        let (oh, ow) = (s.out_h(), s.out_w());
        for o in 0..s.out_c {
            let expected: f32 = probe[o * oh * ow..(o + 1) * oh * ow].iter().sum();
            assert_close(db[o], expected);
        }
    }

    #[test]
    fn test_deconv_output_shape() {
        let s = DeconvShape {
            in_c: 4,
            out_c: 3,
            k: 3,
            stride: 2,
            h: 2,
            w: 3,
        };
        assert_eq!(s.out_h(), 5);
        assert_eq!(s.out_w(), 7);
    }

    #[test]
    fn test_deconv_backward_finite_differences() {
        let s = DeconvShape {
            in_c: 2,
            out_c: 2,
            k: 3,
            stride: 2,
            h: 2,
            w: 2,
        };
        let w = random_vec(s.in_c * s.out_c * 9);
        let b = random_vec(s.out_c);
        let x = random_vec(s.in_c * s.h * s.w);
        let probe = random_vec(s.out_c * s.out_h() * s.out_w());

        let loss = |w: &[f32], x: &[f32]| -> f32 {
            conv_transpose2d_forward(w, &b, x, s)
                .iter()
                .zip(probe.iter())
                .map(|(&y, &p)| y * p)
                .sum()
        };

        let (dw, _db, dx) = conv_transpose2d_backward(&w, &x, &probe, s);

        for idx in (0..w.len()).step_by(2) {
            let mut wp = w.clone();
            let mut wm = w.clone();
            wp[idx] += FD_EPS;
            wm[idx] -= FD_EPS;
            assert_close(dw[idx], (loss(&wp, &x) - loss(&wm, &x)) / (2.0 * FD_EPS));
        }
        for idx in 0..x.len() {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[idx] += FD_EPS;
            xm[idx] -= FD_EPS;
            assert_close(dx[idx], (loss(&w, &xp) - loss(&w, &xm)) / (2.0 * FD_EPS));
        }
    }

    #[test]
    fn test_crop_and_scatter_roundtrip() {
        let src = random_vec(2 * 5 * 5);
        let cropped = crop_planes(&src, 2, 5, 5, 3, 4);
        assert_eq!(cropped.len(), 2 * 3 * 4);
        assert_eq!(cropped[0], src[0]);
        // (c=1, y=2, x=3) of the crop maps to (1, 2, 3) of the source.
        assert_eq!(cropped[1 * 12 + 2 * 4 + 3], src[1 * 25 + 2 * 5 + 3]);

        let scattered = crop_planes_backward(&cropped, 2, 5, 5, 3, 4);
        assert_eq!(scattered.len(), src.len());
        // Outside the crop window everything is zero.
        assert_eq!(scattered[4], 0.0); // (0, 0, 4)
        assert_eq!(scattered[2 * 25 - 1], 0.0); // (1, 4, 4)
        // Inside the window the gradient passes through.
        assert_eq!(scattered[1 * 25 + 2 * 5 + 3], cropped[1 * 12 + 2 * 4 + 3]);
    }

    #[test]
    fn test_channel_softmax_normalizes_every_cell() {
        let x = random_vec(3 * 6);
        let p = channel_softmax_forward(&x, 3, 6);
        for cell in 0..6 {
            let sum: f32 = (0..3).map(|c| p[c * 6 + cell]).sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_channel_softmax_backward_finite_differences() {
        let (channels, cells) = (3, 4);
        let x = random_vec(channels * cells);
        let probe = random_vec(channels * cells);

        let loss = |x: &[f32]| -> f32 {
            channel_softmax_forward(x, channels, cells)
                .iter()
                .zip(probe.iter())
                .map(|(&p, &g)| p * g)
                .sum()
        };

        let p = channel_softmax_forward(&x, channels, cells);
        let dx = channel_softmax_backward(&p, &probe, channels, cells);

        for idx in 0..x.len() {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[idx] += FD_EPS;
            xm[idx] -= FD_EPS;
            assert_close(dx[idx], (loss(&xp) - loss(&xm)) / (2.0 * FD_EPS));
        }
    }
}
