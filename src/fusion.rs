//! The shared likelihood-fusion step (Bayes' rule numerator and normalizer).
//!
//! Both filter variants perform the identical fusion
//! `posterior = (likelihood ⊙ prior) / sum(likelihood ⊙ prior)` per cell and
//! differ only in their transition strategy, so the fusion lives here once.
//!
//! Degenerate-cell policy: when the normalizer is non-finite or below
//! [`EPS`], the observation carried no usable evidence for that cell and the
//! prior is retained unchanged. Any non-finite quotient entries are zeroed.
//! This keeps every cell a valid distribution under adversarial inputs
//! (all-zero observations included) and is a recovery policy, never an error.

/// Epsilon used to floor Bayes normalizers and log arguments.
pub const EPS: f32 = 1e-10;

/// Fuses one cell's prior with an observation likelihood.
///
/// Writes the posterior into `out` and returns `true` if the cell carried
/// evidence, or copies the prior into `out` and returns `false` if the fused
/// mass was degenerate.
pub(crate) fn fuse_cell(prior: &[f32], likelihood: &[f32], out: &mut [f32]) -> bool {
    debug_assert_eq!(prior.len(), likelihood.len());
    debug_assert_eq!(prior.len(), out.len());

    let mut mass = 0.0_f32;
    for ((o, &p), &l) in out.iter_mut().zip(prior.iter()).zip(likelihood.iter()) {
        *o = l * p;
        mass += *o;
    }

    if !mass.is_finite() || mass < EPS {
        out.copy_from_slice(prior);
        return false;
    }

    let inv = 1.0 / mass;
    for o in out.iter_mut() {
        *o *= inv;
        if !o.is_finite() {
            *o = 0.0;
        }
    }
    true
}

/// Fuses a whole grid: `n_state` entries per cell in both buffers.
///
/// `likelihood` and `prior` are cell-major; the posterior is written over
/// `out`. Returns the number of cells that carried evidence.
pub(crate) fn fuse_grid(prior: &[f32], likelihood: &[f32], out: &mut [f32], n_state: usize) -> usize {
    let mut informative = 0;
    for ((p, l), o) in prior
        .chunks(n_state)
        .zip(likelihood.chunks(n_state))
        .zip(out.chunks_mut(n_state))
    {
        if fuse_cell(p, l, o) {
            informative += 1;
        }
    }
    informative
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuse_cell_bayes_rule() {
        let prior = [0.5, 0.25, 0.25];
        let likelihood = [0.8, 0.1, 0.1];
        let mut out = [0.0; 3];
        assert!(fuse_cell(&prior, &likelihood, &mut out));
        let norm = 0.5 * 0.8 + 0.25 * 0.1 + 0.25 * 0.1;
        assert!((out[0] - 0.4 / norm).abs() < 1e-6);
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_fuse_cell_zero_likelihood_keeps_prior() {
        let prior = [0.2, 0.3, 0.5];
        let likelihood = [0.0, 0.0, 0.0];
        let mut out = [9.0; 3];
        assert!(!fuse_cell(&prior, &likelihood, &mut out));
        assert_eq!(out, prior);
    }

    #[test]
    fn test_fuse_cell_nan_likelihood_keeps_prior() {
        let prior = [0.5, 0.5];
        let likelihood = [f32::NAN, 1.0];
        let mut out = [0.0; 2];
        assert!(!fuse_cell(&prior, &likelihood, &mut out));
        assert_eq!(out, prior);
    }

    #[test]
    fn test_fuse_grid_counts_informative_cells() {
        let prior = [0.5, 0.5, 0.5, 0.5];
        let likelihood = [1.0, 0.0, 0.0, 0.0];
        let mut out = [0.0; 4];
        // First cell informative, second degenerate.
        assert_eq!(fuse_grid(&prior, &likelihood, &mut out, 2), 1);
        assert_eq!(&out[..2], &[1.0, 0.0]);
        assert_eq!(&out[2..], &[0.5, 0.5]);
    }

    #[test]
    fn test_fuse_cell_one_hot_posterior() {
        // Uniform prior, identity likelihood on class 0 -> one-hot posterior.
        let prior = [1.0 / 3.0; 3];
        let likelihood = [1.0, 0.0, 0.0];
        let mut out = [0.0; 3];
        assert!(fuse_cell(&prior, &likelihood, &mut out));
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], 0.0);
    }
}
