//! Adam optimizer over flat parameter slices.
//!
//! First/second-moment adaptive gradient descent with bias correction.
//! Moment buffers are kept per parameter slot: the network registers each
//! learnable tensor under a stable slot index and calls
//! [`Adam::update_slot`] once per tensor per step, after a single
//! [`Adam::begin_step`] has advanced the shared timestep.

/// Adam optimizer state.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    /// Shared timestep for bias correction.
    t: u64,
    /// Per-slot first/second moment buffers, lazily sized.
    moments: Vec<Option<(Vec<f32>, Vec<f32>)>>,
}

impl Adam {
    /// Creates an optimizer with the given hyperparameters.
    #[must_use]
    pub fn new(lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            eps,
            t: 0,
            moments: Vec::new(),
        }
    }

    /// Advances the shared timestep. Call once before a round of
    /// [`Adam::update_slot`] calls.
    pub fn begin_step(&mut self) {
        self.t += 1;
    }

    /// Current timestep (number of completed `begin_step` calls).
    #[must_use]
    pub fn timestep(&self) -> u64 {
        self.t
    }

    /// Applies one Adam update to a single parameter tensor.
    ///
    /// `slot` must be stable across steps for moments to track the same
    /// tensor. Moment buffers are created on first use.
    pub fn update_slot(&mut self, slot: usize, param: &mut [f32], grad: &[f32]) {
        debug_assert_eq!(param.len(), grad.len());
        debug_assert!(self.t > 0, "begin_step must precede update_slot");

        if slot >= self.moments.len() {
            self.moments.resize(slot + 1, None);
        }
        let (m, v) = self.moments[slot]
            .get_or_insert_with(|| (vec![0.0; param.len()], vec![0.0; param.len()]));
        debug_assert_eq!(m.len(), param.len());

        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for i in 0..param.len() {
            let g = grad[i];
            m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
            v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = m[i] / bc1;
            let v_hat = v[i] / bc2;
            param[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}
