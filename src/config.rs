//! Configuration types for the grid belief filters.
//!
//! Configuration is plain data: serializable, validated at construction, and
//! passed explicitly into filter constructors. Nothing in this crate reads
//! process-wide state; two filters with different configurations can coexist
//! in the same process and be tested independently.
//!
//! # Example
//!
//! ```rust
//! use grid_belief_filter_rs::config::{DynamicsConfig, GridConfig, TrainingConfig};
//!
//! let grid = GridConfig::new(50, 50, 3, 3);
//! assert!(grid.validate().is_ok());
//!
//! let dynamics = DynamicsConfig::default();
//! let training = TrainingConfig::default();
//! assert!(dynamics.validate().is_ok());
//! assert!(training.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{FilterError, FilterResult};

/// Grid topology and arity shared by both filter variants.
///
/// | Parameter | Meaning |
/// |-----------|----------------------------------------------|
/// | `width`   | Grid width in cells                          |
/// | `height`  | Grid height in cells                         |
/// | `n_state` | Number of discrete hidden-state classes      |
/// | `n_obs`   | Number of observation channels per cell      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Grid width in cells.
    pub width: usize,
    /// Grid height in cells.
    pub height: usize,
    /// Number of discrete hidden-state classes per cell.
    pub n_state: usize,
    /// Number of observation channels per cell.
    pub n_obs: usize,
}

impl GridConfig {
    /// Creates a new grid configuration.
    #[must_use]
    pub fn new(width: usize, height: usize, n_state: usize, n_obs: usize) -> Self {
        Self {
            width,
            height,
            n_state,
            n_obs,
        }
    }

    /// Total number of cells.
    #[must_use]
    pub fn cells(&self) -> usize {
        self.width * self.height
    }

    /// Validates the configuration, rejecting degenerate grids.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidConfig`] if any dimension is zero.
    pub fn validate(&self) -> FilterResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(FilterError::InvalidConfig(format!(
                "grid dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.n_state == 0 {
            return Err(FilterError::InvalidConfig(
                "n_state must be positive".into(),
            ));
        }
        if self.n_obs == 0 {
            return Err(FilterError::InvalidConfig("n_obs must be positive".into()));
        }
        Ok(())
    }
}

/// Architecture of the learned dynamics network.
///
/// The encoder downsamples the observation grid once (3x3 conv, stride 2)
/// before projecting to `encoding_dim`; the decoder mirrors this with a
/// linear projection and one transposed convolution back up to at least the
/// grid size. Small defaults are intentional: the network summarizes a local
/// spatial process, not a vision benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicsConfig {
    /// Dimension of the encoded observation feature vector.
    #[serde(default = "default_encoding_dim")]
    pub encoding_dim: usize,

    /// Dimension of the GRU hidden state.
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    /// Channels produced by the encoder convolution.
    #[serde(default = "default_encoder_channels")]
    pub encoder_channels: usize,

    /// Channels consumed by the decoder transposed convolution.
    #[serde(default = "default_decoder_channels")]
    pub decoder_channels: usize,
}

fn default_encoding_dim() -> usize {
    32
}
fn default_hidden_dim() -> usize {
    64
}
fn default_encoder_channels() -> usize {
    8
}
fn default_decoder_channels() -> usize {
    8
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self {
            encoding_dim: default_encoding_dim(),
            hidden_dim: default_hidden_dim(),
            encoder_channels: default_encoder_channels(),
            decoder_channels: default_decoder_channels(),
        }
    }
}

impl DynamicsConfig {
    /// Validates the architecture parameters.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidConfig`] if any dimension is zero.
    pub fn validate(&self) -> FilterResult<()> {
        if self.encoding_dim == 0
            || self.hidden_dim == 0
            || self.encoder_channels == 0
            || self.decoder_channels == 0
        {
            return Err(FilterError::InvalidConfig(
                "dynamics dimensions must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Hyperparameters for the training path of the learned filter.
///
/// The entropy regularizer over predicted observations is always computed
/// and reported, but only contributes to the optimized objective when
/// `entropy_term_enabled` is set. It ships disabled; the flag exists so the
/// term can be A/B tested without code changes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Adam learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// Adam first-moment decay.
    #[serde(default = "default_beta1")]
    pub beta1: f32,

    /// Adam second-moment decay.
    #[serde(default = "default_beta2")]
    pub beta2: f32,

    /// Adam denominator epsilon.
    #[serde(default = "default_adam_eps")]
    pub adam_eps: f32,

    /// Whether the entropy regularizer is added into the optimized loss.
    #[serde(default)]
    pub entropy_term_enabled: bool,

    /// Weight applied to the entropy regularizer when it is enabled.
    #[serde(default = "default_entropy_weight")]
    pub entropy_weight: f32,
}

fn default_learning_rate() -> f32 {
    1e-3
}
fn default_beta1() -> f32 {
    0.9
}
fn default_beta2() -> f32 {
    0.999
}
fn default_adam_eps() -> f32 {
    1e-8
}
fn default_entropy_weight() -> f32 {
    1.0
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            adam_eps: default_adam_eps(),
            entropy_term_enabled: false,
            entropy_weight: default_entropy_weight(),
        }
    }
}

impl TrainingConfig {
    /// Validates the hyperparameters.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidConfig`] if the learning rate is not
    /// positive or a moment decay is outside `[0, 1)`.
    pub fn validate(&self) -> FilterResult<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(FilterError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(FilterError::InvalidConfig(format!(
                    "{name} must lie in [0, 1), got {beta}"
                )));
            }
        }
        if !self.adam_eps.is_finite() || self.adam_eps <= 0.0 {
            return Err(FilterError::InvalidConfig(
                "adam_eps must be positive".into(),
            ));
        }
        Ok(())
    }
}
