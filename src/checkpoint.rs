//! Serializable parameter sets for the learned filter.
//!
//! A [`ParameterSet`] is a plain-data snapshot of every learnable tensor in
//! the dynamics network, tagged with the grid and architecture it was trained
//! for. It serializes through serde, so callers choose the format and the
//! storage; this crate performs no file I/O. Loading validates the whole set
//! against the receiving network before touching any tensor, so a rejected
//! load leaves the network exactly as it was.

use serde::{Deserialize, Serialize};

use crate::config::{DynamicsConfig, GridConfig};
use crate::dynamics::{DynamicsNetwork, LearnedDynamicsFilter, PARAM_NAMES};
use crate::error::{FilterError, FilterResult};

/// Format version written into every exported set.
pub const PARAMETER_SET_VERSION: u32 = 1;

/// One named tensor: shape plus flat row-major data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    /// Stable tensor name.
    pub name: String,
    /// Tensor shape.
    pub shape: Vec<usize>,
    /// Flat row-major values; length is the product of `shape`.
    pub data: Vec<f32>,
}

/// Snapshot of all learnable parameters of a [`LearnedDynamicsFilter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Format version, [`PARAMETER_SET_VERSION`] when exported by this
    /// crate.
    pub version: u32,
    /// Grid the network was built for.
    pub grid: GridConfig,
    /// Network architecture.
    pub dynamics: DynamicsConfig,
    /// Every learnable tensor, in a stable order.
    pub tensors: Vec<NamedTensor>,
}

impl ParameterSet {
    pub(crate) fn from_network(net: &DynamicsNetwork) -> Self {
        let tensors = PARAM_NAMES
            .iter()
            .zip(net.param_shapes())
            .zip(net.param_slots())
            .map(|((name, shape), data)| NamedTensor {
                name: (*name).to_string(),
                shape,
                data: data.clone(),
            })
            .collect();
        Self {
            version: PARAMETER_SET_VERSION,
            grid: *net.grid(),
            dynamics: *net.arch(),
            tensors,
        }
    }

    pub(crate) fn apply_to_network(&self, net: &mut DynamicsNetwork) -> FilterResult<()> {
        if self.version != PARAMETER_SET_VERSION {
            return Err(FilterError::IncompatibleParameters {
                name: "version".into(),
                expected: vec![PARAMETER_SET_VERSION as usize],
                actual: vec![self.version as usize],
            });
        }
        let grid = *net.grid();
        if self.grid != grid {
            return Err(FilterError::IncompatibleParameters {
                name: "grid".into(),
                expected: vec![grid.width, grid.height, grid.n_state, grid.n_obs],
                actual: vec![
                    self.grid.width,
                    self.grid.height,
                    self.grid.n_state,
                    self.grid.n_obs,
                ],
            });
        }
        if self.tensors.len() != PARAM_NAMES.len() {
            return Err(FilterError::IncompatibleParameters {
                name: "tensor count".into(),
                expected: vec![PARAM_NAMES.len()],
                actual: vec![self.tensors.len()],
            });
        }

        // Validate everything before mutating anything.
        let shapes = net.param_shapes();
        for ((tensor, name), shape) in self.tensors.iter().zip(PARAM_NAMES).zip(shapes.iter()) {
            let elements: usize = shape.iter().product();
            if tensor.name != name || tensor.shape != *shape || tensor.data.len() != elements {
                return Err(FilterError::IncompatibleParameters {
                    name: name.to_string(),
                    expected: shape.clone(),
                    actual: tensor.shape.clone(),
                });
            }
        }

        for (param, tensor) in net.param_slots_mut().into_iter().zip(self.tensors.iter()) {
            param.copy_from_slice(&tensor.data);
        }
        Ok(())
    }
}

impl LearnedDynamicsFilter {
    /// Snapshots every learnable tensor into a serializable set.
    #[must_use]
    pub fn export_parameters(&self) -> ParameterSet {
        ParameterSet::from_network(self.network())
    }

    /// Replaces every learnable tensor from a previously exported set.
    ///
    /// Optimizer moments and the recurrent state are not part of the set;
    /// training resumes with fresh moments.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::IncompatibleParameters`] if the set's version,
    /// grid, tensor names, or tensor shapes do not match this filter. The
    /// filter is unchanged when an error is returned.
    pub fn import_parameters(&mut self, set: &ParameterSet) -> FilterResult<()> {
        set.apply_to_network(self.network_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;

    fn make_filter() -> LearnedDynamicsFilter {
        let grid = GridConfig::new(3, 3, 2, 2);
        let arch = DynamicsConfig {
            encoding_dim: 4,
            hidden_dim: 4,
            encoder_channels: 2,
            decoder_channels: 2,
        };
        LearnedDynamicsFilter::new(grid, arch, TrainingConfig::default()).unwrap()
    }

    #[test]
    fn test_export_names_and_shapes() {
        let set = make_filter().export_parameters();
        assert_eq!(set.version, PARAMETER_SET_VERSION);
        assert_eq!(set.tensors.len(), PARAM_NAMES.len());
        for (tensor, name) in set.tensors.iter().zip(PARAM_NAMES) {
            assert_eq!(tensor.name, name);
            let elements: usize = tensor.shape.iter().product();
            assert_eq!(tensor.data.len(), elements);
        }
    }

    #[test]
    fn test_serde_roundtrip_transfers_parameters() {
        let source = make_filter();
        let json = serde_json::to_string(&source.export_parameters()).unwrap();
        let set: ParameterSet = serde_json::from_str(&json).unwrap();

        let mut target = make_filter();
        target.import_parameters(&set).unwrap();
        assert_eq!(target.export_parameters(), source.export_parameters());
        // Behavior transfers with the parameters.
        assert_eq!(
            target.observation_matrix().as_slice(),
            source.observation_matrix().as_slice()
        );
    }

    #[test]
    fn test_import_rejects_grid_mismatch() {
        let set = make_filter().export_parameters();
        let other_grid = GridConfig::new(4, 4, 2, 2);
        let arch = DynamicsConfig {
            encoding_dim: 4,
            hidden_dim: 4,
            encoder_channels: 2,
            decoder_channels: 2,
        };
        let mut target =
            LearnedDynamicsFilter::new(other_grid, arch, TrainingConfig::default()).unwrap();
        assert!(matches!(
            target.import_parameters(&set),
            Err(FilterError::IncompatibleParameters { .. })
        ));
    }

    #[test]
    fn test_import_rejects_bad_version() {
        let mut set = make_filter().export_parameters();
        set.version = 99;
        let mut target = make_filter();
        assert!(matches!(
            target.import_parameters(&set),
            Err(FilterError::IncompatibleParameters { name, .. }) if name == "version"
        ));
    }

    #[test]
    fn test_failed_import_leaves_filter_unchanged() {
        let mut set = make_filter().export_parameters();
        // Corrupt one tensor's shape.
        set.tensors[5].shape = vec![1, 1];
        let mut target = make_filter();
        let before = target.export_parameters();
        assert!(target.import_parameters(&set).is_err());
        assert_eq!(target.export_parameters(), before);
    }
}
