//! End-to-end property tests for both filter variants.
//!
//! These exercise the public API the way a driving application would: long
//! observation streams, adversarial inputs (all-zero observations, NaN
//! entries, partial masks), interleaved inference and training, and
//! parameter save/restore across filter instances.

use grid_belief_filter_rs::{
    BeliefGrid, DynamicsConfig, FilterError, FilterResult, FixedBayesianFilter, GridConfig,
    LearnedDynamicsFilter, ObservationMatrix, ReplayBuffer, TrainingConfig, TrajectoryMemory,
    TrajectoryWindow, TransitionKernel,
};

const TOLERANCE: f32 = 1e-5;

// ============================================================================
// Fixtures
// ============================================================================

fn small_grid() -> GridConfig {
    GridConfig::new(4, 4, 3, 3)
}

fn small_arch() -> DynamicsConfig {
    DynamicsConfig {
        encoding_dim: 8,
        hidden_dim: 8,
        encoder_channels: 4,
        decoder_channels: 4,
    }
}

fn learned_filter(grid: GridConfig) -> LearnedDynamicsFilter {
    LearnedDynamicsFilter::new(grid, small_arch(), TrainingConfig::default()).unwrap()
}

fn one_hot_obs(grid: &GridConfig, class: usize) -> Vec<f32> {
    let mut obs = vec![0.0_f32; grid.cells() * grid.n_obs];
    for cell in obs.chunks_mut(grid.n_obs) {
        cell[class] = 1.0;
    }
    obs
}

/// A moving one-hot pattern: cell `k` observes the class `(k + t) % n_obs`.
fn moving_obs(grid: &GridConfig, t: usize) -> Vec<f32> {
    let mut obs = vec![0.0_f32; grid.cells() * grid.n_obs];
    for (cell, chunk) in obs.chunks_mut(grid.n_obs).enumerate() {
        chunk[(cell + t) % grid.n_obs] = 1.0;
    }
    obs
}

/// Checkerboard sensor coverage, alternating with `t`.
fn checker_mask(grid: &GridConfig, t: usize) -> Vec<f32> {
    (0..grid.cells())
        .map(|cell| {
            let (x, y) = (cell % grid.width, cell / grid.width);
            if (x + y + t) % 2 == 0 {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Deterministic memory handing out the same scripted windows every time.
struct ScriptedMemory {
    windows: Vec<TrajectoryWindow>,
}

impl TrajectoryMemory for ScriptedMemory {
    fn sample(&mut self, n_batch: usize, n_window: usize) -> FilterResult<Vec<TrajectoryWindow>> {
        assert!(self.windows.iter().all(|w| w.len() == n_window));
        Ok((0..n_batch)
            .map(|i| self.windows[i % self.windows.len()].clone())
            .collect())
    }
}

// ============================================================================
// Fixed filter
// ============================================================================

#[test]
fn fixed_filter_belief_stays_normalized_under_adversarial_stream() {
    let grid = small_grid();
    let mut filter = FixedBayesianFilter::new(
        &grid,
        ObservationMatrix::from_rows(3, 3, vec![0.7, 0.2, 0.1, 0.15, 0.7, 0.15, 0.1, 0.2, 0.7])
            .unwrap(),
        TransitionKernel::diffusion(3, 0.8).unwrap(),
    )
    .unwrap();

    let mut nan_obs = one_hot_obs(&grid, 0);
    nan_obs[5] = f32::NAN;
    let streams: Vec<Vec<f32>> = vec![
        one_hot_obs(&grid, 0),
        vec![0.0; grid.cells() * grid.n_obs],
        nan_obs,
        moving_obs(&grid, 3),
        vec![1.0; grid.cells() * grid.n_obs],
    ];
    for obs in &streams {
        let belief = filter.bayesian_update(obs).unwrap();
        assert!(
            belief.is_normalized(TOLERANCE),
            "belief violated the distribution invariant"
        );
    }
}

#[test]
fn fixed_filter_zero_observation_with_identity_kernel_keeps_prior() {
    let grid = small_grid();
    let mut filter = FixedBayesianFilter::new(
        &grid,
        ObservationMatrix::identity(3),
        TransitionKernel::identity(3),
    )
    .unwrap();
    let seed = BeliefGrid::random(grid.width, grid.height, grid.n_state);
    filter.set_belief(seed.clone()).unwrap();

    let zeros = vec![0.0_f32; grid.cells() * grid.n_obs];
    let belief = filter.bayesian_update(&zeros).unwrap();
    for (a, b) in belief.data().iter().zip(seed.data().iter()) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn fixed_filter_diffusion_spreads_mass_to_neighbors() {
    // Seed all certainty into one corner cell and diffuse with no
    // observation evidence; neighbors gain mass on the seeded class.
    let grid = GridConfig::new(4, 4, 2, 2);
    let mut filter = FixedBayesianFilter::new(
        &grid,
        ObservationMatrix::identity(2),
        TransitionKernel::diffusion(2, 0.5).unwrap(),
    )
    .unwrap();
    let mut seed = BeliefGrid::uniform(4, 4, 2);
    seed.cell_mut(0).copy_from_slice(&[1.0, 0.0]);
    filter.set_belief(seed).unwrap();

    let zeros = vec![0.0_f32; grid.cells() * grid.n_obs];
    let belief = filter.bayesian_update(&zeros).unwrap();
    // Cell 1 (right neighbor) received some of the corner's class-0 mass.
    assert!(belief.cell(1)[0] > 0.5);
    // A far cell is untouched after one step of a 3x3 kernel.
    assert!((belief.cell(15)[0] - 0.5).abs() < 1e-6);
}

#[test]
fn fixed_filter_converges_on_persistent_evidence() {
    let grid = small_grid();
    let mut filter = FixedBayesianFilter::new(
        &grid,
        ObservationMatrix::from_rows(3, 3, vec![0.8, 0.1, 0.1, 0.1, 0.8, 0.1, 0.1, 0.1, 0.8])
            .unwrap(),
        TransitionKernel::identity(3),
    )
    .unwrap();
    let obs = one_hot_obs(&grid, 2);
    for _ in 0..8 {
        filter.bayesian_update(&obs).unwrap();
    }
    for cell in 0..grid.cells() {
        assert!(filter.belief().cell(cell)[2] > 0.99);
    }
}

// ============================================================================
// Learned filter: inference
// ============================================================================

#[test]
fn learned_filter_estimate_stays_normalized_under_adversarial_stream() {
    let grid = small_grid();
    let mut filter = learned_filter(grid);
    for t in 0..12 {
        let obs = if t % 4 == 3 {
            vec![0.0; grid.cells() * grid.n_obs]
        } else {
            moving_obs(&grid, t)
        };
        let mask = checker_mask(&grid, t);
        let estimate = filter.step(&obs, &mask).unwrap();
        assert!(estimate.is_normalized(TOLERANCE));
        assert!(filter.prior().is_normalized(TOLERANCE));
    }
}

#[test]
fn learned_filter_unsensed_cells_keep_prior_exactly() {
    let grid = small_grid();
    let mut filter = learned_filter(grid);
    let prior = filter.prior().clone();
    let mask = checker_mask(&grid, 0);
    let estimate = filter.step(&one_hot_obs(&grid, 1), &mask).unwrap();
    for cell in 0..grid.cells() {
        if mask[cell] == 0.0 {
            assert_eq!(estimate.cell(cell), prior.cell(cell));
        }
    }
}

#[test]
fn learned_filter_rejects_misshapen_inputs() {
    let grid = small_grid();
    let mut filter = learned_filter(grid);
    assert!(matches!(
        filter.step(&[0.5; 7], &[1.0; 16]),
        Err(FilterError::ShapeMismatch { .. })
    ));
}

// ============================================================================
// Learned filter: training
// ============================================================================

#[test]
fn learned_filter_update_needs_history() {
    let grid = small_grid();
    let mut filter = learned_filter(grid);
    let mut buffer = ReplayBuffer::new(32);
    buffer.push(
        one_hot_obs(&grid, 0),
        vec![1.0 / 3.0; grid.cells() * grid.n_state],
        vec![1.0; grid.cells()],
    );
    assert!(matches!(
        filter.update(&mut buffer, 2, 4),
        Err(FilterError::InsufficientHistory { .. })
    ));
}

#[test]
fn learned_filter_trains_through_trait_object() {
    let grid = small_grid();
    let mut filter = learned_filter(grid);
    let window = TrajectoryWindow {
        observations: (0..4).map(|t| moving_obs(&grid, t)).collect(),
        states: (0..4)
            .map(|_| vec![1.0 / 3.0; grid.cells() * grid.n_state])
            .collect(),
        masks: (0..4).map(|_| vec![1.0; grid.cells()]).collect(),
    };
    let mut memory = ScriptedMemory {
        windows: vec![window],
    };
    let memory: &mut dyn TrajectoryMemory = &mut memory;
    let losses = filter.update(memory, 2, 4).unwrap();
    assert!(losses.prediction.is_finite());
    assert!(losses.prediction > 0.0);
}

#[test]
fn learned_filter_online_loop_reduces_prediction_loss() {
    // Drive the filter the way an application would: simulate sweeps,
    // push frames, train once enough history exists.
    let grid = small_grid();
    let training = TrainingConfig {
        learning_rate: 5e-3,
        ..TrainingConfig::default()
    };
    let mut filter = LearnedDynamicsFilter::new(grid, small_arch(), training).unwrap();
    let mut buffer = ReplayBuffer::new(64);

    let state = vec![1.0 / 3.0; grid.cells() * grid.n_state];
    for _ in 0..16 {
        let obs = one_hot_obs(&grid, 1);
        let mask = vec![1.0; grid.cells()];
        filter.step(&obs, &mask).unwrap();
        buffer.push(obs, state.clone(), mask);
    }

    let mut losses = Vec::new();
    for _ in 0..80 {
        losses.push(filter.update(&mut buffer, 4, 4).unwrap().prediction);
    }
    let early: f32 = losses[..5].iter().sum::<f32>() / 5.0;
    let late: f32 = losses[losses.len() - 5..].iter().sum::<f32>() / 5.0;
    assert!(
        late < early,
        "prediction loss did not decrease: early {early}, late {late}"
    );
}

#[test]
fn learned_filter_reports_normalized_observation_matrix() {
    let grid = small_grid();
    let mut filter = learned_filter(grid);
    let mut buffer = ReplayBuffer::new(16);
    for t in 0..8 {
        buffer.push(
            moving_obs(&grid, t),
            vec![1.0 / 3.0; grid.cells() * grid.n_state],
            checker_mask(&grid, t),
        );
    }
    let losses = filter.update(&mut buffer, 2, 4).unwrap();
    for row in losses.observation_matrix.as_slice().chunks(grid.n_obs) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < TOLERANCE);
        assert!(row.iter().all(|&p| p >= 0.0));
    }
}

// ============================================================================
// Checkpointing
// ============================================================================

#[test]
fn parameters_transfer_between_filter_instances() {
    let grid = small_grid();
    let mut source = learned_filter(grid);
    let mut buffer = ReplayBuffer::new(16);
    for t in 0..8 {
        buffer.push(
            moving_obs(&grid, t),
            vec![1.0 / 3.0; grid.cells() * grid.n_state],
            vec![1.0; grid.cells()],
        );
    }
    // Train a little so the exported set is not just the init.
    for _ in 0..5 {
        source.update(&mut buffer, 2, 4).unwrap();
    }

    let json = serde_json::to_string(&source.export_parameters()).unwrap();
    let set = serde_json::from_str(&json).unwrap();

    let mut target = learned_filter(grid);
    target.import_parameters(&set).unwrap();
    assert_eq!(
        target.observation_matrix().as_slice(),
        source.observation_matrix().as_slice()
    );
    assert_eq!(target.export_parameters(), source.export_parameters());
}

#[test]
fn parameters_rejected_by_mismatched_filter() {
    let source = learned_filter(small_grid());
    let mut target = learned_filter(GridConfig::new(5, 5, 3, 3));
    assert!(matches!(
        target.import_parameters(&source.export_parameters()),
        Err(FilterError::IncompatibleParameters { .. })
    ));
}
