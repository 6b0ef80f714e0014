use algloop_linalg::{DenseLu, MinNormSvd};
use faer::{Mat, sparse::SymbolicSparseColMat};

use crate::{bounds::Bounds, jacobian::ColumnPartition};

/// Where a block is in its solve life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverPhase {
    /// Nominal, bounds and initial values are not yet known.
    #[default]
    Uninitialized,
    /// Start values are known; no solve has run yet.
    Initialized,
    /// Taking plain Newton steps.
    Iterating,
    /// Taking regularized steps after a singular Jacobian.
    Regularizing,
    /// Taking minimum-norm steps after repeated singular Jacobians.
    MinimumNorm,
    /// Taking steepest-descent steps.
    SteepestDescent,
    /// The last solve met the exit criterion.
    Converged,
    /// The last solve failed.
    Failed,
}

/// How to recover when the Jacobian cannot be factorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SingularMode {
    /// Solve the regularized normal equations.
    #[default]
    Regularization,
    /// Solve in the least-squares, minimum-norm sense.
    MinimumNorm,
}

/// The factorization used for the next linear solve.
#[derive(Debug, Clone, Default)]
pub enum Factorization {
    /// Nothing factorized yet.
    #[default]
    None,
    /// LU of the Jacobian.
    Lu(DenseLu),
    /// LU of `JᵀW²J + diag(uscale²)`.
    Regularized(DenseLu),
    /// SVD of the Jacobian.
    MinimumNorm(MinNormSvd),
    /// Singular 1×1 Jacobian; steps come from a sign heuristic.
    Scalar,
}

impl Factorization {
    /// Is this one of the singular recovery paths?
    pub fn is_recovery(&self) -> bool {
        matches!(
            self,
            Factorization::Regularized(_) | Factorization::MinimumNorm(_) | Factorization::Scalar
        )
    }
}

/// One-shot and persistent flags of a solver state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateFlags {
    /// `jacobian` holds a usable Jacobian.
    pub jacobian_current: bool,
    /// The last factorization attempt failed.
    pub singular: bool,
    /// Residual scales must be recomputed before the next solve.
    pub force_rescaling: bool,
    /// The next iteration must evaluate a fresh Jacobian.
    pub force_new_jacobian: bool,
    /// Iterate with steepest-descent steps: set when a projected Newton step
    /// stopped being a descent direction, cleared once no bound is active.
    pub use_steepest_descent: bool,
    /// Some residual scale needed clamping.
    pub poorly_scaled: bool,
}

/// Per-block Newton workspace. Owned by exactly one block.
#[derive(Debug, Clone)]
pub struct NewtonSolverState {
    pub(crate) jacobian: Mat<f64>,
    pub(crate) factorization: Factorization,
    pub(crate) uscale: Vec<f64>,
    pub(crate) fscale: Vec<f64>,
    pub(crate) bounds: Bounds,
    pub(crate) last_residual: Vec<f64>,
    pub(crate) last_step: Vec<f64>,
    /// `last_step`/`last_residual` belong to the current attempt.
    pub(crate) history_valid: bool,
    pub(crate) flags: StateFlags,
    /// Set by the scaling engine when the scaled Jacobian is too ill-conditioned to use as is.
    pub(crate) premarked_singular: bool,
    pub(crate) singular_mode: SingularMode,
    pub(crate) jacobian_generation: u64,
    pub(crate) factorized_generation: Option<u64>,
    pub(crate) iterations_since_jacobian: usize,
    pub(crate) pattern: Option<SymbolicSparseColMat<usize>>,
    pub(crate) partition: Option<ColumnPartition>,
    /// `jacobian` was evaluated from scratch at the current iterate.
    pub(crate) jacobian_at_iterate: bool,
    pub(crate) last_fnorm: f64,
    pub(crate) first_newton_solve: bool,
    pub(crate) second_solve: bool,
    pub(crate) jacobian_mismatches: usize,
    pub(crate) checkpoint: Option<Checkpoint>,
    pub(crate) initialized: bool,
}

impl NewtonSolverState {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            jacobian: Mat::zeros(n, n),
            factorization: Factorization::None,
            uscale: vec![1.0; n],
            fscale: vec![1.0; n],
            bounds: Bounds::default(),
            last_residual: vec![0.0; n],
            last_step: vec![0.0; n],
            history_valid: false,
            flags: StateFlags::default(),
            premarked_singular: false,
            singular_mode: SingularMode::default(),
            jacobian_generation: 0,
            factorized_generation: None,
            iterations_since_jacobian: 0,
            pattern: None,
            partition: None,
            jacobian_at_iterate: false,
            last_fnorm: f64::INFINITY,
            first_newton_solve: false,
            second_solve: false,
            jacobian_mismatches: 0,
            checkpoint: None,
            initialized: false,
        }
    }

    /// The most recent Jacobian (possibly quasi-Newton updated).
    pub fn jacobian(&self) -> &Mat<f64> {
        &self.jacobian
    }

    /// The factorization the next step will use.
    pub fn factorization(&self) -> &Factorization {
        &self.factorization
    }

    /// Per-variable scale factors.
    pub fn variable_scales(&self) -> &[f64] {
        &self.uscale
    }

    /// Per-residual scale factors.
    pub fn residual_scales(&self) -> &[f64] {
        &self.fscale
    }

    /// Bound descriptors with their latest classification.
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Status flags.
    pub fn flags(&self) -> StateFlags {
        self.flags
    }

    /// Recovery mode used for the next singular Jacobian.
    pub fn singular_mode(&self) -> SingularMode {
        self.singular_mode
    }

    /// Snapshot saved by the last completed outer step.
    pub fn saved_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// The Jacobian changed; any factorization of the old one is stale.
    pub(crate) fn jacobian_changed(&mut self) {
        self.jacobian_generation += 1;
        self.flags.jacobian_current = true;
    }

    pub(crate) fn factorization_is_current(&self) -> bool {
        self.factorized_generation == Some(self.jacobian_generation)
            && !matches!(self.factorization, Factorization::None)
    }

    pub(crate) fn snapshot(&self, x: &[f64]) -> Checkpoint {
        Checkpoint {
            x: x.to_vec(),
            jacobian: self.jacobian.clone(),
            factorization: self.factorization.clone(),
            uscale: self.uscale.clone(),
            fscale: self.fscale.clone(),
            last_residual: self.last_residual.clone(),
            last_step: self.last_step.clone(),
            flags: self.flags,
            premarked_singular: self.premarked_singular,
            singular_mode: self.singular_mode,
            jacobian_generation: self.jacobian_generation,
            factorized_generation: self.factorized_generation,
            iterations_since_jacobian: self.iterations_since_jacobian,
            last_fnorm: self.last_fnorm,
        }
    }

    pub(crate) fn restore(&mut self, checkpoint: &Checkpoint) {
        self.jacobian = checkpoint.jacobian.clone();
        self.factorization = checkpoint.factorization.clone();
        self.uscale.clone_from(&checkpoint.uscale);
        self.fscale.clone_from(&checkpoint.fscale);
        self.last_residual.clone_from(&checkpoint.last_residual);
        self.last_step.clone_from(&checkpoint.last_step);
        self.flags = checkpoint.flags;
        self.premarked_singular = checkpoint.premarked_singular;
        self.singular_mode = checkpoint.singular_mode;
        self.jacobian_generation = checkpoint.jacobian_generation;
        self.factorized_generation = checkpoint.factorized_generation;
        self.iterations_since_jacobian = checkpoint.iterations_since_jacobian;
        self.last_fnorm = checkpoint.last_fnorm;
        self.jacobian_at_iterate = false;
        self.history_valid = false;
    }
}

/// Opaque copy of everything a solver state needs to resume exactly where it was.
///
/// Contains the Jacobian, the factorization in use (with its pivots, or the
/// regularized / SVD data), both scale vectors, the singularity flags and the
/// point the snapshot was taken at.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    x: Vec<f64>,
    jacobian: Mat<f64>,
    factorization: Factorization,
    uscale: Vec<f64>,
    fscale: Vec<f64>,
    last_residual: Vec<f64>,
    last_step: Vec<f64>,
    flags: StateFlags,
    premarked_singular: bool,
    singular_mode: SingularMode,
    jacobian_generation: u64,
    factorized_generation: Option<u64>,
    iterations_since_jacobian: usize,
    last_fnorm: f64,
}

impl Checkpoint {
    /// The iterate at the time of the snapshot.
    pub fn x(&self) -> &[f64] {
        &self.x
    }

    /// Residual scales at the time of the snapshot.
    pub fn residual_scales(&self) -> &[f64] {
        &self.fscale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_restores_everything() {
        let mut state = NewtonSolverState::new(2);
        state.fscale = vec![0.5, 2.0];
        state.flags.singular = true;
        state.singular_mode = SingularMode::MinimumNorm;
        state.jacobian[(0, 1)] = 3.0;
        state.jacobian_changed();
        let snapshot = state.snapshot(&[1.0, 2.0]);

        state.fscale = vec![1.0, 1.0];
        state.flags = StateFlags::default();
        state.singular_mode = SingularMode::Regularization;
        state.jacobian[(0, 1)] = 0.0;
        state.jacobian_changed();

        state.restore(&snapshot);
        assert_eq!(state.fscale, vec![0.5, 2.0]);
        assert!(state.flags.singular);
        assert_eq!(state.singular_mode, SingularMode::MinimumNorm);
        assert_eq!(state.jacobian[(0, 1)], 3.0);
        assert_eq!(state.jacobian_generation, 1);
        assert_eq!(snapshot.x(), &[1.0, 2.0]);
    }

    #[test]
    fn factorization_goes_stale_when_jacobian_changes() {
        let mut state = NewtonSolverState::new(1);
        state.factorization = Factorization::Scalar;
        state.factorized_generation = Some(state.jacobian_generation);
        assert!(state.factorization_is_current());
        state.jacobian_changed();
        assert!(!state.factorization_is_current());
    }
}
