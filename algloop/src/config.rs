//! Solver options.
//!
//! The numeric defaults were tuned empirically on simulation models. They are
//! sensible starting points, not correctness guarantees, so every one of them
//! can be overridden.

/// How residual equations are scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum ResidualScaling {
    /// All residual scales are 1.
    None,
    /// Scales come from residual nominals supplied by the residual function.
    Manual,
    /// Scales come from Jacobian row magnitudes, on the first solve and after failures.
    #[default]
    Auto,
    /// Like `Auto`, but during the first Newton solve scales are tightened every iteration.
    AggressiveAuto,
    /// Like `AggressiveAuto`, but only when a fresh Jacobian is available.
    FullJacobianAuto,
    /// `Auto`, with nonzero manual residual nominals taking precedence.
    Hybrid,
}

impl ResidualScaling {
    pub(crate) fn is_auto(self) -> bool {
        matches!(
            self,
            Self::Auto | Self::AggressiveAuto | Self::FullJacobianAuto | Self::Hybrid
        )
    }
}

/// How iteration variables are scaled.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum VariableScaling {
    /// All variable scales are 1.
    None,
    /// `1 / max(|nominal|, tol)`.
    #[default]
    Nominal,
    /// `1 / |v_j|` for the given magnitudes.
    Manual(Vec<f64>),
}

/// How the Jacobian is computed when a fresh one is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum JacobianMode {
    /// One-sided differences.
    #[default]
    ForwardDifference,
    /// Central differences for every column.
    CentralDifference,
    /// Central differences for columns whose variable sits near a bound.
    CentralAtBound,
    /// Central differences near a bound or near zero.
    CentralAtBoundAndZero,
    /// Central differences for every column, but only in the rescaled second solve.
    CentralSecondSolve,
    /// `CentralAtBound`, only in the rescaled second solve.
    CentralAtBoundSecondSolve,
    /// `CentralAtBoundAndZero`, only in the rescaled second solve.
    CentralAtBoundAndZeroSecondSolve,
    /// Central differences once the residual norm is small.
    CentralAtSmallResidual,
    /// The analytic Jacobian supplied by the residual function.
    External,
    /// Forward differences with structurally independent columns perturbed together.
    Compression,
}

/// How the Jacobian is maintained between fresh evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum JacobianUpdate {
    /// Evaluate a fresh Jacobian every iteration.
    #[default]
    Full,
    /// Reuse the Jacobian for up to `max_iterations_without_jacobian` iterations.
    Reuse,
    /// Broyden's rank-one update.
    Broyden,
    /// Bogle & Perkins' sparsity-preserving Broyden update.
    SparseBroyden,
    /// Rank-two modified BFGS update.
    ModifiedBfgs,
}

/// When Newton iteration stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum ExitCriterion {
    /// Small scaled step.
    Step,
    /// Small scaled residual.
    Residual,
    /// Small scaled step, with the residual also below the tolerance.
    #[default]
    StepAndResidual,
}

/// What to do when a bound is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum ActiveBoundsMode {
    /// Pin active variables to their bounds and keep the rest of the step.
    #[default]
    Project,
    /// As `Project`, but fall back to steepest descent when the projected step is not a descent direction.
    SteepestDescent,
}

/// Which solver back-end a block uses. Chosen once at block construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum SolverKind {
    /// Damped Newton with scaling, bounds, recovery and retries.
    #[default]
    Newton,
    /// Plain undamped Newton iteration.
    SimpleNewton,
    /// A single direct solve, for linear blocks.
    Linear,
}

/// Configuration for solving one equation block.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    /// Residual / step tolerance.
    pub tolerance: f64,
    /// Lower limit for the tolerance; also the step tolerance for 1-D blocks
    /// refined by Brent's method.
    pub min_tolerance: f64,
    /// Newton iterations per attempt.
    pub max_iterations: usize,
    /// With [`JacobianUpdate::Reuse`] and the quasi-Newton updates, the
    /// Jacobian is refreshed at least this often.
    pub max_iterations_without_jacobian: usize,
    /// Residual scaling policy.
    pub residual_scaling: ResidualScaling,
    /// Variable scaling policy.
    pub variable_scaling: VariableScaling,
    /// Smallest allowed residual scale factor.
    pub min_scaling_factor: f64,
    /// Largest allowed residual scale factor.
    pub max_scaling_factor: f64,
    /// Jacobian evaluation strategy.
    pub jacobian_mode: JacobianMode,
    /// Jacobian maintenance strategy.
    pub jacobian_update: JacobianUpdate,
    /// Relative perturbation for finite differences.
    pub fd_delta: f64,
    /// Keep iterates within min/max.
    pub enforce_bounds: bool,
    /// Behaviour when a bound becomes active.
    pub active_bounds_mode: ActiveBoundsMode,
    /// A bound whose admissible step fraction is below this ratio becomes active.
    /// `None` means twice the step tolerance.
    pub min_step_ratio: Option<f64>,
    /// Per-variable step cap, relative to the nominal value / current value / range.
    pub step_limit_factor: Option<f64>,
    /// When to stop iterating.
    pub exit_criterion: ExitCriterion,
    /// For one unknown, refine with Brent's method on the bracket seen while iterating.
    pub use_brent_in_1d: bool,
    /// Compare analytic Jacobians with finite differences.
    pub jacobian_check: bool,
    /// Relative tolerance for [`Self::jacobian_check`].
    pub jacobian_check_tolerance: f64,
    /// Restore the checkpoint of the last completed outer step before solving.
    pub start_from_last_accepted: bool,
    /// Condition number above which a poorly scaled Jacobian is treated as singular.
    /// `None` means `1 / tolerance`.
    pub regularization_tolerance: Option<f64>,
    /// Recompute residual scaling on every solve call.
    pub rescale_each_step: bool,
    /// Recompute residual scaling after a singular Jacobian was seen.
    pub rescale_after_singular_jacobian: bool,
    /// Log the condition number of the scaled Jacobian whenever scales change.
    pub check_jacobian_condition: bool,
    /// Retry from nominal values when the initial guess fails.
    pub use_nominals_as_fallback: bool,
    /// After a failed attempt, run steepest-descent iterations.
    pub steepest_descent_fallback: bool,
    /// Maximum step reductions in one line search.
    pub line_search_max_backtracks: usize,
    /// Solver back-end.
    pub solver_kind: SolverKind,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            min_tolerance: 1e-12,
            max_iterations: 100,
            max_iterations_without_jacobian: 10,
            residual_scaling: ResidualScaling::default(),
            variable_scaling: VariableScaling::default(),
            min_scaling_factor: 1e-10,
            max_scaling_factor: 1e10,
            jacobian_mode: JacobianMode::default(),
            jacobian_update: JacobianUpdate::default(),
            fd_delta: f64::EPSILON.sqrt(),
            enforce_bounds: true,
            active_bounds_mode: ActiveBoundsMode::default(),
            min_step_ratio: None,
            step_limit_factor: Some(10.0),
            exit_criterion: ExitCriterion::default(),
            use_brent_in_1d: true,
            jacobian_check: false,
            jacobian_check_tolerance: 1e-3,
            start_from_last_accepted: false,
            regularization_tolerance: None,
            rescale_each_step: false,
            rescale_after_singular_jacobian: true,
            check_jacobian_condition: false,
            use_nominals_as_fallback: true,
            steepest_descent_fallback: false,
            line_search_max_backtracks: 20,
            solver_kind: SolverKind::default(),
        }
    }
}

impl SolverConfig {
    /// Set the residual/step tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
    /// Set the tight tolerance.
    pub fn with_min_tolerance(mut self, min_tolerance: f64) -> Self {
        self.min_tolerance = min_tolerance;
        self
    }
    /// Set the Newton iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
    /// Set the residual scaling policy.
    pub fn with_residual_scaling(mut self, mode: ResidualScaling) -> Self {
        self.residual_scaling = mode;
        self
    }
    /// Set the variable scaling policy.
    pub fn with_variable_scaling(mut self, mode: VariableScaling) -> Self {
        self.variable_scaling = mode;
        self
    }
    /// Set the allowed residual scale range.
    pub fn with_scaling_limits(mut self, min: f64, max: f64) -> Self {
        self.min_scaling_factor = min;
        self.max_scaling_factor = max;
        self
    }
    /// Set the Jacobian evaluation strategy.
    pub fn with_jacobian_mode(mut self, mode: JacobianMode) -> Self {
        self.jacobian_mode = mode;
        self
    }
    /// Set the Jacobian maintenance strategy.
    pub fn with_jacobian_update(mut self, update: JacobianUpdate) -> Self {
        self.jacobian_update = update;
        self
    }
    /// Enable or disable bound enforcement.
    pub fn with_enforce_bounds(mut self, on: bool) -> Self {
        self.enforce_bounds = on;
        self
    }
    /// Set the active bound behaviour.
    pub fn with_active_bounds_mode(mut self, mode: ActiveBoundsMode) -> Self {
        self.active_bounds_mode = mode;
        self
    }
    /// Set (or disable) the per-variable step cap.
    pub fn with_step_limit_factor(mut self, factor: Option<f64>) -> Self {
        self.step_limit_factor = factor;
        self
    }
    /// Set the exit criterion.
    pub fn with_exit_criterion(mut self, criterion: ExitCriterion) -> Self {
        self.exit_criterion = criterion;
        self
    }
    /// Enable or disable Brent refinement for one unknown.
    pub fn with_brent_in_1d(mut self, on: bool) -> Self {
        self.use_brent_in_1d = on;
        self
    }
    /// Enable the Jacobian self-check with the given relative tolerance.
    pub fn with_jacobian_check(mut self, tolerance: f64) -> Self {
        self.jacobian_check = true;
        self.jacobian_check_tolerance = tolerance;
        self
    }
    /// Restore from the last accepted point before every solve.
    pub fn with_start_from_last_accepted(mut self, on: bool) -> Self {
        self.start_from_last_accepted = on;
        self
    }
    /// Rescale residuals on every solve.
    pub fn with_rescale_each_step(mut self, on: bool) -> Self {
        self.rescale_each_step = on;
        self
    }
    /// Retry from nominal values after failures.
    pub fn with_nominals_as_fallback(mut self, on: bool) -> Self {
        self.use_nominals_as_fallback = on;
        self
    }
    /// Run steepest-descent iterations after a failed attempt.
    pub fn with_steepest_descent_fallback(mut self, on: bool) -> Self {
        self.steepest_descent_fallback = on;
        self
    }
    /// Choose the solver back-end.
    pub fn with_solver_kind(mut self, kind: SolverKind) -> Self {
        self.solver_kind = kind;
        self
    }

    /// Step tolerance used by the first attempt.
    pub(crate) fn step_tolerance(&self, n: usize) -> f64 {
        if n == 1 && self.use_brent_in_1d {
            self.min_tolerance
        } else {
            libm::fmax(self.tolerance, self.min_tolerance)
        }
    }

    pub(crate) fn regularization_threshold(&self) -> f64 {
        self.regularization_tolerance.unwrap_or(1.0 / self.tolerance)
    }
}
