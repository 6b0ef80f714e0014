/// Which linear-solve path produced an iteration's step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Plain Newton step from an LU factorization.
    Newton,
    /// Step from the regularized normal equations
    /// (or the scalar heuristic when the block has one unknown).
    Regularized,
    /// Minimum-norm step from the SVD.
    MinimumNorm,
    /// Scaled steepest-descent step.
    SteepestDescent,
}

/// Data about one accepted Newton iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationStats {
    /// 1-based iteration number within its attempt.
    pub iteration: usize,
    /// Max-norm of the scaled residual after the step.
    pub residual_norm: f64,
    /// Scaled length of the step actually taken.
    pub step_norm: f64,
    /// Line-search multiplier that was accepted.
    pub damping: f64,
    /// How the step was computed.
    pub step_kind: StepKind,
    /// Was the Jacobian freshly evaluated for this iteration?
    pub fresh_jacobian: bool,
}

/// Data from a successful solve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveReport {
    pub(crate) iterations: usize,
    pub(crate) attempts: usize,
    pub(crate) residual_norm: f64,
    pub(crate) step_norm: f64,
    pub(crate) used_brent: bool,
    pub(crate) jacobian_mismatches: usize,
    pub(crate) trace: Vec<IterationStats>,
}

impl SolveReport {
    /// Newton iterations over all attempts.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// How many Newton runs were needed (first attempt, rescaled retry, fallbacks).
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Max-norm of the scaled residual at the solution.
    pub fn residual_norm(&self) -> f64 {
        self.residual_norm
    }

    /// Scaled length of the last step.
    pub fn step_norm(&self) -> f64 {
        self.step_norm
    }

    /// Did Brent's method refine the solution of a 1-D block?
    pub fn used_brent(&self) -> bool {
        self.used_brent
    }

    /// Jacobian entries that disagreed with finite differences, when checked.
    pub fn jacobian_mismatches(&self) -> usize {
        self.jacobian_mismatches
    }

    /// Every accepted iteration, in order.
    pub fn trace(&self) -> &[IterationStats] {
        &self.trace
    }
}
