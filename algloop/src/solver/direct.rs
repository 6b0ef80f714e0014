use algloop_linalg::{DenseLu, LinearSolver, MinNormSvd};

use super::{BlockSolver, convergence_failure, prepare_state};
use crate::{
    block::SolveContext,
    error::{BlockError, FailureReason},
    events::Severity,
    jacobian,
    newton::{RunFailure, RunStats, Tolerances, scaled_norm},
    singular,
    solve_outcome::{IterationStats, SolveReport, StepKind},
    state::{Factorization, NewtonSolverState, SolverPhase},
};

/// Max-norm of the step in variable-scaled units.
fn scaled_step(step: &[f64], uscale: &[f64]) -> f64 {
    step.iter()
        .zip(uscale)
        .map(|(p, d)| (p * d).abs())
        .fold(0.0, libm::fmax)
}

/// Commit the iterate and turn the run into the block's result.
fn finish(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
    outcome: Result<RunStats, RunFailure>,
    tol: Tolerances,
) -> Result<SolveReport, BlockError> {
    ctx.write_back()?;
    match outcome {
        Ok(stats) => {
            ctx.block.phase = SolverPhase::Converged;
            Ok(SolveReport {
                iterations: stats.iterations,
                attempts: 1,
                residual_norm: stats.residual_norm,
                step_norm: stats.step_norm,
                used_brent: false,
                jacobian_mismatches: state.jacobian_mismatches,
                trace: stats.trace,
            })
        }
        Err(failure) => {
            ctx.block.phase = SolverPhase::Failed;
            state.flags.force_new_jacobian = true;
            let iterations = failure.stats.iterations;
            Err(convergence_failure(ctx, &failure, tol, iterations))
        }
    }
}

/// Plain Newton iteration: full steps, no residual scaling, no line search.
/// Iterates leaving the bounds are clamped back.
#[derive(Debug, Clone)]
pub(crate) struct SimpleNewtonSolver {
    state: NewtonSolverState,
}

impl SimpleNewtonSolver {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            state: NewtonSolverState::new(n),
        }
    }

    fn iterate(
        &mut self,
        ctx: &mut SolveContext<'_>,
        tol: Tolerances,
    ) -> Result<Result<RunStats, RunFailure>, BlockError> {
        let n = ctx.block.n;
        let config = ctx.config;
        let state = &mut self.state;
        let mut stats = RunStats::default();
        let mut x = ctx.block.x.clone();
        let mut f = vec![0.0; n];
        let mut step = vec![0.0; n];
        let fail = |stats: RunStats, reason| Ok(Err(RunFailure { stats, reason }));

        if ctx.evaluate_or_fatal(&x, &mut f)?.is_err() {
            return fail(stats, FailureReason::InitialEvaluation);
        }
        stats.residual_norm = scaled_norm(&f, &state.fscale);
        if stats.residual_norm <= tol.function {
            return Ok(Ok(stats));
        }

        for iteration in 1..=config.max_iterations {
            let fresh = match jacobian::prepare(ctx, state, iteration, &x, &f)? {
                Ok(fresh) => fresh,
                Err(_) => return fail(stats, FailureReason::Jacobian),
            };
            let Some(kind) = singular::compute_step(ctx, state, &f, tol.step, &mut step)? else {
                return fail(stats, FailureReason::LinearSolve);
            };
            let previous = x.clone();
            for (xi, p) in x.iter_mut().zip(&step) {
                *xi += p;
            }
            if config.enforce_bounds {
                state.bounds.clamp(&mut x);
            }
            let last_f = f.clone();
            if ctx.evaluate_or_fatal(&x, &mut f)?.is_err() {
                return fail(stats, FailureReason::LineSearch);
            }
            for i in 0..n {
                state.last_step[i] = x[i] - previous[i];
                state.last_residual[i] = last_f[i];
            }
            state.history_valid = true;
            state.jacobian_at_iterate = false;
            ctx.block.x.copy_from_slice(&x);
            ctx.block.counters.iterations += 1;

            let residual_norm = scaled_norm(&f, &state.fscale);
            let step_norm = scaled_step(&state.last_step, &state.uscale);
            stats.iterations += 1;
            stats.residual_norm = residual_norm;
            stats.step_norm = step_norm;
            stats.trace.push(IterationStats {
                iteration,
                residual_norm,
                step_norm,
                damping: 1.0,
                step_kind: kind,
                fresh_jacobian: fresh,
            });
            tracing::trace!(block = %ctx.block.label, iteration, residual_norm, step_norm, "simple Newton iteration");
            if residual_norm <= tol.function {
                return Ok(Ok(stats));
            }
            if step_norm <= tol.step {
                if residual_norm <= config.tolerance {
                    return Ok(Ok(stats));
                }
                return fail(stats, FailureReason::StepTooSmall);
            }
        }
        fail(stats, FailureReason::MaxIterations)
    }
}

impl BlockSolver for SimpleNewtonSolver {
    fn solve(&mut self, ctx: &mut SolveContext<'_>) -> Result<SolveReport, BlockError> {
        prepare_state(ctx, &mut self.state);
        let tol = Tolerances {
            function: ctx.config.tolerance,
            step: ctx.config.step_tolerance(ctx.block.n),
        };
        ctx.block.phase = SolverPhase::Iterating;
        let outcome = self.iterate(ctx, tol)?;
        finish(ctx, &mut self.state, outcome, tol)
    }

    fn state(&self) -> &NewtonSolverState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut NewtonSolverState {
        &mut self.state
    }
}

/// One direct solve `x ← x − J⁻¹ F(x)`, for blocks whose residual is affine
/// in `x`. The factorization is kept as long as the variability class allows.
#[derive(Debug, Clone)]
pub(crate) struct LinearBlockSolver {
    state: NewtonSolverState,
}

impl LinearBlockSolver {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            state: NewtonSolverState::new(n),
        }
    }

    /// LU, or the minimum-norm factorization when `J` is singular.
    fn factorize(&mut self, ctx: &mut SolveContext<'_>) -> bool {
        let state = &mut self.state;
        state.factorized_generation = Some(state.jacobian_generation);
        let mut lu = DenseLu::default();
        if lu.factor(&state.jacobian).is_ok() {
            state.factorization = Factorization::Lu(lu);
            state.flags.singular = false;
            return true;
        }
        state.flags.singular = true;
        ctx.emit(
            Severity::Warning,
            "SingularJacobian",
            "Singular Jacobian in a linear block; using the minimum-norm solution",
            Vec::new(),
        );
        let mut svd = MinNormSvd::default();
        if svd.factor(&state.jacobian).is_err() {
            state.factorization = Factorization::None;
            return false;
        }
        state.factorization = Factorization::MinimumNorm(svd);
        true
    }

    fn direct_solve(
        &mut self,
        ctx: &mut SolveContext<'_>,
        tol: Tolerances,
    ) -> Result<Result<RunStats, RunFailure>, BlockError> {
        let n = ctx.block.n;
        let mut stats = RunStats::default();
        let fail = |stats: RunStats, reason| Ok(Err(RunFailure { stats, reason }));
        let x0 = ctx.block.x.clone();
        let mut f = vec![0.0; n];
        if ctx.evaluate_or_fatal(&x0, &mut f)?.is_err() {
            return fail(stats, FailureReason::InitialEvaluation);
        }
        let initial_norm = scaled_norm(&f, &self.state.fscale);
        stats.residual_norm = initial_norm;

        if jacobian::prepare(ctx, &mut self.state, 1, &x0, &f)?.is_err() {
            return fail(stats, FailureReason::Jacobian);
        }
        if !self.state.factorization_is_current() && !self.factorize(ctx) {
            return fail(stats, FailureReason::LinearSolve);
        }
        let mut step: Vec<f64> = f.iter().map(|fi| -fi).collect();
        let (solved, kind) = match &mut self.state.factorization {
            Factorization::Lu(lu) => (lu.solve_in_place(&mut step).is_ok(), StepKind::Newton),
            Factorization::MinimumNorm(svd) => (svd.solve_in_place(&mut step).is_ok(), StepKind::MinimumNorm),
            _ => (false, StepKind::Newton),
        };
        if !solved || step.iter().any(|p| !p.is_finite()) {
            return fail(stats, FailureReason::LinearSolve);
        }

        let mut x: Vec<f64> = x0.iter().zip(&step).map(|(xi, p)| xi + p).collect();
        let unclamped = x.clone();
        if ctx.config.enforce_bounds {
            self.state.bounds.clamp(&mut x);
        }
        let clamped = x != unclamped;
        if ctx.evaluate_or_fatal(&x, &mut f)?.is_err() {
            return fail(stats, FailureReason::LineSearch);
        }
        ctx.block.x.copy_from_slice(&x);
        ctx.block.counters.iterations += 1;
        self.state.jacobian_at_iterate = false;

        for ((s, xi), x0i) in step.iter_mut().zip(&x).zip(&x0) {
            *s = xi - x0i;
        }
        let residual_norm = scaled_norm(&f, &self.state.fscale);
        let step_norm = scaled_step(&step, &self.state.uscale);
        stats.iterations = 1;
        stats.residual_norm = residual_norm;
        stats.step_norm = step_norm;
        stats.trace.push(IterationStats {
            iteration: 1,
            residual_norm,
            step_norm,
            damping: 1.0,
            step_kind: kind,
            fresh_jacobian: self.state.iterations_since_jacobian == 0,
        });
        if residual_norm > tol.function * libm::fmax(1.0, initial_norm) {
            let reason = if clamped {
                FailureReason::SolutionOutsideBounds
            } else {
                FailureReason::LinearSolve
            };
            return fail(stats, reason);
        }
        Ok(Ok(stats))
    }
}

impl BlockSolver for LinearBlockSolver {
    fn solve(&mut self, ctx: &mut SolveContext<'_>) -> Result<SolveReport, BlockError> {
        prepare_state(ctx, &mut self.state);
        let tol = Tolerances {
            function: ctx.config.tolerance,
            step: ctx.config.step_tolerance(ctx.block.n),
        };
        ctx.block.phase = SolverPhase::Iterating;
        let outcome = self.direct_solve(ctx, tol)?;
        finish(ctx, &mut self.state, outcome, tol)
    }

    fn state(&self) -> &NewtonSolverState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut NewtonSolverState {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EquationBlock, EvalResult, JacobianVariability, SolverConfig, SolverKind, StartValues};

    struct Affine;

    impl crate::ResidualFunction for Affine {
        fn initialize(&mut self, start: &mut StartValues) -> EvalResult {
            start.initial = vec![0.0, 0.0];
            start.nominal = vec![1.0, 1.0];
            Ok(())
        }

        fn evaluate(&mut self, x: &[f64], f: &mut [f64]) -> EvalResult {
            f[0] = 2.0 * x[0] + x[1] - 3.0;
            f[1] = x[0] - x[1];
            Ok(())
        }
    }

    #[test]
    fn linear_block_solves_in_one_step() {
        let config = SolverConfig::default().with_solver_kind(SolverKind::Linear);
        let mut block = EquationBlock::new("affine", 2, Affine, config).unwrap();
        let report = block.solve().unwrap();
        assert_eq!(report.iterations(), 1);
        assert!((block.x()[0] - 1.0).abs() < 1e-9);
        assert!((block.x()[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn constant_linear_block_reuses_factorization() {
        let config = SolverConfig::default().with_solver_kind(SolverKind::Linear);
        let mut block = EquationBlock::new("affine", 2, Affine, config)
            .unwrap()
            .with_variability(JacobianVariability::Constant);
        block.solve().unwrap();
        block.set_x(&[5.0, -5.0]).unwrap();
        block.solve().unwrap();
        assert_eq!(block.counters().jacobian_evaluations, 1);
        assert!((block.x()[0] - 1.0).abs() < 1e-9);
    }

    /// `x - 10` with `x ≤ 5`.
    struct Capped;

    impl crate::ResidualFunction for Capped {
        fn initialize(&mut self, start: &mut StartValues) -> EvalResult {
            start.max[0] = 5.0;
            Ok(())
        }

        fn evaluate(&mut self, x: &[f64], f: &mut [f64]) -> EvalResult {
            f[0] = x[0] - 10.0;
            Ok(())
        }
    }

    #[test]
    fn linear_solution_is_clamped_into_bounds() {
        let config = SolverConfig::default().with_solver_kind(SolverKind::Linear);
        let mut block = EquationBlock::new("capped", 1, Capped, config).unwrap();
        let err = block.solve().unwrap_err();
        let BlockError::ConvergenceFailure(failure) = err else {
            panic!("expected a convergence failure, got {err:?}");
        };
        assert_eq!(failure.reason, FailureReason::SolutionOutsideBounds);
        assert_eq!(block.x(), &[5.0]);

        let config = SolverConfig::default()
            .with_solver_kind(SolverKind::Linear)
            .with_enforce_bounds(false);
        let mut free = EquationBlock::new("capped", 1, Capped, config).unwrap();
        free.solve().unwrap();
        assert!((free.x()[0] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn simple_newton_converges_on_smooth_problem() {
        let residual = |x: &[f64], f: &mut [f64]| -> EvalResult {
            f[0] = x[0] * x[0] - 2.0;
            Ok(())
        };
        let config = SolverConfig::default().with_solver_kind(SolverKind::SimpleNewton);
        let mut block = EquationBlock::new("sqrt2", 1, residual, config).unwrap();
        block.set_x(&[1.0]).unwrap();
        block.solve().unwrap();
        assert!((block.x()[0] - 2f64.sqrt()).abs() < 1e-9);
        assert!(block.state().flags().jacobian_current);
    }

    #[test]
    fn scaled_step_is_weighted_max() {
        assert_eq!(scaled_step(&[1.0, -4.0], &[1.0, 0.5]), 2.0);
    }
}
