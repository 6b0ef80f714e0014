use faer::Mat;

use crate::{
    block::SolveContext,
    bounds::Bounds,
    brent::{self, BrentOutcome},
    config::{JacobianMode, ResidualScaling, SolverKind},
    error::{BlockError, ConvergenceFailure, EvalError, EvalMode},
    events::Severity,
    jacobian::{self, ColumnPartition},
    newton::{self, RunFailure, RunResult, RunStats, Tolerances},
    scaling, singular,
    solve_outcome::SolveReport,
    state::{Factorization, NewtonSolverState, SolverPhase},
};

mod direct;

pub(crate) use direct::{LinearBlockSolver, SimpleNewtonSolver};

/// A solver back-end. Each block owns exactly one, chosen by
/// [`SolverKind`](crate::SolverKind) when the block is built.
pub trait BlockSolver {
    /// Solve `F(x) = 0` from the block's current iterate.
    fn solve(&mut self, ctx: &mut SolveContext<'_>) -> Result<SolveReport, BlockError>;

    /// Read-only access to the Newton workspace.
    fn state(&self) -> &NewtonSolverState;

    /// Mutable access to the Newton workspace.
    fn state_mut(&mut self) -> &mut NewtonSolverState;

    /// Evaluate a fresh Jacobian at the block's current iterate.
    fn evaluate_jacobian(&mut self, ctx: &mut SolveContext<'_>) -> Result<Mat<f64>, BlockError> {
        let state = self.state_mut();
        prepare_state(ctx, state);
        fresh_jacobian_at_iterate(ctx, state)?;
        Ok(state.jacobian.clone())
    }

    /// Evaluate and factorize a fresh Jacobian at the block's current iterate.
    fn evaluate_jacobian_factorization(
        &mut self,
        ctx: &mut SolveContext<'_>,
    ) -> Result<&Factorization, BlockError> {
        let state = self.state_mut();
        prepare_state(ctx, state);
        fresh_jacobian_at_iterate(ctx, state)?;
        if !singular::factorize(ctx, state)? {
            return Err(BlockError::LinearAlgebra(
                "the Jacobian could not be factorized, not even in the minimum-norm sense".to_owned(),
            ));
        }
        Ok(&self.state().factorization)
    }

    /// Drop every cached Jacobian, factorization and scale.
    fn teardown(&mut self) {
        let n = self.state().uscale.len();
        *self.state_mut() = NewtonSolverState::new(n);
    }
}

pub(crate) fn backend_for(kind: SolverKind, n: usize) -> Box<dyn BlockSolver + Send> {
    match kind {
        SolverKind::Newton => Box::new(NewtonSolver::new(n)),
        SolverKind::SimpleNewton => Box::new(SimpleNewtonSolver::new(n)),
        SolverKind::Linear => Box::new(LinearBlockSolver::new(n)),
    }
}

/// Set up bounds, variable scales and the compression partition the first
/// time a back-end sees its block. Returns `true` on that first call.
pub(crate) fn prepare_state(ctx: &mut SolveContext<'_>, state: &mut NewtonSolverState) -> bool {
    if state.initialized {
        return false;
    }
    let n = ctx.block.n;
    let config = ctx.config;
    state.bounds = Bounds::new(&ctx.block.min, &ctx.block.max, config.step_limit_factor);
    state.uscale = scaling::variable_scales(&config.variable_scaling, &ctx.block.nominal, config.tolerance);
    if config.jacobian_mode == JacobianMode::Compression {
        state.pattern = ctx
            .residual
            .dependency_pattern()
            .filter(|p| p.nrows() == n && p.ncols() == n);
        if state.pattern.is_none() {
            tracing::debug!(block = %ctx.block.label, "no usable dependency pattern, compression disabled");
        }
        state.partition = state.pattern.as_ref().map(ColumnPartition::new);
    }
    state.initialized = true;
    true
}

/// Evaluate `F` and a fresh `J` at the block's iterate, for the explicit
/// Jacobian capabilities.
fn fresh_jacobian_at_iterate(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
) -> Result<(), BlockError> {
    let x = ctx.block.x.clone();
    let mut f = vec![0.0; x.len()];
    if let Err(err) = ctx.evaluate_or_fatal(&x, &mut f)? {
        return Err(BlockError::Jacobian {
            reason: err.reason().to_owned(),
        });
    }
    state.flags.force_new_jacobian = true;
    match jacobian::evaluate_fresh(ctx, state, &x, &f)? {
        Ok(()) => Ok(()),
        Err(err) => Err(BlockError::Jacobian {
            reason: err.reason().to_owned(),
        }),
    }
}

/// Starting point when the initial guess is unusable: the nominal value, or
/// its negation when the nominal is above the upper bound.
fn nominal_guess(nominal: &[f64], min: &[f64], max: &[f64], clamp: bool) -> Vec<f64> {
    nominal
        .iter()
        .zip(min.iter().zip(max))
        .map(|(&nom, (&lo, &hi))| {
            let guess = if nom <= hi { nom } else { -nom };
            if clamp { guess.clamp(lo, hi) } else { guess }
        })
        .collect()
}

/// Failure of a block, recorded as a convergence error.
fn convergence_failure(
    ctx: &mut SolveContext<'_>,
    failure: &RunFailure,
    tol: Tolerances,
    iterations: usize,
) -> BlockError {
    let details = ConvergenceFailure {
        residual_norm: failure.stats.residual_norm,
        step_norm: failure.stats.step_norm,
        residual_tolerance: ctx.config.tolerance,
        step_tolerance: tol.step,
        iterations,
        reason: failure.reason,
    };
    let err = BlockError::ConvergenceFailure(details);
    ctx.emit(
        Severity::Error,
        "ConvergenceFailure",
        err.to_string(),
        vec![
            ("residual_norm", failure.stats.residual_norm),
            ("step_norm", failure.stats.step_norm),
        ],
    );
    err
}

/// The full damped Newton back-end: scaling, bounds, singular recovery,
/// Brent refinement in 1-D and the retry policy.
#[derive(Debug, Clone)]
pub(crate) struct NewtonSolver {
    state: NewtonSolverState,
}

impl NewtonSolver {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            state: NewtonSolverState::new(n),
        }
    }

    /// Evaluate at the start of the very first solve; restart from the
    /// nominal values if the model's initial guess is undefined.
    fn check_initial_point(&mut self, ctx: &mut SolveContext<'_>) -> Result<(), BlockError> {
        let n = ctx.block.n;
        let x = ctx.block.x.clone();
        let mut f = vec![0.0; n];
        let Err(first) = ctx.evaluate_or_fatal(&x, &mut f)? else {
            return Ok(());
        };
        if !ctx.config.use_nominals_as_fallback {
            return Err(BlockError::InitialEvaluation {
                reason: first.reason().to_owned(),
            });
        }
        ctx.block.x = nominal_guess(
            &ctx.block.nominal,
            &ctx.block.min,
            &ctx.block.max,
            ctx.config.enforce_bounds,
        );
        ctx.emit(
            Severity::Warning,
            "NominalsAsInitialGuess",
            format!("Residual undefined at the initial guess ({}); starting from nominal values", first.reason()),
            Vec::new(),
        );
        let x = ctx.block.x.clone();
        match ctx.evaluate_or_fatal(&x, &mut f)? {
            Ok(()) => Ok(()),
            Err(err) => Err(BlockError::InitialEvaluation {
                reason: err.reason().to_owned(),
            }),
        }
    }

    /// For one unknown: run Brent's method on the bracket seen while iterating.
    /// Turns the outcome into a success when the bracket collapses.
    fn refine_with_brent(
        &mut self,
        ctx: &mut SolveContext<'_>,
        outcome: RunResult,
        report: &mut SolveReport,
    ) -> Result<RunResult, BlockError> {
        let Some((below, above)) = ctx.block.bracket.interval() else {
            if outcome.is_err() {
                ctx.emit(
                    Severity::Error,
                    "Brent",
                    "Could neither iterate to required accuracy nor bracket the root",
                    Vec::new(),
                );
            }
            return Ok(outcome);
        };
        let search = brent::find_root(
            |x| {
                let mut r = [0.0];
                ctx.evaluate(&[x], &mut r).map(|()| r[0])
            },
            below,
            above,
            0.0,
        );
        let BrentOutcome {
            x,
            f,
            iterations,
            converged,
        } = match search {
            Ok(found) => found,
            Err(err @ EvalError::Fatal(_)) => return Err(BlockError::from_eval(EvalMode::Evaluate, err)),
            Err(err) => {
                tracing::debug!(block = %ctx.block.label, reason = err.reason(), "Brent search stopped");
                return Ok(outcome);
            }
        };
        if !converged {
            return Ok(outcome);
        }
        ctx.block.x[0] = x;
        self.state.jacobian_at_iterate = false;
        report.used_brent = true;
        let residual_norm = (f * self.state.fscale[0]).abs();
        ctx.emit(
            Severity::Info,
            "Brent",
            "Root refined by Brent's method",
            vec![("x", x), ("residual", f), ("iterations", iterations as f64)],
        );
        let stats = match outcome {
            Ok(stats) => stats,
            Err(failure) => failure.stats,
        };
        Ok(Ok(RunStats {
            residual_norm,
            ..stats
        }))
    }
}

/// Add one attempt's statistics to the report.
fn record_attempt(report: &mut SolveReport, outcome: &RunResult) {
    let stats = match outcome {
        Ok(stats) => stats,
        Err(failure) => &failure.stats,
    };
    report.attempts += 1;
    report.iterations += stats.iterations;
    report.residual_norm = stats.residual_norm;
    report.step_norm = stats.step_norm;
    report.trace.extend(stats.trace.iter().cloned());
}

impl BlockSolver for NewtonSolver {
    fn solve(&mut self, ctx: &mut SolveContext<'_>) -> Result<SolveReport, BlockError> {
        let n = ctx.block.n;
        let config = ctx.config;
        let first = prepare_state(ctx, &mut self.state);
        ctx.block.bracket.clear();
        let mut report = SolveReport::default();

        if first {
            self.check_initial_point(ctx)?;
        } else if config.start_from_last_accepted
            && !ctx.block.at_event
            && !ctx.block.x_set_by_caller
        {
            if let Some(checkpoint) = self.state.checkpoint.clone() {
                self.state.restore(&checkpoint);
                ctx.block.x.copy_from_slice(checkpoint.x());
            }
        }
        // The model may have moved on since the last solve.
        self.state.jacobian_at_iterate = false;

        if first || config.rescale_each_step || self.state.flags.force_rescaling {
            scaling::update_residual_scales(ctx, &mut self.state)?;
        }

        let tol1 = Tolerances::first_attempt(config, n);
        let mut last_tol = tol1;
        self.state.first_newton_solve = true;
        self.state.second_solve = false;
        let mut outcome = newton::run(ctx, &mut self.state, tol1, false)?;
        self.state.first_newton_solve = false;
        record_attempt(&mut report, &outcome);

        if ctx.block.track_bracket {
            outcome = self.refine_with_brent(ctx, outcome, &mut report)?;
        }

        if outcome.is_err() && config.steepest_descent_fallback {
            ctx.emit(
                Severity::Info,
                "SteepestDescent",
                "Retrying with steepest-descent steps",
                Vec::new(),
            );
            outcome = newton::run(ctx, &mut self.state, tol1, true)?;
            record_attempt(&mut report, &outcome);
        }

        if config.residual_scaling != ResidualScaling::None && (first || outcome.is_err()) {
            if let Err(failure) = &outcome {
                ctx.emit(
                    Severity::Warning,
                    "NonConverge",
                    format!("First attempt failed: {}", failure.reason),
                    vec![("residual_norm", failure.stats.residual_norm)],
                );
            }
            ctx.emit(
                Severity::Info,
                "Rescaling",
                "Updating residual scaling and solving again",
                Vec::new(),
            );
            scaling::update_residual_scales(ctx, &mut self.state)?;
            let tol2 = Tolerances::rescaled(config);
            last_tol = tol2;
            self.state.second_solve = true;
            let retry = newton::run(ctx, &mut self.state, tol2, false)?;
            self.state.second_solve = false;
            record_attempt(&mut report, &retry);
            // A converged first attempt stays converged even if the retry stalls.
            if outcome.is_err() || retry.is_ok() {
                outcome = retry;
            }
            if outcome.is_err() {
                self.state.flags.force_new_jacobian = true;
                self.state.flags.force_rescaling = true;
            }
        }

        if outcome.is_err() && config.use_nominals_as_fallback {
            ctx.block.x = nominal_guess(
                &ctx.block.nominal,
                &ctx.block.min,
                &ctx.block.max,
                config.enforce_bounds,
            );
            self.state.jacobian_at_iterate = false;
            ctx.emit(
                Severity::Warning,
                "NominalsAsInitialGuess",
                "Retrying from nominal values",
                Vec::new(),
            );
            last_tol = tol1;
            outcome = newton::run(ctx, &mut self.state, tol1, false)?;
            record_attempt(&mut report, &outcome);
        }

        ctx.write_back()?;
        report.jacobian_mismatches = self.state.jacobian_mismatches;
        match outcome {
            Ok(stats) => {
                ctx.block.phase = SolverPhase::Converged;
                report.residual_norm = stats.residual_norm;
                tracing::debug!(
                    block = %ctx.block.label,
                    iterations = report.iterations,
                    attempts = report.attempts,
                    residual_norm = report.residual_norm,
                    "block converged"
                );
                Ok(report)
            }
            Err(failure) => {
                ctx.block.phase = SolverPhase::Failed;
                self.state.flags.force_new_jacobian = true;
                Err(convergence_failure(ctx, &failure, last_tol, report.iterations))
            }
        }
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

    const INF: f64 = f64::INFINITY;

    #[test]
    fn nominal_guess_flips_when_above_max() {
        let guess = nominal_guess(&[2.0, 5.0], &[-INF, -INF], &[INF, 1.0], false);
        assert_eq!(guess, vec![2.0, -5.0]);
        let clamped = nominal_guess(&[5.0], &[0.0], &[1.0], true);
        assert_eq!(clamped, vec![0.0]);
    }

    #[test]
    fn teardown_resets_state() {
        let mut solver = NewtonSolver::new(2);
        solver.state.fscale = vec![3.0, 4.0];
        solver.state.initialized = true;
        solver.teardown();
        assert_eq!(solver.state().residual_scales(), &[1.0, 1.0]);
        assert!(!solver.state().initialized);
    }
}
