use algloop_linalg::{mul_transpose_vec, mul_vec};

use crate::{
    UNIT_ROUNDOFF,
    block::SolveContext,
    config::{ActiveBoundsMode, ExitCriterion, ResidualScaling, SolverConfig},
    error::{BlockError, FailureReason},
    events::Severity,
    jacobian, scaling, singular,
    solve_outcome::{IterationStats, StepKind},
    state::{NewtonSolverState, SolverPhase},
};

/// Sufficient-decrease constant of the Armijo condition.
const ARMIJO_ALPHA: f64 = 1e-4;

/// Exit tolerances for one Newton run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Tolerances {
    /// Max-norm of the scaled residual.
    pub function: f64,
    /// Scaled step length.
    pub step: f64,
}

impl Tolerances {
    /// Tolerances for the first attempt, as the exit criterion asks.
    pub(crate) fn first_attempt(config: &SolverConfig, n: usize) -> Self {
        match config.exit_criterion {
            ExitCriterion::Step | ExitCriterion::StepAndResidual => Self {
                function: UNIT_ROUNDOFF,
                step: config.step_tolerance(n),
            },
            ExitCriterion::Residual => Self {
                function: config.tolerance,
                step: UNIT_ROUNDOFF,
            },
        }
    }

    /// Tolerances for the retry after rescaling.
    pub(crate) fn rescaled(config: &SolverConfig) -> Self {
        Self {
            function: config.tolerance,
            step: UNIT_ROUNDOFF,
        }
    }
}

/// What a Newton run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RunStats {
    pub iterations: usize,
    pub residual_norm: f64,
    pub step_norm: f64,
    pub trace: Vec<IterationStats>,
}

/// A Newton run that stopped without meeting its exit criterion.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RunFailure {
    pub stats: RunStats,
    pub reason: FailureReason,
}

pub(crate) type RunResult = Result<RunStats, RunFailure>;

/// Max-norm of `W F`.
pub(crate) fn scaled_norm(f: &[f64], fscale: &[f64]) -> f64 {
    f.iter()
        .zip(fscale)
        .map(|(fi, w)| (fi * w).abs())
        .fold(0.0, libm::fmax)
}

/// `½‖W F‖²`, the merit function of the line search.
fn merit(f: &[f64], fscale: &[f64]) -> f64 {
    0.5 * f.iter().zip(fscale).map(|(fi, w)| (fi * w).powi(2)).sum::<f64>()
}

/// Directional derivative of the merit function along `step`: `(W²F)ᵀ(J p)`.
fn merit_slope(state: &NewtonSolverState, f: &[f64], step: &[f64]) -> f64 {
    let mut jp = vec![0.0; step.len()];
    mul_vec(&state.jacobian, step, &mut jp);
    f.iter()
        .zip(&state.fscale)
        .zip(&jp)
        .map(|((fi, w), jpi)| w * w * fi * jpi)
        .sum()
}

/// Replace `step` by the scaled steepest-descent direction `g‖WF‖²/(gᵀg)`,
/// `g = -JᵀW²F`. Leaves `step` alone when the gradient vanishes.
pub(crate) fn steepest_descent_step(state: &NewtonSolverState, f: &[f64], step: &mut [f64]) {
    let weighted: Vec<f64> = f.iter().zip(&state.fscale).map(|(fi, w)| -w * w * fi).collect();
    let mut gradient = vec![0.0; step.len()];
    mul_transpose_vec(&state.jacobian, &weighted, &mut gradient);
    let gg: f64 = gradient.iter().map(|g| g * g).sum();
    if gg == 0.0 || !gg.is_finite() {
        return;
    }
    let wf: f64 = 2.0 * merit(f, &state.fscale);
    for (p, g) in step.iter_mut().zip(&gradient) {
        *p = g * wf / gg;
    }
}

/// Relative step length: `max_i |p_i| / max(|x_i|, 1/uscale_i)`.
fn relative_length(step: &[f64], x: &[f64], uscale: &[f64]) -> f64 {
    step.iter()
        .zip(x)
        .zip(uscale)
        .map(|((p, xi), d)| p.abs() / libm::fmax(xi.abs(), 1.0 / d))
        .fold(0.0, libm::fmax)
}

struct Accepted {
    damping: f64,
    x: Vec<f64>,
    f: Vec<f64>,
}

/// Backtracking line search on `½‖WF‖²` along `step` from `x`.
fn line_search(
    ctx: &mut SolveContext<'_>,
    state: &NewtonSolverState,
    x: &[f64],
    f: &[f64],
    step: &[f64],
    rlength: f64,
    step_tolerance: f64,
) -> Result<Result<Accepted, FailureReason>, BlockError> {
    let n = x.len();
    let f0 = merit(f, &state.fscale);
    let mut slope = merit_slope(state, f, step);
    if slope >= 0.0 || !slope.is_finite() {
        // Not a descent direction: accept anything that does not increase the merit.
        slope = 0.0;
    }
    if rlength == 0.0 {
        return Ok(Err(FailureReason::StepTooSmall));
    }
    let min_damping = step_tolerance / rlength;
    let mut damping: f64 = 1.0;
    let mut x_new = vec![0.0; n];
    let mut f_new = vec![0.0; n];
    for _ in 0..=ctx.config.line_search_max_backtracks {
        if damping < min_damping {
            return Ok(Err(FailureReason::StepTooSmall));
        }
        for ((xn, xi), p) in x_new.iter_mut().zip(x).zip(step) {
            *xn = xi + damping * p;
        }
        if ctx.evaluate_or_fatal(&x_new, &mut f_new)?.is_err() {
            damping *= 0.5;
            continue;
        }
        let f1 = merit(&f_new, &state.fscale);
        if f1 <= f0 + ARMIJO_ALPHA * damping * slope {
            return Ok(Ok(Accepted {
                damping,
                x: x_new,
                f: f_new,
            }));
        }
        // Minimize the quadratic through f0, the slope and f1.
        let curvature = (f1 - f0 - slope * damping) / (damping * damping);
        let next = if slope < 0.0 && curvature > 0.0 {
            -slope / (2.0 * curvature)
        } else {
            0.5 * damping
        };
        damping = next.clamp(0.1 * damping, 0.5 * damping);
    }
    Ok(Err(FailureReason::LineSearch))
}

/// Damped Newton iteration from the block's current iterate.
///
/// The block's `x` always holds the latest accepted iterate, so a failed run
/// leaves the best point it reached.
pub(crate) fn run(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
    tol: Tolerances,
    steepest_descent: bool,
) -> Result<RunResult, BlockError> {
    let n = ctx.block.n;
    let config = ctx.config;
    let mut stats = RunStats::default();
    let mut x = ctx.block.x.clone();
    let mut f = vec![0.0; n];
    state.history_valid = false;
    state.flags.use_steepest_descent = false;
    if ctx.evaluate_or_fatal(&x, &mut f)?.is_err() {
        return Ok(Err(RunFailure {
            stats,
            reason: FailureReason::InitialEvaluation,
        }));
    }
    let mut fnorm = scaled_norm(&f, &state.fscale);
    state.last_fnorm = fnorm;
    stats.residual_norm = fnorm;
    if fnorm <= 0.01 * tol.function {
        return Ok(Ok(stats));
    }

    let min_step_ratio = config
        .min_step_ratio
        .unwrap_or(2.0 * config.step_tolerance(n));
    let tighten = state.first_newton_solve
        && matches!(
            config.residual_scaling,
            ResidualScaling::AggressiveAuto | ResidualScaling::FullJacobianAuto
        );
    let mut step = vec![0.0; n];

    for iteration in 1..=config.max_iterations {
        let fresh = match jacobian::prepare(ctx, state, iteration, &x, &f)? {
            Ok(fresh) => fresh,
            Err(err) => {
                tracing::debug!(block = %ctx.block.label, iteration, reason = err.reason(), "Jacobian unavailable");
                return Ok(Err(RunFailure {
                    stats,
                    reason: FailureReason::Jacobian,
                }));
            }
        };
        if tighten
            && iteration > 1
            && (config.residual_scaling == ResidualScaling::AggressiveAuto || fresh)
        {
            scaling::tighten_residual_scales(ctx, state, &x);
            fnorm = scaled_norm(&f, &state.fscale);
        }

        let Some(mut kind) = singular::compute_step(ctx, state, &f, tol.step, &mut step)? else {
            return Ok(Err(RunFailure {
                stats,
                reason: FailureReason::LinearSolve,
            }));
        };
        if steepest_descent || state.flags.use_steepest_descent {
            steepest_descent_step(state, &f, &mut step);
            kind = StepKind::SteepestDescent;
        }

        if config.enforce_bounds {
            let limit = state.bounds.limit_step(
                &x,
                &ctx.block.nominal,
                &mut step,
                min_step_ratio,
                config.step_limit_factor,
            );
            if limit.active == 0 {
                state.flags.use_steepest_descent = false;
            } else {
                ctx.emit(
                    Severity::Info,
                    "ActiveBound",
                    "Variables pinned to their bounds",
                    vec![("active", limit.active as f64)],
                );
                let descent = merit_slope(state, &f, &step) < 0.0;
                if config.active_bounds_mode == ActiveBoundsMode::SteepestDescent
                    && kind != StepKind::SteepestDescent
                    && !descent
                {
                    ctx.emit(
                        Severity::Info,
                        "SteepestDescent",
                        "Projected step is not a descent direction; using steepest descent",
                        Vec::new(),
                    );
                    steepest_descent_step(state, &f, &mut step);
                    state.bounds.limit_step(
                        &x,
                        &ctx.block.nominal,
                        &mut step,
                        min_step_ratio,
                        config.step_limit_factor,
                    );
                    kind = StepKind::SteepestDescent;
                    // Stay on steepest descent while the bounds remain active.
                    state.flags.use_steepest_descent = true;
                }
            }
            if let Some(index) = limit.limiting {
                ctx.emit(
                    Severity::Info,
                    "LimitingBound",
                    format!("Step limited by a bound on variable {index}"),
                    vec![("index", index as f64), ("ratio", limit.ratio)],
                );
            }
        }
        ctx.block.phase = match kind {
            StepKind::Newton => SolverPhase::Iterating,
            StepKind::Regularized => SolverPhase::Regularizing,
            StepKind::MinimumNorm => SolverPhase::MinimumNorm,
            StepKind::SteepestDescent => SolverPhase::SteepestDescent,
        };

        let rlength = relative_length(&step, &x, &state.uscale);
        let accepted = match line_search(ctx, state, &x, &f, &step, rlength, tol.step)? {
            Ok(accepted) => accepted,
            Err(reason) => {
                if !fresh {
                    // The Jacobian may just be stale.
                    state.flags.force_new_jacobian = true;
                    continue;
                }
                let converged = match reason {
                    FailureReason::StepTooSmall => {
                        config.exit_criterion == ExitCriterion::Step || fnorm <= config.tolerance
                    }
                    _ => fnorm <= config.tolerance,
                };
                if converged {
                    return Ok(Ok(stats));
                }
                return Ok(Err(RunFailure { stats, reason }));
            }
        };

        for i in 0..n {
            state.last_step[i] = accepted.x[i] - x[i];
            state.last_residual[i] = f[i];
        }
        state.history_valid = true;
        state.jacobian_at_iterate = false;
        x = accepted.x;
        f = accepted.f;
        ctx.block.x.copy_from_slice(&x);
        fnorm = scaled_norm(&f, &state.fscale);
        state.last_fnorm = fnorm;

        let step_norm = accepted.damping * rlength;
        stats.iterations += 1;
        stats.residual_norm = fnorm;
        stats.step_norm = step_norm;
        stats.trace.push(IterationStats {
            iteration,
            residual_norm: fnorm,
            step_norm,
            damping: accepted.damping,
            step_kind: kind,
            fresh_jacobian: fresh,
        });
        ctx.block.counters.iterations += 1;
        tracing::debug!(
            block = %ctx.block.label,
            iteration,
            residual_norm = fnorm,
            step_norm,
            damping = accepted.damping,
            ?kind,
            "Newton iteration"
        );

        if fnorm <= tol.function {
            return Ok(Ok(stats));
        }
        if step_norm <= tol.step {
            if config.exit_criterion == ExitCriterion::Step || fnorm <= config.tolerance {
                return Ok(Ok(stats));
            }
            return Ok(Err(RunFailure {
                stats,
                reason: FailureReason::StepTooSmall,
            }));
        }
    }
    Ok(Err(RunFailure {
        stats,
        reason: FailureReason::MaxIterations,
    }))
}

#[cfg(test)]
mod tests {
    use faer::Mat;

    use super::*;

    #[test]
    fn tolerances_follow_exit_criterion() {
        let config = SolverConfig::default();
        let first = Tolerances::first_attempt(&config, 2);
        assert_eq!(first.step, config.tolerance);
        assert_eq!(first.function, UNIT_ROUNDOFF);
        let residual = SolverConfig::default().with_exit_criterion(ExitCriterion::Residual);
        let first = Tolerances::first_attempt(&residual, 2);
        assert_eq!(first.function, residual.tolerance);
        assert_eq!(first.step, UNIT_ROUNDOFF);
        // One unknown refined by Brent: the tight step tolerance.
        assert_eq!(Tolerances::first_attempt(&config, 1).step, config.min_tolerance);
        assert_eq!(Tolerances::rescaled(&config).function, config.tolerance);
    }

    #[test]
    fn relative_length_uses_scale_floor() {
        let len = relative_length(&[1.0, 0.1], &[0.0, 9.0], &[0.5, 1.0]);
        assert!((len - 0.5).abs() < 1e-15);
    }

    #[test]
    fn steepest_descent_points_downhill() {
        let mut state = NewtonSolverState::new(2);
        state.jacobian = Mat::from_fn(2, 2, |i, j| [[3.0, 1.0], [0.0, 2.0]][i][j]);
        let f = [1.0, -2.0];
        let mut step = vec![0.0; 2];
        steepest_descent_step(&state, &f, &mut step);
        assert!(merit_slope(&state, &f, &step) < 0.0);
    }

    #[test]
    fn scaled_norm_is_weighted_max() {
        assert_eq!(scaled_norm(&[1.0, -4.0], &[2.0, 0.25]), 2.0);
    }
}
