use faer::Mat;

use crate::{
    block::SolveContext,
    config::{JacobianMode, JacobianUpdate},
    error::{BlockError, EvalError, EvalMode, EvalResult},
    events::Severity,
    state::NewtonSolverState,
};

mod partition;
mod quasi_newton;

pub(crate) use partition::ColumnPartition;

/// Forward-difference increment for column `j`: `max(|x_j|, 1/uscale_j)·δ`,
/// signed like `x_j` (zero counts as positive).
fn increment(xj: f64, uscale: f64, delta: f64) -> f64 {
    let h = libm::fmax(xj.abs(), 1.0 / uscale) * delta;
    if xj < 0.0 { -h } else { h }
}

/// Which columns get central differences under `mode`.
fn central_columns(ctx: &SolveContext<'_>, state: &NewtonSolverState, x: &[f64]) -> Vec<bool> {
    let mode = ctx.config.jacobian_mode;
    let small_residual = state.last_fnorm <= ctx.config.tolerance.sqrt();
    (0..x.len())
        .map(|j| {
            let inc = increment(x[j], state.uscale[j], ctx.config.fd_delta).abs();
            let near_bound = state.bounds.near_bound(j, x[j], inc);
            let near_zero = x[j].abs() < inc;
            match mode {
                JacobianMode::ForwardDifference | JacobianMode::External | JacobianMode::Compression => {
                    false
                }
                JacobianMode::CentralDifference => true,
                JacobianMode::CentralAtBound => near_bound,
                JacobianMode::CentralAtBoundAndZero => near_bound || near_zero,
                JacobianMode::CentralSecondSolve => state.second_solve,
                JacobianMode::CentralAtBoundSecondSolve => state.second_solve && near_bound,
                JacobianMode::CentralAtBoundAndZeroSecondSolve => {
                    state.second_solve && (near_bound || near_zero)
                }
                JacobianMode::CentralAtSmallResidual => small_residual,
            }
        })
        .collect()
}

/// Column-by-column finite differences into `jac`.
fn finite_difference(
    ctx: &mut SolveContext<'_>,
    uscale: &[f64],
    central: &[bool],
    x: &[f64],
    f: &[f64],
    jac: &mut Mat<f64>,
) -> Result<EvalResult, BlockError> {
    let n = x.len();
    let delta = ctx.config.fd_delta;
    let mut xp = x.to_vec();
    let mut f_right = vec![0.0; n];
    let mut f_left = vec![0.0; n];
    for j in 0..n {
        let xj = x[j];
        let (lo, hi) = (ctx.block.min[j], ctx.block.max[j]);
        let inc = increment(xj, uscale[j], delta);
        if central[j] {
            let h = inc.abs();
            let mut h_right = libm::fmax(libm::fmin(hi - xj, h), 0.0);
            let mut h_left = libm::fmax(libm::fmin(xj - lo, h), 0.0);
            if h_right > 0.0 {
                xp[j] = xj + h_right;
                h_right = xp[j] - xj;
                if ctx.evaluate_or_fatal(&xp, &mut f_right)?.is_err() {
                    h_right = 0.0;
                }
            }
            if h_left > 0.0 {
                xp[j] = xj - h_left;
                h_left = xj - xp[j];
                if ctx.evaluate_or_fatal(&xp, &mut f_left)?.is_err() {
                    h_left = 0.0;
                }
            }
            xp[j] = xj;
            let width = h_right + h_left;
            if width == 0.0 {
                return Ok(Err(EvalError::recoverable(format!(
                    "residual undefined on both sides of variable {j}"
                ))));
            }
            let right = if h_right > 0.0 { &f_right } else { f };
            let left = if h_left > 0.0 { &f_left } else { f };
            for i in 0..n {
                jac[(i, j)] = (right[i] - left[i]) / width;
            }
        } else {
            let mut inc = inc;
            if xj + inc > hi || xj + inc < lo {
                inc = -inc;
            }
            xp[j] = xj + inc;
            if let Err(first) = ctx.evaluate_or_fatal(&xp, &mut f_right)? {
                inc = -inc;
                xp[j] = xj + inc;
                if ctx.evaluate_or_fatal(&xp, &mut f_right)?.is_err() {
                    return Ok(Err(first));
                }
            }
            let h = xp[j] - xj;
            xp[j] = xj;
            for i in 0..n {
                jac[(i, j)] = (f_right[i] - f[i]) / h;
            }
        }
    }
    Ok(Ok(()))
}

/// Forward differences with every column of a group perturbed at once.
fn compressed_difference(
    ctx: &mut SolveContext<'_>,
    uscale: &[f64],
    partition: &ColumnPartition,
    x: &[f64],
    f: &[f64],
    jac: &mut Mat<f64>,
) -> Result<EvalResult, BlockError> {
    let n = x.len();
    let delta = ctx.config.fd_delta;
    let mut xp = x.to_vec();
    let mut fp = vec![0.0; n];
    let mut incs = vec![0.0; n];
    for group in partition.groups() {
        for &j in group {
            let mut inc = increment(x[j], uscale[j], delta);
            if x[j] + inc > ctx.block.max[j] || x[j] + inc < ctx.block.min[j] {
                inc = -inc;
            }
            xp[j] = x[j] + inc;
            incs[j] = xp[j] - x[j];
        }
        if let Err(err) = ctx.evaluate_or_fatal(&xp, &mut fp)? {
            return Ok(Err(err));
        }
        for &j in group {
            for i in 0..n {
                jac[(i, j)] = 0.0;
            }
            for &i in partition.rows_of(j) {
                jac[(i, j)] = (fp[i] - f[i]) / incs[j];
            }
            xp[j] = x[j];
        }
    }
    Ok(Ok(()))
}

/// Columns of `J` as directional derivatives along the unit vectors.
fn directional(
    ctx: &mut SolveContext<'_>,
    x: &[f64],
    jac: &mut Mat<f64>,
) -> Result<EvalResult, BlockError> {
    let n = x.len();
    let Some(derivative) = ctx.derivative.as_deref_mut() else {
        return Ok(Err(EvalError::recoverable("no directional derivative")));
    };
    let mut seed = vec![0.0; n];
    let mut residual = vec![0.0; n];
    let mut column = vec![0.0; n];
    for j in 0..n {
        seed[j] = 1.0;
        let status = derivative.directional_derivative(x, &seed, &mut residual, &mut column);
        seed[j] = 0.0;
        match status {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(BlockError::from_eval(EvalMode::Derivative, err)),
            Err(err) => return Ok(Err(err)),
        }
        for (i, v) in column.iter().enumerate() {
            jac[(i, j)] = *v;
        }
    }
    Ok(Ok(()))
}

/// Compare an analytic or directional Jacobian against forward differences.
fn check_against_differences(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
    x: &[f64],
    f: &[f64],
) -> Result<(), BlockError> {
    let n = x.len();
    let mut fd = Mat::zeros(n, n);
    let forward = vec![false; n];
    if finite_difference(ctx, &state.uscale, &forward, x, f, &mut fd)?.is_err() {
        return Ok(());
    }
    let tol = ctx.config.jacobian_check_tolerance;
    for j in 0..n {
        for i in 0..n {
            let analytic = state.jacobian[(i, j)];
            let estimate = fd[(i, j)];
            let relative = (analytic - estimate).abs() / (estimate.abs() + 1.0);
            if relative >= tol {
                state.jacobian_mismatches += 1;
                ctx.emit(
                    Severity::Error,
                    "JacobianCheck",
                    format!("Jacobian entry ({i}, {j}) disagrees with finite differences"),
                    vec![
                        ("row", i as f64),
                        ("column", j as f64),
                        ("jacobian", analytic),
                        ("finite_difference", estimate),
                    ],
                );
            }
        }
    }
    Ok(())
}

/// Evaluate a fresh Jacobian at `x`, where `F(x) = f`, into `state.jacobian`.
///
/// `Ok(Err(_))` means the Jacobian is undefined at `x` (a recoverable
/// failure); `Err` is fatal.
pub(crate) fn evaluate_fresh(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
    x: &[f64],
    f: &[f64],
) -> Result<EvalResult, BlockError> {
    let n = x.len();
    let mode = ctx.config.jacobian_mode;
    let mut exact = false;
    let status = if mode == JacobianMode::External && ctx.residual.has_analytic_jacobian() {
        exact = true;
        match ctx.residual.jacobian(x, &mut state.jacobian) {
            Err(err) if err.is_fatal() => return Err(BlockError::from_eval(EvalMode::Derivative, err)),
            other => other,
        }
    } else if mode != JacobianMode::External && ctx.derivative.is_some() {
        exact = true;
        directional(ctx, x, &mut state.jacobian)?
    } else if let Some(partition) = state
        .partition
        .as_ref()
        .filter(|_| mode == JacobianMode::Compression)
    {
        let status = compressed_difference(ctx, &state.uscale, partition, x, f, &mut state.jacobian)?;
        match status {
            Ok(()) => Ok(()),
            Err(err) => {
                ctx.emit(
                    Severity::Warning,
                    "CompressedJacobianFailed",
                    format!("Compressed Jacobian evaluation failed ({}); using plain differences", err.reason()),
                    Vec::new(),
                );
                let forward = vec![false; n];
                finite_difference(ctx, &state.uscale, &forward, x, f, &mut state.jacobian)?
            }
        }
    } else {
        let central = central_columns(ctx, state, x);
        finite_difference(ctx, &state.uscale, &central, x, f, &mut state.jacobian)?
    };
    if let Err(err) = status {
        state.flags.jacobian_current = false;
        state.jacobian_at_iterate = false;
        return Ok(Err(err));
    }
    let mut non_finite = None;
    for j in 0..n {
        for i in 0..n {
            if !state.jacobian[(i, j)].is_finite() {
                non_finite = Some((i, j));
            }
        }
    }
    if let Some((i, j)) = non_finite {
        state.flags.jacobian_current = false;
        state.jacobian_at_iterate = false;
        return Ok(Err(EvalError::recoverable(format!(
            "Jacobian entry ({i}, {j}) is not finite"
        ))));
    }

    ctx.block.counters.jacobian_evaluations += 1;
    ctx.block.jacobian_invalidated = false;
    state.jacobian_changed();
    state.jacobian_at_iterate = true;
    state.iterations_since_jacobian = 0;
    state.flags.force_new_jacobian = false;
    if exact && ctx.config.jacobian_check {
        check_against_differences(ctx, state, x, f)?;
    }
    tracing::trace!(block = %ctx.block.label, generation = state.jacobian_generation, "evaluated Jacobian");
    Ok(Ok(()))
}

/// Apply the configured secant update. `false` when it was degenerate or no
/// step history is available.
fn secant_update(update: JacobianUpdate, state: &mut NewtonSolverState, f: &[f64]) -> bool {
    if !state.history_valid {
        return false;
    }
    let NewtonSolverState {
        jacobian,
        last_step,
        last_residual,
        uscale,
        fscale,
        ..
    } = state;
    match update {
        JacobianUpdate::Broyden => quasi_newton::broyden(jacobian, last_step, last_residual, f, uscale),
        JacobianUpdate::SparseBroyden => {
            quasi_newton::sparse_broyden(jacobian, last_step, last_residual, f)
        }
        JacobianUpdate::ModifiedBfgs => {
            quasi_newton::modified_bfgs(jacobian, last_step, last_residual, f, uscale, fscale)
        }
        JacobianUpdate::Full | JacobianUpdate::Reuse => false,
    }
}

/// Make `state.jacobian` usable for Newton iteration `iteration` (1-based) at
/// `x`, where `F(x) = f`. Evaluates, updates or keeps it, as the variability
/// class and update policy allow. The `bool` is whether `J` was evaluated at `x`.
pub(crate) fn prepare(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
    iteration: usize,
    x: &[f64],
    f: &[f64],
) -> Result<EvalResult<bool>, BlockError> {
    let update = ctx.config.jacobian_update;
    let variability = ctx.block.variability;
    let must_refresh = state.flags.force_new_jacobian || !state.flags.jacobian_current;
    if !must_refresh && state.jacobian_at_iterate {
        return Ok(Ok(true));
    }
    let fresh = if must_refresh {
        true
    } else if iteration == 1 {
        !variability.reusable_across_solves(ctx.block.jacobian_invalidated)
    } else if !variability.varies_within_solve() {
        false
    } else {
        match update {
            JacobianUpdate::Full => true,
            JacobianUpdate::Reuse => {
                state.iterations_since_jacobian >= ctx.config.max_iterations_without_jacobian
            }
            _ if state.iterations_since_jacobian >= ctx.config.max_iterations_without_jacobian => true,
            quasi => {
                if secant_update(quasi, state, f) {
                    state.jacobian_changed();
                    state.iterations_since_jacobian += 1;
                    return Ok(Ok(false));
                }
                true
            }
        }
    };
    if !fresh {
        state.iterations_since_jacobian += 1;
        return Ok(Ok(false));
    }
    Ok(evaluate_fresh(ctx, state, x, f)?.map(|()| true))
}

#[cfg(test)]
mod tests {
    use faer::sparse::{Pair, SymbolicSparseColMat};

    use super::*;
    use crate::{
        EquationBlock, ResidualFunction, SolverConfig, StartValues,
        bounds::Bounds,
        events::CollectingSink,
    };

    /// Coupled, sparse system with known Jacobian.
    struct Chain;

    impl ResidualFunction for Chain {
        fn initialize(&mut self, start: &mut StartValues) -> EvalResult {
            start.initial = vec![1.0, 2.0, 3.0, 4.0];
            Ok(())
        }

        fn evaluate(&mut self, x: &[f64], f: &mut [f64]) -> EvalResult {
            f[0] = x[0] * x[0] + x[1] - 1.0;
            f[1] = x[1] * x[2];
            f[2] = x[2].exp() - x[3];
            f[3] = x[3] * x[3] * x[3] - x[0];
            Ok(())
        }

        fn has_analytic_jacobian(&self) -> bool {
            true
        }

        fn jacobian(&mut self, x: &[f64], jac: &mut Mat<f64>) -> EvalResult {
            *jac = Mat::zeros(4, 4);
            jac[(0, 0)] = 2.0 * x[0];
            jac[(0, 1)] = 1.0;
            jac[(1, 1)] = x[2];
            jac[(1, 2)] = x[1];
            jac[(2, 2)] = x[2].exp();
            jac[(2, 3)] = -1.0;
            jac[(3, 3)] = 3.0 * x[3] * x[3];
            jac[(3, 0)] = -1.0;
            Ok(())
        }

        fn dependency_pattern(&self) -> Option<SymbolicSparseColMat<usize>> {
            let cells = [(0, 0), (0, 1), (1, 1), (1, 2), (2, 2), (2, 3), (3, 3), (3, 0)];
            let pairs: Vec<_> = cells.iter().map(|&(row, col)| Pair { row, col }).collect();
            SymbolicSparseColMat::try_new_from_indices(4, 4, &pairs)
                .ok()
                .map(|(sym, _)| sym)
        }
    }

    fn jacobian_with(config: SolverConfig) -> Mat<f64> {
        let mut block = EquationBlock::new("chain", 4, Chain, config).unwrap();
        block.evaluate_jacobian().unwrap()
    }

    fn max_difference(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
        let mut out: f64 = 0.0;
        for j in 0..a.ncols() {
            for i in 0..a.nrows() {
                out = out.max((a[(i, j)] - b[(i, j)]).abs());
            }
        }
        out
    }

    #[test]
    fn finite_differences_match_analytic() {
        let analytic = jacobian_with(SolverConfig::default().with_jacobian_mode(JacobianMode::External));
        let forward = jacobian_with(SolverConfig::default());
        let central =
            jacobian_with(SolverConfig::default().with_jacobian_mode(JacobianMode::CentralDifference));
        assert!(max_difference(&analytic, &forward) < 1e-5);
        assert!(max_difference(&analytic, &central) < 1e-5);
    }

    #[test]
    fn compressed_matches_plain_differences() {
        let plain = jacobian_with(SolverConfig::default());
        let compressed =
            jacobian_with(SolverConfig::default().with_jacobian_mode(JacobianMode::Compression));
        assert!(max_difference(&plain, &compressed) < 1e-12);
        assert_eq!(compressed[(0, 2)], 0.0);
    }

    #[test]
    fn compression_uses_fewer_evaluations() {
        let mut plain = EquationBlock::new("chain", 4, Chain, SolverConfig::default()).unwrap();
        plain.evaluate_jacobian().unwrap();
        let config = SolverConfig::default().with_jacobian_mode(JacobianMode::Compression);
        let mut compressed = EquationBlock::new("chain", 4, Chain, config).unwrap();
        compressed.evaluate_jacobian().unwrap();
        assert!(compressed.counters().residual_evaluations < plain.counters().residual_evaluations);
    }

    struct WrongJacobian;

    impl ResidualFunction for WrongJacobian {
        fn evaluate(&mut self, x: &[f64], f: &mut [f64]) -> EvalResult {
            f[0] = 3.0 * x[0];
            Ok(())
        }

        fn has_analytic_jacobian(&self) -> bool {
            true
        }

        fn jacobian(&mut self, _x: &[f64], jac: &mut Mat<f64>) -> EvalResult {
            jac[(0, 0)] = 2.0;
            Ok(())
        }
    }

    #[test]
    fn jacobian_check_reports_mismatch() {
        let sink = CollectingSink::default();
        let config = SolverConfig::default()
            .with_jacobian_mode(JacobianMode::External)
            .with_jacobian_check(1e-3);
        let mut block = EquationBlock::new("wrong", 1, WrongJacobian, config)
            .unwrap()
            .with_log_sink(sink.clone());
        block.evaluate_jacobian().unwrap();
        assert_eq!(sink.with_category("JacobianCheck").len(), 1);
        assert_eq!(block.state().jacobian_mismatches, 1);
    }

    #[test]
    fn increment_follows_sign_and_scale() {
        assert_eq!(increment(0.0, 1.0, 1e-8), 1e-8);
        assert_eq!(increment(-4.0, 1.0, 1e-8), -4e-8);
        assert_eq!(increment(0.5, 0.1, 1e-8), 1e-7);
    }

    #[test]
    fn forward_difference_flips_at_bound() {
        let residual = |x: &[f64], f: &mut [f64]| -> EvalResult {
            if x[0] > 1.0 {
                return Err(EvalError::recoverable("above max"));
            }
            f[0] = x[0] * x[0];
            Ok(())
        };
        let mut block = EquationBlock::new("edge", 1, residual, SolverConfig::default()).unwrap();
        block.set_x(&[1.0]).unwrap();
        let jac = block.evaluate_jacobian().unwrap();
        assert!((jac[(0, 0)] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn central_columns_follow_mode() {
        let residual = |x: &[f64], f: &mut [f64]| -> EvalResult {
            f[0] = x[0];
            f[1] = x[1];
            Ok(())
        };
        let config = SolverConfig::default().with_jacobian_mode(JacobianMode::CentralAtBound);
        let mut block = EquationBlock::new("b", 2, residual, config).unwrap();
        block.set_x(&[0.0, 0.5]).unwrap();
        let (ctx, _) = block.context();
        let mut state = NewtonSolverState::new(2);
        state.bounds = Bounds::new(&[0.0, 0.0], &[1.0, 1.0], None);
        let central = central_columns(&ctx, &state, &[0.0, 0.5]);
        assert_eq!(central, vec![true, false]);
    }

    #[test]
    fn late_central_modes_wait_for_their_trigger() {
        let residual = |x: &[f64], f: &mut [f64]| -> EvalResult {
            f[0] = x[0];
            f[1] = x[1];
            Ok(())
        };
        let x = [0.5, 0.0];
        let columns = |mode: JacobianMode, second_solve: bool, last_fnorm: f64| {
            let config = SolverConfig::default().with_jacobian_mode(mode);
            let mut block = EquationBlock::new("b", 2, residual, config).unwrap();
            block.set_x(&x).unwrap();
            let (ctx, _) = block.context();
            let mut state = NewtonSolverState::new(2);
            state.bounds = Bounds::new(&[0.0, -1.0], &[1.0, 1.0], None);
            state.second_solve = second_solve;
            state.last_fnorm = last_fnorm;
            central_columns(&ctx, &state, &x)
        };

        assert_eq!(columns(JacobianMode::CentralSecondSolve, false, 1.0), vec![false, false]);
        assert_eq!(columns(JacobianMode::CentralSecondSolve, true, 1.0), vec![true, true]);
        assert_eq!(
            columns(JacobianMode::CentralAtBoundAndZeroSecondSolve, false, 1.0),
            vec![false, false]
        );
        assert_eq!(
            columns(JacobianMode::CentralAtBoundAndZeroSecondSolve, true, 1.0),
            vec![false, true]
        );
        assert_eq!(
            columns(JacobianMode::CentralAtBoundSecondSolve, true, 1.0),
            vec![false, false]
        );
        assert_eq!(columns(JacobianMode::CentralAtSmallResidual, false, 1.0), vec![false, false]);
        assert_eq!(columns(JacobianMode::CentralAtSmallResidual, false, 1e-12), vec![true, true]);
    }
}
