use algloop_linalg::{DenseLu, LinearSolver, MinNormSvd, mul_transpose_vec, weighted_normal_matrix};

use crate::{
    block::SolveContext,
    error::BlockError,
    events::Severity,
    solve_outcome::StepKind,
    state::{Factorization, NewtonSolverState, SingularMode, SolverPhase},
};

/// Factorize `state.jacobian`, falling back to a recovery factorization when
/// plain LU fails (or the scaling engine already judged `J` singular).
///
/// Returns `false` when not even the minimum-norm factorization works.
pub(crate) fn factorize(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
) -> Result<bool, BlockError> {
    let n = ctx.block.n;
    state.factorized_generation = Some(state.jacobian_generation);
    let premarked = std::mem::take(&mut state.premarked_singular);
    if !premarked {
        let mut lu = DenseLu::default();
        if lu.factor(&state.jacobian).is_ok() {
            state.factorization = Factorization::Lu(lu);
            state.flags.singular = false;
            state.singular_mode = SingularMode::Regularization;
            return Ok(true);
        }
    }

    let mode = if premarked || !state.flags.singular {
        SingularMode::Regularization
    } else {
        SingularMode::MinimumNorm
    };
    state.flags.singular = true;
    state.singular_mode = mode;
    ctx.emit(
        Severity::Warning,
        "SingularJacobian",
        "Singular Jacobian detected",
        vec![("generation", state.jacobian_generation as f64)],
    );

    if n == 1 {
        state.factorization = Factorization::Scalar;
        return Ok(true);
    }

    if mode == SingularMode::Regularization {
        let mut normal = weighted_normal_matrix(&state.jacobian, &state.fscale);
        for (j, d) in state.uscale.iter().enumerate() {
            normal[(j, j)] += d * d;
        }
        let mut lu = DenseLu::default();
        if lu.factor(&normal).is_ok() {
            ctx.emit(
                Severity::Info,
                "Regularization",
                "Using the regularized normal equations",
                Vec::new(),
            );
            state.factorization = Factorization::Regularized(lu);
            return Ok(true);
        }
        state.singular_mode = SingularMode::MinimumNorm;
    }

    let mut svd = MinNormSvd::default();
    match svd.factor(&state.jacobian) {
        Ok(()) => {
            ctx.emit(
                Severity::Info,
                "MinimumNorm",
                "Using the minimum-norm solution",
                vec![("rank", svd.rank() as f64)],
            );
            state.factorization = Factorization::MinimumNorm(svd);
            Ok(true)
        }
        Err(report) => {
            tracing::debug!(block = %ctx.block.label, error = ?report, "minimum-norm factorization failed");
            state.factorization = Factorization::None;
            Ok(false)
        }
    }
}

/// Newton step `p` from `J p = -F`, through whichever factorization is current.
///
/// `None` means no step could be computed.
pub(crate) fn compute_step(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
    f: &[f64],
    step_tolerance: f64,
    step: &mut [f64],
) -> Result<Option<StepKind>, BlockError> {
    if !state.factorization_is_current() && !factorize(ctx, state)? {
        return Ok(None);
    }
    for (p, fi) in step.iter_mut().zip(f) {
        *p = -fi;
    }
    let kind = match &mut state.factorization {
        Factorization::None => return Ok(None),
        Factorization::Lu(lu) => {
            if lu.solve_in_place(step).is_err() {
                return Ok(None);
            }
            StepKind::Newton
        }
        Factorization::Regularized(lu) => {
            let weighted: Vec<f64> = step
                .iter()
                .zip(&state.fscale)
                .map(|(b, w)| b * w * w)
                .collect();
            let mut rhs = vec![0.0; step.len()];
            mul_transpose_vec(&state.jacobian, &weighted, &mut rhs);
            let gradient = rhs.iter().map(|g| g.abs()).fold(0.0, libm::fmax);
            if gradient < step_tolerance {
                // Flat weighted gradient: push along a fixed, scale-aware direction instead.
                let push: f64 = step
                    .iter()
                    .zip(&state.fscale)
                    .zip(&state.uscale)
                    .map(|((b, w), d)| b * w * w / d)
                    .sum();
                rhs.fill(push);
            }
            if lu.solve_in_place(&mut rhs).is_err() {
                return Ok(None);
            }
            step.copy_from_slice(&rhs);
            StepKind::Regularized
        }
        Factorization::MinimumNorm(svd) => {
            if svd.solve_in_place(step).is_err() {
                return Ok(None);
            }
            StepKind::MinimumNorm
        }
        Factorization::Scalar => {
            let nominal = ctx.block.nominal[0];
            step[0] = 0.1 * nominal.abs() * (-f[0]).signum() * state.jacobian[(0, 0)].signum();
            StepKind::Regularized
        }
    };
    if step.iter().any(|p| !p.is_finite()) {
        return Ok(None);
    }
    if kind != StepKind::Newton {
        after_recovery_step(ctx, state)?;
    }
    Ok(Some(kind))
}

fn after_recovery_step(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
) -> Result<(), BlockError> {
    state.flags.force_new_jacobian = true;
    if ctx.config.rescale_after_singular_jacobian {
        state.flags.force_rescaling = true;
    }
    if ctx.block.auxiliary_count > 0 {
        let x = ctx.block.x.clone();
        ctx.evaluate_auxiliary(&x)?;
    }
    ctx.block.phase = match state.singular_mode {
        SingularMode::Regularization => SolverPhase::Regularizing,
        SingularMode::MinimumNorm => SolverPhase::MinimumNorm,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use faer::Mat;

    use super::*;
    use crate::{EquationBlock, EvalResult, SolverConfig, events::CollectingSink};

    fn with_context<T>(
        n: usize,
        body: impl FnOnce(&mut SolveContext<'_>, &mut NewtonSolverState) -> T,
    ) -> (T, CollectingSink) {
        let residual = |_x: &[f64], _f: &mut [f64]| -> EvalResult { Ok(()) };
        let sink = CollectingSink::default();
        let mut block = EquationBlock::new("singular", n, residual, SolverConfig::default())
            .unwrap()
            .with_log_sink(sink.clone());
        let (mut ctx, _) = block.context();
        ctx.block.nominal = vec![2.0; n];
        let mut state = NewtonSolverState::new(n);
        let out = body(&mut ctx, &mut state);
        (out, sink)
    }

    #[test]
    fn regular_matrix_uses_lu() {
        let ((kind, step), _) = with_context(2, |ctx, state| {
            state.jacobian = Mat::from_fn(2, 2, |i, j| [[2.0, 0.0], [0.0, 4.0]][i][j]);
            state.jacobian_changed();
            let mut step = vec![0.0; 2];
            let kind = compute_step(ctx, state, &[2.0, 2.0], 1e-10, &mut step).unwrap();
            (kind, step)
        });
        assert_eq!(kind, Some(StepKind::Newton));
        assert_eq!(step, vec![-1.0, -0.5]);
    }

    #[test]
    fn first_singularity_regularizes_then_minimum_norm() {
        let ((first, second, mode), sink) = with_context(2, |ctx, state| {
            state.jacobian = Mat::from_fn(2, 2, |_, _| 1.0);
            state.jacobian_changed();
            let mut step = vec![0.0; 2];
            let first = compute_step(ctx, state, &[1.0, 1.0], 1e-10, &mut step).unwrap();
            assert!(state.flags.force_new_jacobian);
            state.jacobian_changed();
            let second = compute_step(ctx, state, &[1.0, 1.0], 1e-10, &mut step).unwrap();
            // Minimum-norm solution of [1 1; 1 1] p = -[1 1] is p = (-0.5, -0.5).
            assert!((step[0] + 0.5).abs() < 1e-12);
            assert!((step[1] + 0.5).abs() < 1e-12);
            (first, second, state.singular_mode)
        });
        assert_eq!(first, Some(StepKind::Regularized));
        assert_eq!(second, Some(StepKind::MinimumNorm));
        assert_eq!(mode, SingularMode::MinimumNorm);
        assert_eq!(sink.with_category("SingularJacobian").len(), 2);
        assert_eq!(sink.with_category("Regularization").len(), 1);
    }

    #[test]
    fn scalar_heuristic_for_one_unknown() {
        let ((kind, step), _) = with_context(1, |ctx, state| {
            state.jacobian = Mat::zeros(1, 1);
            state.jacobian_changed();
            let mut step = vec![0.0];
            let kind = compute_step(ctx, state, &[3.0], 1e-10, &mut step).unwrap();
            (kind, step)
        });
        assert_eq!(kind, Some(StepKind::Regularized));
        // 0.1 * |nominal| * sign(-F) * sign(J) with sign(0) = +1.
        assert!((step[0] + 0.2).abs() < 1e-15);
    }

    #[test]
    fn lu_success_clears_singular_state() {
        let (singular, _) = with_context(1, |ctx, state| {
            state.flags.singular = true;
            state.singular_mode = SingularMode::MinimumNorm;
            state.jacobian = Mat::from_fn(1, 1, |_, _| 2.0);
            state.jacobian_changed();
            factorize(ctx, state).unwrap();
            (state.flags.singular, state.singular_mode)
        });
        assert_eq!(singular, (false, SingularMode::Regularization));
    }

    #[test]
    fn premarked_jacobian_skips_lu() {
        let (kind, _) = with_context(2, |ctx, state| {
            state.jacobian = Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 0.0 });
            state.jacobian_changed();
            state.premarked_singular = true;
            let mut step = vec![0.0; 2];
            compute_step(ctx, state, &[1.0, 1.0], 1e-10, &mut step).unwrap()
        });
        assert_eq!(kind, Some(StepKind::Regularized));
    }
}
