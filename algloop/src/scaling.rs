use algloop_linalg::{DenseLu, LinearSolver};
use faer::Mat;

use crate::{
    block::SolveContext,
    config::{ResidualScaling, VariableScaling},
    error::BlockError,
    events::Severity,
    jacobian,
    state::NewtonSolverState,
};

/// `uscale_j`: the reciprocal of each variable's typical magnitude.
pub(crate) fn variable_scales(mode: &VariableScaling, nominal: &[f64], tol: f64) -> Vec<f64> {
    match mode {
        VariableScaling::None => vec![1.0; nominal.len()],
        VariableScaling::Nominal => nominal
            .iter()
            .map(|nom| 1.0 / libm::fmax(nom.abs(), tol))
            .collect(),
        VariableScaling::Manual(magnitudes) => nominal
            .iter()
            .enumerate()
            .map(|(j, nom)| {
                let v = magnitudes.get(j).copied().unwrap_or(*nom);
                1.0 / libm::fmax(v.abs(), tol)
            })
            .collect(),
    }
}

/// Raw automatic residual scales: the reciprocal of the largest entry in each
/// row of `J`, with column `j` weighted by the size of `x_j`.
pub(crate) fn auto_scales(jac: &Mat<f64>, nominal: &[f64], x: &[f64], tol: f64) -> Vec<f64> {
    let weights: Vec<f64> = nominal
        .iter()
        .zip(x)
        .map(|(nom, x)| libm::fmax(libm::fmax(nom.abs(), x.abs()), tol))
        .collect();
    (0..jac.nrows())
        .map(|i| {
            let row_max = weights
                .iter()
                .enumerate()
                .map(|(j, w)| jac[(i, j)].abs() * w)
                .fold(0.0, libm::fmax);
            1.0 / row_max
        })
        .collect()
}

/// Clamp a raw scale into `[min, max]`. NaN becomes 1. Reports whether it had to change.
fn clamp_scale(raw: f64, min: f64, max: f64) -> (f64, bool) {
    if raw.is_nan() {
        (1.0, true)
    } else if raw < min {
        (min, true)
    } else if raw > max {
        (max, true)
    } else {
        (raw, false)
    }
}

/// Clamp every scale, logging each one that had to change.
fn clamp_all(ctx: &mut SolveContext<'_>, state: &mut NewtonSolverState, raw: &[f64]) {
    let (min, max) = (ctx.config.min_scaling_factor, ctx.config.max_scaling_factor);
    for (i, &r) in raw.iter().enumerate() {
        let (scale, clamped) = clamp_scale(r, min, max);
        if clamped {
            state.flags.poorly_scaled = true;
            ctx.emit(
                Severity::Warning,
                "ScalingClamped",
                format!("Residual scale for equation {i} is out of range"),
                vec![("index", i as f64), ("raw", r), ("scale", scale)],
            );
        }
        state.fscale[i] = scale;
    }
}

/// Recompute `fscale` according to the configured policy.
///
/// The automatic policies need `F` and a fresh `J` at the current iterate;
/// if either cannot be evaluated the old scales are kept.
pub(crate) fn update_residual_scales(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
) -> Result<(), BlockError> {
    let n = ctx.block.n;
    let mode = ctx.config.residual_scaling;
    let tol = ctx.config.tolerance;
    state.flags.force_rescaling = false;
    if mode == ResidualScaling::None {
        state.fscale.fill(1.0);
        state.flags.poorly_scaled = false;
        return Ok(());
    }

    let x = ctx.block.x.clone();
    let mut raw = vec![1.0; n];
    if mode.is_auto() {
        let mut f = vec![0.0; n];
        if ctx.evaluate_or_fatal(&x, &mut f)?.is_err() {
            tracing::debug!(block = %ctx.block.label, "residual undefined at iterate, keeping residual scales");
            return Ok(());
        }
        if jacobian::evaluate_fresh(ctx, state, &x, &f)?.is_err() {
            tracing::debug!(block = %ctx.block.label, "Jacobian undefined at iterate, keeping residual scales");
            return Ok(());
        }
        raw = auto_scales(&state.jacobian, &ctx.block.nominal, &x, tol);
    }
    if matches!(mode, ResidualScaling::Manual | ResidualScaling::Hybrid) {
        let mut nominals = vec![0.0; n];
        if ctx.residual.residual_nominals(&mut nominals) {
            for (r, nom) in raw.iter_mut().zip(&nominals) {
                if *nom != 0.0 {
                    *r = 1.0 / nom.abs();
                } else if mode == ResidualScaling::Manual {
                    *r = 1.0;
                }
            }
        }
    }

    state.flags.poorly_scaled = false;
    clamp_all(ctx, state, &raw);
    tracing::trace!(block = %ctx.block.label, fscale = ?state.fscale, "updated residual scales");

    let check_condition = state.flags.poorly_scaled && !state.flags.singular;
    if (check_condition || ctx.config.check_jacobian_condition) && state.flags.jacobian_current {
        let cond = scaled_condition_number(&state.jacobian, &state.fscale, &state.uscale);
        if ctx.config.check_jacobian_condition {
            ctx.emit(
                Severity::Info,
                "JacobianCondition",
                "Condition number of the scaled Jacobian",
                vec![("condition", cond)],
            );
        }
        if check_condition && cond > ctx.config.regularization_threshold() {
            ctx.emit(
                Severity::Warning,
                "IllConditioned",
                "Scaled Jacobian is ill-conditioned; treating it as singular",
                vec![("condition", cond)],
            );
            state.premarked_singular = true;
            state.factorized_generation = None;
        }
    }
    Ok(())
}

/// Tighten residual scales during the first Newton solve: each scale becomes
/// the smaller of its old value and the value for the current Jacobian.
pub(crate) fn tighten_residual_scales(
    ctx: &mut SolveContext<'_>,
    state: &mut NewtonSolverState,
    x: &[f64],
) {
    let mut raw = auto_scales(&state.jacobian, &ctx.block.nominal, x, ctx.config.tolerance);
    for (r, old) in raw.iter_mut().zip(&state.fscale) {
        if !r.is_nan() {
            *r = libm::fmin(*r, *old);
        }
    }
    clamp_all(ctx, state, &raw);
}

/// 1-norm condition number of `diag(fscale) · J · diag(1/uscale)`.
/// Infinite when the scaled matrix cannot be factorized.
pub(crate) fn scaled_condition_number(jac: &Mat<f64>, fscale: &[f64], uscale: &[f64]) -> f64 {
    let scaled = Mat::from_fn(jac.nrows(), jac.ncols(), |i, j| {
        fscale[i] * jac[(i, j)] / uscale[j]
    });
    let mut lu = DenseLu::default();
    if lu.factor(&scaled).is_err() {
        return f64::INFINITY;
    }
    match lu.reciprocal_condition() {
        Ok(rcond) if rcond > 0.0 => 1.0 / rcond,
        _ => f64::INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_variable_scales() {
        let scales = variable_scales(&VariableScaling::Nominal, &[2.0, -0.5, 0.0], 1e-10);
        assert_eq!(scales, vec![0.5, 2.0, 1e10]);
        let none = variable_scales(&VariableScaling::None, &[2.0], 1e-10);
        assert_eq!(none, vec![1.0]);
        let manual = variable_scales(&VariableScaling::Manual(vec![4.0]), &[2.0, 8.0], 1e-10);
        assert_eq!(manual, vec![0.25, 0.125]);
    }

    #[test]
    fn auto_scales_use_row_maxima() {
        let jac = Mat::from_fn(2, 2, |i, j| [[1.0, 100.0], [0.5, 0.0]][i][j]);
        let scales = auto_scales(&jac, &[1.0, 1.0], &[1.0, 2.0], 1e-10);
        assert!((scales[0] - 1.0 / 200.0).abs() < 1e-15);
        assert!((scales[1] - 2.0).abs() < 1e-15);
    }

    #[test]
    fn zero_row_gives_infinite_raw_scale() {
        let jac = Mat::<f64>::zeros(1, 1);
        let scales = auto_scales(&jac, &[1.0], &[1.0], 1e-10);
        assert!(scales[0].is_infinite());
        assert_eq!(clamp_scale(scales[0], 1e-10, 1e10), (1e10, true));
    }

    #[test]
    fn clamp_maps_nan_to_one() {
        assert_eq!(clamp_scale(f64::NAN, 1e-10, 1e10), (1.0, true));
        assert_eq!(clamp_scale(0.5, 1e-10, 1e10), (0.5, false));
        assert_eq!(clamp_scale(1e-12, 1e-10, 1e10), (1e-10, true));
    }

    #[test]
    fn condition_number_of_scaled_identity() {
        let jac = Mat::from_fn(2, 2, |i, j| if i == j { [1.0, 1e6][i] } else { 0.0 });
        // Unscaled, the condition number is 1e6; row scaling removes it.
        let raw = scaled_condition_number(&jac, &[1.0, 1.0], &[1.0, 1.0]);
        assert!((raw - 1e6).abs() < 1.0);
        let scaled = scaled_condition_number(&jac, &[1.0, 1e-6], &[1.0, 1.0]);
        assert!((scaled - 1.0).abs() < 1e-9);
    }

    #[test]
    fn singular_matrix_has_infinite_condition() {
        let jac = Mat::from_fn(2, 2, |_, _| 1.0);
        assert!(scaled_condition_number(&jac, &[1.0, 1.0], &[1.0, 1.0]).is_infinite());
    }
}
