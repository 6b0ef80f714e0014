//! Secant updates of the Jacobian between fresh evaluations.
//!
//! Each update takes the accepted step `p = x_new - x_old` and the residuals
//! on both ends, and returns `false` without touching `J` when its
//! denominator is degenerate.
use algloop_linalg::{mul_transpose_vec, mul_vec};
use faer::Mat;

use crate::UNIT_ROUNDOFF;

fn usable(denominator: f64) -> bool {
    denominator.is_finite() && denominator.abs() > f64::MIN_POSITIVE
}

/// `r = Δf - J p`, with entries lost in round-off set to zero.
fn secant_defect(jac: &Mat<f64>, step: &[f64], f_old: &[f64], f_new: &[f64]) -> Vec<f64> {
    let mut jp = vec![0.0; f_new.len()];
    mul_vec(jac, step, &mut jp);
    f_new
        .iter()
        .zip(f_old)
        .zip(&jp)
        .map(|((new, old), jp)| {
            let r = (new - old) - jp;
            if r.abs() < UNIT_ROUNDOFF * (new.abs() + old.abs()) {
                0.0
            } else {
                r
            }
        })
        .collect()
}

/// Broyden's rank-one update in the variable-scaled norm:
/// `J += r (D²p)ᵀ / (pᵀD²p)`.
pub(crate) fn broyden(
    jac: &mut Mat<f64>,
    step: &[f64],
    f_old: &[f64],
    f_new: &[f64],
    uscale: &[f64],
) -> bool {
    let weighted: Vec<f64> = step.iter().zip(uscale).map(|(p, d)| d * d * p).collect();
    let denominator: f64 = weighted.iter().zip(step).map(|(w, p)| w * p).sum();
    if !usable(denominator) {
        return false;
    }
    let r = secant_defect(jac, step, f_old, f_new);
    for (j, w) in weighted.iter().enumerate() {
        let c = w / denominator;
        for (i, ri) in r.iter().enumerate() {
            jac[(i, j)] += ri * c;
        }
    }
    true
}

/// Bogle & Perkins' sparse Broyden update. Row `i` changes by
/// `r_i p_j J_ij² / Σ_k (p_k J_ik)²`, so structural zeros stay zero.
pub(crate) fn sparse_broyden(
    jac: &mut Mat<f64>,
    step: &[f64],
    f_old: &[f64],
    f_new: &[f64],
) -> bool {
    if step.iter().all(|p| *p == 0.0) {
        return false;
    }
    let r = secant_defect(jac, step, f_old, f_new);
    let n = step.len();
    for (i, ri) in r.iter().enumerate() {
        if *ri == 0.0 {
            continue;
        }
        let denominator: f64 = (0..n).map(|k| (step[k] * jac[(i, k)]).powi(2)).sum();
        if !usable(denominator) {
            continue;
        }
        for (j, pj) in step.iter().enumerate() {
            let jij = jac[(i, j)];
            jac[(i, j)] += ri * pj * jij * jij / denominator;
        }
    }
    true
}

/// Rank-two modified BFGS update:
/// `J += Δf (D²p)ᵀ/(pᵀD²p) - (Jp)(JᵀW²Δf)ᵀ/(ΔfᵀW²Jp)`.
pub(crate) fn modified_bfgs(
    jac: &mut Mat<f64>,
    step: &[f64],
    f_old: &[f64],
    f_new: &[f64],
    uscale: &[f64],
    fscale: &[f64],
) -> bool {
    let n = step.len();
    let df: Vec<f64> = f_new.iter().zip(f_old).map(|(a, b)| a - b).collect();
    let weighted_step: Vec<f64> = step.iter().zip(uscale).map(|(p, d)| d * d * p).collect();
    let step_denominator: f64 = weighted_step.iter().zip(step).map(|(w, p)| w * p).sum();

    let mut jp = vec![0.0; n];
    mul_vec(jac, step, &mut jp);
    let weighted_df: Vec<f64> = df.iter().zip(fscale).map(|(d, w)| w * w * d).collect();
    let mut jt_wdf = vec![0.0; n];
    mul_transpose_vec(jac, &weighted_df, &mut jt_wdf);
    let curvature: f64 = weighted_df.iter().zip(&jp).map(|(a, b)| a * b).sum();
    if !usable(step_denominator) || !usable(curvature) {
        return false;
    }
    for j in 0..n {
        let a = weighted_step[j] / step_denominator;
        let b = jt_wdf[j] / curvature;
        for i in 0..n {
            jac[(i, j)] += df[i] * a - jp[i] * b;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mat(rows: &[[f64; 2]; 2]) -> Mat<f64> {
        Mat::from_fn(2, 2, |i, j| rows[i][j])
    }

    fn secant_error(jac: &Mat<f64>, step: &[f64], f_old: &[f64], f_new: &[f64]) -> f64 {
        let mut jp = vec![0.0; step.len()];
        mul_vec(jac, step, &mut jp);
        jp.iter()
            .zip(f_new.iter().zip(f_old))
            .map(|(jp, (new, old))| (jp - (new - old)).abs())
            .fold(0.0, libm::fmax)
    }

    #[test]
    fn broyden_satisfies_secant_equation() {
        let mut jac = mat(&[[2.0, 1.0], [0.5, 3.0]]);
        let step = [0.3, -0.2];
        let f_old = [1.0, 2.0];
        let f_new = [1.7, 1.1];
        assert!(broyden(&mut jac, &step, &f_old, &f_new, &[1.0, 0.5]));
        assert!(secant_error(&jac, &step, &f_old, &f_new) < 1e-14);
    }

    #[test]
    fn sparse_broyden_keeps_structure() {
        let mut jac = mat(&[[2.0, 0.0], [0.5, 3.0]]);
        let step = [0.3, -0.2];
        let f_old = [1.0, 2.0];
        let f_new = [1.7, 1.1];
        assert!(sparse_broyden(&mut jac, &step, &f_old, &f_new));
        assert_eq!(jac[(0, 1)], 0.0);
        assert!(secant_error(&jac, &step, &f_old, &f_new) < 1e-14);
    }

    #[test]
    fn modified_bfgs_satisfies_secant_equation() {
        let mut jac = mat(&[[2.0, 1.0], [0.5, 3.0]]);
        let step = [0.3, -0.2];
        let f_old = [1.0, 2.0];
        let f_new = [1.7, 1.1];
        assert!(modified_bfgs(&mut jac, &step, &f_old, &f_new, &[1.0, 1.0], &[1.0, 1.0]));
        assert!(secant_error(&jac, &step, &f_old, &f_new) < 1e-13);
    }

    #[test]
    fn zero_step_is_degenerate() {
        let mut jac = mat(&[[2.0, 1.0], [0.5, 3.0]]);
        let before = jac.clone();
        assert!(!broyden(&mut jac, &[0.0, 0.0], &[1.0, 1.0], &[1.0, 1.0], &[1.0, 1.0]));
        assert!(!sparse_broyden(&mut jac, &[0.0, 0.0], &[1.0, 1.0], &[1.0, 1.0]));
        assert_eq!(jac, before);
    }
}
