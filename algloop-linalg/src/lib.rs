//! Dense linear algebra used by the algloop block solver.
//!
//! Blocks are small-to-medium and square, so everything here works on dense
//! [`faer::Mat`] storage and faer's factorizations. The LU reports singular
//! pivots as errors (the block solver needs to know, rather than receive a
//! garbage solve), and the SVD-based solver gives minimum-norm solutions for
//! matrices that LU rejects.
mod linalg;

pub use linalg::{DenseLu, MinNormSvd, mul_transpose_vec, mul_vec, weighted_normal_matrix};

use core::fmt::{self, Display, Formatter};

/// A factor-then-solve linear solver over matrices of type `M`.
pub trait LinearSolver<M> {
    /// Factorizes `a`, replacing any previous factorization.
    fn factor(&mut self, a: &M) -> LinalgResult<()>;
    /// Solves in-place: `rhs` is overwritten with the solution.
    fn solve_in_place(&mut self, rhs: &mut [f64]) -> LinalgResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct LinalgError;

impl Display for LinalgError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("linear algebra error")
    }
}

impl std::error::Error for LinalgError {}

pub type LinalgResult<T> = Result<T, error_stack::Report<LinalgError>>;

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn mat(rows: &[&[f64]]) -> Mat<f64> {
        Mat::from_fn(rows.len(), rows[0].len(), |i, j| rows[i][j])
    }

    fn lu_solve(a: &Mat<f64>, b: &[f64]) -> Vec<f64> {
        let mut lu = DenseLu::default();
        lu.factor(a).unwrap();
        let mut x = b.to_vec();
        lu.solve_in_place(&mut x).unwrap();
        x
    }

    #[test]
    fn lu_solves_small_system() {
        let a = mat(&[&[1.0, 1.0], &[1.0, -1.0]]);
        let x = lu_solve(&a, &[3.0, 1.0]);
        assert!((x[0] - 2.0).abs() < 1e-14);
        assert!((x[1] - 1.0).abs() < 1e-14);
    }

    #[test]
    fn lu_pivots_on_zero_diagonal() {
        let a = mat(&[&[0.0, 2.0, 1.0], &[1.0, 0.0, 0.0], &[0.0, 1.0, 3.0]]);
        for v in lu_solve(&a, &[3.0, 1.0, 4.0]) {
            assert!((v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn lu_rejects_singular() {
        let a = mat(&[&[1.0, 2.0], &[2.0, 4.0]]);
        let mut lu = DenseLu::default();
        assert!(lu.factor(&a).is_err());
        let mut b = vec![1.0, 1.0];
        assert!(lu.solve_in_place(&mut b).is_err());
    }

    #[test]
    fn rcond_of_identity_is_one() {
        let a = Mat::<f64>::identity(4, 4);
        let mut lu = DenseLu::default();
        lu.factor(&a).unwrap();
        let rcond = lu.reciprocal_condition().unwrap();
        assert!((rcond - 1.0).abs() < 1e-14);
    }

    #[test]
    fn rcond_detects_bad_conditioning() {
        let a = mat(&[&[1.0, 0.0], &[0.0, 1e-12]]);
        let mut lu = DenseLu::default();
        lu.factor(&a).unwrap();
        let rcond = lu.reciprocal_condition().unwrap();
        assert!(rcond < 1e-11);
    }

    #[test]
    fn min_norm_on_rank_deficient() {
        // x0 + x1 = 2 twice: the minimum-norm solution is (1, 1).
        let a = mat(&[&[1.0, 1.0], &[1.0, 1.0]]);
        let mut svd = MinNormSvd::default();
        svd.factor(&a).unwrap();
        assert_eq!(svd.rank(), 1);
        let mut b = vec![2.0, 2.0];
        svd.solve_in_place(&mut b).unwrap();
        assert!((b[0] - 1.0).abs() < 1e-12);
        assert!((b[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn min_norm_matches_lu_when_regular() {
        let a = mat(&[&[4.0, 1.0], &[2.0, 3.0]]);
        let lu_x = lu_solve(&a, &[1.0, 2.0]);
        let mut svd = MinNormSvd::default();
        svd.factor(&a).unwrap();
        let mut b = vec![1.0, 2.0];
        svd.solve_in_place(&mut b).unwrap();
        assert!((b[0] - lu_x[0]).abs() < 1e-12);
        assert!((b[1] - lu_x[1]).abs() < 1e-12);
    }

    #[test]
    fn normal_matrix_is_weighted() {
        let a = mat(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let w = [1.0, 0.5];
        let n = weighted_normal_matrix(&a, &w);
        // J^T W^2 J with W = diag(1, 0.5)
        assert!((n[(0, 0)] - (1.0 + 0.25 * 9.0)).abs() < 1e-14);
        assert!((n[(0, 1)] - (2.0 + 0.25 * 12.0)).abs() < 1e-14);
        assert!((n[(1, 0)] - n[(0, 1)]).abs() < 1e-14);
        assert!((n[(1, 1)] - (4.0 + 0.25 * 16.0)).abs() < 1e-14);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn lu_residual_is_small(
                entries in proptest::collection::vec(-10.0f64..10.0, 9),
                b in proptest::collection::vec(-10.0f64..10.0, 3),
            ) {
                // Diagonal dominance keeps the matrix well conditioned.
                let a = Mat::from_fn(3, 3, |i, j| {
                    let v = entries[i * 3 + j];
                    if i == j { v.abs() + 40.0 } else { v }
                });
                let x = lu_solve(&a, &b);
                let mut ax = vec![0.0; 3];
                mul_vec(&a, &x, &mut ax);
                for i in 0..3 {
                    prop_assert!((ax[i] - b[i]).abs() < 1e-10);
                }
            }
        }
    }
}
