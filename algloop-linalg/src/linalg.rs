use super::{LinalgError, LinalgResult, LinearSolver};
use error_stack::{Report, ResultExt};
use faer::{
    ColRef, Mat, MatMut,
    linalg::solvers::{DenseSolveCore, PartialPivLu},
    prelude::Solve,
};

/// Row-pivoted LU factorization of a dense square matrix.
///
/// faer's factorization never fails, so after factoring we look at the
/// diagonal of `U`: a pivot that is exactly zero, not finite, or below
/// `ε · max|A|` rejects the matrix as singular. The factorization (with its
/// row permutation) is `Clone`, so it can be kept in a checkpoint and reused.
#[derive(Debug, Clone, Default)]
pub struct DenseLu {
    lu: Option<PartialPivLu<f64>>,
    dim: usize,
    norm_one: f64,
}

impl DenseLu {
    /// Reciprocal condition number in the 1-norm, `1 / (‖A‖₁ ‖A⁻¹‖₁)`.
    pub fn reciprocal_condition(&self) -> LinalgResult<f64> {
        let lu = self
            .lu
            .as_ref()
            .ok_or(LinalgError)
            .attach_printable("Dense LU not factorized")?;
        if self.dim == 0 || self.norm_one == 0.0 {
            return Ok(0.0);
        }
        let inv_norm = one_norm(&lu.inverse());
        if !inv_norm.is_finite() {
            return Ok(0.0);
        }
        Ok(1.0 / (self.norm_one * inv_norm))
    }
}

impl LinearSolver<Mat<f64>> for DenseLu {
    fn factor(&mut self, a: &Mat<f64>) -> LinalgResult<()> {
        self.lu = None;
        if a.nrows() != a.ncols() {
            return Err(Report::new(LinalgError).attach_printable(format!(
                "LU needs a square matrix, got {}x{}",
                a.nrows(),
                a.ncols()
            )));
        }
        let largest = a.as_ref().norm_max();
        if !largest.is_finite() {
            return Err(Report::new(LinalgError).attach_printable("Matrix has non-finite entries"));
        }
        let threshold = f64::EPSILON * largest;
        let lu = a.partial_piv_lu();
        let singular = lu
            .U()
            .diagonal()
            .column_vector()
            .iter()
            .copied()
            .enumerate()
            .find(|&(_, pivot)| !pivot.is_finite() || pivot == 0.0 || pivot.abs() <= threshold);
        if let Some((k, pivot)) = singular {
            return Err(Report::new(LinalgError)
                .attach_printable(format!("Singular pivot {pivot:e} in column {k}")));
        }
        self.dim = a.nrows();
        self.norm_one = one_norm(a);
        self.lu = Some(lu);
        Ok(())
    }

    fn solve_in_place(&mut self, rhs: &mut [f64]) -> LinalgResult<()> {
        let lu = self
            .lu
            .as_ref()
            .ok_or(LinalgError)
            .attach_printable("Dense LU not factorized")?;
        let n = self.dim;
        if rhs.len() != n {
            return Err(Report::new(LinalgError).attach_printable(format!(
                "Right-hand side has length {} but the factorization is {n}x{n}",
                rhs.len()
            )));
        }
        lu.solve_in_place(MatMut::from_column_major_slice_mut(rhs, n, 1));
        Ok(())
    }
}

/// Minimum-norm least-squares solver based on the SVD `A = UΣVᵀ`.
///
/// Keeps the pseudoinverse `V Σ⁺ Uᵀ`, so a solve is one product. The
/// numerical rank counts singular values above `ε · n · σ_max`.
#[derive(Debug, Clone)]
pub struct MinNormSvd {
    pinv: Mat<f64>,
    rank: usize,
    factored: bool,
}

impl Default for MinNormSvd {
    fn default() -> Self {
        Self {
            pinv: Mat::zeros(0, 0),
            rank: 0,
            factored: false,
        }
    }
}

impl MinNormSvd {
    /// Numerical rank found by the last factorization.
    pub fn rank(&self) -> usize {
        self.rank
    }
}

impl LinearSolver<Mat<f64>> for MinNormSvd {
    fn factor(&mut self, a: &Mat<f64>) -> LinalgResult<()> {
        self.factored = false;
        let (m, n) = (a.nrows(), a.ncols());
        if m != n {
            return Err(Report::new(LinalgError).attach_printable(format!(
                "Minimum-norm solve needs a square matrix, got {m}x{n}"
            )));
        }
        let svd = a.svd().map_err(|e| {
            Report::new(LinalgError).attach_printable(format!("SVD did not converge: {e:?}"))
        })?;
        let sigma = svd.S().column_vector();
        if sigma.iter().any(|s| !s.is_finite()) {
            return Err(Report::new(LinalgError).attach_printable("SVD produced non-finite values"));
        }
        let cutoff = f64::EPSILON * (n as f64) * sigma.norm_max();
        self.rank = sigma.iter().filter(|&&s| s > cutoff).count();
        self.pinv = svd.pseudoinverse();
        self.factored = true;
        Ok(())
    }

    fn solve_in_place(&mut self, rhs: &mut [f64]) -> LinalgResult<()> {
        if !self.factored {
            return Err(Report::new(LinalgError).attach_printable("SVD not computed"));
        }
        let n = self.pinv.nrows();
        if rhs.len() != n {
            return Err(Report::new(LinalgError).attach_printable(format!(
                "Right-hand side has length {} but the matrix is {n}x{n}",
                rhs.len()
            )));
        }
        let x = self.pinv.as_ref() * ColRef::from_slice(rhs);
        for (out, xi) in rhs.iter_mut().zip(x.iter()) {
            *out = *xi;
        }
        Ok(())
    }
}

/// `out = A x`.
pub fn mul_vec(a: &Mat<f64>, x: &[f64], out: &mut [f64]) {
    debug_assert_eq!(a.nrows(), out.len());
    let ax = a.as_ref() * ColRef::from_slice(x);
    for (o, v) in out.iter_mut().zip(ax.iter()) {
        *o = *v;
    }
}

/// `out = Aᵀ y`.
pub fn mul_transpose_vec(a: &Mat<f64>, y: &[f64], out: &mut [f64]) {
    debug_assert_eq!(a.ncols(), out.len());
    let aty = a.transpose() * ColRef::from_slice(y);
    for (o, v) in out.iter_mut().zip(aty.iter()) {
        *o = *v;
    }
}

/// `Aᵀ W² A` for the diagonal weights `w`.
pub fn weighted_normal_matrix(a: &Mat<f64>, w: &[f64]) -> Mat<f64> {
    debug_assert_eq!(a.nrows(), w.len());
    let wa = Mat::from_fn(a.nrows(), a.ncols(), |i, j| w[i] * a[(i, j)]);
    wa.transpose() * wa.as_ref()
}

/// Maximum absolute column sum.
fn one_norm(a: &Mat<f64>) -> f64 {
    a.as_ref()
        .col_iter()
        .map(|col| col.norm_l1())
        .fold(0.0, libm::fmax)
}
