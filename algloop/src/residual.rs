//! The residual collaborator: the generated model code the block solves for.
use faer::{Mat, sparse::SymbolicSparseColMat};

use crate::error::{EvalError, EvalResult};

/// Marks a nominal value the model did not provide.
pub const UNDEFINED: f64 = f64::MAX;

/// Values a residual function reports about its unknowns.
///
/// Pre-filled before [`ResidualFunction::initialize`] is called: nominal with
/// [`UNDEFINED`], min with `-inf`, max with `+inf`, initial with `0`.
#[derive(Debug, Clone, PartialEq)]
pub struct StartValues {
    /// Typical magnitude of each unknown.
    pub nominal: Vec<f64>,
    /// Lower bounds.
    pub min: Vec<f64>,
    /// Upper bounds.
    pub max: Vec<f64>,
    /// Initial guess.
    pub initial: Vec<f64>,
}

impl StartValues {
    /// Defaults for `n` unknowns.
    pub fn new(n: usize) -> Self {
        Self {
            nominal: vec![UNDEFINED; n],
            min: vec![f64::NEG_INFINITY; n],
            max: vec![f64::INFINITY; n],
            initial: vec![0.0; n],
        }
    }
}

/// `F(x) = 0` for one algebraic loop.
///
/// Each method is one mode of the collaborator. Only [`Self::evaluate`] is
/// required; every other mode has a neutral default.
pub trait ResidualFunction {
    /// Initialize mode: fill in nominal, bounds and the initial guess.
    fn initialize(&mut self, _start: &mut StartValues) -> EvalResult {
        Ok(())
    }

    /// Evaluate mode: compute `F(x)` into `residual`.
    fn evaluate(&mut self, x: &[f64], residual: &mut [f64]) -> EvalResult;

    /// Evaluate-auxiliary mode: refresh non-real outputs (discrete variables,
    /// relations) that depend on `x`.
    fn evaluate_auxiliary(&mut self, _x: &[f64]) -> EvalResult {
        Ok(())
    }

    /// Write-back mode: commit `x` as the model's current value.
    fn write_back(&mut self, _x: &[f64]) -> EvalResult {
        Ok(())
    }

    /// Residual nominal magnitudes for manual scaling.
    /// Return `false` if none are known; zero entries mean "unknown".
    fn residual_nominals(&self, _nominals: &mut [f64]) -> bool {
        false
    }

    /// Does [`Self::jacobian`] compute anything?
    fn has_analytic_jacobian(&self) -> bool {
        false
    }

    /// Analytic Jacobian at `x`, written into the `n × n` matrix `jac`.
    fn jacobian(&mut self, _x: &[f64], _jac: &mut Mat<f64>) -> EvalResult {
        Err(EvalError::fatal("no analytic Jacobian"))
    }

    /// Which residuals depend on which unknowns (row `i`, column `j`).
    /// Enables column compression.
    fn dependency_pattern(&self) -> Option<SymbolicSparseColMat<usize>> {
        None
    }
}

impl<F> ResidualFunction for F
where
    F: FnMut(&[f64], &mut [f64]) -> EvalResult,
{
    fn evaluate(&mut self, x: &[f64], residual: &mut [f64]) -> EvalResult {
        self(x, residual)
    }
}

/// Computes `J(x)·seed` without forming `J`.
pub trait DirectionalDerivative {
    /// Writes `F(x)` into `residual` and `J(x)·seed` into `derivative`.
    fn directional_derivative(
        &mut self,
        x: &[f64],
        seed: &[f64],
        residual: &mut [f64],
        derivative: &mut [f64],
    ) -> EvalResult;
}
