#![no_main]

use algloop::{
    EquationBlock, EvalError, EvalResult, ExitCriterion, JacobianMode, JacobianUpdate,
    ResidualFunction, ResidualScaling, SolverConfig, SolverKind, StartValues,
};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

const MAX_UNKNOWNS: usize = 4;

fuzz_target!(|setup: Setup| {
    let n = setup.rows.len().clamp(1, MAX_UNKNOWNS);
    let mut rows = setup.rows;
    rows.resize_with(n, Row::default);
    if rows.iter().any(|r| !r.well_formed()) {
        return;
    }
    let bounds: Vec<_> = rows.iter().map(Row::bounds).collect();
    let config = SolverConfig::default()
        .with_solver_kind(setup.kind)
        .with_jacobian_mode(setup.mode)
        .with_jacobian_update(setup.update)
        .with_residual_scaling(setup.scaling)
        .with_exit_criterion(setup.exit)
        .with_max_iterations(30);
    let enforce = config.enforce_bounds;
    let Ok(mut block) = EquationBlock::new("fuzz", n, Polynomials { rows }, config) else {
        return;
    };
    if let Err(e) = block.solve() {
        // Only a convergence failure can come out of a well-formed, always-defined loop.
        assert!(!e.is_fatal(), "{e}");
        return;
    }
    if enforce {
        for (x, (lo, hi)) in block.x().iter().zip(bounds) {
            assert!(*x >= lo && *x <= hi, "{x} outside [{lo}, {hi}]");
        }
    }
});

#[derive(Debug, Arbitrary)]
struct Setup {
    rows: Vec<Row>,
    kind: SolverKind,
    mode: JacobianMode,
    update: JacobianUpdate,
    scaling: ResidualScaling,
    exit: ExitCriterion,
}

/// `f_i = c0 + c1 x_i + c2 x_i² + c3 x_i³ + coupling · x_{i+1}`.
#[derive(Debug, Arbitrary, Default)]
struct Row {
    coefficients: [f64; 4],
    coupling: f64,
    guess: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Row {
    fn well_formed(&self) -> bool {
        let values = self
            .coefficients
            .iter()
            .chain([&self.coupling, &self.guess])
            .chain(self.min.iter())
            .chain(self.max.iter());
        if !values.into_iter().all(|v| v.is_finite() && v.abs() < 1e6) {
            return false;
        }
        let (lo, hi) = self.bounds();
        lo <= hi
    }

    fn bounds(&self) -> (f64, f64) {
        (self.min.unwrap_or(-f64::MAX), self.max.unwrap_or(f64::MAX))
    }
}

struct Polynomials {
    rows: Vec<Row>,
}

impl ResidualFunction for Polynomials {
    fn initialize(&mut self, start: &mut StartValues) -> EvalResult {
        for (i, row) in self.rows.iter().enumerate() {
            start.initial[i] = row.guess;
            let (lo, hi) = row.bounds();
            start.min[i] = lo;
            start.max[i] = hi;
        }
        Ok(())
    }

    fn evaluate(&mut self, x: &[f64], f: &mut [f64]) -> EvalResult {
        let n = x.len();
        for (i, row) in self.rows.iter().enumerate() {
            let [c0, c1, c2, c3] = row.coefficients;
            let xi = x[i];
            f[i] = c0 + xi * (c1 + xi * (c2 + xi * c3)) + row.coupling * x[(i + 1) % n];
            if !f[i].is_finite() {
                return Err(EvalError::recoverable("polynomial overflow"));
            }
        }
        Ok(())
    }
}
