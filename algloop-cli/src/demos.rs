//! Built-in algebraic loops.
use algloop::{EvalError, EvalResult, ResidualFunction, StartValues};
use faer::{
    Mat,
    sparse::{Pair, SymbolicSparseColMat},
};

type Residual = fn(&[f64], &mut [f64]) -> EvalResult;
type Jacobian = fn(&[f64], &mut Mat<f64>);

/// One loop from the catalogue.
pub struct Demo {
    pub name: &'static str,
    pub description: &'static str,
    pub n: usize,
    pub initial: &'static [f64],
    pub nominal: Option<&'static [f64]>,
    pub min: Option<&'static [f64]>,
    pub max: Option<&'static [f64]>,
    pub residual: Residual,
    pub jacobian: Option<Jacobian>,
    /// Each row depends on its neighbours only, so compressed differences apply.
    pub tridiagonal: bool,
}

impl Demo {
    pub fn find(name: &str) -> Option<&'static Demo> {
        CATALOGUE.iter().find(|d| d.name == name)
    }

    pub fn residual_fn(&'static self) -> DemoResidual {
        DemoResidual(self)
    }
}

/// Adapts a catalogue entry to the solver's residual collaborator.
pub struct DemoResidual(&'static Demo);

impl ResidualFunction for DemoResidual {
    fn initialize(&mut self, start: &mut StartValues) -> EvalResult {
        let demo = self.0;
        start.initial = demo.initial.to_vec();
        if let Some(nominal) = demo.nominal {
            start.nominal = nominal.to_vec();
        }
        if let Some(min) = demo.min {
            start.min = min.to_vec();
        }
        if let Some(max) = demo.max {
            start.max = max.to_vec();
        }
        Ok(())
    }

    fn evaluate(&mut self, x: &[f64], residual: &mut [f64]) -> EvalResult {
        (self.0.residual)(x, residual)
    }

    fn has_analytic_jacobian(&self) -> bool {
        self.0.jacobian.is_some()
    }

    fn jacobian(&mut self, x: &[f64], jac: &mut Mat<f64>) -> EvalResult {
        match self.0.jacobian {
            Some(jacobian) => {
                jacobian(x, jac);
                Ok(())
            }
            None => Err(EvalError::fatal("this loop has no analytic Jacobian")),
        }
    }

    fn dependency_pattern(&self) -> Option<SymbolicSparseColMat<usize>> {
        if !self.0.tridiagonal {
            return None;
        }
        let n = self.0.n;
        let pairs: Vec<_> = (0..n)
            .flat_map(|col| (col.saturating_sub(1)..(col + 2).min(n)).map(move |row| Pair { row, col }))
            .collect();
        SymbolicSparseColMat::try_new_from_indices(n, n, &pairs)
            .ok()
            .map(|(pattern, _)| pattern)
    }
}

const DIODE_SATURATION: f64 = 1e-12;
const THERMAL_VOLTAGE: f64 = 0.025;
const SUPPLY: f64 = 5.0;
const RESISTANCE: f64 = 1000.0;

const CHAIN_LEN: usize = 8;

pub static CATALOGUE: &[Demo] = &[
    Demo {
        name: "square",
        description: "x² = 4 from a far initial guess",
        n: 1,
        initial: &[10.0],
        nominal: None,
        min: None,
        max: None,
        residual: |x, f| {
            f[0] = x[0] * x[0] - 4.0;
            Ok(())
        },
        jacobian: None,
        tridiagonal: false,
    },
    Demo {
        name: "linear",
        description: "x0 + x1 = 3, x0 - x1 = 1 with the exact Jacobian",
        n: 2,
        initial: &[0.0, 0.0],
        nominal: None,
        min: None,
        max: None,
        residual: |x, f| {
            f[0] = x[0] + x[1] - 3.0;
            f[1] = x[0] - x[1] - 1.0;
            Ok(())
        },
        jacobian: Some(|_, jac| {
            jac[(0, 0)] = 1.0;
            jac[(0, 1)] = 1.0;
            jac[(1, 0)] = 1.0;
            jac[(1, 1)] = -1.0;
        }),
        tridiagonal: false,
    },
    Demo {
        name: "capped",
        description: "x = 10 with x ≤ 5: the bound stops the iteration",
        n: 1,
        initial: &[0.0],
        nominal: None,
        min: None,
        max: Some(&[5.0]),
        residual: |x, f| {
            f[0] = x[0] - 10.0;
            Ok(())
        },
        jacobian: None,
        tridiagonal: false,
    },
    Demo {
        name: "circle-line",
        description: "intersection of x0² + x1² = 4 and x0 = x1",
        n: 2,
        initial: &[1.0, 1.5],
        nominal: None,
        min: None,
        max: None,
        residual: |x, f| {
            f[0] = libm::hypot(x[0], x[1]) - 2.0;
            f[1] = x[0] - x[1];
            Ok(())
        },
        jacobian: None,
        tridiagonal: false,
    },
    Demo {
        name: "diode",
        description: "diode voltage in a resistor-diode loop (stiff exponential)",
        n: 1,
        initial: &[0.0],
        nominal: Some(&[0.7]),
        min: Some(&[-SUPPLY]),
        max: Some(&[SUPPLY]),
        residual: |x, f| {
            let v = x[0];
            let current = DIODE_SATURATION * (libm::exp(v / THERMAL_VOLTAGE) - 1.0);
            if !current.is_finite() {
                return Err(EvalError::recoverable("diode current overflow"));
            }
            f[0] = current - (SUPPLY - v) / RESISTANCE;
            Ok(())
        },
        jacobian: None,
        tridiagonal: false,
    },
    Demo {
        name: "chain",
        description: "discretized -u'' + u³ = 1 on eight points (tridiagonal)",
        n: CHAIN_LEN,
        initial: &[0.0; CHAIN_LEN],
        nominal: None,
        min: None,
        max: None,
        residual: |x, f| {
            let n = x.len();
            for i in 0..n {
                let left = if i > 0 { x[i - 1] } else { 0.0 };
                let right = if i + 1 < n { x[i + 1] } else { 0.0 };
                f[i] = 2.0 * x[i] - left - right + x[i].powi(3) - 1.0;
            }
            Ok(())
        },
        jacobian: None,
        tridiagonal: true,
    },
    Demo {
        name: "singular",
        description: "two equations in x0 + x1 only: singular Jacobian everywhere",
        n: 2,
        initial: &[3.0, 4.0],
        nominal: None,
        min: None,
        max: None,
        residual: |x, f| {
            f[0] = x[0] + x[1] - 2.0;
            f[1] = 2.0 * (x[0] + x[1] - 2.0);
            Ok(())
        },
        jacobian: Some(|_, jac| {
            jac[(0, 0)] = 1.0;
            jac[(0, 1)] = 1.0;
            jac[(1, 0)] = 2.0;
            jac[(1, 1)] = 2.0;
        }),
        tridiagonal: false,
    },
    Demo {
        name: "rosenbrock",
        description: "10(x1 - x0²) = 0, 1 - x0 = 0 from (-1.2, 1)",
        n: 2,
        initial: &[-1.2, 1.0],
        nominal: None,
        min: None,
        max: None,
        residual: |x, f| {
            f[0] = 10.0 * (x[1] - x[0] * x[0]);
            f[1] = 1.0 - x[0];
            Ok(())
        },
        jacobian: Some(|x, jac| {
            jac[(0, 0)] = -20.0 * x[0];
            jac[(0, 1)] = 10.0;
            jac[(1, 0)] = -1.0;
            jac[(1, 1)] = 0.0;
        }),
        tridiagonal: false,
    },
];
