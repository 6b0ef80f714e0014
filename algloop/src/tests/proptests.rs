use proptest::prelude::*;

use crate::{
    CollectingSink, EquationBlock, EvalResult, ResidualFunction, SolverConfig, StartValues,
    tests::{assert_nearly_eq, assert_not_fatal},
};

/// Decoupled monotone cubics `a_i x_i + x_i³ = c_i`: one root each, nonsingular Jacobian.
struct Cubics {
    a: Vec<f64>,
    c: Vec<f64>,
}

impl ResidualFunction for Cubics {
    fn evaluate(&mut self, x: &[f64], f: &mut [f64]) -> EvalResult {
        for i in 0..x.len() {
            f[i] = self.a[i] * x[i] + x[i].powi(3) - self.c[i];
        }
        Ok(())
    }
}

/// `(x - target)(1 + x²/10)` inside `[lo, hi]`.
struct Boxed {
    target: f64,
    lo: f64,
    hi: f64,
}

impl ResidualFunction for Boxed {
    fn initialize(&mut self, start: &mut StartValues) -> EvalResult {
        start.min[0] = self.lo;
        start.max[0] = self.hi;
        Ok(())
    }

    fn evaluate(&mut self, x: &[f64], f: &mut [f64]) -> EvalResult {
        f[0] = (x[0] - self.target) * (1.0 + 0.1 * x[0] * x[0]);
        Ok(())
    }
}

fn cubic_system() -> impl Strategy<Value = (Vec<f64>, Vec<f64>, Vec<f64>)> {
    (1usize..=4).prop_flat_map(|n| {
        (
            prop::collection::vec(0.5f64..5.0, n),
            prop::collection::vec(-10.0f64..10.0, n),
            prop::collection::vec(-10.0f64..10.0, n),
        )
    })
}

proptest! {
    #[test]
    fn well_posed_systems_converge((a, c, guess) in cubic_system()) {
        let n = a.len();
        let mut block = EquationBlock::new("cubics", n, Cubics { a, c }, SolverConfig::default()).unwrap();
        block.set_x(&guess).unwrap();
        let report = block.solve().unwrap();
        prop_assert!(report.iterations() <= 100 * report.attempts());
        let Cubics { a, c } = block.residual();
        for (i, x) in block.x().iter().enumerate() {
            let f = a[i] * x + x.powi(3) - c[i];
            prop_assert!(f.abs() < 1e-6, "residual {f} for unknown {i}");
        }
    }

    #[test]
    fn converged_blocks_stay_put((a, c, guess) in cubic_system()) {
        let n = a.len();
        let mut block = EquationBlock::new("cubics", n, Cubics { a, c }, SolverConfig::default()).unwrap();
        block.set_x(&guess).unwrap();
        block.solve().unwrap();
        let first = block.x().to_vec();
        block.solve().unwrap();
        for (before, after) in first.iter().zip(block.x()) {
            assert_nearly_eq(*after, *before, 1e-9);
        }
    }

    #[test]
    fn iterates_respect_bounds(
        lo in -50.0f64..50.0,
        width in 0.1f64..20.0,
        target in -100.0f64..100.0,
        guess in -100.0f64..100.0,
    ) {
        let hi = lo + width;
        let mut block = EquationBlock::new("boxed", 1, Boxed { target, lo, hi }, SolverConfig::default()).unwrap();
        block.set_x(&[guess]).unwrap();
        let result = block.solve();
        assert_not_fatal(&result);
        if result.is_ok() {
            let x = block.x()[0];
            prop_assert!(x >= lo && x <= hi, "{x} outside [{lo}, {hi}]");
        }
    }

    #[test]
    fn residual_scales_stay_in_range(exponent in -15i32..=15) {
        let magnitude = 10f64.powi(exponent);
        let residual = move |x: &[f64], f: &mut [f64]| -> EvalResult {
            f[0] = magnitude * (x[0] - 1.0);
            f[1] = x[1] - x[0];
            Ok(())
        };
        let config = SolverConfig::default();
        let (min, max) = (config.min_scaling_factor, config.max_scaling_factor);
        let sink = CollectingSink::default();
        let mut block = EquationBlock::new("scaled", 2, residual, config)
            .unwrap()
            .with_log_sink(sink.clone());
        let result = block.solve();
        assert_not_fatal(&result);
        for scale in block.state().residual_scales() {
            prop_assert!(*scale >= min && *scale <= max, "scale {scale} out of range");
        }
        if exponent.abs() > 10 {
            prop_assert!(!sink.with_category("ScalingClamped").is_empty());
        }
    }

    #[test]
    fn singular_jacobians_never_abort(x0 in -10.0f64..10.0, x1 in -10.0f64..10.0, slope in 0.1f64..10.0) {
        // Both rows depend on x0 + x1 only.
        let residual = move |x: &[f64], f: &mut [f64]| -> EvalResult {
            let s = x[0] + x[1];
            f[0] = s - 1.0;
            f[1] = slope * (s - 1.0);
            Ok(())
        };
        let mut block = EquationBlock::new("singular", 2, residual, SolverConfig::default()).unwrap();
        block.set_x(&[x0, x1]).unwrap();
        assert_not_fatal(&block.solve());
    }
}
