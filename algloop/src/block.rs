use faer::Mat;

use crate::{
    UNIT_ROUNDOFF,
    brent::Bracket,
    config::SolverConfig,
    error::{BlockError, EvalError, EvalMode, EvalResult},
    events::{LogSink, Severity, SolverEvent, TracingSink},
    residual::{DirectionalDerivative, ResidualFunction, StartValues, UNDEFINED},
    solve_outcome::SolveReport,
    solver::{BlockSolver, backend_for},
    state::{Checkpoint, Factorization, NewtonSolverState, SolverPhase},
};

/// How often the Jacobian of a block can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JacobianVariability {
    /// Never changes.
    Constant,
    /// Changes only when parameters change, which the block never sees.
    Parameter,
    /// Changes only at events.
    Discrete,
    /// May change with every solve.
    #[default]
    Continuous,
}

impl JacobianVariability {
    /// Can a Jacobian from an earlier solve call be reused?
    pub(crate) fn reusable_across_solves(self, invalidated_by_event: bool) -> bool {
        match self {
            JacobianVariability::Constant | JacobianVariability::Parameter => true,
            JacobianVariability::Discrete => !invalidated_by_event,
            JacobianVariability::Continuous => false,
        }
    }

    /// Can the Jacobian change between iterations of one solve?
    pub(crate) fn varies_within_solve(self) -> bool {
        !matches!(
            self,
            JacobianVariability::Constant | JacobianVariability::Parameter
        )
    }
}

/// Work done by a block over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Calls to [`EquationBlock::solve`].
    pub solves: usize,
    /// Accepted Newton iterations.
    pub iterations: usize,
    /// Calls to the residual function in evaluate mode.
    pub residual_evaluations: usize,
    /// Jacobians computed from scratch (not quasi-Newton updates).
    pub jacobian_evaluations: usize,
}

/// Everything about a block except its collaborators and back-end.
#[derive(Debug, Clone)]
pub(crate) struct BlockData {
    pub label: String,
    pub n: usize,
    pub auxiliary_count: usize,
    pub x: Vec<f64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub nominal: Vec<f64>,
    pub initial: Vec<f64>,
    pub variability: JacobianVariability,
    pub counters: Counters,
    pub phase: SolverPhase,
    pub at_event: bool,
    /// An event happened since the last fresh Jacobian.
    pub jacobian_invalidated: bool,
    /// The caller replaced `x` since the last solve.
    pub x_set_by_caller: bool,
    pub track_bracket: bool,
    pub bracket: Bracket,
}

impl BlockData {
    fn new(label: String, n: usize) -> Self {
        Self {
            label,
            n,
            auxiliary_count: 0,
            x: vec![0.0; n],
            min: vec![f64::NEG_INFINITY; n],
            max: vec![f64::INFINITY; n],
            nominal: vec![1.0; n],
            initial: vec![0.0; n],
            variability: JacobianVariability::default(),
            counters: Counters::default(),
            phase: SolverPhase::Uninitialized,
            at_event: false,
            jacobian_invalidated: false,
            x_set_by_caller: false,
            track_bracket: false,
            bracket: Bracket::default(),
        }
    }
}

/// What a solver back-end sees while it runs: the block and its collaborators.
pub struct SolveContext<'a> {
    pub(crate) block: &'a mut BlockData,
    pub(crate) residual: &'a mut dyn ResidualFunction,
    pub(crate) derivative: Option<&'a mut dyn DirectionalDerivative>,
    pub(crate) log: &'a mut dyn LogSink,
    pub(crate) config: &'a SolverConfig,
}

impl SolveContext<'_> {
    /// Number of real unknowns.
    pub fn n(&self) -> usize {
        self.block.n
    }

    /// The current iterate.
    pub fn x(&self) -> &[f64] {
        &self.block.x
    }

    /// The block configuration.
    pub fn config(&self) -> &SolverConfig {
        self.config
    }

    /// Evaluate `F(x)`. Non-finite output is turned into a recoverable failure.
    pub fn evaluate(&mut self, x: &[f64], residual: &mut [f64]) -> EvalResult {
        self.block.counters.residual_evaluations += 1;
        self.residual.evaluate(x, residual)?;
        if let Some(i) = residual.iter().position(|r| !r.is_finite()) {
            self.emit(
                Severity::Warning,
                "IllegalResidual",
                format!("Residual {i} is not finite"),
                vec![("index", i as f64), ("residual", residual[i])],
            );
            return Err(EvalError::recoverable(format!("residual {i} is not finite")));
        }
        if self.block.track_bracket {
            self.block.bracket.record(x[0], residual[0]);
        }
        Ok(())
    }

    /// Like [`Self::evaluate`], but a fatal failure becomes a [`BlockError`].
    pub(crate) fn evaluate_or_fatal(
        &mut self,
        x: &[f64],
        residual: &mut [f64],
    ) -> Result<EvalResult, BlockError> {
        match self.evaluate(x, residual) {
            Err(err) if err.is_fatal() => Err(BlockError::from_eval(EvalMode::Evaluate, err)),
            other => Ok(other),
        }
    }

    /// Refresh non-real outputs that depend on `x`.
    pub(crate) fn evaluate_auxiliary(&mut self, x: &[f64]) -> Result<(), BlockError> {
        match self.residual.evaluate_auxiliary(x) {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(BlockError::from_eval(EvalMode::EvaluateAuxiliary, err)),
            Err(err) => {
                self.emit(
                    Severity::Warning,
                    "IllegalResidual",
                    format!("Auxiliary outputs could not be updated: {}", err.reason()),
                    Vec::new(),
                );
                Ok(())
            }
        }
    }

    /// Commit the current iterate to the model.
    pub(crate) fn write_back(&mut self) -> Result<(), BlockError> {
        let Self { block, residual, .. } = self;
        residual
            .write_back(&block.x)
            .map_err(|err| BlockError::from_eval(EvalMode::WriteBack, err))
    }

    /// Report a structured event to the log sink.
    pub fn emit(
        &mut self,
        severity: Severity,
        category: &'static str,
        message: impl Into<String>,
        values: Vec<(&'static str, f64)>,
    ) {
        self.log.emit(SolverEvent {
            severity,
            category,
            block: self.block.label.clone(),
            message: message.into(),
            values,
        });
    }

    /// Run initialize mode and derive nominals, bounds and the starting point.
    /// Does nothing after the first call.
    pub(crate) fn initialize(&mut self) -> Result<(), BlockError> {
        if self.block.phase != SolverPhase::Uninitialized {
            return Ok(());
        }
        let n = self.block.n;
        let mut start = StartValues::new(n);
        self.residual.initialize(&mut start).map_err(|err| match err {
            EvalError::Fatal(reason) => BlockError::ResidualFatal {
                mode: EvalMode::Initialize,
                reason,
            },
            EvalError::Recoverable(reason) => BlockError::InitialEvaluation { reason },
        })?;
        for v in [&start.nominal, &start.min, &start.max, &start.initial] {
            if v.len() != n {
                return Err(BlockError::DimensionMismatch {
                    expected: n,
                    actual: v.len(),
                });
            }
        }
        for i in 0..n {
            let (lo, hi) = (start.min[i], start.max[i]);
            if lo > hi {
                return Err(BlockError::InconsistentBounds {
                    index: i,
                    min: lo,
                    max: hi,
                });
            }
            if lo == hi {
                self.emit(
                    Severity::Warning,
                    "MinAndMaxEqual",
                    format!("Variable {i} has equal min and max; it cannot change"),
                    vec![("index", i as f64), ("bound", lo)],
                );
            }
            start.nominal[i] = repaired_nominal(start.nominal[i], lo, hi, start.initial[i]);
        }

        let block = &mut *self.block;
        block.x.clone_from(&start.initial);
        block.nominal = start.nominal;
        block.min = start.min;
        block.max = start.max;
        block.initial = start.initial;
        block.track_bracket = n == 1 && self.config.use_brent_in_1d;
        block.phase = SolverPhase::Initialized;
        tracing::debug!(block = %block.label, n, "initialized equation block");
        self.project_iterate();
        Ok(())
    }

    /// Clamp the iterate into `[min, max]` when bounds are enforced.
    pub(crate) fn project_iterate(&mut self) {
        if !self.config.enforce_bounds {
            return;
        }
        let block = &mut *self.block;
        let mut moved = 0usize;
        for ((x, &lo), &hi) in block.x.iter_mut().zip(&block.min).zip(&block.max) {
            let clamped = libm::fmin(libm::fmax(*x, lo), hi);
            if clamped != *x {
                *x = clamped;
                moved += 1;
            }
        }
        if moved > 0 {
            tracing::debug!(block = %block.label, moved, "projected iterate into its bounds");
        }
    }
}

/// Pick a usable nominal value when the model's nominal is missing or outside the bounds.
pub(crate) fn repaired_nominal(nominal: f64, min: f64, max: f64, initial: f64) -> f64 {
    let ok = nominal != UNDEFINED && nominal.is_finite() && nominal >= min && nominal <= max;
    if ok {
        return nominal;
    }
    let has_min = min.is_finite();
    let has_max = max.is_finite();
    if initial > min && initial < max && initial != 0.0 {
        initial
    } else if has_min && has_max {
        let mid = 0.5 * (min + max);
        // Nearly symmetric range around zero.
        if min * max < 0.0 && mid.abs() < 1e-2 * max {
            1e-2 * max
        } else {
            mid
        }
    } else if has_min {
        if min == 0.0 {
            1.0
        } else if min > 0.0 {
            min * (1.0 + UNIT_ROUNDOFF)
        } else {
            min * (1.0 - UNIT_ROUNDOFF)
        }
    } else if has_max {
        if max == 0.0 {
            -1.0
        } else if max > 0.0 {
            max * (1.0 - UNIT_ROUNDOFF)
        } else {
            max * (1.0 + UNIT_ROUNDOFF)
        }
    } else {
        1.0
    }
}

/// One algebraic loop together with its residual function and solver.
///
/// ```
/// use algloop::{EquationBlock, EvalResult, SolverConfig};
///
/// let residual = |x: &[f64], f: &mut [f64]| -> EvalResult {
///     f[0] = x[0] * x[0] - 4.0;
///     Ok(())
/// };
/// let mut block = EquationBlock::new("square", 1, residual, SolverConfig::default()).unwrap();
/// block.set_x(&[10.0]).unwrap();
/// block.solve().unwrap();
/// assert!((block.x()[0] - 2.0).abs() < 1e-10);
/// ```
pub struct EquationBlock<R> {
    data: BlockData,
    residual: R,
    derivative: Option<Box<dyn DirectionalDerivative + Send>>,
    log: Box<dyn LogSink + Send>,
    config: SolverConfig,
    solver: Box<dyn BlockSolver + Send>,
}

impl<R: ResidualFunction> EquationBlock<R> {
    /// A block with `n` real unknowns. Events go to `tracing` until
    /// [`Self::with_log_sink`] says otherwise.
    pub fn new(
        label: impl Into<String>,
        n: usize,
        residual: R,
        config: SolverConfig,
    ) -> Result<Self, BlockError> {
        let label = label.into();
        if n == 0 {
            return Err(BlockError::EmptyBlock { label });
        }
        let solver = backend_for(config.solver_kind, n);
        Ok(Self {
            data: BlockData::new(label, n),
            residual,
            derivative: None,
            log: Box::new(TracingSink),
            config,
            solver,
        })
    }

    /// Declare non-real unknowns that must be refreshed through evaluate-auxiliary mode.
    pub fn with_auxiliary_count(mut self, count: usize) -> Self {
        self.data.auxiliary_count = count;
        self
    }

    /// Declare how often the Jacobian changes.
    pub fn with_variability(mut self, variability: JacobianVariability) -> Self {
        self.data.variability = variability;
        self
    }

    /// Send events somewhere other than `tracing`.
    pub fn with_log_sink(mut self, sink: impl LogSink + Send + 'static) -> Self {
        self.log = Box::new(sink);
        self
    }

    /// Compute Jacobian columns as directional derivatives.
    pub fn with_directional_derivative(
        mut self,
        derivative: impl DirectionalDerivative + Send + 'static,
    ) -> Self {
        self.derivative = Some(Box::new(derivative));
        self
    }

    pub(crate) fn context(&mut self) -> (SolveContext<'_>, &mut (dyn BlockSolver + Send)) {
        let Self {
            data,
            residual,
            derivative,
            log,
            config,
            solver,
        } = self;
        let derivative: Option<&mut dyn DirectionalDerivative> = match derivative {
            Some(d) => Some(&mut **d),
            None => None,
        };
        let ctx = SolveContext {
            block: data,
            residual,
            derivative,
            log: &mut **log,
            config,
        };
        (ctx, &mut **solver)
    }

    /// Solve `F(x) = 0`, starting from the current iterate.
    ///
    /// The final iterate is written back to the model whether or not the
    /// solve succeeded.
    pub fn solve(&mut self) -> Result<SolveReport, BlockError> {
        self.data.counters.solves += 1;
        let (mut ctx, solver) = self.context();
        ctx.initialize()?;
        ctx.project_iterate();
        if ctx.block.at_event && ctx.block.auxiliary_count > 0 {
            let x = ctx.block.x.clone();
            ctx.evaluate_auxiliary(&x)?;
        }
        let result = solver.solve(&mut ctx);
        ctx.block.at_event = false;
        ctx.block.x_set_by_caller = false;
        result
    }

    /// The current iterate.
    pub fn x(&self) -> &[f64] {
        &self.data.x
    }

    /// Replace the current iterate, e.g. with a better guess from the caller.
    /// The guess is clamped into `[min, max]` when bounds are enforced.
    pub fn set_x(&mut self, x: &[f64]) -> Result<(), BlockError> {
        if x.len() != self.data.n {
            return Err(BlockError::DimensionMismatch {
                expected: self.data.n,
                actual: x.len(),
            });
        }
        // Initialize first so the caller's guess is not overwritten by the model's.
        let (mut ctx, _) = self.context();
        ctx.initialize()?;
        ctx.block.x.copy_from_slice(x);
        ctx.project_iterate();
        ctx.block.x_set_by_caller = true;
        Ok(())
    }

    /// The block's label.
    pub fn label(&self) -> &str {
        &self.data.label
    }

    /// Number of real unknowns.
    pub fn len(&self) -> usize {
        self.data.n
    }

    /// Blocks always have at least one unknown.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Repaired nominal values.
    pub fn nominal(&self) -> &[f64] {
        &self.data.nominal
    }

    /// Lower bounds.
    pub fn min(&self) -> &[f64] {
        &self.data.min
    }

    /// Upper bounds.
    pub fn max(&self) -> &[f64] {
        &self.data.max
    }

    /// Work counters.
    pub fn counters(&self) -> Counters {
        self.data.counters
    }

    /// Life-cycle phase.
    pub fn phase(&self) -> SolverPhase {
        self.data.phase
    }

    /// The configuration the block was built with.
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// The back-end's Newton workspace.
    pub fn state(&self) -> &NewtonSolverState {
        self.solver.state()
    }

    /// The residual function.
    pub fn residual(&self) -> &R {
        &self.residual
    }

    /// The outer stepper accepted the current point: remember it.
    pub fn completed_outer_step(&mut self) {
        let checkpoint = self.solver.state().snapshot(&self.data.x);
        self.solver.state_mut().checkpoint = Some(checkpoint);
    }

    /// Snapshot of the solver state and iterate.
    pub fn checkpoint(&self) -> Checkpoint {
        self.solver.state().snapshot(&self.data.x)
    }

    /// Return to a snapshot taken from this block.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), BlockError> {
        if checkpoint.x().len() != self.data.n {
            return Err(BlockError::DimensionMismatch {
                expected: self.data.n,
                actual: checkpoint.x().len(),
            });
        }
        self.solver.state_mut().restore(checkpoint);
        self.data.x.copy_from_slice(checkpoint.x());
        Ok(())
    }

    /// The model hit an event: discrete Jacobians are stale and auxiliary
    /// outputs are refreshed before the next solve.
    pub fn notify_event(&mut self) {
        self.data.at_event = true;
        self.data.jacobian_invalidated = true;
    }

    /// Evaluate the Jacobian at the current iterate.
    pub fn evaluate_jacobian(&mut self) -> Result<Mat<f64>, BlockError> {
        let (mut ctx, solver) = self.context();
        ctx.initialize()?;
        solver.evaluate_jacobian(&mut ctx)
    }

    /// Evaluate and factorize the Jacobian at the current iterate.
    pub fn evaluate_jacobian_factorization(&mut self) -> Result<&Factorization, BlockError> {
        let (mut ctx, solver) = self.context();
        ctx.initialize()?;
        solver.evaluate_jacobian_factorization(&mut ctx)
    }

    /// Release the back-end's workspace. The next solve starts from scratch,
    /// apart from the current iterate.
    pub fn teardown(&mut self) {
        self.solver.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INF: f64 = f64::INFINITY;

    #[test]
    fn valid_nominal_is_kept() {
        assert_eq!(repaired_nominal(3.0, 0.0, 10.0, 1.0), 3.0);
        assert_eq!(repaired_nominal(-3.0, -INF, INF, 1.0), -3.0);
    }

    #[test]
    fn nominal_repair_prefers_initial_guess() {
        assert_eq!(repaired_nominal(UNDEFINED, 0.0, 10.0, 4.0), 4.0);
        assert_eq!(repaired_nominal(20.0, 0.0, 10.0, 4.0), 4.0);
    }

    #[test]
    fn nominal_repair_uses_midpoint() {
        assert_eq!(repaired_nominal(UNDEFINED, 2.0, 4.0, 0.0), 3.0);
        // Nearly symmetric about zero: one percent of max.
        assert_eq!(repaired_nominal(UNDEFINED, -10.0, 10.0, 0.0), 0.1);
    }

    #[test]
    fn nominal_repair_one_sided() {
        assert_eq!(repaired_nominal(UNDEFINED, 0.0, INF, 0.0), 1.0);
        assert!(repaired_nominal(UNDEFINED, 5.0, INF, 0.0) > 5.0);
        assert!(repaired_nominal(UNDEFINED, -5.0, INF, 0.0) > -5.0);
        assert_eq!(repaired_nominal(UNDEFINED, -INF, 0.0, 0.0), -1.0);
        assert!(repaired_nominal(UNDEFINED, -INF, 5.0, 0.0) < 5.0);
        assert!(repaired_nominal(UNDEFINED, -INF, -5.0, 0.0) < -5.0);
    }

    #[test]
    fn nominal_repair_default() {
        assert_eq!(repaired_nominal(UNDEFINED, -INF, INF, 0.0), 1.0);
    }

    #[test]
    fn empty_block_is_rejected() {
        let residual = |_x: &[f64], _f: &mut [f64]| -> EvalResult { Ok(()) };
        let err = EquationBlock::new("empty", 0, residual, SolverConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, BlockError::EmptyBlock { .. }));
        assert!(err.is_fatal());
    }

    struct BadBounds;

    impl ResidualFunction for BadBounds {
        fn initialize(&mut self, start: &mut StartValues) -> EvalResult {
            start.min[0] = 2.0;
            start.max[0] = 1.0;
            Ok(())
        }

        fn evaluate(&mut self, x: &[f64], residual: &mut [f64]) -> EvalResult {
            residual[0] = x[0];
            Ok(())
        }
    }

    #[test]
    fn inconsistent_bounds_are_fatal() {
        let mut block = EquationBlock::new("bad", 1, BadBounds, SolverConfig::default()).unwrap();
        let err = block.solve().unwrap_err();
        assert_eq!(
            err,
            BlockError::InconsistentBounds {
                index: 0,
                min: 2.0,
                max: 1.0
            }
        );
    }

    #[test]
    fn set_x_checks_length() {
        let residual = |x: &[f64], f: &mut [f64]| -> EvalResult {
            f[0] = x[0];
            f[1] = x[1];
            Ok(())
        };
        let mut block = EquationBlock::new("b", 2, residual, SolverConfig::default()).unwrap();
        assert_eq!(
            block.set_x(&[1.0]),
            Err(BlockError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        );
        block.set_x(&[1.0, 2.0]).unwrap();
        assert_eq!(block.x(), &[1.0, 2.0]);
    }
}
