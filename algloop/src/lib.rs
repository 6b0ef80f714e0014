//! Solves algebraic loops: sets of equations in a simulation model that
//! depend on each other and so cannot be computed one after another.
//!
//! A model hands each loop to an [`EquationBlock`], together with a
//! [`ResidualFunction`] `F(x)`. Calling [`EquationBlock::solve`] finds `x`
//! with `F(x) ≈ 0` using a damped Newton method with
//! - automatic residual and variable scaling,
//! - box bounds enforced by step limiting and projection,
//! - finite-difference, compressed, analytic or quasi-Newton Jacobians,
//! - recovery from singular Jacobians (regularization, minimum-norm steps),
//! - checkpoints so an outer time stepper can rewind the solver state.

pub use crate::block::{Counters, EquationBlock, JacobianVariability, SolveContext};
pub use crate::bounds::{BoundClass, BoundDescriptor, BoundKind, Bounds, StepLimit};
pub use crate::config::{
    ActiveBoundsMode, ExitCriterion, JacobianMode, JacobianUpdate, ResidualScaling, SolverConfig,
    SolverKind, VariableScaling,
};
pub use crate::error::{BlockError, ConvergenceFailure, EvalError, EvalMode, EvalResult, FailureReason};
pub use crate::events::{CollectingSink, LogSink, Severity, SolverEvent, TracingSink};
pub use crate::residual::{DirectionalDerivative, ResidualFunction, StartValues, UNDEFINED};
pub use crate::solve_outcome::{IterationStats, SolveReport, StepKind};
pub use crate::solver::BlockSolver;
pub use crate::state::{Checkpoint, Factorization, NewtonSolverState, SingularMode, SolverPhase, StateFlags};

/// The equation block and its solve context.
mod block;
/// Box bounds and step limiting.
mod bounds;
/// One-dimensional bracketed root search.
mod brent;
mod config;
mod error;
mod events;
/// Jacobian approximation and quasi-Newton updates.
mod jacobian;
/// The damped Newton iteration.
mod newton;
mod residual;
/// Residual and variable scaling.
mod scaling;
/// Recovery from singular Jacobians.
mod singular;
mod solve_outcome;
/// Solver back-ends.
mod solver;
mod state;

/// Relative machine precision.
pub(crate) const UNIT_ROUNDOFF: f64 = f64::EPSILON;
