use algloop_linalg::LinalgError;
use error_stack::Report;

/// Status returned by the residual and directional-derivative collaborators.
///
/// `Ok(())` is success. The two error variants decide what the solver does
/// next: a recoverable failure rejects the trial point and another one is
/// tried, a fatal failure aborts the solve immediately.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The point is outside the domain of the residual (e.g. `sqrt` of a negative).
    #[error("recoverable evaluation failure: {0}")]
    Recoverable(String),
    /// The model cannot continue.
    #[error("fatal evaluation failure: {0}")]
    Fatal(String),
}

impl EvalError {
    /// Shorthand for a recoverable failure.
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Self::Recoverable(reason.into())
    }

    /// Shorthand for a fatal failure.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// Is this failure fatal?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub(crate) fn reason(&self) -> &str {
        match self {
            Self::Recoverable(r) | Self::Fatal(r) => r,
        }
    }
}

/// Result of a collaborator call.
pub type EvalResult<T = ()> = Result<T, EvalError>;

/// Which collaborator mode an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Populating nominal, min, max and initial values.
    Initialize,
    /// Computing the residual at a point.
    Evaluate,
    /// Refreshing non-real outputs.
    EvaluateAuxiliary,
    /// Committing the iterate to the model.
    WriteBack,
    /// Computing an analytic Jacobian or a directional derivative.
    Derivative,
}

impl std::fmt::Display for EvalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EvalMode::Initialize => "initialize",
            EvalMode::Evaluate => "evaluate",
            EvalMode::EvaluateAuxiliary => "evaluate auxiliary",
            EvalMode::WriteBack => "write back",
            EvalMode::Derivative => "derivative",
        };
        f.write_str(name)
    }
}

/// Details of a solve that exhausted its retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceFailure {
    /// Max-norm of the scaled residual at the final iterate.
    pub residual_norm: f64,
    /// Scaled length of the last step.
    pub step_norm: f64,
    /// Residual tolerance that was configured.
    pub residual_tolerance: f64,
    /// Scaled step tolerance that was configured.
    pub step_tolerance: f64,
    /// Newton iterations spent over all attempts.
    pub iterations: usize,
    /// Why the last attempt stopped.
    pub reason: FailureReason,
}

/// Why a Newton run stopped without meeting the exit criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Iteration budget exhausted.
    MaxIterations,
    /// The line search could not find an acceptable point.
    LineSearch,
    /// The step became smaller than the step tolerance but the residual is not small.
    StepTooSmall,
    /// No step could be computed, even through singular recovery.
    LinearSolve,
    /// The Jacobian could not be approximated.
    Jacobian,
    /// The residual could not be evaluated at the starting point.
    InitialEvaluation,
    /// The only root lies outside `[min, max]`.
    SolutionOutsideBounds,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            FailureReason::MaxIterations => "the iteration limit was reached",
            FailureReason::LineSearch => "the line search could not find a sufficiently distinct iterate",
            FailureReason::StepTooSmall => {
                "the step norm criterion is satisfied but the residual norm is above the tolerance"
            }
            FailureReason::LinearSolve => "no step could be computed from the Jacobian",
            FailureReason::Jacobian => "the Jacobian could not be evaluated",
            FailureReason::InitialEvaluation => "the residual could not be evaluated at the initial point",
            FailureReason::SolutionOutsideBounds => "the solution of the linear system violates the variable bounds",
        };
        f.write_str(msg)
    }
}

/// Errors that leave an equation block.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[cfg_attr(not(feature = "unstable-exhaustive"), non_exhaustive)]
pub enum BlockError {
    /// A block must have at least one real unknown.
    #[error("Equation block {label} has no real unknowns")]
    EmptyBlock {
        /// Label of the block.
        label: String,
    },
    /// A variable has `min > max`.
    #[error("Variable {index} has inconsistent bounds: min {min} > max {max}")]
    InconsistentBounds {
        /// Index of the variable.
        index: usize,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// A vector handed to the block has the wrong length.
    #[error("Expected {expected} values but got {actual}")]
    DimensionMismatch {
        /// Block size.
        expected: usize,
        /// Length supplied.
        actual: usize,
    },
    /// The residual collaborator reported a fatal failure.
    #[error("Residual function failed fatally in {mode} mode: {reason}")]
    ResidualFatal {
        /// Mode the collaborator was called in.
        mode: EvalMode,
        /// Reason given by the collaborator.
        reason: String,
    },
    /// The residual could not be evaluated at the initial guess or the nominal fallback.
    #[error("Residual could not be evaluated at the initial guess: {reason}")]
    InitialEvaluation {
        /// Reason given by the collaborator.
        reason: String,
    },
    /// The Jacobian could not be evaluated on request.
    #[error("Could not evaluate the Jacobian: {reason}")]
    Jacobian {
        /// What went wrong.
        reason: String,
    },
    /// The retry policy was exhausted without meeting the exit criterion.
    #[error(
        "Could not converge: {} (residual {:e}, step {:e}, tolerances: residual {:e}, step {:e}, {} iterations)",
        .0.reason, .0.residual_norm, .0.step_norm, .0.residual_tolerance, .0.step_tolerance, .0.iterations
    )]
    ConvergenceFailure(ConvergenceFailure),
    /// A factorization requested through the block API failed.
    #[error("Linear algebra failed: {0}")]
    LinearAlgebra(String),
}

impl BlockError {
    /// Fatal errors must not be retried by the caller.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BlockError::ConvergenceFailure(_))
    }

    pub(crate) fn from_eval(mode: EvalMode, err: EvalError) -> Self {
        BlockError::ResidualFatal {
            mode,
            reason: err.reason().to_owned(),
        }
    }
}

impl From<Report<LinalgError>> for BlockError {
    fn from(report: Report<LinalgError>) -> Self {
        BlockError::LinearAlgebra(format!("{report:?}"))
    }
}
