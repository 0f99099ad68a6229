//! Nonlinear programs of the form
//!
//! ```text
//! min f(x)  s.t.  g_l <= g(x) <= g_u,  x_l <= x <= x_u
//! ```
//!
//! and a sequential quadratic programming solver for them.

pub mod adapter;
pub mod best_iterate;
pub mod sqp;

use std::fmt;

use na::{DMatrix, DVector};

use crate::{error::FitResult, problem::triplets::SparseTriplets, types::Float};

/// Problem dimensions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NlpInfo {
    pub n: usize,
    pub m: usize,
    pub nnz_jac_g: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableBounds {
    pub x_lower: DVector<Float>,
    pub x_upper: DVector<Float>,
    pub g_lower: DVector<Float>,
    pub g_upper: DVector<Float>,
}

/// What the solver reports to `intermediate_callback` at the start of
/// every iteration
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IterationStats {
    pub iteration: usize,
    pub objective: Float,
    /// Largest constraint violation
    pub inf_pr: Float,
    /// Infinity norm of the previous step
    pub d_norm: Float,
    /// Step length of the previous line search
    pub alpha: Float,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverStatus {
    Converged,
    MaxIterationsExceeded,
    LineSearchFailed,
    QpFailed,
    UserRequestedStop,
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SolverStatus::Converged => "converged",
            SolverStatus::MaxIterationsExceeded => "maximum iterations exceeded",
            SolverStatus::LineSearchFailed => "line search failed",
            SolverStatus::QpFailed => "QP subproblem failed",
            SolverStatus::UserRequestedStop => "stopped by callback",
        };
        write!(f, "{}", text)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SolveReport {
    pub status: SolverStatus,
    pub iterations: usize,
    pub final_objective: Float,
}

/// The contract between a problem and the solver.
pub trait NonlinearProgram {
    fn nlp_info(&self) -> NlpInfo;
    fn bounds_info(&self) -> VariableBounds;
    fn starting_point(&self) -> DVector<Float>;

    fn eval_f(&mut self, x: &DVector<Float>) -> FitResult<Float>;
    fn eval_grad_f(&mut self, x: &DVector<Float>) -> FitResult<DVector<Float>>;
    fn eval_g(&mut self, x: &DVector<Float>) -> FitResult<DVector<Float>>;
    fn eval_jac_g(&mut self, x: &DVector<Float>) -> FitResult<SparseTriplets>;

    /// Hessian of the Lagrangian. None makes the solver fall back to a
    /// quasi-Newton approximation.
    fn eval_h(
        &mut self,
        _x: &DVector<Float>,
        _obj_factor: Float,
        _lambda: &DVector<Float>,
    ) -> Option<DMatrix<Float>> {
        None
    }

    /// Return false to stop the solve
    fn intermediate_callback(&mut self, _stats: &IterationStats, _x: &DVector<Float>) -> bool {
        true
    }

    fn finalize_solution(&mut self, status: SolverStatus, x: &DVector<Float>, objective: Float);
}
