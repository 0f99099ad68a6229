use std::collections::VecDeque;

use clarabel::{
    algebra::CscMatrix as QpMatrix,
    solver::{
        DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus as QpStatus,
        SupportedConeT::{self, NonnegativeConeT, ZeroConeT},
    },
};
use log::{debug, info};
use na::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CscMatrix};

use crate::{error::FitResult, problem::triplets::SparseTriplets, types::Float};

use super::{IterationStats, NonlinearProgram, SolveReport, SolverStatus, VariableBounds};

/// Sufficient decrease factor of the Armijo condition
const ARMIJO: Float = 1e-4;
/// Smallest step length tried by the line search
const MIN_STEP: Float = 1e-10;
/// Slack added to the largest multiplier for the merit penalty
const PENALTY_MARGIN: Float = 1e-2;
/// Powell damping threshold of the BFGS update
const DAMPING: Float = 0.2;
/// Relative model decrease under which a failed line search means the
/// iterate cannot be improved
const STALL_DECREASE: Float = 1e-10;

#[derive(Clone, Debug, PartialEq)]
pub struct SolverSettings {
    pub tolerance: Float,
    pub max_iterations: usize,
    /// Number of (s, y) pairs kept for the quasi-Newton Hessian
    pub lbfgs_history: usize,
    /// Log every n-th iteration, 0 to never log iterations
    pub print_frequency: usize,
    pub silence_output: bool,
    pub disable_line_search: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings {
            tolerance: 1e-8,
            max_iterations: 500,
            lbfgs_history: 8,
            print_frequency: 1,
            silence_output: false,
            disable_line_search: false,
        }
    }
}

/// Damped BFGS approximation built from the most recent (s, y) pairs,
/// starting from γI.
struct LbfgsHessian {
    history: usize,
    pairs: VecDeque<(DVector<Float>, DVector<Float>)>,
    gamma: Float,
}

impl LbfgsHessian {
    fn new(history: usize, gamma: Float) -> Self {
        LbfgsHessian {
            history: history.max(1),
            pairs: VecDeque::new(),
            gamma,
        }
    }

    fn push(&mut self, s: DVector<Float>, y: DVector<Float>) {
        if s.norm_squared() < 1e-24 {
            return;
        }
        let sy = s.dot(&y);
        if sy > 1e-12 {
            self.gamma = (y.norm_squared() / sy).clamp(1e-8, 1e8);
        }
        self.pairs.push_back((s, y));
        if self.pairs.len() > self.history {
            self.pairs.pop_front();
        }
    }

    fn matrix(&self, n: usize) -> DMatrix<Float> {
        let mut B = DMatrix::identity(n, n) * self.gamma;
        for (s, y) in self.pairs.iter() {
            let Bs = &B * s;
            let sBs = s.dot(&Bs);
            if sBs <= 1e-16 {
                continue;
            }
            let sy = s.dot(y);
            let theta = if sy >= DAMPING * sBs {
                1.
            } else {
                (1. - DAMPING) * sBs / (sBs - sy)
            };
            let r = y * theta + &Bs * (1. - theta);
            let sr = s.dot(&r);
            if sr <= 1e-16 {
                continue;
            }
            B -= &Bs * Bs.transpose() / sBs;
            B += &r * r.transpose() / sr;
        }
        B
    }
}

struct QpStep {
    d: DVector<Float>,
    /// Multipliers of g, signed so that ∇f + Jᵀλ vanishes at a solution
    lambda: DVector<Float>,
}

/// Sequential quadratic programming with a quasi-Newton Hessian. Every
/// subproblem linearizes the constraints and keeps the variable bounds, and
/// is solved by clarabel. Steps are globalized by backtracking on the l1
/// merit function f + ν|violation|₁.
pub struct SqpSolver {
    settings: SolverSettings,
}

impl SqpSolver {
    pub fn new(settings: SolverSettings) -> Self {
        SqpSolver { settings }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn solve<P: NonlinearProgram>(&self, nlp: &mut P) -> FitResult<SolveReport> {
        let info = nlp.nlp_info();
        let bounds = nlp.bounds_info();
        let tol = self.settings.tolerance;

        let mut x = project(&nlp.starting_point(), &bounds);
        let mut f = nlp.eval_f(&x)?;
        let mut grad = nlp.eval_grad_f(&x)?;
        let mut g = nlp.eval_g(&x)?;
        let mut J = nlp.eval_jac_g(&x)?;
        let mut lambda = DVector::zeros(info.m);

        let mut hessian = LbfgsHessian::new(self.settings.lbfgs_history, grad.amax().max(1.));
        let mut penalty: Float = 1.;
        let mut d_norm = 0.;
        let mut alpha = 0.;
        let mut iteration = 0;

        let status = loop {
            let violation = constraint_violation(&g, &bounds);
            let stats = IterationStats {
                iteration,
                objective: f,
                inf_pr: if violation.is_empty() { 0. } else { violation.amax() },
                d_norm,
                alpha,
            };
            self.log_iteration(&stats);
            if !nlp.intermediate_callback(&stats, &x) {
                break SolverStatus::UserRequestedStop;
            }
            if iteration >= self.settings.max_iterations {
                break SolverStatus::MaxIterationsExceeded;
            }

            let B = match nlp.eval_h(&x, 1., &lambda) {
                Some(H) if H.clone().cholesky().is_some() => H,
                _ => hessian.matrix(info.n),
            };
            let step = match self.solve_qp(&B, &grad, &x, &g, &J, &bounds) {
                Some(step) => step,
                None => {
                    // Restart the quasi-Newton model from a scaled identity
                    hessian = LbfgsHessian::new(self.settings.lbfgs_history, grad.amax().max(1.));
                    let identity = hessian.matrix(info.n);
                    match self.solve_qp(&identity, &grad, &x, &g, &J, &bounds) {
                        Some(step) => step,
                        None => break SolverStatus::QpFailed,
                    }
                }
            };
            d_norm = if step.d.is_empty() { 0. } else { step.d.amax() };
            let x_norm = if x.is_empty() { 0. } else { x.amax() };
            if d_norm <= tol * (1. + x_norm) && stats.inf_pr <= tol {
                break SolverStatus::Converged;
            }

            if !step.lambda.is_empty() {
                penalty = penalty.max(step.lambda.amax() + PENALTY_MARGIN);
            }
            let violation_l1 = violation.sum();
            let merit = f + penalty * violation_l1;
            let slope = (grad.dot(&step.d) - penalty * violation_l1).min(0.);

            alpha = 1.;
            let accepted = loop {
                let trial = &x + &step.d * alpha;
                let f_trial = nlp.eval_f(&trial)?;
                let g_trial = nlp.eval_g(&trial)?;
                let merit_trial =
                    f_trial + penalty * constraint_violation(&g_trial, &bounds).sum();
                if self.settings.disable_line_search
                    || merit_trial <= merit + ARMIJO * alpha * slope
                {
                    break Some((trial, f_trial, g_trial));
                }
                alpha *= 0.5;
                if alpha < MIN_STEP {
                    break None;
                }
            };
            let Some((x_new, f_new, g_new)) = accepted else {
                // Feasible and stationary up to rounding
                let predicted = -grad.dot(&step.d);
                if stats.inf_pr <= tol && predicted <= STALL_DECREASE * (1. + f.abs()) {
                    break SolverStatus::Converged;
                }
                break SolverStatus::LineSearchFailed;
            };

            let grad_new = nlp.eval_grad_f(&x_new)?;
            let J_new = nlp.eval_jac_g(&x_new)?;
            let s = &x_new - &x;
            let y = (&grad_new + J_new.transpose_mul_vector(&step.lambda))
                - (&grad + J.transpose_mul_vector(&step.lambda));
            hessian.push(s, y);

            x = x_new;
            f = f_new;
            g = g_new;
            grad = grad_new;
            J = J_new;
            lambda = step.lambda;
            iteration += 1;
        };

        if !self.settings.silence_output {
            info!(
                "SQP finished: {} after {} iterations, objective {:.6e}",
                status, iteration, f
            );
        }
        nlp.finalize_solution(status, &x, f);
        Ok(SolveReport {
            status,
            iterations: iteration,
            final_objective: f,
        })
    }

    fn log_iteration(&self, stats: &IterationStats) {
        let every = self.settings.print_frequency;
        if self.settings.silence_output || every == 0 || stats.iteration % every != 0 {
            return;
        }
        info!(
            "iter {:4}  f {:.8e}  inf_pr {:.2e}  |d| {:.2e}  alpha {:.2e}",
            stats.iteration, stats.objective, stats.inf_pr, stats.d_norm, stats.alpha
        );
    }

    /// min ½dᵀBd + ∇fᵀd  s.t.  g_l <= g + Jd <= g_u,  x_l <= x + d <= x_u
    fn solve_qp(
        &self,
        B: &DMatrix<Float>,
        grad: &DVector<Float>,
        x: &DVector<Float>,
        g: &DVector<Float>,
        J: &SparseTriplets,
        bounds: &VariableBounds,
    ) -> Option<QpStep> {
        let n = x.len();
        let m = g.len();

        // Row assignment: equalities first, then every finite one-sided bound
        let mut equality_rows = vec![None; m];
        let mut upper_rows = vec![None; m];
        let mut lower_rows = vec![None; m];
        let mut rows = 0;
        for i in 0..m {
            if bounds.g_lower[i] == bounds.g_upper[i] {
                equality_rows[i] = Some(rows);
                rows += 1;
            }
        }
        let num_equalities = rows;
        let mut b = vec![0.; num_equalities];
        for i in 0..m {
            if equality_rows[i].is_some() {
                continue;
            }
            if bounds.g_upper[i].is_finite() {
                upper_rows[i] = Some(rows);
                rows += 1;
            }
            if bounds.g_lower[i].is_finite() {
                lower_rows[i] = Some(rows);
                rows += 1;
            }
        }
        for i in 0..m {
            if let Some(row) = equality_rows[i] {
                b[row] = bounds.g_lower[i] - g[i];
            }
        }
        b.resize(rows, 0.);
        for i in 0..m {
            if let Some(row) = upper_rows[i] {
                b[row] = bounds.g_upper[i] - g[i];
            }
            if let Some(row) = lower_rows[i] {
                b[row] = g[i] - bounds.g_lower[i];
            }
        }

        let constraint_rows = rows;
        let mut bound_entries = vec![];
        for i in 0..n {
            if bounds.x_upper[i].is_finite() {
                bound_entries.push((rows, i, 1.));
                b.push(bounds.x_upper[i] - x[i]);
                rows += 1;
            }
            if bounds.x_lower[i].is_finite() {
                bound_entries.push((rows, i, -1.));
                b.push(x[i] - bounds.x_lower[i]);
                rows += 1;
            }
        }
        debug_assert!(constraint_rows + bound_entries.len() == rows);

        let mut A = CooMatrix::new(rows, n);
        for e in J.entries() {
            if let Some(row) = equality_rows[e.row] {
                A.push(row, e.col, e.value);
            }
            if let Some(row) = upper_rows[e.row] {
                A.push(row, e.col, e.value);
            }
            if let Some(row) = lower_rows[e.row] {
                A.push(row, e.col, -e.value);
            }
        }
        for (row, col, value) in bound_entries {
            A.push(row, col, value);
        }

        if rows == 0 {
            let d = B.clone().cholesky()?.solve(&(-grad));
            return Some(QpStep {
                d,
                lambda: DVector::zeros(m),
            });
        }

        let mut P = CooMatrix::new(n, n);
        for j in 0..n {
            for i in 0..=j {
                let value = 0.5 * (B[(i, j)] + B[(j, i)]);
                if value != 0. {
                    P.push(i, j, value);
                }
            }
        }

        let mut cones: Vec<SupportedConeT<Float>> = vec![];
        if num_equalities > 0 {
            cones.push(ZeroConeT(num_equalities));
        }
        if rows > num_equalities {
            cones.push(NonnegativeConeT(rows - num_equalities));
        }

        let settings = DefaultSettingsBuilder::default()
            .verbose(false)
            .build()
            .ok()?;
        let mut solver = DefaultSolver::new(
            &to_qp_matrix(&P),
            grad.as_slice(),
            &to_qp_matrix(&A),
            &b,
            &cones,
            settings,
        );
        solver.solve();
        let status = solver.solution.status;
        let usable = match status {
            QpStatus::Solved | QpStatus::AlmostSolved => true,
            // A stalled interior point iterate is still a descent direction
            QpStatus::InsufficientProgress | QpStatus::MaxIterations | QpStatus::MaxTime => {
                solver.solution.x.iter().all(|v| v.is_finite())
                    && solver.solution.z.iter().all(|v| v.is_finite())
            }
            _ => false,
        };
        if !usable {
            debug!("QP subproblem rejected with status {:?}", status);
            return None;
        }

        let z = &solver.solution.z;
        let mut lambda = DVector::zeros(m);
        for i in 0..m {
            if let Some(row) = equality_rows[i] {
                lambda[i] += z[row];
            }
            if let Some(row) = upper_rows[i] {
                lambda[i] += z[row];
            }
            if let Some(row) = lower_rows[i] {
                lambda[i] -= z[row];
            }
        }
        Some(QpStep {
            d: DVector::from_column_slice(&solver.solution.x),
            lambda,
        })
    }
}

fn to_qp_matrix(coo: &CooMatrix<Float>) -> QpMatrix<Float> {
    let (nrows, ncols) = (coo.nrows(), coo.ncols());
    let (offsets, indices, values) = CscMatrix::from(coo).disassemble();
    QpMatrix::new(nrows, ncols, offsets, indices, values)
}

/// Clamp x into the variable bounds
fn project(x: &DVector<Float>, bounds: &VariableBounds) -> DVector<Float> {
    DVector::from_fn(x.len(), |i, _| {
        x[i].max(bounds.x_lower[i]).min(bounds.x_upper[i])
    })
}

/// Per-constraint distance outside [g_l, g_u]
fn constraint_violation(g: &DVector<Float>, bounds: &VariableBounds) -> DVector<Float> {
    DVector::from_fn(g.len(), |i, _| {
        (bounds.g_lower[i] - g[i]).max(0.) + (g[i] - bounds.g_upper[i]).max(0.)
    })
}

#[cfg(test)]
mod sqp_tests {
    use na::dvector;

    use super::*;
    use crate::{assert_close, assert_vec_close, nlp::NlpInfo};

    type Objective = fn(&DVector<Float>) -> Float;
    type Gradient = fn(&DVector<Float>) -> DVector<Float>;

    /// A program with linear constraints A x and hand-written objective
    struct ToyProgram {
        f: Objective,
        grad: Gradient,
        A: DMatrix<Float>,
        bounds: VariableBounds,
        start: DVector<Float>,
        stop_after: Option<usize>,
        iterations_seen: usize,
        solution: Option<(SolverStatus, DVector<Float>)>,
    }

    impl ToyProgram {
        fn unconstrained(f: Objective, grad: Gradient, start: DVector<Float>) -> Self {
            let n = start.len();
            ToyProgram {
                f,
                grad,
                A: DMatrix::zeros(0, n),
                bounds: VariableBounds {
                    x_lower: DVector::from_element(n, Float::NEG_INFINITY),
                    x_upper: DVector::from_element(n, Float::INFINITY),
                    g_lower: DVector::zeros(0),
                    g_upper: DVector::zeros(0),
                },
                start,
                stop_after: None,
                iterations_seen: 0,
                solution: None,
            }
        }
    }

    impl NonlinearProgram for ToyProgram {
        fn nlp_info(&self) -> NlpInfo {
            NlpInfo {
                n: self.start.len(),
                m: self.A.nrows(),
                nnz_jac_g: self.A.iter().filter(|v| **v != 0.).count(),
            }
        }

        fn bounds_info(&self) -> VariableBounds {
            self.bounds.clone()
        }

        fn starting_point(&self) -> DVector<Float> {
            self.start.clone()
        }

        fn eval_f(&mut self, x: &DVector<Float>) -> FitResult<Float> {
            Ok((self.f)(x))
        }

        fn eval_grad_f(&mut self, x: &DVector<Float>) -> FitResult<DVector<Float>> {
            Ok((self.grad)(x))
        }

        fn eval_g(&mut self, x: &DVector<Float>) -> FitResult<DVector<Float>> {
            Ok(&self.A * x)
        }

        fn eval_jac_g(&mut self, _x: &DVector<Float>) -> FitResult<SparseTriplets> {
            let mut J = SparseTriplets::new(self.A.nrows(), self.A.ncols());
            for i in 0..self.A.nrows() {
                for j in 0..self.A.ncols() {
                    if self.A[(i, j)] != 0. {
                        J.push(i, j, self.A[(i, j)]);
                    }
                }
            }
            Ok(J)
        }

        fn intermediate_callback(&mut self, stats: &IterationStats, _x: &DVector<Float>) -> bool {
            self.iterations_seen = stats.iteration + 1;
            self.stop_after.map_or(true, |limit| stats.iteration < limit)
        }

        fn finalize_solution(&mut self, status: SolverStatus, x: &DVector<Float>, _objective: Float) {
            self.solution = Some((status, x.clone()));
        }
    }

    fn rosenbrock(x: &DVector<Float>) -> Float {
        (1. - x[0]).powi(2) + 10. * (x[1] - x[0] * x[0]).powi(2)
    }

    fn rosenbrock_gradient(x: &DVector<Float>) -> DVector<Float> {
        let inner = x[1] - x[0] * x[0];
        dvector![-2. * (1. - x[0]) - 40. * x[0] * inner, 20. * inner]
    }

    fn quiet() -> SqpSolver {
        SqpSolver::new(SolverSettings {
            tolerance: 1e-7,
            silence_output: true,
            ..Default::default()
        })
    }

    #[test]
    fn unconstrained_minimum_is_found() {
        // Arrange
        let mut program = ToyProgram::unconstrained(rosenbrock, rosenbrock_gradient, dvector![-1., 1.5]);

        // Act
        let report = quiet().solve(&mut program).unwrap();

        // Assert
        assert_eq!(report.status, SolverStatus::Converged);
        assert_close!(report.final_objective, 0., 1e-8);
        let (_, x) = program.solution.unwrap();
        assert_vec_close!(x, dvector![1., 1.], 1e-4);
    }

    #[test]
    fn equality_constrained_minimum_is_found() {
        // min x0² + x1²  s.t.  x0 + x1 = 1
        let mut program = ToyProgram::unconstrained(
            |x| x.norm_squared(),
            |x| x * 2.,
            dvector![3., -1.],
        );
        program.A = DMatrix::from_row_slice(1, 2, &[1., 1.]);
        program.bounds.g_lower = dvector![1.];
        program.bounds.g_upper = dvector![1.];

        let report = quiet().solve(&mut program).unwrap();

        assert_eq!(report.status, SolverStatus::Converged);
        let (_, x) = program.solution.unwrap();
        assert_vec_close!(x, dvector![0.5, 0.5], 1e-6);
    }

    #[test]
    fn active_bound_is_respected() {
        // min (x - 3)²  s.t.  x <= 2
        let mut program = ToyProgram::unconstrained(
            |x| (x[0] - 3.).powi(2),
            |x| dvector![2. * (x[0] - 3.)],
            dvector![0.],
        );
        program.bounds.x_upper = dvector![2.];

        let report = quiet().solve(&mut program).unwrap();

        assert_eq!(report.status, SolverStatus::Converged);
        let (_, x) = program.solution.unwrap();
        assert_close!(x[0], 2., 1e-6);
    }

    #[test]
    fn callback_can_stop_the_solve() {
        let mut program = ToyProgram::unconstrained(rosenbrock, rosenbrock_gradient, dvector![-1., 1.5]);
        program.stop_after = Some(2);

        let report = quiet().solve(&mut program).unwrap();

        assert_eq!(report.status, SolverStatus::UserRequestedStop);
        assert_eq!(report.iterations, 2);
        assert_eq!(program.iterations_seen, 3);
    }

    #[test]
    fn iteration_limit_is_a_status() {
        let mut program = ToyProgram::unconstrained(rosenbrock, rosenbrock_gradient, dvector![-1., 1.5]);
        let solver = SqpSolver::new(SolverSettings {
            max_iterations: 2,
            silence_output: true,
            ..Default::default()
        });

        let report = solver.solve(&mut program).unwrap();

        assert_eq!(report.status, SolverStatus::MaxIterationsExceeded);
        assert_eq!(report.iterations, 2);
        assert!(program.solution.is_some());
    }
}
