use log::{debug, info};
use na::DVector;

use crate::{
    dynamics_model::DynamicsModel,
    error::FitResult,
    problem::{triplets::SparseTriplets, DynamicsFitProblem},
    types::Float,
};

use super::{
    best_iterate::BestIterateTracker, IterationStats, NlpInfo, NonlinearProgram, SolverStatus,
    VariableBounds,
};

/// Exposes a `DynamicsFitProblem` to the solver. Remembers the best feasible
/// iterate seen, and writes it back into the initialization when the solve
/// ends.
pub struct DynamicsFitNlp<'a, M: DynamicsModel> {
    problem: DynamicsFitProblem<'a, M>,
    jacobian: SparseTriplets,
    best: BestIterateTracker,
}

impl<'a, M: DynamicsModel> DynamicsFitNlp<'a, M> {
    pub fn new(problem: DynamicsFitProblem<'a, M>) -> Self {
        // The constraints are linear, so their Jacobian is built once
        let jacobian = problem.compute_sparse_constraints_jacobian();
        DynamicsFitNlp {
            problem,
            jacobian,
            best: BestIterateTracker::new(),
        }
    }

    pub fn problem(&self) -> &DynamicsFitProblem<'a, M> {
        &self.problem
    }

    pub fn problem_mut(&mut self) -> &mut DynamicsFitProblem<'a, M> {
        &mut self.problem
    }

    pub fn best(&self) -> &BestIterateTracker {
        &self.best
    }
}

impl<'a, M: DynamicsModel> NonlinearProgram for DynamicsFitNlp<'a, M> {
    fn nlp_info(&self) -> NlpInfo {
        NlpInfo {
            n: self.problem.problem_size(),
            m: self.problem.constraint_size(),
            nnz_jac_g: self.jacobian.len(),
        }
    }

    fn bounds_info(&self) -> VariableBounds {
        let m = self.problem.constraint_size();
        VariableBounds {
            x_lower: self.problem.flatten_lower_bound(),
            x_upper: self.problem.flatten_upper_bound(),
            g_lower: DVector::zeros(m),
            g_upper: DVector::zeros(m),
        }
    }

    fn starting_point(&self) -> DVector<Float> {
        self.problem.flatten()
    }

    fn eval_f(&mut self, x: &DVector<Float>) -> FitResult<Float> {
        self.problem.compute_loss(x, false)
    }

    fn eval_grad_f(&mut self, x: &DVector<Float>) -> FitResult<DVector<Float>> {
        self.problem.compute_gradient(x)
    }

    fn eval_g(&mut self, x: &DVector<Float>) -> FitResult<DVector<Float>> {
        Ok(self.problem.compute_constraints(x))
    }

    fn eval_jac_g(&mut self, _x: &DVector<Float>) -> FitResult<SparseTriplets> {
        Ok(self.jacobian.clone())
    }

    fn intermediate_callback(&mut self, stats: &IterationStats, x: &DVector<Float>) -> bool {
        if self.best.record(stats, x) {
            debug!(
                "New best iterate {} with loss {:.6e}",
                stats.iteration, stats.objective
            );
        }
        true
    }

    fn finalize_solution(&mut self, status: SolverStatus, x: &DVector<Float>, objective: Float) {
        match self.best.best().cloned() {
            Some(best) => {
                info!(
                    "Solve {}: keeping best iterate {} with loss {:.6e} (final loss {:.6e})",
                    status, best.iteration, best.objective, objective
                );
                self.problem.write_back(&best.x);
            }
            None => {
                info!(
                    "Solve {}: no feasible iterate recorded, keeping final loss {:.6e}",
                    status, objective
                );
                self.problem.write_back(x);
            }
        }
    }
}

#[cfg(test)]
mod adapter_tests {
    use super::*;
    use crate::{
        nlp::sqp::{SolverSettings, SqpSolver},
        problem::{fixtures::pendulum_initialization, InclusionFlags},
    };

    #[test]
    fn info_matches_problem() {
        // Arrange
        let (skeleton, mut init) = pendulum_initialization(5);
        let problem = DynamicsFitProblem::new(&mut init, &skeleton).unwrap();
        let x = problem.flatten();

        // Act
        let nlp = DynamicsFitNlp::new(problem);
        let info = nlp.nlp_info();
        let bounds = nlp.bounds_info();

        // Assert
        assert_eq!(info.n, x.len());
        assert_eq!(info.nnz_jac_g, 3 * info.m);
        assert_eq!(nlp.starting_point(), x);
        assert_eq!(bounds.g_lower.len(), info.m);
        assert_eq!(bounds.g_upper, DVector::zeros(info.m));
    }

    #[test]
    fn finalize_writes_best_iterate() {
        // Arrange
        let (skeleton, mut init) = pendulum_initialization(4);
        let problem = DynamicsFitProblem::new(&mut init, &skeleton)
            .unwrap()
            .with_flags(InclusionFlags {
                poses: false,
                ..Default::default()
            });
        let mut nlp = DynamicsFitNlp::new(problem);
        let mut best_x = nlp.starting_point();
        best_x[0] = 6.;
        let mut worse_x = best_x.clone();
        worse_x[0] = 9.;

        // Act
        let stats = |iteration, objective| IterationStats {
            iteration,
            objective,
            inf_pr: 0.,
            d_norm: 0.,
            alpha: 1.,
        };
        nlp.intermediate_callback(&stats(0, 1.), &best_x);
        nlp.intermediate_callback(&stats(1, 2.), &worse_x);
        nlp.finalize_solution(SolverStatus::MaxIterationsExceeded, &worse_x, 2.);
        drop(nlp);

        // Assert
        assert_eq!(init.group_masses[0], 6.);
    }

    #[test]
    fn mass_only_solve_does_not_increase_loss() {
        let (skeleton, mut init) = pendulum_initialization(6);
        let flags = InclusionFlags {
            masses: true,
            ..InclusionFlags::none()
        };
        let problem = DynamicsFitProblem::new(&mut init, &skeleton)
            .unwrap()
            .with_flags(flags);
        let mut nlp = DynamicsFitNlp::new(problem);
        let x0 = nlp.starting_point();
        let initial = nlp.eval_f(&x0).unwrap();

        let solver = SqpSolver::new(SolverSettings {
            max_iterations: 20,
            silence_output: true,
            ..Default::default()
        });
        let report = solver.solve(&mut nlp).unwrap();

        assert!(report.final_objective <= initial);
        assert!(nlp.best().best().unwrap().objective <= initial);
    }
}
