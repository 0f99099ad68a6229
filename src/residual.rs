use na::{DMatrix, DVector, Vector6};

use crate::{
    dynamics_model::{DynamicsModel, WithRespectTo},
    finite_difference::finite_difference_jacobian,
    spatial::wrench,
    types::Float,
};

/// Initial step of the Ridders finite difference fallback
const RESIDUAL_FD_STEP: Float = 1e-3;

/// Computes the residual force on the floating base: the part of the
/// inverse-dynamics torques on the 6 root dofs that the measured external
/// wrenches do not explain.
///
/// `forces` concatenates one world wrench (moment about origin, force) per
/// force body, in the order the bodies were given.
#[derive(Clone, Debug)]
pub struct ResidualForceHelper {
    force_bodies: Vec<usize>,
}

impl ResidualForceHelper {
    pub fn new(force_bodies: Vec<usize>) -> Self {
        ResidualForceHelper { force_bodies }
    }

    pub fn force_bodies(&self) -> &[usize] {
        &self.force_bodies
    }

    /// (M ddq + C - Σ τ(wrench_i)) on the root dofs
    pub fn calculate_residual<M: DynamicsModel>(
        &self,
        model: &M,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        forces: &DVector<Float>,
    ) -> Vector6<Float> {
        debug_assert_eq!(forces.len(), 6 * self.force_bodies.len());
        let mut tau = model.inverse_dynamics(q, dq, ddq);
        for (i, &body) in self.force_bodies.iter().enumerate() {
            let w = wrench::nth(forces, i).as_vector6();
            tau -= model.external_wrench_torques(q, body, &w);
        }
        tau.fixed_rows::<6>(0).into_owned()
    }

    pub fn calculate_residual_norm<M: DynamicsModel>(
        &self,
        model: &M,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        forces: &DVector<Float>,
        use_l1: bool,
    ) -> Float {
        residual_norm(&self.calculate_residual(model, q, dq, ddq, forces), use_l1)
    }

    /// d(residual)/d(wrt), 6 × dim(wrt). Falls back to finite differencing
    /// whenever the model has no closed form for `wrt`.
    pub fn calculate_residual_jacobian_wrt<M: DynamicsModel>(
        &self,
        model: &M,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        forces: &DVector<Float>,
        wrt: WithRespectTo,
    ) -> DMatrix<Float> {
        match self.analytical_residual_jacobian(model, q, dq, ddq, forces, wrt) {
            Some(J) => J,
            None => self.finite_difference_residual_jacobian_wrt(model, q, dq, ddq, forces, wrt),
        }
    }

    fn analytical_residual_jacobian<M: DynamicsModel>(
        &self,
        model: &M,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        forces: &DVector<Float>,
        wrt: WithRespectTo,
    ) -> Option<DMatrix<Float>> {
        let mut J = model.jacobian_of_m(q, ddq, wrt)? + model.jacobian_of_c(q, dq, wrt)?;
        for (i, &body) in self.force_bodies.iter().enumerate() {
            let w = wrench::nth(forces, i).as_vector6();
            J -= model.external_wrench_torques_jacobian(q, body, &w, wrt)?;
        }
        Some(J.rows(0, 6).into_owned())
    }

    pub fn finite_difference_residual_jacobian_wrt<M: DynamicsModel>(
        &self,
        model: &M,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        forces: &DVector<Float>,
        wrt: WithRespectTo,
    ) -> DMatrix<Float> {
        let parameters = wrt.parameters(model);
        let residual = |eps: Float, i: usize| -> DVector<Float> {
            let perturb = |v: &DVector<Float>| {
                let mut v = v.clone();
                v[i] += eps;
                v
            };
            let r = match (wrt, &parameters) {
                (WithRespectTo::Position, _) => {
                    self.calculate_residual(model, &perturb(q), dq, ddq, forces)
                }
                (WithRespectTo::Velocity, _) => {
                    self.calculate_residual(model, q, &perturb(dq), ddq, forces)
                }
                (WithRespectTo::Acceleration, _) => {
                    self.calculate_residual(model, q, dq, &perturb(ddq), forces)
                }
                (_, Some(p)) => {
                    let mut perturbed = model.clone();
                    wrt.set_parameters(&mut perturbed, &perturb(p));
                    self.calculate_residual(&perturbed, q, dq, ddq, forces)
                }
                (_, None) => unreachable!("parameter group without parameters"),
            };
            DVector::from_column_slice(r.as_slice())
        };
        finite_difference_jacobian(residual, wrt.dim(model), RESIDUAL_FD_STEP, true)
    }

    pub fn calculate_residual_norm_gradient_wrt<M: DynamicsModel>(
        &self,
        model: &M,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        forces: &DVector<Float>,
        wrt: WithRespectTo,
        use_l1: bool,
    ) -> DVector<Float> {
        let r = self.calculate_residual(model, q, dq, ddq, forces);
        let J = self.calculate_residual_jacobian_wrt(model, q, dq, ddq, forces, wrt);
        J.transpose() * DVector::from_column_slice(residual_norm_gradient(&r, use_l1).as_slice())
    }

    pub fn finite_difference_residual_norm_gradient_wrt<M: DynamicsModel>(
        &self,
        model: &M,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        forces: &DVector<Float>,
        wrt: WithRespectTo,
        use_l1: bool,
    ) -> DVector<Float> {
        let J = self.finite_difference_residual_jacobian_wrt(model, q, dq, ddq, forces, wrt);
        let r = self.calculate_residual(model, q, dq, ddq, forces);
        J.transpose() * DVector::from_column_slice(residual_norm_gradient(&r, use_l1).as_slice())
    }
}

/// |force| + |torque| for L1, squared norm otherwise
pub fn residual_norm(r: &Vector6<Float>, use_l1: bool) -> Float {
    if use_l1 {
        r.fixed_rows::<3>(0).norm() + r.fixed_rows::<3>(3).norm()
    } else {
        r.norm_squared()
    }
}

/// d(residual_norm)/dr. A zero half of the L1 norm contributes zero.
pub fn residual_norm_gradient(r: &Vector6<Float>, use_l1: bool) -> Vector6<Float> {
    if !use_l1 {
        return 2. * r;
    }
    let mut grad = Vector6::zeros();
    for half in [0, 3] {
        let part = r.fixed_rows::<3>(half);
        let norm = part.norm();
        if norm > 0. {
            grad.fixed_rows_mut::<3>(half).copy_from(&(part / norm));
        }
    }
    grad
}

#[cfg(test)]
mod residual_tests {
    use na::{DVector, Vector3};

    use super::*;
    use crate::{
        assert_close, assert_vec_close,
        finite_difference::finite_difference_jacobian,
        helpers::build_walker,
        skeleton::Skeleton,
        util::test_utils::random_dvector,
    };

    struct Fixture {
        skeleton: Skeleton,
        helper: ResidualForceHelper,
        q: DVector<Float>,
        dq: DVector<Float>,
        ddq: DVector<Float>,
        forces: DVector<Float>,
    }

    fn fixture() -> Fixture {
        let mut rng = rand::rng();
        let skeleton = build_walker();
        let n = skeleton.dofs.len();
        let feet = vec![
            skeleton.body_index("left_foot").unwrap(),
            skeleton.body_index("right_foot").unwrap(),
        ];
        let mut forces = random_dvector(&mut rng, 12, 20.0);
        forces[4] += 300.;
        forces[10] += 300.;
        Fixture {
            helper: ResidualForceHelper::new(feet),
            q: random_dvector(&mut rng, n, 0.5),
            dq: random_dvector(&mut rng, n, 1.0),
            ddq: random_dvector(&mut rng, n, 1.0),
            forces,
            skeleton,
        }
    }

    #[test]
    fn residual_jacobians_match_finite_difference() {
        // Arrange
        let f = fixture();

        for wrt in WithRespectTo::ALL {
            // Act
            let analytic = f
                .helper
                .calculate_residual_jacobian_wrt(&f.skeleton, &f.q, &f.dq, &f.ddq, &f.forces, wrt);

            // Assert
            let fd = f.helper.finite_difference_residual_jacobian_wrt(
                &f.skeleton, &f.q, &f.dq, &f.ddq, &f.forces, wrt,
            );
            assert_eq!(analytic.shape(), (6, wrt.dim(&f.skeleton)));
            assert_vec_close!(analytic, fd, 1e-6);
        }
    }

    #[test]
    fn residual_norm_gradients_match_finite_difference() {
        let f = fixture();
        for use_l1 in [false, true] {
            for wrt in [WithRespectTo::Position, WithRespectTo::GroupMasses] {
                let analytic = f.helper.calculate_residual_norm_gradient_wrt(
                    &f.skeleton, &f.q, &f.dq, &f.ddq, &f.forces, wrt, use_l1,
                );

                // Differentiate the norm itself, not through the Jacobian
                let fd = finite_difference_jacobian(
                    |eps, i| {
                        let mut skeleton = f.skeleton.clone();
                        let mut q = f.q.clone();
                        match wrt {
                            WithRespectTo::Position => q[i] += eps,
                            _ => {
                                let mut m = skeleton.group_masses();
                                m[i] += eps;
                                skeleton.set_group_masses(&m);
                            }
                        }
                        DVector::from_element(
                            1,
                            f.helper.calculate_residual_norm(
                                &skeleton, &q, &f.dq, &f.ddq, &f.forces, use_l1,
                            ),
                        )
                    },
                    wrt.dim(&f.skeleton),
                    1e-3,
                    true,
                );
                let fd = fd.row(0).transpose();
                let scale = 1.0_f64.max(fd.amax());
                assert_vec_close!(analytic / scale, fd / scale, 1e-7);
            }
        }
    }

    #[test]
    fn l1_norm_gradient_ignores_zero_half() {
        let r = Vector6::new(3., 4., 0., 0., 0., 0.);
        let grad = residual_norm_gradient(&r, true);
        assert_close!(residual_norm(&r, true), 5., 1e-12);
        assert_vec_close!(grad.fixed_rows::<3>(0), Vector3::new(0.6, 0.8, 0.), 1e-12);
        assert_vec_close!(grad.fixed_rows::<3>(3), Vector3::<Float>::zeros(), 0.);
    }
}
