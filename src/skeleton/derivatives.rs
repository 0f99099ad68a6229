use na::{DMatrix, DVector, Point3, Vector3, Vector6};

use crate::{
    dynamics_model::WithRespectTo,
    inertia::{moment_basis, SpatialInertia},
    spatial::spatial_vector::SpatialVector,
    types::Float,
};

use super::{dynamics::NewtonEulerState, Skeleton};

/// Analytical derivatives of the recursive Newton-Euler torques.
///
/// The position derivative uses dS_k/dq_j = S_j × S_k for every dof k below
/// dof j, and dI/dq_j x = S_j ×* (I x) - I (S_j × x) for every body below
/// dof j, chained through the forward and backward passes.
impl Skeleton {
    /// d(tau)/dq at (q, dq, ddq)
    pub fn torques_jacobian_wrt_positions(
        &self,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        gravity: bool,
    ) -> DMatrix<Float> {
        let n = self.dofs.len();
        let state = self.newton_euler(q, dq, ddq, gravity);
        let S = &state.kin.motion_subspaces;
        let mut J = DMatrix::zeros(n, n);

        for j in 0..n {
            let Sj = S[j];
            let dS = |k: usize| {
                if self.is_strict_ancestor(j, k) {
                    Sj.cross(&S[k])
                } else {
                    SpatialVector::zero()
                }
            };

            let mut dv = vec![SpatialVector::zero(); n];
            let mut da = vec![SpatialVector::zero(); n];
            let mut df = vec![SpatialVector::zero(); n];
            for k in j..n {
                if !self.is_ancestor_or_self(j, k) {
                    continue;
                }
                let (dv_parent, da_parent) = match self.dofs[k].parent {
                    Some(p) => (dv[p], da[p]),
                    None => (SpatialVector::zero(), SpatialVector::zero()),
                };
                let dSk = dS(k);
                let v = state.velocities[k];
                dv[k] = dv_parent + dSk * dq[k];
                da[k] = da_parent
                    + dSk * ddq[k]
                    + dv[k].cross(&S[k]) * dq[k]
                    + v.cross(&dSk) * dq[k];

                if let Some(b) = self.dofs[k].body {
                    let I = &state.inertias[b];
                    let a = state.accelerations[k];
                    df[k] = I.moving_mul(&Sj, &a)
                        + I.mul(&da[k])
                        + dv[k].cross_force(&I.mul(&v))
                        + v.cross_force(&(I.moving_mul(&Sj, &v) + I.mul(&dv[k])));
                }
            }

            for k in (0..n).rev() {
                J[(k, j)] = dS(k).dot(&state.joint_forces[k]) + S[k].dot(&df[k]);
                if let Some(p) = self.dofs[k].parent {
                    let f = df[k];
                    df[p] += f;
                }
            }
        }
        J
    }

    /// d(tau)/d(dq) at (q, dq, ddq)
    pub fn torques_jacobian_wrt_velocities(
        &self,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        gravity: bool,
    ) -> DMatrix<Float> {
        let n = self.dofs.len();
        let state = self.newton_euler(q, dq, ddq, gravity);
        let S = &state.kin.motion_subspaces;
        let mut J = DMatrix::zeros(n, n);

        for j in 0..n {
            let mut dv = vec![SpatialVector::zero(); n];
            let mut da = vec![SpatialVector::zero(); n];
            let mut df = vec![SpatialVector::zero(); n];
            for k in j..n {
                if !self.is_ancestor_or_self(j, k) {
                    continue;
                }
                let (dv_parent, da_parent) = match self.dofs[k].parent {
                    Some(p) => (dv[p], da[p]),
                    None => (SpatialVector::zero(), SpatialVector::zero()),
                };
                let v = state.velocities[k];
                dv[k] = dv_parent;
                da[k] = da_parent;
                if k == j {
                    dv[k] += S[k];
                    da[k] += v.cross(&S[k]);
                }
                da[k] += dv[k].cross(&S[k]) * dq[k];

                if let Some(b) = self.dofs[k].body {
                    let I = &state.inertias[b];
                    df[k] = I.mul(&da[k])
                        + dv[k].cross_force(&I.mul(&v))
                        + v.cross_force(&I.mul(&dv[k]));
                }
            }

            let (_, dtau) = self.backward_pass(&state.kin, df);
            J.set_column(j, &dtau);
        }
        J
    }

    /// d(tau)/dθ for one of the inertial parameter groups (masses, coms,
    /// inertias). None for any other quantity.
    pub fn torques_jacobian_wrt_inertial_parameters(
        &self,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        gravity: bool,
        wrt: WithRespectTo,
    ) -> Option<DMatrix<Float>> {
        let per_group = match wrt {
            WithRespectTo::GroupMasses => 1,
            WithRespectTo::GroupComs => 3,
            WithRespectTo::GroupInertias => 6,
            _ => return None,
        };

        let n = self.dofs.len();
        let state = self.newton_euler(q, dq, ddq, gravity);
        let mut J = DMatrix::zeros(n, per_group * self.groups.len());

        for (g, group) in self.groups.iter().enumerate() {
            for i in 0..per_group {
                let mut df = vec![SpatialVector::zero(); n];
                for &b in group.bodies.iter() {
                    let dI = self.body_inertia_derivative(&state, b, wrt, i);
                    let k = self.body_dof(b);
                    let v = state.velocities[k];
                    df[k] = dI.mul(&state.accelerations[k]) + v.cross_force(&dI.mul(&v));
                }
                let (_, dtau) = self.backward_pass(&state.kin, df);
                J.set_column(per_group * g + i, &dtau);
            }
        }
        Some(J)
    }

    /// World-frame d(I_b)/dθ_i. Spatial inertia is linear in each of these
    /// parameters, so this is exact.
    fn body_inertia_derivative(
        &self,
        state: &NewtonEulerState,
        body: usize,
        wrt: WithRespectTo,
        i: usize,
    ) -> SpatialInertia {
        let group = self.body_group(body);
        let iso = self.body_transform(&state.kin, body);
        let R = iso.rotation.to_rotation_matrix().into_inner();
        let com = (iso * Point3::from(self.body_local_com(body))).coords;

        match wrt {
            WithRespectTo::GroupMasses => SpatialInertia::mass_derivative(&com),
            WithRespectTo::GroupComs => {
                let mut e = Vector3::zeros();
                e[i] = group.scale[i];
                SpatialInertia::com_derivative(group.mass, &com, &(R * e))
            }
            WithRespectTo::GroupInertias => SpatialInertia::new(
                R * moment_basis(i) * R.transpose(),
                Vector3::zeros(),
                0.,
            ),
            _ => unreachable!("not an inertial parameter group"),
        }
    }

    /// d(S_k · w)/dq for a world wrench applied to `body`
    pub fn wrench_torques_jacobian_wrt_positions(
        &self,
        q: &DVector<Float>,
        body: usize,
        wrench: &Vector6<Float>,
    ) -> DMatrix<Float> {
        let n = self.dofs.len();
        let kin = self.forward_kinematics(q);
        let S = &kin.motion_subspaces;
        let w = SpatialVector::from_vector6(wrench);
        let mut J = DMatrix::zeros(n, n);
        for &k in self.dofs[self.body_dof(body)].ancestors.iter() {
            for &j in self.dofs[k].ancestors.iter().filter(|&&j| j != k) {
                J[(k, j)] = S[j].cross(&S[k]).dot(&w);
            }
        }
        J
    }
}

#[cfg(test)]
mod derivatives_tests {
    use na::{DVector, Vector6};

    use super::*;
    use crate::{
        assert_vec_close,
        finite_difference::finite_difference_jacobian,
        helpers::build_walker,
        util::test_utils::random_dvector,
    };

    fn random_state(n: usize) -> (DVector<Float>, DVector<Float>, DVector<Float>) {
        let mut rng = rand::rng();
        (
            random_dvector(&mut rng, n, 1.0),
            random_dvector(&mut rng, n, 1.0),
            random_dvector(&mut rng, n, 1.0),
        )
    }

    #[test]
    fn position_jacobian_matches_finite_difference() {
        // Arrange
        let skeleton = build_walker();
        let n = skeleton.dofs.len();
        let (q, dq, ddq) = random_state(n);

        // Act
        let analytic = skeleton.torques_jacobian_wrt_positions(&q, &dq, &ddq, true);

        // Assert
        let fd = finite_difference_jacobian(
            |eps, i| {
                let mut q = q.clone();
                q[i] += eps;
                skeleton.inverse_dynamics_torques(&q, &dq, &ddq)
            },
            n,
            1e-3,
            true,
        );
        assert_vec_close!(analytic, fd, 1e-7);
    }

    #[test]
    fn velocity_jacobian_matches_finite_difference() {
        // Arrange
        let skeleton = build_walker();
        let n = skeleton.dofs.len();
        let (q, dq, ddq) = random_state(n);

        // Act
        let analytic = skeleton.torques_jacobian_wrt_velocities(&q, &dq, &ddq, true);

        // Assert
        let fd = finite_difference_jacobian(
            |eps, i| {
                let mut dq = dq.clone();
                dq[i] += eps;
                skeleton.inverse_dynamics_torques(&q, &dq, &ddq)
            },
            n,
            1e-3,
            true,
        );
        assert_vec_close!(analytic, fd, 1e-7);
    }

    #[test]
    fn inertial_parameter_jacobians_match_finite_difference() {
        let skeleton = build_walker();
        let n = skeleton.dofs.len();
        let (q, dq, ddq) = random_state(n);

        for wrt in [
            WithRespectTo::GroupMasses,
            WithRespectTo::GroupComs,
            WithRespectTo::GroupInertias,
        ] {
            let analytic = skeleton
                .torques_jacobian_wrt_inertial_parameters(&q, &dq, &ddq, true, wrt)
                .unwrap();

            let params = wrt.parameters(&skeleton).unwrap();
            let fd = finite_difference_jacobian(
                |eps, i| {
                    let mut perturbed = params.clone();
                    perturbed[i] += eps;
                    let mut skeleton = skeleton.clone();
                    wrt.set_parameters(&mut skeleton, &perturbed);
                    skeleton.inverse_dynamics_torques(&q, &dq, &ddq)
                },
                params.len(),
                1e-3,
                true,
            );
            assert_vec_close!(analytic, fd, 1e-7);
        }
    }

    #[test]
    fn wrench_jacobian_matches_finite_difference() {
        let skeleton = build_walker();
        let n = skeleton.dofs.len();
        let (q, _, _) = random_state(n);
        let foot = skeleton.body_index("left_foot").unwrap();
        let wrench = Vector6::new(1.0, -2.0, 0.5, 30.0, 700.0, -20.0);

        let analytic = skeleton.wrench_torques_jacobian_wrt_positions(&q, foot, &wrench);

        let fd = finite_difference_jacobian(
            |eps, i| {
                let mut q = q.clone();
                q[i] += eps;
                skeleton.wrench_torques(&q, foot, &wrench)
            },
            n,
            1e-3,
            true,
        );
        assert_vec_close!(analytic, fd, 1e-7);
    }
}
