use na::{DMatrix, DVector, Isometry3, Vector3, Vector6};

use crate::{
    dynamics_model::{DynamicsModel, Marker, WithRespectTo},
    types::Float,
};

use super::Skeleton;

/// Flattened scale group parameters
impl Skeleton {
    pub fn group_scales_vector(&self) -> DVector<Float> {
        DVector::from_iterator(
            3 * self.groups.len(),
            self.groups.iter().flat_map(|g| g.scale.iter().copied()),
        )
    }

    pub fn set_group_scales_vector(&mut self, scales: &DVector<Float>) {
        assert_eq!(scales.len(), 3 * self.groups.len());
        for (g, group) in self.groups.iter_mut().enumerate() {
            group.scale = scales.fixed_rows::<3>(3 * g).into_owned();
        }
    }

    fn repeated_bounds(&self, per_group: usize, bound: impl Fn(usize) -> (Float, Float)) -> (DVector<Float>, DVector<Float>) {
        let len = per_group * self.groups.len();
        (
            DVector::from_fn(len, |i, _| bound(i % per_group).0),
            DVector::from_fn(len, |i, _| bound(i % per_group).1),
        )
    }
}

impl DynamicsModel for Skeleton {
    fn num_dofs(&self) -> usize {
        self.dofs.len()
    }

    fn num_bodies(&self) -> usize {
        self.bodies.len()
    }

    fn num_scale_groups(&self) -> usize {
        self.groups.len()
    }

    fn group_masses(&self) -> DVector<Float> {
        DVector::from_iterator(self.groups.len(), self.groups.iter().map(|g| g.mass))
    }

    fn set_group_masses(&mut self, masses: &DVector<Float>) {
        assert_eq!(masses.len(), self.groups.len());
        for (group, mass) in self.groups.iter_mut().zip(masses.iter()) {
            group.mass = *mass;
        }
    }

    fn group_masses_bounds(&self) -> (DVector<Float>, DVector<Float>) {
        self.repeated_bounds(1, |_| self.bounds.mass)
    }

    fn group_coms(&self) -> DVector<Float> {
        DVector::from_iterator(
            3 * self.groups.len(),
            self.groups.iter().flat_map(|g| g.com.iter().copied()),
        )
    }

    fn set_group_coms(&mut self, coms: &DVector<Float>) {
        assert_eq!(coms.len(), 3 * self.groups.len());
        for (g, group) in self.groups.iter_mut().enumerate() {
            group.com = coms.fixed_rows::<3>(3 * g).into_owned();
        }
    }

    fn group_coms_bounds(&self) -> (DVector<Float>, DVector<Float>) {
        self.repeated_bounds(3, |_| self.bounds.com)
    }

    fn group_inertias(&self) -> DVector<Float> {
        DVector::from_iterator(
            6 * self.groups.len(),
            self.groups.iter().flat_map(|g| g.inertia.iter().copied()),
        )
    }

    fn set_group_inertias(&mut self, inertias: &DVector<Float>) {
        assert_eq!(inertias.len(), 6 * self.groups.len());
        for (g, group) in self.groups.iter_mut().enumerate() {
            group.inertia = inertias.fixed_rows::<6>(6 * g).into_owned();
        }
    }

    fn group_inertias_bounds(&self) -> (DVector<Float>, DVector<Float>) {
        self.repeated_bounds(6, |i| {
            if i < 3 {
                self.bounds.inertia_moments
            } else {
                self.bounds.inertia_products
            }
        })
    }

    fn group_scales(&self) -> DVector<Float> {
        self.group_scales_vector()
    }

    fn set_group_scales(&mut self, scales: &DVector<Float>) {
        self.set_group_scales_vector(scales)
    }

    fn group_scales_bounds(&self) -> (DVector<Float>, DVector<Float>) {
        self.repeated_bounds(3, |_| self.bounds.scale)
    }

    fn position_limits(&self) -> (DVector<Float>, DVector<Float>) {
        self.limits(|dof| dof.position_limits)
    }

    fn velocity_limits(&self) -> (DVector<Float>, DVector<Float>) {
        self.limits(|dof| dof.velocity_limits)
    }

    fn acceleration_limits(&self) -> (DVector<Float>, DVector<Float>) {
        self.limits(|dof| dof.acceleration_limits)
    }

    fn body_masses(&self) -> DVector<Float> {
        DVector::from_fn(self.bodies.len(), |b, _| self.body_group(b).mass)
    }

    fn body_scale_group(&self, body: usize) -> usize {
        self.bodies[body].scale_group
    }

    fn body_children(&self, body: usize) -> Vec<usize> {
        self.children(body)
    }

    fn body_world_transforms(&self, q: &DVector<Float>) -> Vec<Isometry3<Float>> {
        let kin = self.forward_kinematics(q);
        (0..self.bodies.len())
            .map(|b| self.body_transform(&kin, b))
            .collect()
    }

    fn body_com_world_positions(&self, q: &DVector<Float>) -> Vec<Vector3<Float>> {
        self.body_com_positions(q)
    }

    fn mass_matrix(&self, q: &DVector<Float>) -> DMatrix<Float> {
        self.compute_mass_matrix(q)
    }

    fn coriolis_and_gravity_forces(
        &self,
        q: &DVector<Float>,
        dq: &DVector<Float>,
    ) -> DVector<Float> {
        self.coriolis_and_gravity(q, dq)
    }

    fn jacobian_of_m(
        &self,
        q: &DVector<Float>,
        ddq: &DVector<Float>,
        wrt: WithRespectTo,
    ) -> Option<DMatrix<Float>> {
        let n = self.dofs.len();
        let zeros = DVector::zeros(n);
        match wrt {
            WithRespectTo::Position => {
                Some(self.torques_jacobian_wrt_positions(q, &zeros, ddq, false))
            }
            WithRespectTo::Velocity => Some(DMatrix::zeros(n, n)),
            WithRespectTo::Acceleration => Some(self.compute_mass_matrix(q)),
            WithRespectTo::GroupScales => None,
            _ => self.torques_jacobian_wrt_inertial_parameters(q, &zeros, ddq, false, wrt),
        }
    }

    fn jacobian_of_c(
        &self,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        wrt: WithRespectTo,
    ) -> Option<DMatrix<Float>> {
        let n = self.dofs.len();
        let zeros = DVector::zeros(n);
        match wrt {
            WithRespectTo::Position => {
                Some(self.torques_jacobian_wrt_positions(q, dq, &zeros, true))
            }
            WithRespectTo::Velocity => {
                Some(self.torques_jacobian_wrt_velocities(q, dq, &zeros, true))
            }
            WithRespectTo::Acceleration => Some(DMatrix::zeros(n, n)),
            WithRespectTo::GroupScales => None,
            _ => self.torques_jacobian_wrt_inertial_parameters(q, dq, &zeros, true, wrt),
        }
    }

    fn external_wrench_torques(
        &self,
        q: &DVector<Float>,
        body: usize,
        wrench: &Vector6<Float>,
    ) -> DVector<Float> {
        self.wrench_torques(q, body, wrench)
    }

    fn external_wrench_torques_jacobian(
        &self,
        q: &DVector<Float>,
        body: usize,
        wrench: &Vector6<Float>,
        wrt: WithRespectTo,
    ) -> Option<DMatrix<Float>> {
        match wrt {
            WithRespectTo::Position => {
                Some(self.wrench_torques_jacobian_wrt_positions(q, body, wrench))
            }
            // Joint offsets stretch with scale, which moves the axes
            WithRespectTo::GroupScales => None,
            _ => Some(DMatrix::zeros(self.dofs.len(), wrt.dim(self))),
        }
    }

    fn marker_world_positions(&self, q: &DVector<Float>, markers: &[Marker]) -> DVector<Float> {
        self.marker_positions(q, markers)
    }

    fn marker_jacobian_wrt_positions(
        &self,
        q: &DVector<Float>,
        markers: &[Marker],
    ) -> DMatrix<Float> {
        self.marker_positions_jacobian(q, markers)
    }

    fn marker_jacobian_wrt_offsets(
        &self,
        q: &DVector<Float>,
        markers: &[Marker],
    ) -> DMatrix<Float> {
        self.marker_offsets_jacobian(q, markers)
    }

    fn marker_jacobian_wrt_scales(
        &self,
        q: &DVector<Float>,
        markers: &[Marker],
    ) -> DMatrix<Float> {
        self.marker_scales_jacobian(q, markers)
    }

    fn joint_world_positions(&self, q: &DVector<Float>, joints: &[usize]) -> DVector<Float> {
        self.joint_positions(q, joints)
    }

    fn joint_jacobian_wrt_positions(
        &self,
        q: &DVector<Float>,
        joints: &[usize],
    ) -> DMatrix<Float> {
        self.joint_positions_jacobian(q, joints)
    }

    fn joint_jacobian_wrt_scales(&self, q: &DVector<Float>, joints: &[usize]) -> DMatrix<Float> {
        self.joint_scales_jacobian(q, joints)
    }

    fn inverse_dynamics(
        &self,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
    ) -> DVector<Float> {
        self.inverse_dynamics_torques(q, dq, ddq)
    }
}

#[cfg(test)]
mod model_tests {
    use na::DVector;

    use super::*;
    use crate::{assert_vec_close, helpers::build_walker, util::test_utils::random_dvector};

    #[test]
    fn m_and_c_jacobians_sum_to_full_derivative() {
        // Arrange
        let mut rng = rand::rng();
        let skeleton = build_walker();
        let n = skeleton.dofs.len();
        let q = random_dvector(&mut rng, n, 1.0);
        let dq = random_dvector(&mut rng, n, 1.0);
        let ddq = random_dvector(&mut rng, n, 1.0);

        for wrt in [
            WithRespectTo::Position,
            WithRespectTo::Velocity,
            WithRespectTo::GroupMasses,
            WithRespectTo::GroupComs,
        ] {
            // Act
            let split = skeleton.jacobian_of_m(&q, &ddq, wrt).unwrap()
                + skeleton.jacobian_of_c(&q, &dq, wrt).unwrap();

            // Assert
            let full = match wrt {
                WithRespectTo::Position => skeleton.torques_jacobian_wrt_positions(&q, &dq, &ddq, true),
                WithRespectTo::Velocity => skeleton.torques_jacobian_wrt_velocities(&q, &dq, &ddq, true),
                _ => skeleton
                    .torques_jacobian_wrt_inertial_parameters(&q, &dq, &ddq, true, wrt)
                    .unwrap(),
            };
            assert_vec_close!(split, full, 1e-9);
        }
    }

    #[test]
    fn parameter_setters_round_trip() {
        let mut skeleton = build_walker();
        let masses = DVector::from_fn(skeleton.groups.len(), |i, _| 1.0 + i as Float);
        skeleton.set_group_masses(&masses);
        assert_vec_close!(skeleton.group_masses(), masses, 0.);

        let (lower, upper) = skeleton.group_inertias_bounds();
        assert!(lower.iter().zip(upper.iter()).all(|(l, u)| l <= u));
    }
}
