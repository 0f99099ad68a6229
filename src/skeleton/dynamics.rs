use na::{DMatrix, DVector, Vector6};

use crate::{
    inertia::{moment_from_vector, SpatialInertia},
    spatial::spatial_vector::SpatialVector,
    types::Float,
};

use super::{kinematics::KinematicState, Skeleton};

/// Everything the recursive Newton-Euler passes produce, all in world frame.
/// Per-dof vectors are indexed by dof; inertias by body.
pub struct NewtonEulerState {
    pub kin: KinematicState,
    pub inertias: Vec<SpatialInertia>,
    pub velocities: Vec<SpatialVector>,
    pub accelerations: Vec<SpatialVector>,
    /// Net force transmitted across each dof, i.e. the sum of body forces of
    /// its subtree
    pub joint_forces: Vec<SpatialVector>,
    pub torques: DVector<Float>,
}

impl Skeleton {
    /// World-frame spatial inertia of every body
    pub fn world_inertias(&self, kin: &KinematicState) -> Vec<SpatialInertia> {
        (0..self.bodies.len())
            .map(|b| {
                let group = self.body_group(b);
                SpatialInertia::from_com(
                    group.mass,
                    &self.body_local_com(b),
                    &moment_from_vector(&group.inertia),
                )
                .transform(&self.body_transform(kin, b))
            })
            .collect()
    }

    /// Spatial acceleration of the world, gravity handled by accelerating the
    /// base upwards
    pub(crate) fn base_acceleration(&self, gravity: bool) -> SpatialVector {
        if gravity {
            SpatialVector::linear(-self.gravity)
        } else {
            SpatialVector::zero()
        }
    }

    /// Recursive Newton-Euler inverse dynamics in world frame.
    /// Ref: Chapter 5.3 The Recursive Newton-Euler Algorithm in "Rigid Body
    /// Dynamics Algorithms" by Roy Featherstone
    pub fn newton_euler(
        &self,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
        gravity: bool,
    ) -> NewtonEulerState {
        let n = self.dofs.len();
        assert_eq!(dq.len(), n, "dq has wrong length");
        assert_eq!(ddq.len(), n, "ddq has wrong length");

        let kin = self.forward_kinematics(q);
        let inertias = self.world_inertias(&kin);
        let a0 = self.base_acceleration(gravity);

        let mut velocities = Vec::with_capacity(n);
        let mut accelerations = Vec::with_capacity(n);
        for (k, dof) in self.dofs.iter().enumerate() {
            let S = kin.motion_subspaces[k];
            let (v_parent, a_parent) = match dof.parent {
                Some(p) => (velocities[p], accelerations[p]),
                None => (SpatialVector::zero(), a0),
            };
            let v: SpatialVector = v_parent + S * dq[k];
            let a = a_parent + S * ddq[k] + v.cross(&S) * dq[k];
            velocities.push(v);
            accelerations.push(a);
        }

        let body_forces: Vec<SpatialVector> = (0..n)
            .map(|k| match self.dofs[k].body {
                Some(b) => {
                    let I = &inertias[b];
                    let v = &velocities[k];
                    I.mul(&accelerations[k]) + v.cross_force(&I.mul(v))
                }
                None => SpatialVector::zero(),
            })
            .collect();

        let (joint_forces, torques) = self.backward_pass(&kin, body_forces);

        NewtonEulerState {
            kin,
            inertias,
            velocities,
            accelerations,
            joint_forces,
            torques,
        }
    }

    /// Accumulate per-dof forces towards the root and project them onto the
    /// motion subspaces.
    pub(crate) fn backward_pass(
        &self,
        kin: &KinematicState,
        mut forces: Vec<SpatialVector>,
    ) -> (Vec<SpatialVector>, DVector<Float>) {
        let n = self.dofs.len();
        let mut torques = DVector::zeros(n);
        for k in (0..n).rev() {
            torques[k] = kin.motion_subspaces[k].dot(&forces[k]);
            if let Some(p) = self.dofs[k].parent {
                let f = forces[k];
                forces[p] += f;
            }
        }
        (forces, torques)
    }

    pub fn inverse_dynamics_torques(
        &self,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
    ) -> DVector<Float> {
        self.newton_euler(q, dq, ddq, true).torques
    }

    /// Composite-rigid-body algorithm
    /// Ref: Chapter 6.2 The Composite-Rigid-Body Algorithm in "Rigid Body
    /// Dynamics Algorithms" by Roy Featherstone
    pub fn compute_mass_matrix(&self, q: &DVector<Float>) -> DMatrix<Float> {
        let n = self.dofs.len();
        let kin = self.forward_kinematics(q);
        let inertias = self.world_inertias(&kin);

        let mut composite: Vec<SpatialInertia> = (0..n)
            .map(|k| match self.dofs[k].body {
                Some(b) => inertias[b],
                None => SpatialInertia::zero(),
            })
            .collect();
        for k in (0..n).rev() {
            if let Some(p) = self.dofs[k].parent {
                let Ic = composite[k];
                composite[p] += &Ic;
            }
        }

        let mut M = DMatrix::zeros(n, n);
        for k in 0..n {
            let F = composite[k].mul(&kin.motion_subspaces[k]);
            for &i in self.dofs[k].ancestors.iter() {
                let value = kin.motion_subspaces[i].dot(&F);
                M[(i, k)] = value;
                M[(k, i)] = value;
            }
        }
        M
    }

    pub fn coriolis_and_gravity(&self, q: &DVector<Float>, dq: &DVector<Float>) -> DVector<Float> {
        let zeros = DVector::zeros(self.dofs.len());
        self.newton_euler(q, dq, &zeros, true).torques
    }

    /// Generalized forces of a world wrench applied to `body`: S_k · w on
    /// every dof supporting the body
    pub fn wrench_torques(
        &self,
        q: &DVector<Float>,
        body: usize,
        wrench: &Vector6<Float>,
    ) -> DVector<Float> {
        let kin = self.forward_kinematics(q);
        let w = SpatialVector::from_vector6(wrench);
        let mut tau = DVector::zeros(self.dofs.len());
        for &k in self.dofs[self.body_dof(body)].ancestors.iter() {
            tau[k] = kin.motion_subspaces[k].dot(&w);
        }
        tau
    }
}

#[cfg(test)]
mod dynamics_tests {
    use na::{dvector, vector, DVector, Vector6};

    use super::*;
    use crate::{
        assert_close, assert_vec_close,
        helpers::{build_floating_box, build_walker},
        inertia::kinetic_energy,
        util::test_utils::random_dvector,
        GRAVITY,
    };

    #[test]
    fn free_box_at_rest_needs_its_weight() {
        // Arrange
        let skeleton = build_floating_box(3.0);
        let n = skeleton.dofs.len();
        let q = dvector![0.1, 0.5, -0.2, 0., 0., 0.];

        // Act
        let tau = skeleton.inverse_dynamics_torques(&q, &DVector::zeros(n), &DVector::zeros(n));

        // Assert
        assert_vec_close!(tau.rows(0, 3), vector![0., 3.0 * GRAVITY, 0.], 1e-10);
    }

    #[test]
    fn inverse_dynamics_is_mass_matrix_plus_bias() {
        // Arrange
        let mut rng = rand::rng();
        let skeleton = build_walker();
        let n = skeleton.dofs.len();
        let q = random_dvector(&mut rng, n, 1.0);
        let dq = random_dvector(&mut rng, n, 1.0);
        let ddq = random_dvector(&mut rng, n, 1.0);

        // Act
        let tau = skeleton.inverse_dynamics_torques(&q, &dq, &ddq);

        // Assert
        let expected = skeleton.compute_mass_matrix(&q) * &ddq + skeleton.coriolis_and_gravity(&q, &dq);
        assert_vec_close!(tau, expected, 1e-9);
    }

    #[test]
    fn mass_matrix_gives_kinetic_energy() {
        // Arrange
        let mut rng = rand::rng();
        let skeleton = build_walker();
        let n = skeleton.dofs.len();
        let q = random_dvector(&mut rng, n, 1.0);
        let dq = random_dvector(&mut rng, n, 1.0);

        // Act
        let M = skeleton.compute_mass_matrix(&q);
        let state = skeleton.newton_euler(&q, &dq, &DVector::zeros(n), false);

        // Assert
        let expected: Float = (0..n)
            .filter_map(|k| skeleton.dofs[k].body.map(|b| (k, b)))
            .map(|(k, b)| kinetic_energy(&state.inertias[b], &state.velocities[k]))
            .sum();
        assert_close!(0.5 * dq.dot(&(&M * &dq)), expected, 1e-9);
    }

    #[test]
    fn wrench_at_com_balances_gravity() {
        // Arrange
        let skeleton = build_floating_box(2.0);
        let n = skeleton.dofs.len();
        let q = dvector![0.3, 1.0, 0.2, 0.4, -0.3, 0.2];
        let com = skeleton.body_com_positions(&q)[0];
        let force = vector![0., 2.0 * GRAVITY, 0.];
        let angular = com.cross(&force);
        let wrench = Vector6::new(angular.x, angular.y, angular.z, force.x, force.y, force.z);

        // Act
        let tau_ext = skeleton.wrench_torques(&q, 0, &wrench);
        let tau = skeleton.inverse_dynamics_torques(&q, &DVector::zeros(n), &DVector::zeros(n));

        // Assert
        assert_vec_close!(tau, tau_ext, 1e-10);
    }
}
