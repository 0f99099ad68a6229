use na::{DMatrix, DVector, Isometry3, Matrix3, Point3, Vector3};

use crate::{
    dynamics_model::Marker, finite_difference::finite_difference_jacobian,
    spatial::spatial_vector::SpatialVector, types::Float,
};

use super::Skeleton;

/// Step for the Ridders finite difference over group scales
const SCALE_FD_STEP: Float = 1e-3;

/// Per-dof world frames and motion subspaces at a configuration q.
#[derive(Clone, Debug)]
pub struct KinematicState {
    /// Frame after the motion of each dof
    pub frames: Vec<Isometry3<Float>>,
    /// Motion subspace of each dof, expressed in world frame
    pub motion_subspaces: Vec<SpatialVector>,
}

impl Skeleton {
    pub fn forward_kinematics(&self, q: &DVector<Float>) -> KinematicState {
        assert_eq!(q.len(), self.dofs.len(), "q has wrong length");

        let n = self.dofs.len();
        let mut frames: Vec<Isometry3<Float>> = Vec::with_capacity(n);
        let mut motion_subspaces = Vec::with_capacity(n);
        for (k, dof) in self.dofs.iter().enumerate() {
            let joint = &self.joints[dof.joint];
            let base = if k == joint.first_dof {
                let parent_frame = match joint.parent_body {
                    Some(parent) => frames[self.body_dof(parent)],
                    None => Isometry3::identity(),
                };
                parent_frame * self.scaled_joint_offset(joint)
            } else {
                frames[k - 1]
            };

            motion_subspaces.push(dof.axis.motion_subspace().transform(&base));
            frames.push(base * dof.axis.transform(q[k]));
        }

        KinematicState {
            frames,
            motion_subspaces,
        }
    }

    pub fn body_transform(&self, kin: &KinematicState, body: usize) -> Isometry3<Float> {
        kin.frames[self.body_dof(body)]
    }

    /// d(x)/dq for a world point x rigidly attached to `body`
    fn point_jacobian(&self, kin: &KinematicState, body: usize, x: &Vector3<Float>) -> DMatrix<Float> {
        let mut J = DMatrix::zeros(3, self.dofs.len());
        for &k in self.dofs[self.body_dof(body)].ancestors.iter() {
            J.fixed_view_mut::<3, 1>(0, k)
                .copy_from(&kin.motion_subspaces[k].point_velocity(x));
        }
        J
    }

    fn marker_world_position(&self, kin: &KinematicState, marker: &Marker) -> Vector3<Float> {
        let local = self.body_group(marker.body).scale.component_mul(&marker.offset);
        (self.body_transform(kin, marker.body) * Point3::from(local)).coords
    }

    pub fn marker_positions(&self, q: &DVector<Float>, markers: &[Marker]) -> DVector<Float> {
        let kin = self.forward_kinematics(q);
        let mut result = DVector::zeros(3 * markers.len());
        for (i, marker) in markers.iter().enumerate() {
            let x = self.marker_world_position(&kin, marker);
            result.fixed_rows_mut::<3>(3 * i).copy_from(&x);
        }
        result
    }

    pub fn marker_positions_jacobian(&self, q: &DVector<Float>, markers: &[Marker]) -> DMatrix<Float> {
        let kin = self.forward_kinematics(q);
        let mut J = DMatrix::zeros(3 * markers.len(), self.dofs.len());
        for (i, marker) in markers.iter().enumerate() {
            let x = self.marker_world_position(&kin, marker);
            J.rows_mut(3 * i, 3)
                .copy_from(&self.point_jacobian(&kin, marker.body, &x));
        }
        J
    }

    pub fn marker_offsets_jacobian(&self, q: &DVector<Float>, markers: &[Marker]) -> DMatrix<Float> {
        let kin = self.forward_kinematics(q);
        let mut J = DMatrix::zeros(3 * markers.len(), 3 * markers.len());
        for (i, marker) in markers.iter().enumerate() {
            let R = self
                .body_transform(&kin, marker.body)
                .rotation
                .to_rotation_matrix()
                .into_inner();
            let S = Matrix3::from_diagonal(&self.body_group(marker.body).scale);
            J.fixed_view_mut::<3, 3>(3 * i, 3 * i).copy_from(&(R * S));
        }
        J
    }

    pub fn marker_scales_jacobian(&self, q: &DVector<Float>, markers: &[Marker]) -> DMatrix<Float> {
        self.scales_finite_difference(|skeleton| skeleton.marker_positions(q, markers))
    }

    pub fn joint_positions(&self, q: &DVector<Float>, joints: &[usize]) -> DVector<Float> {
        let kin = self.forward_kinematics(q);
        let mut result = DVector::zeros(3 * joints.len());
        for (i, &body) in joints.iter().enumerate() {
            result
                .fixed_rows_mut::<3>(3 * i)
                .copy_from(&self.body_transform(&kin, body).translation.vector);
        }
        result
    }

    pub fn joint_positions_jacobian(&self, q: &DVector<Float>, joints: &[usize]) -> DMatrix<Float> {
        let kin = self.forward_kinematics(q);
        let mut J = DMatrix::zeros(3 * joints.len(), self.dofs.len());
        for (i, &body) in joints.iter().enumerate() {
            let x = self.body_transform(&kin, body).translation.vector;
            J.rows_mut(3 * i, 3)
                .copy_from(&self.point_jacobian(&kin, body, &x));
        }
        J
    }

    pub fn joint_scales_jacobian(&self, q: &DVector<Float>, joints: &[usize]) -> DMatrix<Float> {
        self.scales_finite_difference(|skeleton| skeleton.joint_positions(q, joints))
    }

    pub fn body_com_positions(&self, q: &DVector<Float>) -> Vec<Vector3<Float>> {
        let kin = self.forward_kinematics(q);
        (0..self.bodies.len())
            .map(|b| (self.body_transform(&kin, b) * Point3::from(self.body_local_com(b))).coords)
            .collect()
    }

    /// Ridders finite difference of `f` over the flattened group scales
    pub(crate) fn scales_finite_difference<F>(&self, f: F) -> DMatrix<Float>
    where
        F: Fn(&Skeleton) -> DVector<Float>,
    {
        let scales = self.group_scales_vector();
        finite_difference_jacobian(
            |eps, i| {
                let mut perturbed = scales.clone();
                perturbed[i] += eps;
                let mut skeleton = self.clone();
                skeleton.set_group_scales_vector(&perturbed);
                f(&skeleton)
            },
            scales.len(),
            SCALE_FD_STEP,
            true,
        )
    }
}
