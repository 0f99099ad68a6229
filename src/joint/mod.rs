use na::{Isometry3, Unit, Vector3};
use prismatic::PrismaticAxis;
use revolute::RevoluteAxis;

use crate::{spatial::spatial_vector::SpatialVector, types::Float};

pub mod prismatic;
pub mod revolute;

/// One generalized coordinate of a joint. Multi-dof joints are chains of
/// these, each one moving the frame of the next.
#[derive(Clone, Debug, PartialEq)]
pub enum DofAxis {
    Revolute(RevoluteAxis),
    Prismatic(PrismaticAxis),
}

impl DofAxis {
    pub fn transform(&self, q: Float) -> Isometry3<Float> {
        match self {
            DofAxis::Revolute(axis) => axis.transform(q),
            DofAxis::Prismatic(axis) => axis.transform(q),
        }
    }

    pub fn motion_subspace(&self) -> SpatialVector {
        match self {
            DofAxis::Revolute(axis) => axis.motion_subspace(),
            DofAxis::Prismatic(axis) => axis.motion_subspace(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JointType {
    Revolute(Vector3<Float>),
    Prismatic(Vector3<Float>),
    /// XYZ euler angles
    Ball,
    /// Translation (x, y, z) followed by XYZ euler angles
    Free,
}

impl JointType {
    pub fn axes(&self) -> Vec<DofAxis> {
        let rx = || DofAxis::Revolute(RevoluteAxis::new(Vector3::x_axis()));
        let ry = || DofAxis::Revolute(RevoluteAxis::new(Vector3::y_axis()));
        let rz = || DofAxis::Revolute(RevoluteAxis::new(Vector3::z_axis()));
        match self {
            JointType::Revolute(axis) => {
                vec![DofAxis::Revolute(RevoluteAxis::new(Unit::new_normalize(*axis)))]
            }
            JointType::Prismatic(axis) => {
                vec![DofAxis::Prismatic(PrismaticAxis::new(Unit::new_normalize(*axis)))]
            }
            JointType::Ball => vec![rx(), ry(), rz()],
            JointType::Free => vec![
                DofAxis::Prismatic(PrismaticAxis::new(Vector3::x_axis())),
                DofAxis::Prismatic(PrismaticAxis::new(Vector3::y_axis())),
                DofAxis::Prismatic(PrismaticAxis::new(Vector3::z_axis())),
                rx(),
                ry(),
                rz(),
            ],
        }
    }

    pub fn num_dofs(&self) -> usize {
        match self {
            JointType::Revolute(_) | JointType::Prismatic(_) => 1,
            JointType::Ball => 3,
            JointType::Free => 6,
        }
    }
}

/// A joint connecting a parent body (or the world) to its child body.
#[derive(Clone, Debug)]
pub struct Joint {
    pub name: String,
    pub joint_type: JointType,
    pub parent_body: Option<usize>,
    pub child_body: usize,
    /// Joint frame in the parent body frame. The translation is given for an
    /// unscaled parent and is stretched by the parent's scale.
    pub offset: Isometry3<Float>,
    pub first_dof: usize,
}

impl Joint {
    pub fn dofs(&self) -> std::ops::Range<usize> {
        self.first_dof..self.first_dof + self.joint_type.num_dofs()
    }
}

#[cfg(test)]
mod joint_tests {
    use na::vector;

    use super::*;
    use crate::assert_vec_close;

    #[test]
    fn free_joint_translates_before_rotating() {
        // Arrange
        let axes = JointType::Free.axes();
        let q = [1., 2., 3., 0.3, -0.4, 0.5];

        // Act
        let iso = axes
            .iter()
            .zip(q.iter())
            .fold(Isometry3::identity(), |acc, (axis, q)| acc * axis.transform(*q));

        // Assert
        assert_vec_close!(iso.translation.vector, vector![1., 2., 3.], 1e-12);
    }
}
