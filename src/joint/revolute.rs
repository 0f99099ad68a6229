use na::{Isometry3, Translation3, UnitQuaternion, UnitVector3};

use crate::{spatial::spatial_vector::SpatialVector, types::Float};

/// A single rotational degree of freedom about a fixed axis of its joint
/// frame.
#[derive(Clone, Debug, PartialEq)]
pub struct RevoluteAxis {
    pub axis: UnitVector3<Float>, // axis expressed in joint frame
}

impl RevoluteAxis {
    pub fn new(axis: UnitVector3<Float>) -> Self {
        RevoluteAxis { axis }
    }

    /// Transform of the successor frame relative to the joint frame, rotated
    /// by q about axis
    pub fn transform(&self, q: Float) -> Isometry3<Float> {
        Isometry3::from_parts(
            Translation3::identity(),
            UnitQuaternion::from_axis_angle(&self.axis, q),
        )
    }

    pub fn motion_subspace(&self) -> SpatialVector {
        SpatialVector::angular(self.axis.into_inner())
    }
}

#[cfg(test)]
mod revolute_tests {
    use na::{vector, Vector3};

    use super::*;
    use crate::{assert_vec_close, PI};

    #[test]
    fn quarter_turn_about_z() {
        // Arrange
        let joint = RevoluteAxis::new(Vector3::z_axis());

        // Act
        let iso = joint.transform(PI / 2.);

        // Assert
        assert_vec_close!(iso * vector![1., 0., 0.], vector![0., 1., 0.], 1e-12);
    }
}
