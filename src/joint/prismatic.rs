use na::{Isometry3, Translation3, UnitQuaternion, UnitVector3};

use crate::{spatial::spatial_vector::SpatialVector, types::Float};

/// A single translational degree of freedom along a fixed axis of its joint
/// frame.
#[derive(Clone, Debug, PartialEq)]
pub struct PrismaticAxis {
    pub axis: UnitVector3<Float>, // axis expressed in joint frame
}

impl PrismaticAxis {
    pub fn new(axis: UnitVector3<Float>) -> Self {
        PrismaticAxis { axis }
    }

    /// Transform of the successor frame relative to the joint frame, moved
    /// along axis by q
    pub fn transform(&self, q: Float) -> Isometry3<Float> {
        Isometry3::from_parts(
            Translation3::from(self.axis.into_inner() * q),
            UnitQuaternion::identity(),
        )
    }

    pub fn motion_subspace(&self) -> SpatialVector {
        SpatialVector::linear(self.axis.into_inner())
    }
}
