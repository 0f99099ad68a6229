use std::ops::{Add, AddAssign, Mul, Neg, Sub};

use na::{zero, Isometry3, Vector3, Vector6};

use crate::{
    types::Float,
    util::{se3_commutator, se3_dual_commutator},
};

/// A 6D spatial vector (angular, linear) expressed in world frame.
/// Used for both motion (twist, acceleration, motion subspace) and force
/// (wrench) quantities; the cross products distinguish the two.
#[derive(Clone, Debug, Copy, PartialEq)]
pub struct SpatialVector {
    pub angular: Vector3<Float>,
    pub linear: Vector3<Float>,
}

impl SpatialVector {
    pub fn zero() -> Self {
        SpatialVector {
            angular: zero(),
            linear: zero(),
        }
    }

    pub fn new(angular: Vector3<Float>, linear: Vector3<Float>) -> Self {
        SpatialVector { angular, linear }
    }

    pub fn angular(angular: Vector3<Float>) -> Self {
        SpatialVector {
            angular,
            linear: zero(),
        }
    }

    pub fn linear(linear: Vector3<Float>) -> Self {
        SpatialVector {
            angular: zero(),
            linear,
        }
    }

    /// Express a vector given in a local frame in the frame that `iso` maps
    /// into.
    pub fn transform(&self, iso: &Isometry3<Float>) -> SpatialVector {
        let angular = iso.rotation * self.angular;
        let linear = iso.rotation * self.linear + iso.translation.vector.cross(&angular);
        SpatialVector { angular, linear }
    }

    /// Motion cross product, self × rhs
    pub fn cross(&self, rhs: &SpatialVector) -> SpatialVector {
        let (angular, linear) =
            se3_commutator(&self.angular, &self.linear, &rhs.angular, &rhs.linear);
        SpatialVector { angular, linear }
    }

    /// Force cross product, self ×* force
    pub fn cross_force(&self, force: &SpatialVector) -> SpatialVector {
        let (angular, linear) =
            se3_dual_commutator(&self.angular, &self.linear, &force.angular, &force.linear);
        SpatialVector { angular, linear }
    }

    /// Pairing of a motion and a force vector, i.e. power.
    pub fn dot(&self, rhs: &SpatialVector) -> Float {
        self.angular.dot(&rhs.angular) + self.linear.dot(&rhs.linear)
    }

    /// Velocity of the world point p under this motion
    pub fn point_velocity(&self, p: &Vector3<Float>) -> Vector3<Float> {
        self.angular.cross(p) + self.linear
    }

    pub fn as_vector6(&self) -> Vector6<Float> {
        Vector6::new(
            self.angular.x,
            self.angular.y,
            self.angular.z,
            self.linear.x,
            self.linear.y,
            self.linear.z,
        )
    }

    pub fn from_vector6(v: &Vector6<Float>) -> Self {
        SpatialVector {
            angular: v.fixed_rows::<3>(0).into_owned(),
            linear: v.fixed_rows::<3>(3).into_owned(),
        }
    }
}

impl Mul<Float> for SpatialVector {
    type Output = SpatialVector;

    fn mul(self, rhs: Float) -> Self::Output {
        SpatialVector {
            angular: self.angular * rhs,
            linear: self.linear * rhs,
        }
    }
}

impl Add for SpatialVector {
    type Output = SpatialVector;

    fn add(self, rhs: Self) -> Self::Output {
        SpatialVector {
            angular: self.angular + rhs.angular,
            linear: self.linear + rhs.linear,
        }
    }
}

impl AddAssign for SpatialVector {
    fn add_assign(&mut self, rhs: Self) {
        self.angular += rhs.angular;
        self.linear += rhs.linear;
    }
}

impl Sub for SpatialVector {
    type Output = SpatialVector;

    fn sub(self, rhs: Self) -> Self::Output {
        SpatialVector {
            angular: self.angular - rhs.angular,
            linear: self.linear - rhs.linear,
        }
    }
}

impl Neg for SpatialVector {
    type Output = SpatialVector;

    fn neg(self) -> Self::Output {
        SpatialVector {
            angular: -self.angular,
            linear: -self.linear,
        }
    }
}
