use std::ops::{Add, AddAssign};

use na::{Isometry3, Matrix3, Vector3, Vector6};

use crate::{
    spatial::spatial_vector::SpatialVector,
    types::Float,
    util::{mul_inertia, point_mass_moment},
};

/// A spatial inertia, or inertia matrix, represents the mass distribution of a
/// rigid body.
/// A spatial inertia expressed in frame i is defined as:
/// I^i = | J         c_hat |
///       | c_hat^T     mI  |
/// where J is the mass moment of inertia, m is the total mass, and c is the
/// 'cross part', which is the center of mass position scaled by m.
///
/// !!! Warning
///     The __moment__ field of a __SpatialInertia__ is the moment of inertia
///     about the origin of its frame, not about the center of mass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialInertia {
    pub moment: Matrix3<Float>,
    pub cross_part: Vector3<Float>,
    pub mass: Float,
}

impl SpatialInertia {
    pub fn new(moment: Matrix3<Float>, cross_part: Vector3<Float>, mass: Float) -> Self {
        SpatialInertia {
            moment,
            cross_part,
            mass,
        }
    }

    pub fn zero() -> Self {
        SpatialInertia {
            moment: Matrix3::zeros(),
            cross_part: Vector3::zeros(),
            mass: 0.,
        }
    }

    /// Spatial inertia in body frame, from a mass, a center of mass and the
    /// inertia about the center of mass, both in body coordinates.
    pub fn from_com(mass: Float, com: &Vector3<Float>, inertia_about_com: &Matrix3<Float>) -> Self {
        SpatialInertia {
            moment: inertia_about_com + mass * point_mass_moment(com),
            cross_part: mass * com,
            mass,
        }
    }

    pub fn center_of_mass(&self) -> Vector3<Float> {
        self.cross_part / self.mass
    }

    /// Tranform the spatial inertia from body frame to the frame that `iso`
    /// maps into.
    pub fn transform(&self, iso: &Isometry3<Float>) -> SpatialInertia {
        let R = iso.rotation.to_rotation_matrix().into_inner();
        let p = iso.translation.vector;

        let J = self.moment;
        let mc = self.cross_part;
        let m = self.mass;

        let Rmc = R * mc;
        let mp = m * p;
        let mcnew = Rmc + mp;
        let X = Rmc * p.transpose();
        let Y = X + X.transpose() + mp * p.transpose();
        let Jnew = R * J * R.transpose() - Y + Y.trace() * Matrix3::identity();

        SpatialInertia {
            moment: Jnew,
            cross_part: mcnew,
            mass: m,
        }
    }

    /// I * v, a spatial momentum (force-like)
    pub fn mul(&self, v: &SpatialVector) -> SpatialVector {
        let (angular, linear) = mul_inertia(
            &self.moment,
            &self.cross_part,
            self.mass,
            &v.angular,
            &v.linear,
        );
        SpatialVector { angular, linear }
    }

    /// d(I x)/dθ when the body carrying this inertia moves with unit motion
    /// s per unit θ:
    ///     dI x = s ×* (I x) - I (s × x)
    pub fn moving_mul(&self, s: &SpatialVector, x: &SpatialVector) -> SpatialVector {
        s.cross_force(&self.mul(x)) - self.mul(&s.cross(x))
    }

    /// dI/dm for a body whose center of mass is at world position `com`
    pub fn mass_derivative(com: &Vector3<Float>) -> Self {
        SpatialInertia {
            moment: point_mass_moment(com),
            cross_part: *com,
            mass: 1.,
        }
    }

    /// dI/dθ when the world center of mass moves with du/dθ = u
    pub fn com_derivative(mass: Float, com: &Vector3<Float>, u: &Vector3<Float>) -> Self {
        SpatialInertia {
            moment: mass
                * (2. * com.dot(u) * Matrix3::identity()
                    - u * com.transpose()
                    - com * u.transpose()),
            cross_part: mass * u,
            mass: 0.,
        }
    }
}

impl<'a, 'b> Add<&'b SpatialInertia> for &'a SpatialInertia {
    type Output = SpatialInertia;

    fn add(self, rhs: &SpatialInertia) -> SpatialInertia {
        SpatialInertia {
            moment: self.moment + rhs.moment,
            cross_part: self.cross_part + rhs.cross_part,
            mass: self.mass + rhs.mass,
        }
    }
}

impl<'a, 'b> AddAssign<&'b SpatialInertia> for SpatialInertia {
    fn add_assign(&mut self, rhs: &Self) {
        self.moment += rhs.moment;
        self.cross_part += rhs.cross_part;
        self.mass += rhs.mass;
    }
}

/// Inertia tensor from its 6-vector (Ixx, Iyy, Izz, Ixy, Ixz, Iyz)
pub fn moment_from_vector(v: &Vector6<Float>) -> Matrix3<Float> {
    #[rustfmt::skip]
    let m = Matrix3::new(
        v[0], v[3], v[4],
        v[3], v[1], v[5],
        v[4], v[5], v[2],
    );
    m
}

pub fn moment_to_vector(m: &Matrix3<Float>) -> Vector6<Float> {
    Vector6::new(
        m[(0, 0)],
        m[(1, 1)],
        m[(2, 2)],
        m[(0, 1)],
        m[(0, 2)],
        m[(1, 2)],
    )
}

/// d(inertia tensor)/d(i-th element of the 6-vector)
pub fn moment_basis(i: usize) -> Matrix3<Float> {
    let mut e = Vector6::zeros();
    e[i] = 1.;
    moment_from_vector(&e)
}

/// Computes the kinetic energy of a body
/// Essentially implements KE = 1/2 * v^T * M * v
pub fn kinetic_energy(inertia: &SpatialInertia, twist: &SpatialVector) -> Float {
    let w = twist.angular;
    let v = twist.linear;
    let J = inertia.moment;
    let c = inertia.cross_part;
    let m = inertia.mass;

    (w.dot(&(J * w)) + v.dot(&(m * v + 2.0 * w.cross(&c)))) / 2.0
}

#[cfg(test)]
mod inertia_tests {
    use na::{vector, Translation3, UnitQuaternion};

    use super::*;
    use crate::{assert_close, assert_vec_close, util::test_utils::random_vector};

    #[test]
    fn transform_matches_world_com_construction() {
        // Arrange
        let mass = 3.0;
        let com = vector![0.1, -0.2, 0.3];
        let I_c = moment_from_vector(&vector![0.2, 0.3, 0.4, 0.01, -0.02, 0.03]);
        let iso = Isometry3::from_parts(
            Translation3::new(0.5, 1.0, -1.5),
            UnitQuaternion::from_euler_angles(0.4, 0.1, -0.7),
        );

        // Act
        let world = SpatialInertia::from_com(mass, &com, &I_c).transform(&iso);

        // Assert
        let R = iso.rotation.to_rotation_matrix().into_inner();
        let expected =
            SpatialInertia::from_com(mass, &(iso * na::Point3::from(com)).coords, &(R * I_c * R.transpose()));
        assert_vec_close!(world.moment, expected.moment, 1e-12);
        assert_vec_close!(world.cross_part, expected.cross_part, 1e-12);
        assert_close!(world.mass, expected.mass, 1e-12);
    }

    #[test]
    fn com_derivative_matches_finite_difference() {
        let mut rng = rand::rng();
        let mass = 2.5;
        let com = random_vector(&mut rng, 1.0);
        let u = random_vector(&mut rng, 1.0);
        let eps = 1e-6;

        let plus = SpatialInertia::from_com(mass, &(com + u * eps), &Matrix3::zeros());
        let minus = SpatialInertia::from_com(mass, &(com - u * eps), &Matrix3::zeros());
        let fd = (plus.moment - minus.moment) / (2. * eps);

        let analytic = SpatialInertia::com_derivative(mass, &com, &u);
        assert_vec_close!(analytic.moment, fd, 1e-6);
        assert_vec_close!(analytic.cross_part, mass * u, 1e-12);
    }

    #[test]
    fn moment_vector_layout() {
        let v = vector![1., 2., 3., 4., 5., 6.];
        let m = moment_from_vector(&v);
        assert_close!(m[(1, 2)], 6., 0.);
        assert_close!(m[(2, 0)], 5., 0.);
        assert_vec_close!(moment_to_vector(&m), v, 0.);
    }
}
