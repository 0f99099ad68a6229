use na::{Vector3, Vector6};

use crate::{spatial::spatial_vector::SpatialVector, types::Float};

/// A wrench represents a system of forces.
/// The wrench w expressed in world frame is defined as
///     w = (τ f) = ∑ over j (r_j \cross f_j + τ_j   f_j)
/// where the f_j are forces exerted at world positions r_j, and τ_j are pure
/// moments. τ is the total torque about the world origin and f is the total
/// force.
pub type Wrench = SpatialVector;

/// Return the wrench of a force applied at point
pub fn from_force(point: &Vector3<Float>, force: &Vector3<Float>) -> Wrench {
    Wrench {
        angular: point.cross(force),
        linear: *force,
    }
}

/// Wrench about the world origin of a force plate reading: a force and a
/// free moment measured at the center of pressure.
pub fn from_plate_reading(
    center_of_pressure: &Vector3<Float>,
    force: &Vector3<Float>,
    moment: &Vector3<Float>,
) -> Wrench {
    let mut w = from_force(center_of_pressure, force);
    w.angular += moment;
    w
}

/// Read the `index`-th wrench out of a concatenated (angular, linear) vector.
pub fn nth(concatenated: &na::DVector<Float>, index: usize) -> Wrench {
    let v: Vector6<Float> = concatenated.fixed_rows::<6>(index * 6).into_owned();
    Wrench::from_vector6(&v)
}
