use na::{Matrix3, Vector3};

use crate::types::Float;

/// Mulitiply a spatial inertia with a spatial motion vector
/// | J         c_hat | | w |   | Jw        + c_hat v |
/// | c_hat^T   m     | | v | = | c_hat^T w + mv      |
pub fn mul_inertia(
    J: &Matrix3<Float>,
    c: &Vector3<Float>,
    m: Float,
    w: &Vector3<Float>,
    v: &Vector3<Float>,
) -> (Vector3<Float>, Vector3<Float>) {
    let angular = J * w + c.cross(v);
    let linear = m * v - c.cross(w);
    (angular, linear)
}

/// Also known as spatial motion cross product
/// Reference: Chapter 2.9 Spatial Cross Products in "Robot Dynamics Algorithms" by Roy Featherstone
pub fn se3_commutator(
    xw: &Vector3<Float>,
    xv: &Vector3<Float>,
    yw: &Vector3<Float>,
    yv: &Vector3<Float>,
) -> (Vector3<Float>, Vector3<Float>) {
    let anguar = xw.cross(yw);
    let linear = xw.cross(yv) + xv.cross(yw);
    (anguar, linear)
}

/// Spatial force cross product, i.e. the dual of se3_commutator.
///     x ×* f = (xw × fn + xv × ff, xw × ff)
pub fn se3_dual_commutator(
    xw: &Vector3<Float>,
    xv: &Vector3<Float>,
    fw: &Vector3<Float>,
    fv: &Vector3<Float>,
) -> (Vector3<Float>, Vector3<Float>) {
    let angular = xw.cross(fw) + xv.cross(fv);
    let linear = xw.cross(fv);
    (angular, linear)
}

/// [c]ₓᵀ[c]ₓ = (cᵀc) I - c cᵀ, the moment of a unit point mass at c.
pub fn point_mass_moment(c: &Vector3<Float>) -> Matrix3<Float> {
    Matrix3::identity() * c.dot(c) - c * c.transpose()
}

/// Elementwise-scaled vector, s ⊙ v
pub fn scaled(s: &Vector3<Float>, v: &Vector3<Float>) -> Vector3<Float> {
    s.component_mul(v)
}

#[macro_export]
macro_rules! assert_close {
    ($left:expr, $right:expr, $tolerance:expr) => {
        let left = $left;
        let right = $right;
        let tol = $tolerance;
        let diff = (left - right).abs();
        if diff > tol {
            panic!(
                "assertion failed: {} ~= {} \
                (tolerance: {}, difference: {})",
                left, right, tol, diff
            );
        }
    };
}

#[macro_export]
macro_rules! assert_vec_close {
    ($left:expr, $right:expr, $tolerance:expr) => {
        let left = $left;
        let right = $right;
        let tol = $tolerance;
        assert_eq!(left.len(), right.len(), "length mismatch");
        for (a, b) in left.iter().zip(right.iter()) {
            $crate::assert_close!(a, b, tol);
        }
    };
}

#[cfg(test)]
pub mod test_utils {
    use na::{vector, DVector, Vector3};
    use rand::{rngs::ThreadRng, Rng};

    use crate::types::Float;

    /// Build a Vector3 where each element is random between (-range, range)
    pub fn random_vector(rng: &mut ThreadRng, range: Float) -> Vector3<Float> {
        vector![
            rng.random_range(-range..range),
            rng.random_range(-range..range),
            rng.random_range(-range..range)
        ]
    }

    /// Build a DVector of length n where each element is random between
    /// (-range, range)
    pub fn random_dvector(rng: &mut ThreadRng, n: usize, range: Float) -> DVector<Float> {
        DVector::from_fn(n, |_, _| rng.random_range(-range..range))
    }

    /// Install a logger once for the test binary.
    pub fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}
