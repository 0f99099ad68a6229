use na::{vector, Isometry3, Translation3, UnitQuaternion, Vector3};

use crate::{
    joint::JointType,
    skeleton::{BodyProperties, Skeleton},
    types::Float,
};

fn offset(x: Float, y: Float, z: Float) -> Isometry3<Float> {
    Isometry3::from_parts(Translation3::new(x, y, z), UnitQuaternion::identity())
}

/// Build a single free-floating box whose center of mass sits slightly off
/// its body origin
pub fn build_floating_box(mass: Float) -> Skeleton {
    let mut skeleton = Skeleton::new();
    skeleton.add_body(
        "box",
        None,
        JointType::Free,
        Isometry3::identity(),
        BodyProperties::cuboid(mass, vector![0.02, 0.05, -0.01], 0.3, 0.2, 0.4),
    );
    skeleton
}

/// Build a free-floating torso with one hinged arm, both bodies in a single
/// scale group
pub fn build_floating_pendulum(mass: Float) -> Skeleton {
    let mut skeleton = Skeleton::new();
    let torso = skeleton.add_body(
        "torso",
        None,
        JointType::Free,
        Isometry3::identity(),
        BodyProperties::cuboid(mass, vector![0., 0.1, 0.], 0.3, 0.5, 0.2),
    );
    let arm = skeleton.add_body(
        "arm",
        Some(torso),
        JointType::Revolute(Vector3::z()),
        offset(0.2, 0.3, 0.),
        BodyProperties::cuboid(mass, vector![0., -0.15, 0.], 0.08, 0.3, 0.08),
    );
    skeleton.merge_scale_groups(torso, arm);
    skeleton
}

/// Build a planar-hipped walker: a free pelvis, two legs of thigh (ball
/// hip), shank (knee hinge) and foot (ankle hinge). Every body is its own
/// scale group.
pub fn build_walker() -> Skeleton {
    let mut skeleton = Skeleton::new();
    let pelvis = skeleton.add_body(
        "pelvis",
        None,
        JointType::Free,
        Isometry3::identity(),
        BodyProperties::cuboid(10., vector![0., 0.05, 0.], 0.3, 0.2, 0.2),
    );

    for (side, z) in [("left", -0.1), ("right", 0.1)] {
        let thigh = skeleton.add_body(
            &format!("{}_thigh", side),
            Some(pelvis),
            JointType::Ball,
            offset(0., -0.1, z),
            BodyProperties::cuboid(7., vector![0., -0.2, 0.], 0.1, 0.4, 0.1),
        );
        let shank = skeleton.add_body(
            &format!("{}_shank", side),
            Some(thigh),
            JointType::Revolute(Vector3::z()),
            offset(0., -0.4, 0.),
            BodyProperties::cuboid(3.5, vector![0., -0.2, 0.], 0.08, 0.4, 0.08),
        );
        skeleton.add_body(
            &format!("{}_foot", side),
            Some(shank),
            JointType::Revolute(Vector3::z()),
            offset(0., -0.4, 0.),
            BodyProperties::cuboid(1., vector![0.05, -0.03, 0.], 0.2, 0.06, 0.1),
        );
    }

    skeleton
}
