use na::{vector, DVector, Isometry3, Translation3, Vector3, Vector6};

use crate::{
    joint::{DofAxis, Joint, JointType},
    types::Float,
    GRAVITY,
};

pub mod derivatives;
pub mod dynamics;
pub mod kinematics;
mod model;

/// Inertial properties a body is created with.
#[derive(Clone, Debug, PartialEq)]
pub struct BodyProperties {
    pub mass: Float,
    /// Center of mass in unscaled body coordinates
    pub com: Vector3<Float>,
    /// Inertia about the center of mass, (Ixx, Iyy, Izz, Ixy, Ixz, Iyz)
    pub inertia: Vector6<Float>,
}

impl BodyProperties {
    pub fn new(mass: Float, com: Vector3<Float>, inertia: Vector6<Float>) -> Self {
        BodyProperties { mass, com, inertia }
    }

    /// Uniform solid box with side lengths (x, y, z), centered at `com`
    pub fn cuboid(mass: Float, com: Vector3<Float>, x: Float, y: Float, z: Float) -> Self {
        let k = mass / 12.;
        BodyProperties {
            mass,
            com,
            inertia: Vector6::new(k * (y * y + z * z), k * (x * x + z * z), k * (x * x + y * y), 0., 0., 0.),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Body {
    pub name: String,
    pub parent_joint: usize,
    pub scale_group: usize,
}

/// A set of bodies that share one mass, center of mass, inertia and scale.
#[derive(Clone, Debug)]
pub struct ScaleGroup {
    pub bodies: Vec<usize>,
    pub mass: Float,
    pub com: Vector3<Float>,
    pub inertia: Vector6<Float>,
    pub scale: Vector3<Float>,
}

#[derive(Clone, Debug)]
pub struct Dof {
    pub name: String,
    pub joint: usize,
    pub axis: DofAxis,
    pub parent: Option<usize>,
    /// Ancestor dofs, including self, in increasing order
    pub ancestors: Vec<usize>,
    /// Body whose frame is the frame after this dof
    pub body: Option<usize>,
    pub position_limits: (Float, Float),
    pub velocity_limits: (Float, Float),
    pub acceleration_limits: (Float, Float),
}

/// Box bounds applied to every scale group parameter
#[derive(Clone, Debug)]
pub struct ParameterBounds {
    pub mass: (Float, Float),
    pub com: (Float, Float),
    pub inertia_moments: (Float, Float),
    pub inertia_products: (Float, Float),
    pub scale: (Float, Float),
}

impl Default for ParameterBounds {
    fn default() -> Self {
        ParameterBounds {
            mass: (0.01, 1000.),
            com: (-2., 2.),
            inertia_moments: (0., 100.),
            inertia_products: (-100., 100.),
            scale: (0.5, 2.),
        }
    }
}

/// A tree of rigid bodies connected by joints. Y is up.
#[derive(Clone, Debug)]
pub struct Skeleton {
    pub bodies: Vec<Body>,
    pub joints: Vec<Joint>,
    pub dofs: Vec<Dof>,
    pub groups: Vec<ScaleGroup>,
    pub bounds: ParameterBounds,
    pub gravity: Vector3<Float>,
}

impl Default for Skeleton {
    fn default() -> Self {
        Self::new()
    }
}

impl Skeleton {
    pub fn new() -> Self {
        Skeleton {
            bodies: vec![],
            joints: vec![],
            dofs: vec![],
            groups: vec![],
            bounds: ParameterBounds::default(),
            gravity: vector![0., -GRAVITY, 0.],
        }
    }

    /// Attach a new body to `parent` (or the world) through a joint whose
    /// frame sits at `offset` in the parent body frame. The body starts in a
    /// scale group of its own. Returns the body index.
    pub fn add_body(
        &mut self,
        name: &str,
        parent: Option<usize>,
        joint_type: JointType,
        offset: Isometry3<Float>,
        properties: BodyProperties,
    ) -> usize {
        if let Some(parent) = parent {
            assert!(parent < self.bodies.len(), "parent body {} does not exist", parent);
        }

        let body = self.bodies.len();
        let joint = self.joints.len();
        let first_dof = self.dofs.len();
        let axes = joint_type.axes();
        let last_axis = axes.len() - 1;

        for (i, axis) in axes.into_iter().enumerate() {
            let dof_parent = if i == 0 {
                parent.map(|p| self.body_dof(p))
            } else {
                Some(first_dof + i - 1)
            };
            let mut ancestors = dof_parent
                .map(|p| self.dofs[p].ancestors.clone())
                .unwrap_or_default();
            ancestors.push(first_dof + i);

            self.dofs.push(Dof {
                name: format!("{}_{}", name, i),
                joint,
                axis,
                parent: dof_parent,
                ancestors,
                body: if i == last_axis { Some(body) } else { None },
                position_limits: (Float::NEG_INFINITY, Float::INFINITY),
                velocity_limits: (Float::NEG_INFINITY, Float::INFINITY),
                acceleration_limits: (Float::NEG_INFINITY, Float::INFINITY),
            });
        }

        self.joints.push(Joint {
            name: format!("{}_joint", name),
            joint_type,
            parent_body: parent,
            child_body: body,
            offset,
            first_dof,
        });

        self.groups.push(ScaleGroup {
            bodies: vec![body],
            mass: properties.mass,
            com: properties.com,
            inertia: properties.inertia,
            scale: Vector3::repeat(1.),
        });
        self.bodies.push(Body {
            name: name.to_string(),
            parent_joint: joint,
            scale_group: self.groups.len() - 1,
        });

        body
    }

    /// Put the bodies of b's group into a's group. Parameters of the merged
    /// group are averaged over its bodies.
    pub fn merge_scale_groups(&mut self, a: usize, b: usize) {
        let ga = self.bodies[a].scale_group;
        let gb = self.bodies[b].scale_group;
        if ga == gb {
            return;
        }

        let removed = self.groups[gb].clone();
        let na = self.groups[ga].bodies.len() as Float;
        let nb = removed.bodies.len() as Float;
        let blend = |x: Float, y: Float| (x * na + y * nb) / (na + nb);
        {
            let group = &mut self.groups[ga];
            group.mass = blend(group.mass, removed.mass);
            group.com = group.com.zip_map(&removed.com, blend);
            group.inertia = group.inertia.zip_map(&removed.inertia, blend);
            group.scale = group.scale.zip_map(&removed.scale, blend);
            group.bodies.extend(removed.bodies.iter().copied());
            group.bodies.sort_unstable();
        }

        self.groups.remove(gb);
        for (index, group) in self.groups.iter().enumerate() {
            for &body in group.bodies.iter() {
                self.bodies[body].scale_group = index;
            }
        }
    }

    pub fn body_index(&self, name: &str) -> Option<usize> {
        self.bodies.iter().position(|b| b.name == name)
    }

    /// The dof whose frame is the body frame
    pub fn body_dof(&self, body: usize) -> usize {
        let joint = &self.joints[self.bodies[body].parent_joint];
        joint.first_dof + joint.joint_type.num_dofs() - 1
    }

    pub fn parent_body(&self, body: usize) -> Option<usize> {
        self.joints[self.bodies[body].parent_joint].parent_body
    }

    pub fn children(&self, body: usize) -> Vec<usize> {
        self.joints
            .iter()
            .filter(|j| j.parent_body == Some(body))
            .map(|j| j.child_body)
            .collect()
    }

    pub fn is_ancestor_or_self(&self, ancestor: usize, dof: usize) -> bool {
        self.dofs[dof].ancestors.binary_search(&ancestor).is_ok()
    }

    pub fn is_strict_ancestor(&self, ancestor: usize, dof: usize) -> bool {
        ancestor != dof && self.is_ancestor_or_self(ancestor, dof)
    }

    pub fn set_position_limits(&mut self, dof: usize, lower: Float, upper: Float) {
        self.dofs[dof].position_limits = (lower, upper);
    }

    pub fn set_velocity_limits(&mut self, dof: usize, lower: Float, upper: Float) {
        self.dofs[dof].velocity_limits = (lower, upper);
    }

    pub fn set_acceleration_limits(&mut self, dof: usize, lower: Float, upper: Float) {
        self.dofs[dof].acceleration_limits = (lower, upper);
    }

    /// Joint frame of the joint's first dof in its parent body frame, with
    /// the translation stretched by the parent scale
    pub(crate) fn scaled_joint_offset(&self, joint: &Joint) -> Isometry3<Float> {
        match joint.parent_body {
            None => joint.offset,
            Some(parent) => {
                let scale = self.groups[self.bodies[parent].scale_group].scale;
                let t = joint.offset.translation.vector.component_mul(&scale);
                Isometry3::from_parts(Translation3::from(t), joint.offset.rotation)
            }
        }
    }

    pub(crate) fn body_group(&self, body: usize) -> &ScaleGroup {
        &self.groups[self.bodies[body].scale_group]
    }

    /// Center of mass in the body frame, scale applied
    pub(crate) fn body_local_com(&self, body: usize) -> Vector3<Float> {
        let group = self.body_group(body);
        group.scale.component_mul(&group.com)
    }

    fn limits(&self, f: impl Fn(&Dof) -> (Float, Float)) -> (DVector<Float>, DVector<Float>) {
        let n = self.dofs.len();
        (
            DVector::from_fn(n, |i, _| f(&self.dofs[i]).0),
            DVector::from_fn(n, |i, _| f(&self.dofs[i]).1),
        )
    }
}

#[cfg(test)]
mod skeleton_tests {
    use crate::helpers::build_walker;

    #[test]
    fn dof_ancestry_follows_the_tree() {
        // Arrange
        let skeleton = build_walker();

        // Act
        let pelvis_dof = skeleton.body_dof(0);
        let left_foot = skeleton.body_index("left_foot").unwrap();
        let right_thigh = skeleton.body_index("right_thigh").unwrap();

        // Assert
        assert_eq!(pelvis_dof, 5);
        assert!(skeleton.is_ancestor_or_self(pelvis_dof, skeleton.body_dof(left_foot)));
        assert!(!skeleton.is_ancestor_or_self(
            skeleton.body_dof(right_thigh),
            skeleton.body_dof(left_foot)
        ));
        assert_eq!(skeleton.children(0).len(), 2);
    }

    #[test]
    fn merging_groups_averages_and_reindexes() {
        let mut skeleton = build_walker();
        let groups_before = skeleton.groups.len();
        let left = skeleton.body_index("left_thigh").unwrap();
        let right = skeleton.body_index("right_thigh").unwrap();
        let expected_mass = (skeleton.body_group(left).mass + skeleton.body_group(right).mass) / 2.;

        skeleton.merge_scale_groups(left, right);

        assert_eq!(skeleton.groups.len(), groups_before - 1);
        assert_eq!(skeleton.bodies[left].scale_group, skeleton.bodies[right].scale_group);
        crate::assert_close!(skeleton.body_group(right).mass, expected_mass, 1e-12);
        for (index, group) in skeleton.groups.iter().enumerate() {
            for &body in group.bodies.iter() {
                assert_eq!(skeleton.bodies[body].scale_group, index);
            }
        }
    }
}
