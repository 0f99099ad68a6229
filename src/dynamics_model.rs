use std::collections::BTreeMap;

use na::{DMatrix, DVector, Isometry3, Vector3, Vector6};

use crate::types::Float;

/// A marker rigidly attached to a body. The offset is in unscaled body
/// coordinates; its effective position in the body frame is scale ⊙ offset.
#[derive(Clone, Debug, PartialEq)]
pub struct Marker {
    pub body: usize,
    pub offset: Vector3<Float>,
}

impl Marker {
    pub fn new(body: usize, offset: Vector3<Float>) -> Self {
        Marker { body, offset }
    }
}

pub type MarkerMap = BTreeMap<String, Marker>;

/// Quantities the dynamics can be differentiated with respect to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WithRespectTo {
    Position,
    Velocity,
    Acceleration,
    GroupMasses,
    GroupComs,
    GroupInertias,
    GroupScales,
}

impl WithRespectTo {
    pub const ALL: [WithRespectTo; 7] = [
        WithRespectTo::Position,
        WithRespectTo::Velocity,
        WithRespectTo::Acceleration,
        WithRespectTo::GroupMasses,
        WithRespectTo::GroupComs,
        WithRespectTo::GroupInertias,
        WithRespectTo::GroupScales,
    ];

    pub fn dim<M: DynamicsModel>(&self, model: &M) -> usize {
        match self {
            WithRespectTo::Position | WithRespectTo::Velocity | WithRespectTo::Acceleration => {
                model.num_dofs()
            }
            WithRespectTo::GroupMasses => model.num_scale_groups(),
            WithRespectTo::GroupComs | WithRespectTo::GroupScales => 3 * model.num_scale_groups(),
            WithRespectTo::GroupInertias => 6 * model.num_scale_groups(),
        }
    }

    pub fn is_state(&self) -> bool {
        matches!(
            self,
            WithRespectTo::Position | WithRespectTo::Velocity | WithRespectTo::Acceleration
        )
    }

    /// Current value of a parameter group, None for state quantities.
    pub fn parameters<M: DynamicsModel>(&self, model: &M) -> Option<DVector<Float>> {
        match self {
            WithRespectTo::GroupMasses => Some(model.group_masses()),
            WithRespectTo::GroupComs => Some(model.group_coms()),
            WithRespectTo::GroupInertias => Some(model.group_inertias()),
            WithRespectTo::GroupScales => Some(model.group_scales()),
            _ => None,
        }
    }

    pub fn set_parameters<M: DynamicsModel>(&self, model: &mut M, value: &DVector<Float>) {
        match self {
            WithRespectTo::GroupMasses => model.set_group_masses(value),
            WithRespectTo::GroupComs => model.set_group_coms(value),
            WithRespectTo::GroupInertias => model.set_group_inertias(value),
            WithRespectTo::GroupScales => model.set_group_scales(value),
            _ => panic!("{:?} is not a parameter group", self),
        }
    }
}

/// Rigid-body dynamics oracle. Joint state is always passed in, so every
/// query is a pure function of (parameters, state); parameters are owned by
/// the model and changed through the setters.
///
/// Generalized coordinates are expected to start with a floating base whose
/// first 3 dofs translate and next 3 rotate the root body.
pub trait DynamicsModel: Clone {
    fn num_dofs(&self) -> usize;
    fn num_bodies(&self) -> usize;
    fn num_scale_groups(&self) -> usize;

    fn group_masses(&self) -> DVector<Float>;
    fn set_group_masses(&mut self, masses: &DVector<Float>);
    fn group_masses_bounds(&self) -> (DVector<Float>, DVector<Float>);

    /// Unscaled centers of mass, 3 per group
    fn group_coms(&self) -> DVector<Float>;
    fn set_group_coms(&mut self, coms: &DVector<Float>);
    fn group_coms_bounds(&self) -> (DVector<Float>, DVector<Float>);

    /// Inertias about the center of mass, (Ixx, Iyy, Izz, Ixy, Ixz, Iyz) per
    /// group
    fn group_inertias(&self) -> DVector<Float>;
    fn set_group_inertias(&mut self, inertias: &DVector<Float>);
    fn group_inertias_bounds(&self) -> (DVector<Float>, DVector<Float>);

    fn group_scales(&self) -> DVector<Float>;
    fn set_group_scales(&mut self, scales: &DVector<Float>);
    fn group_scales_bounds(&self) -> (DVector<Float>, DVector<Float>);

    fn position_limits(&self) -> (DVector<Float>, DVector<Float>);
    fn velocity_limits(&self) -> (DVector<Float>, DVector<Float>);
    fn acceleration_limits(&self) -> (DVector<Float>, DVector<Float>);

    /// Mass of every body, following its scale group
    fn body_masses(&self) -> DVector<Float>;
    fn body_scale_group(&self, body: usize) -> usize;
    fn body_children(&self, body: usize) -> Vec<usize>;
    fn body_world_transforms(&self, q: &DVector<Float>) -> Vec<Isometry3<Float>>;
    fn body_com_world_positions(&self, q: &DVector<Float>) -> Vec<Vector3<Float>>;

    fn mass_matrix(&self, q: &DVector<Float>) -> DMatrix<Float>;
    fn coriolis_and_gravity_forces(&self, q: &DVector<Float>, dq: &DVector<Float>)
        -> DVector<Float>;

    /// d(M(q) ddq)/d(wrt), None if no closed form is available
    fn jacobian_of_m(
        &self,
        q: &DVector<Float>,
        ddq: &DVector<Float>,
        wrt: WithRespectTo,
    ) -> Option<DMatrix<Float>>;

    /// d(C(q, dq))/d(wrt), None if no closed form is available
    fn jacobian_of_c(
        &self,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        wrt: WithRespectTo,
    ) -> Option<DMatrix<Float>>;

    /// Generalized forces produced by a world-frame wrench (moment about the
    /// world origin, force) acting on `body`
    fn external_wrench_torques(
        &self,
        q: &DVector<Float>,
        body: usize,
        wrench: &Vector6<Float>,
    ) -> DVector<Float>;

    fn external_wrench_torques_jacobian(
        &self,
        q: &DVector<Float>,
        body: usize,
        wrench: &Vector6<Float>,
        wrt: WithRespectTo,
    ) -> Option<DMatrix<Float>>;

    fn marker_world_positions(&self, q: &DVector<Float>, markers: &[Marker]) -> DVector<Float>;
    fn marker_jacobian_wrt_positions(&self, q: &DVector<Float>, markers: &[Marker])
        -> DMatrix<Float>;
    /// Block diagonal, 3 rows and 3 columns per marker
    fn marker_jacobian_wrt_offsets(&self, q: &DVector<Float>, markers: &[Marker])
        -> DMatrix<Float>;
    fn marker_jacobian_wrt_scales(&self, q: &DVector<Float>, markers: &[Marker])
        -> DMatrix<Float>;

    /// World positions of the given joints, 3 per joint. A joint is
    /// identified by its child body.
    fn joint_world_positions(&self, q: &DVector<Float>, joints: &[usize]) -> DVector<Float>;
    fn joint_jacobian_wrt_positions(&self, q: &DVector<Float>, joints: &[usize])
        -> DMatrix<Float>;
    fn joint_jacobian_wrt_scales(&self, q: &DVector<Float>, joints: &[usize]) -> DMatrix<Float>;

    /// Full inverse dynamics, M(q) ddq + C(q, dq)
    fn inverse_dynamics(
        &self,
        q: &DVector<Float>,
        dq: &DVector<Float>,
        ddq: &DVector<Float>,
    ) -> DVector<Float> {
        self.mass_matrix(q) * ddq + self.coriolis_and_gravity_forces(q, dq)
    }
}
