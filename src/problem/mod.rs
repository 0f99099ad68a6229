#[cfg(test)]
pub mod fixtures;
pub mod layout;
pub mod triplets;

use log::{debug, info, warn};
use na::{DMatrix, DVector, Vector3};

use crate::{
    dynamics_model::{DynamicsModel, Marker, WithRespectTo},
    error::{FitError, FitResult},
    finite_difference::{finite_difference_jacobian, try_finite_difference_gradient},
    fitter::initialization::DynamicsInitialization,
    residual::ResidualForceHelper,
    types::Float,
};

use self::{
    layout::{Block, BlockKind, DecisionLayout, LayoutDims},
    triplets::SparseTriplets,
};

/// Marker offsets may not move further than this from the body origin
pub const MARKER_OFFSET_BOUND: Float = 5.0;

/// Which parameter groups are decision variables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InclusionFlags {
    pub masses: bool,
    pub coms: bool,
    pub inertias: bool,
    pub body_scales: bool,
    pub poses: bool,
    pub marker_offsets: bool,
}

impl Default for InclusionFlags {
    fn default() -> Self {
        InclusionFlags {
            masses: true,
            coms: true,
            inertias: true,
            body_scales: true,
            poses: true,
            marker_offsets: true,
        }
    }
}

impl InclusionFlags {
    pub fn none() -> Self {
        InclusionFlags {
            masses: false,
            coms: false,
            inertias: false,
            body_scales: false,
            poses: false,
            marker_offsets: false,
        }
    }
}

/// Loss weights and regularization strengths.
#[derive(Clone, Debug, PartialEq)]
pub struct FitWeights {
    pub residual: Float,
    pub marker: Float,
    pub joint: Float,
    pub residual_use_l1: bool,
    pub marker_use_l1: bool,
    pub regularize_masses: Float,
    pub regularize_coms: Float,
    pub regularize_inertias: Float,
    pub regularize_body_scales: Float,
    pub regularize_poses: Float,
    pub regularize_tracking_marker_offsets: Float,
    pub regularize_anatomical_marker_offsets: Float,
}

impl Default for FitWeights {
    fn default() -> Self {
        FitWeights {
            residual: 0.1,
            marker: 1.0,
            joint: 1.0,
            residual_use_l1: false,
            marker_use_l1: false,
            regularize_masses: 1.0,
            regularize_coms: 1.0,
            regularize_inertias: 1.0,
            regularize_body_scales: 0.2,
            regularize_poses: 0.0,
            regularize_tracking_marker_offsets: 0.05,
            regularize_anatomical_marker_offsets: 10.0,
        }
    }
}

/// Breakdown of the loss, one entry per term.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LossTerms {
    pub masses: Float,
    pub coms: Float,
    pub inertias: Float,
    pub scales: Float,
    pub marker_offsets: Float,
    pub residual: Float,
    pub markers: Float,
    pub joints: Float,
    pub axes: Float,
    pub poses: Float,
}

impl LossTerms {
    pub fn total(&self) -> Float {
        self.masses
            + self.coms
            + self.inertias
            + self.scales
            + self.marker_offsets
            + self.residual
            + self.markers
            + self.joints
            + self.axes
            + self.poses
    }

    fn check(&self) -> FitResult<()> {
        let named = [
            ("mass regularization", self.masses),
            ("COM regularization", self.coms),
            ("inertia regularization", self.inertias),
            ("scale regularization", self.scales),
            ("marker offset regularization", self.marker_offsets),
            ("residual", self.residual),
            ("marker error", self.markers),
            ("joint center error", self.joints),
            ("joint axis error", self.axes),
            ("pose regularization", self.poses),
        ];
        for (term, value) in named {
            if value.is_nan() {
                return Err(FitError::nan_in(term));
            }
        }
        Ok(())
    }
}

/// The dynamics fitting problem: a differentiable loss over the skeleton
/// parameters, marker offsets and pose/velocity/acceleration trajectories,
/// with linear finite-difference consistency constraints between the
/// trajectories.
///
/// The problem owns its model (configured from the initialization object)
/// and borrows the initialization, which receives the result through
/// `write_back`.
pub struct DynamicsFitProblem<'a, M: DynamicsModel> {
    init: &'a mut DynamicsInitialization,
    model: M,
    flags: InclusionFlags,
    weights: FitWeights,
    layout: DecisionLayout,

    marker_names: Vec<String>,
    markers: Vec<Marker>,
    marker_is_tracking: Vec<bool>,
    residual_helper: ResidualForceHelper,

    poses: Vec<DMatrix<Float>>,
    velocities: Vec<DMatrix<Float>>,
    accelerations: Vec<DMatrix<Float>>,
    reference_poses: Vec<DMatrix<Float>>,

    num_observed_markers: usize,
    num_timesteps: usize,
    num_acceleration_timesteps: usize,

    last_x: Option<DVector<Float>>,
}

impl<'a, M: DynamicsModel> DynamicsFitProblem<'a, M> {
    /// Build a problem over every parameter group with default weights.
    /// Velocities and accelerations start as finite differences of the
    /// poses.
    pub fn new(init: &'a mut DynamicsInitialization, template: &M) -> FitResult<Self> {
        init.validate(template)?;
        let model = init.configured(template);

        let marker_names: Vec<String> = init.marker_map.keys().cloned().collect();
        let markers: Vec<Marker> = init.marker_map.values().cloned().collect();
        let marker_is_tracking = marker_names
            .iter()
            .map(|name| init.is_tracking_marker(name))
            .collect();

        let mut poses = vec![];
        let mut velocities = vec![];
        let mut accelerations = vec![];
        let mut reference_poses = vec![];
        for (trial, q) in init.pose_trials.iter().enumerate() {
            let dt = init.trial_timesteps[trial];
            let (n, T) = q.shape();
            let dq = DMatrix::from_fn(n, T - 1, |i, t| (q[(i, t + 1)] - q[(i, t)]) / dt);
            let ddq = DMatrix::from_fn(n, T - 2, |i, t| (dq[(i, t + 1)] - dq[(i, t)]) / dt);
            poses.push(q.clone());
            velocities.push(dq);
            accelerations.push(ddq);

            let reference = match init.original_pose_trials.get(trial) {
                Some(original) if original.shape() == q.shape() => original.clone(),
                _ => q.clone(),
            };
            reference_poses.push(reference);
        }

        let num_observed_markers = init
            .marker_observation_trials
            .iter()
            .flatten()
            .map(|frame| marker_names.iter().filter(|n| frame.contains_key(*n)).count())
            .sum();
        let num_timesteps = poses.iter().map(|q| q.ncols()).sum();
        let num_acceleration_timesteps = accelerations.iter().map(|a| a.ncols()).sum();

        let flags = InclusionFlags::default();
        let layout = DecisionLayout::new(
            &flags,
            &LayoutDims {
                num_groups: model.num_scale_groups(),
                num_markers: markers.len(),
                num_dofs: model.num_dofs(),
                trial_lengths: poses.iter().map(|q| q.ncols()).collect(),
            },
        );

        Ok(DynamicsFitProblem {
            residual_helper: ResidualForceHelper::new(init.grf_bodies.clone()),
            init,
            model,
            flags,
            weights: FitWeights::default(),
            layout,
            marker_names,
            markers,
            marker_is_tracking,
            poses,
            velocities,
            accelerations,
            reference_poses,
            num_observed_markers,
            num_timesteps,
            num_acceleration_timesteps,
            last_x: None,
        })
    }

    pub fn with_flags(mut self, flags: InclusionFlags) -> Self {
        self.flags = flags;
        self.layout = DecisionLayout::new(
            &flags,
            &LayoutDims {
                num_groups: self.model.num_scale_groups(),
                num_markers: self.markers.len(),
                num_dofs: self.model.num_dofs(),
                trial_lengths: self.poses.iter().map(|q| q.ncols()).collect(),
            },
        );
        self.last_x = None;
        self
    }

    pub fn with_weights(mut self, weights: FitWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn flags(&self) -> &InclusionFlags {
        &self.flags
    }

    pub fn weights(&self) -> &FitWeights {
        &self.weights
    }

    pub fn layout(&self) -> &DecisionLayout {
        &self.layout
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn init(&self) -> &DynamicsInitialization {
        &*self.init
    }

    pub fn problem_size(&self) -> usize {
        self.layout.len()
    }

    /// Current values of one block
    fn read_block(&self, block: &Block) -> DVector<Float> {
        match block.kind {
            BlockKind::GroupMasses => self.model.group_masses(),
            BlockKind::GroupComs => self.model.group_coms(),
            BlockKind::GroupInertias => self.model.group_inertias(),
            BlockKind::GroupScales => self.model.group_scales(),
            BlockKind::MarkerOffset { marker } => {
                DVector::from_column_slice(self.markers[marker].offset.as_slice())
            }
            BlockKind::Pose { trial, t } => self.poses[trial].column(t).into_owned(),
            BlockKind::Velocity { trial, t } => self.velocities[trial].column(t).into_owned(),
            BlockKind::Acceleration { trial, t } => {
                self.accelerations[trial].column(t).into_owned()
            }
        }
    }

    fn write_block(&mut self, block: &Block, values: &DVector<Float>) {
        match block.kind {
            BlockKind::GroupMasses => self.model.set_group_masses(values),
            BlockKind::GroupComs => self.model.set_group_coms(values),
            BlockKind::GroupInertias => self.model.set_group_inertias(values),
            BlockKind::GroupScales => self.model.set_group_scales(values),
            BlockKind::MarkerOffset { marker } => {
                self.markers[marker].offset = Vector3::new(values[0], values[1], values[2])
            }
            BlockKind::Pose { trial, t } => self.poses[trial].set_column(t, values),
            BlockKind::Velocity { trial, t } => self.velocities[trial].set_column(t, values),
            BlockKind::Acceleration { trial, t } => {
                self.accelerations[trial].set_column(t, values)
            }
        }
    }

    /// (lower, upper) bounds of one block
    fn block_bounds(&self, block: &Block) -> (DVector<Float>, DVector<Float>) {
        match block.kind {
            BlockKind::GroupMasses => self.model.group_masses_bounds(),
            BlockKind::GroupComs => self.model.group_coms_bounds(),
            BlockKind::GroupInertias => self.model.group_inertias_bounds(),
            BlockKind::GroupScales => self.model.group_scales_bounds(),
            BlockKind::MarkerOffset { .. } => (
                DVector::from_element(3, -MARKER_OFFSET_BOUND),
                DVector::from_element(3, MARKER_OFFSET_BOUND),
            ),
            BlockKind::Pose { .. } => self.model.position_limits(),
            BlockKind::Velocity { .. } => self.model.velocity_limits(),
            BlockKind::Acceleration { .. } => self.model.acceleration_limits(),
        }
    }

    /// Write the problem state into a decision vector
    pub fn flatten(&self) -> DVector<Float> {
        let mut x = DVector::zeros(self.problem_size());
        for block in self.layout.blocks() {
            x.rows_mut(block.offset, block.len)
                .copy_from(&self.read_block(block));
        }
        x
    }

    pub fn flatten_upper_bound(&self) -> DVector<Float> {
        let mut x = DVector::zeros(self.problem_size());
        for block in self.layout.blocks() {
            x.rows_mut(block.offset, block.len)
                .copy_from(&self.block_bounds(block).1);
        }
        x
    }

    pub fn flatten_lower_bound(&self) -> DVector<Float> {
        let mut x = DVector::zeros(self.problem_size());
        for block in self.layout.blocks() {
            x.rows_mut(block.offset, block.len)
                .copy_from(&self.block_bounds(block).0);
        }
        x
    }

    /// Read a decision vector into the problem state. Does nothing when `x`
    /// is bit-identical to the last vector read.
    pub fn unflatten(&mut self, x: &DVector<Float>) {
        assert_eq!(x.len(), self.problem_size());
        if let Some(last) = &self.last_x {
            if last.iter().zip(x.iter()).all(|(a, b)| a.to_bits() == b.to_bits()) {
                return;
            }
        }

        let blocks = self.layout.blocks().to_vec();
        for block in blocks.iter() {
            self.write_block(block, &x.rows(block.offset, block.len).into_owned());
        }
        self.last_x = Some(x.clone());
    }

    fn pose(&self, trial: usize, t: usize) -> DVector<Float> {
        self.poses[trial].column(t).into_owned()
    }

    fn residual_active(&self, trial: usize, t: usize) -> bool {
        t < self.accelerations[trial].ncols() && !self.init.probably_missing_grf[trial][t]
    }

    fn residual_norm_gradient(&self, trial: usize, t: usize, wrt: WithRespectTo) -> DVector<Float> {
        let scale = self.weights.residual / self.num_acceleration_timesteps as Float;
        self.residual_helper.calculate_residual_norm_gradient_wrt(
            &self.model,
            &self.pose(trial, t),
            &self.velocities[trial].column(t).into_owned(),
            &self.accelerations[trial].column(t).into_owned(),
            &self.init.grf_trials[trial].column(t).into_owned(),
            wrt,
            self.weights.residual_use_l1,
        ) * scale
    }

    fn num_groups(&self) -> Float {
        self.model.num_scale_groups() as Float
    }

    /// Evaluate every loss term at `x`
    pub fn compute_loss_terms(&mut self, x: &DVector<Float>) -> FitResult<LossTerms> {
        self.init.require_missing_grf_flags()?;
        self.unflatten(x);

        let w = &self.weights;
        let G = self.num_groups();
        let mut terms = LossTerms::default();

        if self.flags.masses {
            terms.masses = w.regularize_masses / G
                * (self.model.group_masses() - &self.init.original_group_masses).norm_squared();
        }
        if self.flags.coms {
            terms.coms = w.regularize_coms / G
                * (self.model.group_coms() - &self.init.original_group_coms).norm_squared();
        }
        if self.flags.inertias {
            terms.inertias = w.regularize_inertias / G
                * (self.model.group_inertias() - &self.init.original_group_inertias)
                    .norm_squared();
        }
        if self.flags.body_scales {
            terms.scales = w.regularize_body_scales / G
                * (self.model.group_scales() - &self.init.original_group_scales).norm_squared();
        }
        if self.flags.marker_offsets {
            for (i, name) in self.marker_names.iter().enumerate() {
                if let Some(original) = self.init.original_marker_offsets.get(name) {
                    terms.marker_offsets += self.marker_offset_weight(i)
                        / self.markers.len() as Float
                        * (self.markers[i].offset - original).norm_squared();
                }
            }
        }

        let residual_scale = w.residual / self.num_acceleration_timesteps as Float;
        let pose_scale = w.regularize_poses / self.num_timesteps as Float;
        let mut marker_sum = 0.;
        for trial in 0..self.poses.len() {
            for t in 0..self.poses[trial].ncols() {
                let q = self.pose(trial, t);

                if self.residual_active(trial, t) {
                    terms.residual += residual_scale
                        * self.residual_helper.calculate_residual_norm(
                            &self.model,
                            &q,
                            &self.velocities[trial].column(t).into_owned(),
                            &self.accelerations[trial].column(t).into_owned(),
                            &self.init.grf_trials[trial].column(t).into_owned(),
                            w.residual_use_l1,
                        );
                }

                let observed = &self.init.marker_observation_trials[trial][t];
                if self.marker_names.iter().any(|n| observed.contains_key(n)) {
                    let simulated = self.model.marker_world_positions(&q, &self.markers);
                    for (i, name) in self.marker_names.iter().enumerate() {
                        if let Some(target) = observed.get(name) {
                            let diff = simulated.fixed_rows::<3>(3 * i) - target;
                            marker_sum += if w.marker_use_l1 {
                                diff.norm()
                            } else {
                                diff.norm_squared()
                            };
                        }
                    }
                }

                if !self.init.joints.is_empty() {
                    let joints = self.model.joint_world_positions(&q, &self.init.joints);
                    let centers = &self.init.joint_centers[trial];
                    let axes = &self.init.joint_axis[trial];
                    for j in 0..self.init.joints.len() {
                        let p = joints.fixed_rows::<3>(3 * j);
                        let center = centers.fixed_view::<3, 1>(3 * j, t);
                        terms.joints += w.joint
                            * self.init.joint_weights[j]
                            * (p - center).norm_squared();

                        let perpendicular = axis_offset(
                            &p.into_owned(),
                            &axes.fixed_view::<3, 1>(6 * j, t).into_owned(),
                            &axes.fixed_view::<3, 1>(6 * j + 3, t).into_owned(),
                        );
                        terms.axes +=
                            w.joint * self.init.axis_weights[j] * perpendicular.norm_squared();
                    }
                }

                if self.flags.poses && pose_scale != 0. {
                    let q0 = self.reference_poses[trial].column(t);
                    terms.poses += pose_scale * (&q - q0).norm_squared();
                }
            }
        }
        if self.num_observed_markers > 0 {
            terms.markers = w.marker * marker_sum / self.num_observed_markers as Float;
        }

        terms.check()?;
        Ok(terms)
    }

    pub fn compute_loss(&mut self, x: &DVector<Float>, log_explanation: bool) -> FitResult<Float> {
        let terms = self.compute_loss_terms(x)?;
        if log_explanation {
            debug!(
                "[massR={:.6e}, comR={:.6e}, inR={:.6e}, scR={:.6e}, mkrR={:.6e}, jnt={:.6e}, axis={:.6e}, qR={:.6e}, res={:.6e}, mkr={:.6e}]",
                terms.masses,
                terms.coms,
                terms.inertias,
                terms.scales,
                terms.marker_offsets,
                terms.joints,
                terms.axes,
                terms.poses,
                terms.residual,
                terms.markers
            );
        }
        Ok(terms.total())
    }

    fn marker_offset_weight(&self, marker: usize) -> Float {
        if self.marker_is_tracking[marker] {
            self.weights.regularize_tracking_marker_offsets
        } else {
            self.weights.regularize_anatomical_marker_offsets
        }
    }

    /// Closed-form gradient of the loss
    pub fn compute_gradient(&mut self, x: &DVector<Float>) -> FitResult<DVector<Float>> {
        self.init.require_missing_grf_flags()?;
        self.unflatten(x);

        let w = self.weights.clone();
        let G = self.num_groups();
        let mut grad = DVector::zeros(self.problem_size());

        let regularizers = [
            (
                BlockKind::GroupMasses,
                w.regularize_masses,
                self.model.group_masses() - &self.init.original_group_masses,
            ),
            (
                BlockKind::GroupComs,
                w.regularize_coms,
                self.model.group_coms() - &self.init.original_group_coms,
            ),
            (
                BlockKind::GroupInertias,
                w.regularize_inertias,
                self.model.group_inertias() - &self.init.original_group_inertias,
            ),
            (
                BlockKind::GroupScales,
                w.regularize_body_scales,
                self.model.group_scales() - &self.init.original_group_scales,
            ),
        ];
        for (kind, weight, diff) in regularizers.iter() {
            if let Some(block) = self.layout.parameter(*kind) {
                add_segment(&mut grad, block.offset, &(diff * (2. * weight / G)));
            }
        }
        for (i, name) in self.marker_names.iter().enumerate() {
            if let (Some(block), Some(original)) = (
                self.layout.marker(i),
                self.init.original_marker_offsets.get(name),
            ) {
                let g = (self.markers[i].offset - original)
                    * (2. * self.marker_offset_weight(i) / self.markers.len() as Float);
                add_segment(&mut grad, block.offset, &DVector::from_column_slice(g.as_slice()));
            }
        }

        let pose_scale = w.regularize_poses / self.num_timesteps as Float;
        let marker_scale = if self.num_observed_markers > 0 {
            w.marker / self.num_observed_markers as Float
        } else {
            0.
        };
        let parameter_blocks = [
            (BlockKind::GroupMasses, WithRespectTo::GroupMasses),
            (BlockKind::GroupComs, WithRespectTo::GroupComs),
            (BlockKind::GroupInertias, WithRespectTo::GroupInertias),
            (BlockKind::GroupScales, WithRespectTo::GroupScales),
        ];

        for trial in 0..self.poses.len() {
            for t in 0..self.poses[trial].ncols() {
                let q = self.pose(trial, t);

                // d(loss)/d(marker world positions)
                let observed = &self.init.marker_observation_trials[trial][t];
                let mut marker_grad = DVector::zeros(3 * self.markers.len());
                let mut any_marker = false;
                if self.marker_names.iter().any(|n| observed.contains_key(n)) {
                    let simulated = self.model.marker_world_positions(&q, &self.markers);
                    for (i, name) in self.marker_names.iter().enumerate() {
                        if let Some(target) = observed.get(name) {
                            let diff = simulated.fixed_rows::<3>(3 * i) - target;
                            let g = if w.marker_use_l1 {
                                let norm = diff.norm();
                                if norm > 0. {
                                    diff / norm
                                } else {
                                    Vector3::zeros()
                                }
                            } else {
                                diff * 2.
                            };
                            marker_grad
                                .fixed_rows_mut::<3>(3 * i)
                                .copy_from(&(g * marker_scale));
                            any_marker = true;
                        }
                    }
                }

                // d(loss)/d(joint world positions)
                let num_joints = self.init.joints.len();
                let mut joint_grad = DVector::zeros(3 * num_joints);
                if num_joints > 0 {
                    let joints = self.model.joint_world_positions(&q, &self.init.joints);
                    let centers = &self.init.joint_centers[trial];
                    let axes = &self.init.joint_axis[trial];
                    for j in 0..num_joints {
                        let p = joints.fixed_rows::<3>(3 * j).into_owned();
                        let center = centers.fixed_view::<3, 1>(3 * j, t);
                        let perpendicular = axis_offset(
                            &p,
                            &axes.fixed_view::<3, 1>(6 * j, t).into_owned(),
                            &axes.fixed_view::<3, 1>(6 * j + 3, t).into_owned(),
                        );
                        let g = (p - center) * (2. * self.init.joint_weights[j])
                            + perpendicular * (2. * self.init.axis_weights[j]);
                        joint_grad.fixed_rows_mut::<3>(3 * j).copy_from(&(g * w.joint));
                    }
                }

                let residual_active = self.residual_active(trial, t);
                for (kind, wrt) in parameter_blocks {
                    let Some(block) = self.layout.parameter(kind) else {
                        continue;
                    };
                    let offset = block.offset;
                    if residual_active {
                        let g = self.residual_norm_gradient(trial, t, wrt);
                        add_segment(&mut grad, offset, &g);
                    }
                    if kind == BlockKind::GroupScales {
                        if any_marker {
                            let J = self.model.marker_jacobian_wrt_scales(&q, &self.markers);
                            add_segment(&mut grad, offset, &(J.transpose() * &marker_grad));
                        }
                        if num_joints > 0 {
                            let J = self.model.joint_jacobian_wrt_scales(&q, &self.init.joints);
                            add_segment(&mut grad, offset, &(J.transpose() * &joint_grad));
                        }
                    }
                }

                if any_marker && self.flags.marker_offsets {
                    let J = self.model.marker_jacobian_wrt_offsets(&q, &self.markers);
                    let g = J.transpose() * &marker_grad;
                    for i in 0..self.markers.len() {
                        if let Some(block) = self.layout.marker(i) {
                            add_segment(&mut grad, block.offset, &g.rows(3 * i, 3).into_owned());
                        }
                    }
                }

                let Some(pose_block) = self.layout.pose(trial, t) else {
                    continue;
                };
                let pose_offset = pose_block.offset;
                if residual_active {
                    let g = self.residual_norm_gradient(trial, t, WithRespectTo::Position);
                    add_segment(&mut grad, pose_offset, &g);
                    let g = self.residual_norm_gradient(trial, t, WithRespectTo::Velocity);
                    add_segment(&mut grad, self.layout.velocity_offset(trial, t), &g);
                    let g = self.residual_norm_gradient(trial, t, WithRespectTo::Acceleration);
                    add_segment(&mut grad, self.layout.acceleration_offset(trial, t), &g);
                }
                if any_marker {
                    let J = self.model.marker_jacobian_wrt_positions(&q, &self.markers);
                    add_segment(&mut grad, pose_offset, &(J.transpose() * &marker_grad));
                }
                if num_joints > 0 {
                    let J = self.model.joint_jacobian_wrt_positions(&q, &self.init.joints);
                    add_segment(&mut grad, pose_offset, &(J.transpose() * &joint_grad));
                }
                if pose_scale != 0. {
                    let diff = &q - self.reference_poses[trial].column(t);
                    add_segment(&mut grad, pose_offset, &(diff * (2. * pose_scale)));
                }
            }
        }

        Ok(grad)
    }

    /// Gradient of the loss by finite differencing. Leaves the problem state
    /// at `x`.
    pub fn finite_difference_gradient(
        &mut self,
        x: &DVector<Float>,
        use_ridders: bool,
    ) -> FitResult<DVector<Float>> {
        let eps = if use_ridders { 1e-3 } else { 1e-6 };
        let n = self.problem_size();
        let result = try_finite_difference_gradient(
            |eps, i| {
                let mut perturbed = x.clone();
                perturbed[i] += eps;
                self.compute_loss(&perturbed, false)
            },
            n,
            eps,
            use_ridders,
        );
        self.unflatten(x);
        result
    }

    pub fn constraint_size(&self) -> usize {
        if !self.flags.poses {
            return 0;
        }
        let n = self.model.num_dofs();
        self.accelerations
            .iter()
            .map(|acc| 2 * n * acc.ncols() + n)
            .sum()
    }

    /// Finite-difference consistency of the trajectories. Per trial and per
    /// t < T-2, n velocity rows then n acceleration rows, then n rows for the
    /// velocity at T-2.
    pub fn compute_constraints(&mut self, x: &DVector<Float>) -> DVector<Float> {
        let mut g = DVector::zeros(self.constraint_size());
        if !self.flags.poses {
            return g;
        }
        self.unflatten(x);

        let n = self.model.num_dofs();
        let mut row = 0;
        for trial in 0..self.poses.len() {
            let dt = self.init.trial_timesteps[trial];
            let q = &self.poses[trial];
            let dq = &self.velocities[trial];
            let ddq = &self.accelerations[trial];
            for t in 0..ddq.ncols() {
                for i in 0..n {
                    g[row] = dq[(i, t)] * dt - (q[(i, t + 1)] - q[(i, t)]);
                    row += 1;
                }
                for i in 0..n {
                    g[row] = ddq[(i, t)] * dt - (dq[(i, t + 1)] - dq[(i, t)]);
                    row += 1;
                }
            }
            let last = ddq.ncols();
            for i in 0..n {
                g[row] = dq[(i, last)] * dt - (q[(i, last + 1)] - q[(i, last)]);
                row += 1;
            }
        }
        assert_eq!(row, g.len());
        g
    }

    /// The constant constraint Jacobian as (row, col, value) entries
    pub fn compute_sparse_constraints_jacobian(&self) -> SparseTriplets {
        let mut J = SparseTriplets::new(self.constraint_size(), self.problem_size());
        if !self.flags.poses {
            return J;
        }

        let n = self.model.num_dofs();
        let layout = &self.layout;
        let mut row = 0;
        let mut max_col = 0;
        for trial in 0..self.poses.len() {
            let dt = self.init.trial_timesteps[trial];
            let steps = self.accelerations[trial].ncols();
            for t in 0..steps {
                let (q0, q1) = (layout.pose_offset(trial, t), layout.pose_offset(trial, t + 1));
                let (v0, v1) = (
                    layout.velocity_offset(trial, t),
                    layout.velocity_offset(trial, t + 1),
                );
                let a0 = layout.acceleration_offset(trial, t);
                for i in 0..n {
                    J.push(row, q0 + i, 1.);
                    J.push(row, q1 + i, -1.);
                    J.push(row, v0 + i, dt);
                    row += 1;
                }
                for i in 0..n {
                    J.push(row, v0 + i, 1.);
                    J.push(row, v1 + i, -1.);
                    J.push(row, a0 + i, dt);
                    row += 1;
                }
            }
            let q0 = layout.pose_offset(trial, steps);
            let q1 = layout.pose_offset(trial, steps + 1);
            let v0 = layout.velocity_offset(trial, steps);
            for i in 0..n {
                J.push(row, q0 + i, 1.);
                J.push(row, q1 + i, -1.);
                J.push(row, v0 + i, dt);
                row += 1;
            }
            max_col = max_col.max(q1 + n);
        }

        assert_eq!(row, self.constraint_size(), "constraint rows do not match");
        assert_eq!(max_col, self.problem_size(), "constraint columns do not cover the problem");
        J
    }

    pub fn compute_constraints_jacobian(&self) -> DMatrix<Float> {
        if !self.flags.poses {
            return DMatrix::zeros(0, 0);
        }
        self.compute_sparse_constraints_jacobian().to_dense()
    }

    /// Constraint Jacobian by central differencing around the current state
    pub fn finite_difference_constraints_jacobian(&mut self) -> DMatrix<Float> {
        let n = self.problem_size();
        if self.constraint_size() == 0 {
            return DMatrix::zeros(0, n);
        }
        let original = self.flatten();
        let J = finite_difference_jacobian(
            |eps, i| {
                let mut perturbed = original.clone();
                perturbed[i] += eps;
                self.compute_constraints(&perturbed)
            },
            n,
            1e-6,
            false,
        );
        self.unflatten(&original);
        J
    }

    /// Logs every entry where `analytical` disagrees with `fd`, named by its
    /// block. Entries with |fd| > 1 are compared relatively. Returns true if
    /// any entry disagrees.
    pub fn debug_errors(&self, fd: &DVector<Float>, analytical: &DVector<Float>, tol: Float) -> bool {
        assert_eq!(fd.len(), self.problem_size());
        assert_eq!(analytical.len(), self.problem_size());
        let mut any_error = false;
        for block in self.layout.blocks() {
            for i in block.range() {
                let error = if fd[i].abs() > 1. {
                    ((fd[i] - analytical[i]) / fd[i]).abs()
                } else {
                    (fd[i] - analytical[i]).abs()
                };
                if error > tol || error.is_nan() {
                    warn!(
                        "Error on {}[{}]: {} - {} = {}",
                        block.kind,
                        i - block.offset,
                        fd[i],
                        analytical[i],
                        error
                    );
                    any_error = true;
                }
            }
        }
        any_error
    }

    /// Copy a decision vector into the initialization object
    pub fn write_back(&mut self, x: &DVector<Float>) {
        self.unflatten(x);
        if self.flags.masses {
            self.init.group_masses = self.model.group_masses();
        }
        if self.flags.coms {
            self.init.group_coms = self.model.group_coms();
        }
        if self.flags.inertias {
            self.init.group_inertias = self.model.group_inertias();
        }
        if self.flags.body_scales {
            self.init.group_scales = self.model.group_scales();
        }
        if self.flags.poses {
            self.init.pose_trials = self.poses.clone();
        }
        if self.flags.marker_offsets {
            for (name, marker) in self.marker_names.iter().zip(self.markers.iter()) {
                if let Some(target) = self.init.marker_map.get_mut(name) {
                    target.offset = marker.offset;
                }
            }
        }
        info!(
            "Wrote fit back: {} group(s), {} marker(s), {} trial(s)",
            self.model.num_scale_groups(),
            self.markers.len(),
            self.poses.len()
        );
    }
}

/// Component of (p - point) perpendicular to the axis direction
fn axis_offset(
    p: &Vector3<Float>,
    point: &Vector3<Float>,
    direction: &Vector3<Float>,
) -> Vector3<Float> {
    let diff = p - point;
    match direction.try_normalize(0.) {
        Some(axis) => diff - axis * diff.dot(&axis),
        None => diff,
    }
}

fn add_segment(grad: &mut DVector<Float>, offset: usize, values: &DVector<Float>) {
    for (i, v) in values.iter().enumerate() {
        grad[offset + i] += v;
    }
}
