//! The dynamics fitting pipeline: build an initialization from kinematic
//! results and force plates, run the contact and mass heuristics on it, then
//! refine it with optimization rounds.

pub mod contacts;
pub mod initialization;
pub mod masses;

use itertools::izip;
use log::{info, warn};
use na::{DMatrix, DVector};

use crate::{
    dynamics_model::{DynamicsModel, MarkerMap, WithRespectTo},
    error::{FitError, FitResult},
    force_plate::ForcePlate,
    nlp::{
        adapter::DynamicsFitNlp,
        sqp::{SolverSettings, SqpSolver},
        SolveReport,
    },
    problem::{DynamicsFitProblem, FitWeights, InclusionFlags},
    residual::ResidualForceHelper,
    smoother::AccelerationSmoother,
    types::Float,
};

use self::initialization::{DynamicsInitialization, MarkerObservations};

/// Jerk weight of the light smoothing applied to incoming poses
const POSE_SMOOTHING_WEIGHT: Float = 0.05;
const POSE_SMOOTHING_REGULARIZATION: Float = 1.0;

/// Tolerance of the derivative check run before a solve
const DERIVATIVE_CHECK_TOLERANCE: Float = 1e-6;

/// Output of the kinematic (marker) fitting stage, with all trials
/// concatenated along the columns.
#[derive(Clone, Debug)]
pub struct MarkerInitialization {
    pub poses: DMatrix<Float>,
    pub marker_map: MarkerMap,
    pub joints: Vec<usize>,
    pub joint_weights: DVector<Float>,
    pub axis_weights: DVector<Float>,
    /// 3 rows per joint
    pub joint_centers: DMatrix<Float>,
    /// 6 rows per joint: a point on the axis then its direction
    pub joint_axis: DMatrix<Float>,
}

/// One optimization pass over a chosen set of variables.
///
/// `residual_weight` and `marker_weight` are given as linear weights and
/// squared when the corresponding cost is squared, so that a weight keeps
/// its meaning whichever norm is chosen.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizationRound {
    pub residual_weight: Float,
    pub marker_weight: Float,
    pub include: InclusionFlags,
    pub weights: FitWeights,
}

impl Default for OptimizationRound {
    fn default() -> Self {
        OptimizationRound {
            residual_weight: 0.1,
            marker_weight: 1.0,
            include: InclusionFlags::default(),
            weights: FitWeights::default(),
        }
    }
}

impl OptimizationRound {
    /// Weights handed to the problem
    pub fn effective_weights(&self) -> FitWeights {
        let mut weights = self.weights.clone();
        weights.residual = if weights.residual_use_l1 {
            self.residual_weight
        } else {
            self.residual_weight * self.residual_weight
        };
        weights.marker = if weights.marker_use_l1 {
            self.marker_weight
        } else {
            self.marker_weight * self.marker_weight
        };
        weights
    }
}

/// Fits skeleton inertial parameters, marker offsets and motion to marker
/// and force plate data. Holds the template model that every problem clones
/// and the solver configuration.
pub struct DynamicsFitter<M: DynamicsModel> {
    model: M,
    settings: SolverSettings,
    check_derivatives: bool,
}

impl<M: DynamicsModel> DynamicsFitter<M> {
    pub fn new(model: M) -> Self {
        DynamicsFitter {
            model,
            settings: SolverSettings::default(),
            check_derivatives: false,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn solver_settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn set_tolerance(&mut self, tolerance: Float) {
        self.settings.tolerance = tolerance;
    }

    pub fn set_iteration_limit(&mut self, limit: usize) {
        self.settings.max_iterations = limit;
    }

    pub fn set_lbfgs_history_length(&mut self, length: usize) {
        self.settings.lbfgs_history = length;
    }

    pub fn set_check_derivatives(&mut self, check: bool) {
        self.check_derivatives = check;
    }

    pub fn set_print_frequency(&mut self, frequency: usize) {
        self.settings.print_frequency = frequency;
    }

    pub fn set_silence_output(&mut self, silent: bool) {
        self.settings.silence_output = silent;
    }

    pub fn set_disable_line_search(&mut self, disable: bool) {
        self.settings.disable_line_search = disable;
    }

    /// Build an initialization from poses and force plates. Poses are lightly
    /// smoothed; the raw poses are kept as the pose regularization target.
    /// Every force plate reading is assigned to the GRF body whose origin is
    /// nearest its center of pressure.
    #[allow(clippy::too_many_arguments)]
    pub fn create_initialization(
        &self,
        marker_map: MarkerMap,
        tracking_markers: Vec<String>,
        grf_bodies: Vec<usize>,
        force_plate_trials: Vec<Vec<ForcePlate>>,
        pose_trials: Vec<DMatrix<Float>>,
        frames_per_second: &[usize],
        marker_observation_trials: Vec<MarkerObservations>,
    ) -> FitResult<DynamicsInitialization> {
        let trials = pose_trials.len();
        if force_plate_trials.len() != trials
            || frames_per_second.len() != trials
            || marker_observation_trials.len() != trials
        {
            return Err(FitError::invalid_input(format!(
                "inconsistent trial counts: {} poses, {} force plate trials, {} frame rates, {} marker trials",
                trials,
                force_plate_trials.len(),
                frames_per_second.len(),
                marker_observation_trials.len()
            )));
        }
        for body in grf_bodies.iter() {
            if *body >= self.model.num_bodies() {
                return Err(FitError::invalid_input(format!(
                    "GRF body {} does not exist",
                    body
                )));
            }
        }

        let mut init = DynamicsInitialization {
            original_marker_offsets: marker_map
                .iter()
                .map(|(name, marker)| (name.clone(), marker.offset))
                .collect(),
            marker_map,
            tracking_markers,
            grf_bodies,
            marker_observation_trials,
            ..Default::default()
        };
        init.capture_parameters(&self.model);

        for (trial, (poses, fps, plates)) in
            izip!(pose_trials.iter(), frames_per_second, force_plate_trials.iter()).enumerate()
        {
            let T = poses.ncols();
            if *fps == 0 {
                return Err(FitError::invalid_input(format!(
                    "trial {} has a frame rate of 0",
                    trial
                )));
            }
            if T < 3 {
                return Err(FitError::invalid_input(format!(
                    "trial {} has {} timesteps, need at least 3",
                    trial, T
                )));
            }
            if let Some(plate) = plates.iter().find(|p| p.num_timesteps() < T) {
                return Err(FitError::invalid_input(format!(
                    "trial {} has a force plate with {} readings for {} poses",
                    trial,
                    plate.num_timesteps(),
                    T
                )));
            }
            if !plates.is_empty() && init.grf_bodies.is_empty() {
                return Err(FitError::invalid_input(
                    "force plate data needs at least one GRF body",
                ));
            }

            let smoother =
                AccelerationSmoother::new(T, POSE_SMOOTHING_WEIGHT, POSE_SMOOTHING_REGULARIZATION)?;
            let smoothed = smoother.smooth(poses);
            init.grf_trials
                .push(self.assign_plates_to_bodies(&smoothed, plates, &init.grf_bodies));
            init.pose_trials.push(smoothed);
            init.trial_timesteps.push(1. / *fps as Float);
        }
        init.original_pose_trials = pose_trials;
        init.force_plate_trials = force_plate_trials;

        info!(
            "Created initialization: {} trial(s), {} GRF bodies, {} markers",
            init.num_trials(),
            init.grf_bodies.len(),
            init.marker_map.len()
        );
        Ok(init)
    }

    /// World wrenches per GRF body, 6 rows per body and one column per pose
    fn assign_plates_to_bodies(
        &self,
        poses: &DMatrix<Float>,
        plates: &[ForcePlate],
        grf_bodies: &[usize],
    ) -> DMatrix<Float> {
        let mut grf = DMatrix::zeros(6 * grf_bodies.len(), poses.ncols());
        if plates.is_empty() {
            return grf;
        }
        for t in 0..poses.ncols() {
            let transforms = self
                .model
                .body_world_transforms(&poses.column(t).into_owned());
            for plate in plates.iter() {
                let cop = plate.centers_of_pressure[t];
                let nearest = grf_bodies
                    .iter()
                    .enumerate()
                    .map(|(i, &body)| (i, (transforms[body].translation.vector - cop).norm()))
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let wrench = plate.wrench_at(t).as_vector6();
                let mut column = grf.fixed_view_mut::<6, 1>(6 * nearest, t);
                column += wrench;
            }
        }
        grf
    }

    /// Build an initialization from the kinematic fit, splitting its
    /// concatenated poses and joint data into trials by the number of marker
    /// frames per trial.
    pub fn create_initialization_from_kinematics(
        &self,
        kinematics: &MarkerInitialization,
        tracking_markers: Vec<String>,
        grf_bodies: Vec<usize>,
        force_plate_trials: Vec<Vec<ForcePlate>>,
        frames_per_second: &[usize],
        marker_observation_trials: Vec<MarkerObservations>,
    ) -> FitResult<DynamicsInitialization> {
        let lengths: Vec<usize> = marker_observation_trials.iter().map(|o| o.len()).collect();
        let total: usize = lengths.iter().sum();
        if kinematics.poses.ncols() != total {
            return Err(FitError::invalid_input(format!(
                "kinematic fit has {} poses, marker trials have {} frames",
                kinematics.poses.ncols(),
                total
            )));
        }
        let has_joints = !kinematics.joints.is_empty();
        if has_joints
            && (kinematics.joint_centers.ncols() != total || kinematics.joint_axis.ncols() != total)
        {
            return Err(FitError::invalid_input(format!(
                "kinematic joint data covers {} and {} frames, expected {}",
                kinematics.joint_centers.ncols(),
                kinematics.joint_axis.ncols(),
                total
            )));
        }

        let pose_trials = split_columns(&kinematics.poses, &lengths);
        let mut init = self.create_initialization(
            kinematics.marker_map.clone(),
            tracking_markers,
            grf_bodies,
            force_plate_trials,
            pose_trials,
            frames_per_second,
            marker_observation_trials,
        )?;

        init.joints = kinematics.joints.clone();
        init.joint_weights = kinematics.joint_weights.clone();
        init.axis_weights = kinematics.axis_weights.clone();
        if has_joints {
            init.joint_centers = split_columns(&kinematics.joint_centers, &lengths);
            init.joint_axis = split_columns(&kinematics.joint_axis, &lengths);
        }
        Ok(init)
    }

    /// Run one optimization round and write the best iterate back into
    /// `init`. Needs the missing-GRF flags from
    /// `estimate_foot_ground_contacts`.
    pub fn run_optimization(
        &self,
        init: &mut DynamicsInitialization,
        round: &OptimizationRound,
    ) -> FitResult<SolveReport> {
        init.require_missing_grf_flags()?;

        let mut problem = DynamicsFitProblem::new(init, &self.model)?
            .with_flags(round.include)
            .with_weights(round.effective_weights());
        if self.check_derivatives {
            Self::check_problem_derivatives(&mut problem)?;
        }
        info!(
            "Optimizing over {} variables with {} constraints",
            problem.problem_size(),
            problem.constraint_size()
        );

        let mut nlp = DynamicsFitNlp::new(problem);
        let report = SqpSolver::new(self.settings.clone()).solve(&mut nlp)?;
        info!(
            "Optimization {} after {} iterations, final loss {:.6e}",
            report.status, report.iterations, report.final_objective
        );
        Ok(report)
    }

    /// Compare analytical and finite-difference derivatives at the starting
    /// point and log every mismatch
    fn check_problem_derivatives(problem: &mut DynamicsFitProblem<M>) -> FitResult<()> {
        let x = problem.flatten();
        let analytical = problem.compute_gradient(&x)?;
        let fd = problem.finite_difference_gradient(&x, true)?;
        if problem.debug_errors(&fd, &analytical, DERIVATIVE_CHECK_TOLERANCE) {
            warn!("Loss gradient disagrees with finite differences");
        }

        let jacobian = problem.compute_constraints_jacobian();
        let fd_jacobian = problem.finite_difference_constraints_jacobian();
        if jacobian.shape() == fd_jacobian.shape() {
            let error = (&jacobian - &fd_jacobian).amax();
            if error > DERIVATIVE_CHECK_TOLERANCE {
                warn!("Constraint Jacobian disagrees with finite differences by {}", error);
            }
        }
        Ok(())
    }

    /// Mean distance, in meters, between observed and simulated markers
    pub fn compute_average_marker_rmse(&self, init: &DynamicsInitialization) -> Float {
        let model = init.configured(&self.model);
        let names: Vec<&String> = init.marker_map.keys().collect();
        let markers: Vec<_> = init.marker_map.values().cloned().collect();

        let mut total = 0.;
        let mut count = 0;
        for (poses, observations) in init
            .pose_trials
            .iter()
            .zip(init.marker_observation_trials.iter())
        {
            for (t, observed) in observations.iter().enumerate().take(poses.ncols()) {
                let simulated =
                    model.marker_world_positions(&poses.column(t).into_owned(), &markers);
                for (i, name) in names.iter().enumerate() {
                    if let Some(target) = observed.get(*name) {
                        total += (simulated.fixed_rows::<3>(3 * i) - target).norm();
                        count += 1;
                    }
                }
            }
        }
        if count == 0 {
            return 0.;
        }
        total / count as Float
    }

    /// Mean residual (force in N, torque in N·m) over the timesteps that are
    /// not flagged as missing GRF. Velocities and accelerations are finite
    /// differences of the poses.
    pub fn compute_average_residual_force(
        &self,
        init: &DynamicsInitialization,
    ) -> FitResult<(Float, Float)> {
        init.require_missing_grf_flags()?;
        let model = init.configured(&self.model);
        let helper = ResidualForceHelper::new(init.grf_bodies.clone());

        let mut force = 0.;
        let mut torque = 0.;
        let mut count = 0;
        for trial in 0..init.num_trials() {
            let dt = init.trial_timesteps[trial];
            let poses = &init.pose_trials[trial];
            for t in 0..poses.ncols().saturating_sub(2) {
                if init.probably_missing_grf[trial][t] {
                    continue;
                }
                let q = poses.column(t).into_owned();
                let dq = (poses.column(t + 1) - poses.column(t)) / dt;
                let ddq = (poses.column(t + 2) - poses.column(t + 1) * 2. + poses.column(t))
                    / (dt * dt);
                let residual = helper.calculate_residual(
                    &model,
                    &q,
                    &dq,
                    &ddq,
                    &init.grf_trials[trial].column(t).into_owned(),
                );
                force += residual.fixed_rows::<3>(0).norm();
                torque += residual.fixed_rows::<3>(3).norm();
                count += 1;
            }
        }
        if count == 0 {
            return Ok((0., 0.));
        }
        Ok((force / count as Float, torque / count as Float))
    }

    /// Mean measured plate force (N) and free moment (N·m) per timestep
    pub fn compute_average_real_force(&self, init: &DynamicsInitialization) -> (Float, Float) {
        let mut force = 0.;
        let mut torque = 0.;
        let mut count = 0;
        for (poses, plates) in init.pose_trials.iter().zip(init.force_plate_trials.iter()) {
            for t in 0..poses.ncols().saturating_sub(2) {
                for plate in plates.iter() {
                    force += plate.forces[t].norm();
                    torque += plate.moments[t].norm();
                }
                count += 1;
            }
        }
        if count == 0 {
            return (0., 0.);
        }
        (force / count as Float, torque / count as Float)
    }

    /// Residual gradient at one timestep w.r.t. one quantity, for inspecting
    /// which parameters drive the residual
    pub fn residual_gradient_at(
        &self,
        init: &DynamicsInitialization,
        trial: usize,
        t: usize,
        wrt: WithRespectTo,
    ) -> FitResult<DVector<Float>> {
        init.check_trial(trial)?;
        let poses = &init.pose_trials[trial];
        if t + 2 >= poses.ncols() {
            return Err(FitError::invalid_input(format!(
                "timestep {} has no finite-difference acceleration in a trial of {}",
                t,
                poses.ncols()
            )));
        }
        let model = init.configured(&self.model);
        let dt = init.trial_timesteps[trial];
        let q = poses.column(t).into_owned();
        let dq = (poses.column(t + 1) - poses.column(t)) / dt;
        let ddq = (poses.column(t + 2) - poses.column(t + 1) * 2. + poses.column(t)) / (dt * dt);
        Ok(ResidualForceHelper::new(init.grf_bodies.clone()).calculate_residual_norm_gradient_wrt(
            &model,
            &q,
            &dq,
            &ddq,
            &init.grf_trials[trial].column(t).into_owned(),
            wrt,
            false,
        ))
    }
}

/// Split the columns of `concatenated` into consecutive blocks of `lengths`
fn split_columns(concatenated: &DMatrix<Float>, lengths: &[usize]) -> Vec<DMatrix<Float>> {
    let mut cursor = 0;
    lengths
        .iter()
        .map(|&len| {
            let block = concatenated.columns(cursor, len).into_owned();
            cursor += len;
            block
        })
        .collect()
}

#[cfg(test)]
pub mod test_fixtures {
    use std::collections::HashMap;

    use na::{DMatrix, Matrix6, Vector6};

    use crate::{
        dynamics_model::DynamicsModel, fitter::initialization::DynamicsInitialization,
        helpers::build_floating_pendulum, skeleton::Skeleton, types::Float,
    };

    pub const DT: Float = 0.01;

    /// A pendulum of mass `true_mass` swinging through a smooth trajectory,
    /// with a torso GRF that explains its root dynamics exactly under
    /// finite-difference velocities and accelerations. Contact flags are set
    /// (nothing missing) and no markers are observed.
    pub fn pendulum_with_exact_grf(true_mass: Float, timesteps: usize) -> (Skeleton, DynamicsInitialization) {
        let skeleton = build_floating_pendulum(true_mass);
        let torso = skeleton.body_index("torso").unwrap();
        let n = skeleton.num_dofs();

        let poses = DMatrix::from_fn(n, timesteps, |i, t| {
            let s = t as Float * DT;
            0.1 * i as Float + 0.3 * (2. * s + 0.5 * i as Float).sin() + 0.2 * s * s
        });
        let dq = DMatrix::from_fn(n, timesteps - 1, |i, t| (poses[(i, t + 1)] - poses[(i, t)]) / DT);
        let ddq = DMatrix::from_fn(n, timesteps - 2, |i, t| (dq[(i, t + 1)] - dq[(i, t)]) / DT);

        let mut grf = DMatrix::zeros(6, timesteps);
        for t in 0..timesteps - 2 {
            let q = poses.column(t).into_owned();
            let tau = skeleton.inverse_dynamics(&q, &dq.column(t).into_owned(), &ddq.column(t).into_owned());
            let target: Vector6<Float> = tau.fixed_rows::<6>(0).into_owned();

            // The root torques are linear in the wrench
            let mut map = Matrix6::zeros();
            for k in 0..6 {
                let unit = Vector6::from_fn(|i, _| if i == k { 1. } else { 0. });
                let column: Vector6<Float> =
                    skeleton.external_wrench_torques(&q, torso, &unit).fixed_rows::<6>(0).into_owned();
                map.set_column(k, &column);
            }
            let wrench = map.lu().solve(&target).unwrap();
            grf.set_column(t, &wrench);
        }

        let init = DynamicsInitialization {
            pose_trials: vec![poses.clone()],
            original_pose_trials: vec![poses],
            trial_timesteps: vec![DT],
            marker_observation_trials: vec![vec![HashMap::new(); timesteps]],
            grf_bodies: vec![torso],
            grf_trials: vec![grf],
            probably_missing_grf: vec![vec![false; timesteps]],
            force_plate_trials: vec![vec![]],
            ..Default::default()
        };
        (skeleton, init)
    }
}
