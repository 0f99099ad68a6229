use std::collections::{BTreeMap, HashMap};

use na::{DMatrix, DVector, Vector3};

use crate::{
    dynamics_model::{DynamicsModel, MarkerMap},
    error::{FitError, FitResult},
    force_plate::ForcePlate,
    types::Float,
};

/// Per-timestep marker observations of one trial
pub type MarkerObservations = Vec<HashMap<String, Vector3<Float>>>;

/// Everything a dynamics fit reads and refines. Created once per subject and
/// updated in place by the heuristics and by every optimization round.
#[derive(Clone, Debug)]
pub struct DynamicsInitialization {
    // Input data
    pub force_plate_trials: Vec<Vec<ForcePlate>>,
    /// Poses as handed in, before smoothing
    pub original_pose_trials: Vec<DMatrix<Float>>,
    pub marker_observation_trials: Vec<MarkerObservations>,
    pub trial_timesteps: Vec<Float>,

    // GRF assignment
    pub grf_bodies: Vec<usize>,
    /// Per trial, one world wrench (moment about origin, force) per GRF body
    /// stacked per column: 6 * grf_bodies rows, one column per timestep
    pub grf_trials: Vec<DMatrix<Float>>,
    pub pose_trials: Vec<DMatrix<Float>>,

    // Contact heuristic results, per trial
    pub probably_missing_grf: Vec<Vec<bool>>,
    /// Per GRF body, the body and its descendants up to the next GRF body
    pub contact_bodies: Vec<Vec<usize>>,
    pub ground_height: Vec<Float>,
    pub flat_ground: Vec<bool>,
    pub default_force_plate_corners: Vec<Vec<Vector3<Float>>>,
    /// Indexed [trial][grf body][contact body]
    pub grf_body_contact_sphere_radius: Vec<Vec<Vec<Float>>>,
    /// Indexed [trial][t][grf body]
    pub grf_body_force_active: Vec<Vec<Vec<bool>>>,
    pub grf_body_sphere_in_contact: Vec<Vec<Vec<bool>>>,
    pub grf_body_off_force_plate: Vec<Vec<Vec<bool>>>,

    // Joint center data from the kinematics stage
    pub joints: Vec<usize>,
    pub joint_weights: DVector<Float>,
    pub axis_weights: DVector<Float>,
    /// Per trial, 3 rows per joint
    pub joint_centers: Vec<DMatrix<Float>>,
    /// Per trial, 6 rows per joint: a point on the axis then its direction
    pub joint_axis: Vec<DMatrix<Float>>,

    // Skeleton parameters
    pub group_masses: DVector<Float>,
    pub group_coms: DVector<Float>,
    pub group_inertias: DVector<Float>,
    pub group_scales: DVector<Float>,
    pub original_group_masses: DVector<Float>,
    pub original_group_coms: DVector<Float>,
    pub original_group_inertias: DVector<Float>,
    pub original_group_scales: DVector<Float>,

    pub marker_map: MarkerMap,
    pub original_marker_offsets: BTreeMap<String, Vector3<Float>>,
    pub tracking_markers: Vec<String>,
}

impl Default for DynamicsInitialization {
    fn default() -> Self {
        DynamicsInitialization {
            force_plate_trials: vec![],
            original_pose_trials: vec![],
            marker_observation_trials: vec![],
            trial_timesteps: vec![],
            grf_bodies: vec![],
            grf_trials: vec![],
            pose_trials: vec![],
            probably_missing_grf: vec![],
            contact_bodies: vec![],
            ground_height: vec![],
            flat_ground: vec![],
            default_force_plate_corners: vec![],
            grf_body_contact_sphere_radius: vec![],
            grf_body_force_active: vec![],
            grf_body_sphere_in_contact: vec![],
            grf_body_off_force_plate: vec![],
            joints: vec![],
            joint_weights: DVector::zeros(0),
            axis_weights: DVector::zeros(0),
            joint_centers: vec![],
            joint_axis: vec![],
            group_masses: DVector::zeros(0),
            group_coms: DVector::zeros(0),
            group_inertias: DVector::zeros(0),
            group_scales: DVector::zeros(0),
            original_group_masses: DVector::zeros(0),
            original_group_coms: DVector::zeros(0),
            original_group_inertias: DVector::zeros(0),
            original_group_scales: DVector::zeros(0),
            marker_map: MarkerMap::new(),
            original_marker_offsets: BTreeMap::new(),
            tracking_markers: vec![],
        }
    }
}

impl DynamicsInitialization {
    pub fn num_trials(&self) -> usize {
        self.pose_trials.len()
    }

    pub fn check_trial(&self, trial: usize) -> FitResult<()> {
        if trial >= self.num_trials() {
            return Err(FitError::TrialOutOfRange {
                trial,
                trials: self.num_trials(),
            });
        }
        Ok(())
    }

    /// Missing-GRF flags exist for every timestep of every trial
    pub fn has_missing_grf_flags(&self) -> bool {
        self.probably_missing_grf.len() == self.num_trials()
            && self
                .probably_missing_grf
                .iter()
                .zip(self.pose_trials.iter())
                .all(|(flags, poses)| flags.len() == poses.ncols())
    }

    pub fn require_missing_grf_flags(&self) -> FitResult<()> {
        if !self.has_missing_grf_flags() {
            return Err(FitError::MissingGrfFlags {
                computed: self.probably_missing_grf.len(),
                trials: self.num_trials(),
            });
        }
        Ok(())
    }

    /// Record the model's current parameters as both current and original
    /// values
    pub fn capture_parameters<M: DynamicsModel>(&mut self, model: &M) {
        self.group_masses = model.group_masses();
        self.group_coms = model.group_coms();
        self.group_inertias = model.group_inertias();
        self.group_scales = model.group_scales();
        self.original_group_masses = self.group_masses.clone();
        self.original_group_coms = self.group_coms.clone();
        self.original_group_inertias = self.group_inertias.clone();
        self.original_group_scales = self.group_scales.clone();
    }

    pub fn apply_to<M: DynamicsModel>(&self, model: &mut M) {
        model.set_group_masses(&self.group_masses);
        model.set_group_coms(&self.group_coms);
        model.set_group_inertias(&self.group_inertias);
        model.set_group_scales(&self.group_scales);
    }

    /// A copy of `template` carrying this initialization's parameters
    pub fn configured<M: DynamicsModel>(&self, template: &M) -> M {
        let mut model = template.clone();
        self.apply_to(&mut model);
        model
    }

    pub fn is_tracking_marker(&self, name: &str) -> bool {
        self.tracking_markers.iter().any(|m| m == name)
    }

    /// Shape checks shared by everything that consumes an initialization
    pub fn validate<M: DynamicsModel>(&self, model: &M) -> FitResult<()> {
        let trials = self.num_trials();
        if model.num_dofs() < 6 {
            return Err(FitError::invalid_input(
                "skeleton root must be a free joint with 6 dofs",
            ));
        }
        if self.trial_timesteps.len() != trials
            || self.grf_trials.len() != trials
            || self.marker_observation_trials.len() != trials
        {
            return Err(FitError::invalid_input(format!(
                "inconsistent trial counts: {} poses, {} timesteps, {} GRF, {} marker trials",
                trials,
                self.trial_timesteps.len(),
                self.grf_trials.len(),
                self.marker_observation_trials.len()
            )));
        }
        if self.group_masses.len() != model.num_scale_groups() {
            return Err(FitError::invalid_input(format!(
                "{} group masses for {} scale groups",
                self.group_masses.len(),
                model.num_scale_groups()
            )));
        }
        if !self.joints.is_empty()
            && (self.joint_weights.len() != self.joints.len()
                || self.axis_weights.len() != self.joints.len())
        {
            return Err(FitError::invalid_input(format!(
                "{} joints with {} joint weights and {} axis weights",
                self.joints.len(),
                self.joint_weights.len(),
                self.axis_weights.len()
            )));
        }
        for (trial, poses) in self.pose_trials.iter().enumerate() {
            if poses.nrows() != model.num_dofs() {
                return Err(FitError::invalid_input(format!(
                    "trial {} poses have {} rows, skeleton has {} dofs",
                    trial,
                    poses.nrows(),
                    model.num_dofs()
                )));
            }
            if poses.ncols() < 3 {
                return Err(FitError::invalid_input(format!(
                    "trial {} has {} timesteps, need at least 3",
                    trial,
                    poses.ncols()
                )));
            }
            if self.grf_trials[trial].nrows() != 6 * self.grf_bodies.len()
                || self.grf_trials[trial].ncols() != poses.ncols()
            {
                return Err(FitError::invalid_input(format!(
                    "trial {} GRF matrix is {}x{}, expected {}x{}",
                    trial,
                    self.grf_trials[trial].nrows(),
                    self.grf_trials[trial].ncols(),
                    6 * self.grf_bodies.len(),
                    poses.ncols()
                )));
            }
            if self.marker_observation_trials[trial].len() != poses.ncols() {
                return Err(FitError::invalid_input(format!(
                    "trial {} has {} marker frames for {} poses",
                    trial,
                    self.marker_observation_trials[trial].len(),
                    poses.ncols()
                )));
            }
            if !self.joints.is_empty()
                && (self.joint_centers.get(trial).map(|c| c.shape())
                    != Some((3 * self.joints.len(), poses.ncols()))
                    || self.joint_axis.get(trial).map(|a| a.shape())
                        != Some((6 * self.joints.len(), poses.ncols())))
            {
                return Err(FitError::invalid_input(format!(
                    "trial {} joint data does not match {} joints",
                    trial,
                    self.joints.len()
                )));
            }
        }
        Ok(())
    }
}
