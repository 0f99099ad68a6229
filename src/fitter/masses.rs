use log::{info, warn};
use na::{vector, DMatrix, DVector, Vector3};

use crate::{
    dynamics_model::DynamicsModel,
    error::{FitError, FitResult},
    types::Float,
    GRAVITY,
};

use super::{initialization::DynamicsInitialization, DynamicsFitter};

/// Lightest mass a scale group may be given by the heuristics
const MIN_GROUP_MASS: Float = 0.01;

fn gravity() -> Vector3<Float> {
    vector![0., -GRAVITY, 0.]
}

/// Second differences of a sampled trajectory
fn finite_difference_accelerations(positions: &[Vector3<Float>], dt: Float) -> Vec<Vector3<Float>> {
    positions
        .windows(3)
        .map(|w| {
            let v1 = (w[1] - w[0]) / dt;
            let v2 = (w[2] - w[1]) / dt;
            (v2 - v1) / dt
        })
        .collect()
}

impl<M: DynamicsModel> DynamicsFitter<M> {
    /// Whole-body center of mass at every pose of a trial
    pub fn com_positions(
        &self,
        init: &DynamicsInitialization,
        trial: usize,
    ) -> FitResult<Vec<Vector3<Float>>> {
        init.check_trial(trial)?;
        let model = init.configured(&self.model);
        let masses = model.body_masses();
        let total = masses.sum();
        let poses = &init.pose_trials[trial];

        Ok((0..poses.ncols())
            .map(|t| {
                let coms = model.body_com_world_positions(&poses.column(t).into_owned());
                coms.iter()
                    .zip(masses.iter())
                    .fold(Vector3::zeros(), |acc, (com, m)| acc + com * *m)
                    / total
            })
            .collect())
    }

    /// Center of mass accelerations by finite differences, one fewer than
    /// two per trial
    pub fn com_accelerations(
        &self,
        init: &DynamicsInitialization,
        trial: usize,
    ) -> FitResult<Vec<Vector3<Float>>> {
        let coms = self.com_positions(init, trial)?;
        Ok(finite_difference_accelerations(&coms, init.trial_timesteps[trial]))
    }

    /// Net external force on the center of mass implied by the motion. With
    /// `include_gravity` this is the force the ground must supply, m (a - g).
    pub fn implied_com_forces(
        &self,
        init: &DynamicsInitialization,
        trial: usize,
        include_gravity: bool,
    ) -> FitResult<Vec<Vector3<Float>>> {
        let total_mass = init.configured(&self.model).body_masses().sum();
        let accelerations = self.com_accelerations(init, trial)?;
        Ok(accelerations
            .into_iter()
            .map(|a| {
                let a = if include_gravity { a - gravity() } else { a };
                a * total_mass
            })
            .collect())
    }

    /// Sum of plate forces at every timestep that has an acceleration
    pub fn measured_grf_forces(
        &self,
        init: &DynamicsInitialization,
        trial: usize,
    ) -> FitResult<Vec<Vector3<Float>>> {
        init.check_trial(trial)?;
        let plates = init
            .force_plate_trials
            .get(trial)
            .map(|p| p.as_slice())
            .unwrap_or(&[]);
        let steps = init.pose_trials[trial].ncols().saturating_sub(2);
        Ok((0..steps)
            .map(|t| plates.iter().map(|p| p.forces[t]).sum())
            .collect())
    }

    /// Scale every group mass by one factor so that total weight matches the
    /// vertical plate forces
    pub fn scale_link_masses_from_gravity(&self, init: &mut DynamicsInitialization) -> FitResult<()> {
        let mut total_grf = 0.;
        let mut total_acc = 0.;
        for trial in 0..init.num_trials() {
            total_grf += self
                .measured_grf_forces(init, trial)?
                .iter()
                .map(|f| f.y)
                .sum::<Float>();
            total_acc += self
                .com_accelerations(init, trial)?
                .iter()
                .map(|a| a.y + GRAVITY)
                .sum::<Float>();
        }

        let current = init.configured(&self.model).body_masses().sum();
        let implied = total_grf / total_acc;
        if !implied.is_finite() || implied <= 0. || current <= 0. {
            warn!(
                "Cannot scale masses from gravity: GRF {} over accelerations {}",
                total_grf, total_acc
            );
            return Ok(());
        }

        let ratio = implied / current;
        init.group_masses *= ratio;
        info!(
            "Scaled total mass from {:.3} kg to {:.3} kg to match GRF",
            current, implied
        );
        Ok(())
    }

    /// Fit group masses, holding poses, COMs and inertias fixed, by linear
    /// least squares on Newton's law for the whole body:
    ///
    /// ```text
    /// Σ_groups m_g Σ_(b in g) (a_b - g) = Σ plate forces
    /// ```
    ///
    /// stacked over every timestep, plus `regularization_weight · (m - m0)`
    /// rows anchoring each group to its current mass.
    pub fn estimate_link_masses_from_acceleration(
        &self,
        init: &mut DynamicsInitialization,
        regularization_weight: Float,
    ) -> FitResult<()> {
        let model = init.configured(&self.model);
        let groups = model.num_scale_groups();
        let steps: usize = init.pose_trials.iter().map(|p| p.ncols().saturating_sub(2)).sum();

        let mut A = DMatrix::zeros(3 * steps + groups, groups);
        let mut b = DVector::zeros(3 * steps + groups);
        let mut cursor = 0;
        for trial in 0..init.num_trials() {
            let poses = &init.pose_trials[trial];
            let dt = init.trial_timesteps[trial];

            let mut body_paths = vec![Vec::with_capacity(poses.ncols()); model.num_bodies()];
            for t in 0..poses.ncols() {
                let coms = model.body_com_world_positions(&poses.column(t).into_owned());
                for (path, com) in body_paths.iter_mut().zip(coms) {
                    path.push(com);
                }
            }
            for (body, path) in body_paths.iter().enumerate() {
                let group = model.body_scale_group(body);
                for (t, acc) in finite_difference_accelerations(path, dt).iter().enumerate() {
                    let mut rows = A.fixed_view_mut::<3, 1>(3 * (cursor + t), group);
                    rows += acc - gravity();
                }
            }

            let forces = self.measured_grf_forces(init, trial)?;
            for (t, force) in forces.iter().enumerate() {
                b.fixed_rows_mut::<3>(3 * (cursor + t)).copy_from(force);
            }
            cursor += poses.ncols().saturating_sub(2);
        }

        let previous = init.group_masses.clone();
        for g in 0..groups {
            A[(3 * steps + g, g)] = regularization_weight;
            b[3 * steps + g] = regularization_weight * previous[g];
        }

        let solution = A
            .svd(true, true)
            .solve(&b, 1e-12)
            .map_err(|e| FitError::SingularSystem(format!("mass estimation: {}", e)))?;
        init.group_masses = solution.map(|m| m.max(MIN_GROUP_MASS));

        for g in 0..groups {
            info!(
                "Group {} mass {:.4} -> {:.4} kg ({:+.2}%)",
                g,
                previous[g],
                init.group_masses[g],
                100. * (init.group_masses[g] / previous[g] - 1.)
            );
        }
        Ok(())
    }
}
