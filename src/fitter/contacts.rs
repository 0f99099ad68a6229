use std::collections::VecDeque;

use log::{debug, info};
use na::{vector, DMatrix, Vector3};

use crate::{
    dynamics_model::DynamicsModel,
    force_plate::ForcePlate,
    geometry::{convex_polygon_contains, sort_convex_corners},
    types::Float,
};

use super::{initialization::DynamicsInitialization, DynamicsFitter};

/// A GRF body whose wrench has a squared norm above this is carrying load
const FORCE_ACTIVE_THRESHOLD: Float = 1e-3;

/// Padding added on every side of the plate synthesized from centers of
/// pressure
const DEFAULT_PLATE_PADDING: Float = 0.10;

const FLAT_GROUND_TOLERANCE: Float = 1e-8;

/// Starting contact sphere radius, so a body resting on the ground touches
/// it even when its GRF body is never loaded
const CONTACT_TOLERANCE: Float = 0.01;

fn force_active(grf: &DMatrix<Float>, body: usize, t: usize) -> bool {
    grf.fixed_view::<6, 1>(6 * body, t).norm_squared() > FORCE_ACTIVE_THRESHOLD
}

/// Ground height and flatness from plate corners, else the lowest center of
/// pressure. With no plate data at all the ground is at 0.
fn ground_from_plates(plates: &[ForcePlate], timesteps: usize) -> (Float, bool) {
    let mut corners = plates.iter().flat_map(|p| p.corners.iter());
    if let Some(first) = corners.next() {
        let flat = corners.all(|c| (c.y - first.y).abs() < FLAT_GROUND_TOLERANCE);
        return (first.y, flat);
    }

    let lowest = plates
        .iter()
        .flat_map(|p| p.centers_of_pressure.iter().take(timesteps))
        .map(|cop| cop.y)
        .min_by(|a, b| a.total_cmp(b));
    (lowest.unwrap_or(0.), true)
}

/// A rectangle around every center of pressure, needed when some plate has
/// no recorded outline. Empty otherwise.
fn default_plate_corners(
    plates: &[ForcePlate],
    timesteps: usize,
    ground_height: Float,
) -> Vec<Vector3<Float>> {
    if plates.iter().all(|p| !p.corners.is_empty()) {
        return vec![];
    }
    let (mut min_x, mut max_x) = (Float::INFINITY, Float::NEG_INFINITY);
    let (mut min_z, mut max_z) = (Float::INFINITY, Float::NEG_INFINITY);
    for cop in plates
        .iter()
        .flat_map(|p| p.centers_of_pressure.iter().take(timesteps))
    {
        min_x = min_x.min(cop.x);
        max_x = max_x.max(cop.x);
        min_z = min_z.min(cop.z);
        max_z = max_z.max(cop.z);
    }
    if !min_x.is_finite() {
        return vec![];
    }
    min_x -= DEFAULT_PLATE_PADDING;
    max_x += DEFAULT_PLATE_PADDING;
    min_z -= DEFAULT_PLATE_PADDING;
    max_z += DEFAULT_PLATE_PADDING;

    let mut corners = vec![
        vector![min_x, ground_height, min_z],
        vector![min_x, ground_height, max_z],
        vector![max_x, ground_height, max_z],
        vector![max_x, ground_height, min_z],
    ];
    sort_convex_corners(&mut corners);
    corners
}

impl<M: DynamicsModel> DynamicsFitter<M> {
    /// Each GRF body together with its descendants, stopping at other GRF
    /// bodies. Breadth-first, so the GRF body itself comes first.
    pub fn contact_bodies(&self, grf_bodies: &[usize]) -> Vec<Vec<usize>> {
        grf_bodies
            .iter()
            .map(|&root| {
                let mut bodies = vec![];
                let mut queue = VecDeque::from([root]);
                while let Some(body) = queue.pop_front() {
                    bodies.push(body);
                    queue.extend(
                        self.model
                            .body_children(body)
                            .into_iter()
                            .filter(|child| !grf_bodies.contains(child)),
                    );
                }
                bodies
            })
            .collect()
    }

    /// Guess, for every timestep, whether a foot touches the ground somewhere
    /// the force plates cannot see. Such timesteps are flagged in
    /// `probably_missing_grf` and left out of the residual loss.
    ///
    /// Every contact body carries a sphere that grows just enough to touch
    /// the ground on each frame where its GRF body is loaded. A frame is
    /// suspicious when a sphere touches the ground, no force is measured,
    /// and no contact body stands over a plate.
    pub fn estimate_foot_ground_contacts(&self, init: &mut DynamicsInitialization) {
        let model = init.configured(&self.model);
        init.contact_bodies = self.contact_bodies(&init.grf_bodies);
        init.probably_missing_grf.clear();
        init.ground_height.clear();
        init.flat_ground.clear();
        init.default_force_plate_corners.clear();
        init.grf_body_contact_sphere_radius.clear();
        init.grf_body_force_active.clear();
        init.grf_body_sphere_in_contact.clear();
        init.grf_body_off_force_plate.clear();

        let no_plates = vec![];
        for trial in 0..init.num_trials() {
            let poses = &init.pose_trials[trial];
            let grf = &init.grf_trials[trial];
            let plates = init.force_plate_trials.get(trial).unwrap_or(&no_plates);
            let T = poses.ncols();

            let (ground_height, flat) = ground_from_plates(plates, T);

            // Heights of every contact body above the ground, [t][grf body][contact body]
            let heights: Vec<Vec<Vec<(Vector3<Float>, Float)>>> = (0..T)
                .map(|t| {
                    let transforms = model.body_world_transforms(&poses.column(t).into_owned());
                    init.contact_bodies
                        .iter()
                        .map(|bodies| {
                            bodies
                                .iter()
                                .map(|&b| {
                                    let p = transforms[b].translation.vector;
                                    (p, p.y - ground_height)
                                })
                                .collect()
                        })
                        .collect()
                })
                .collect();

            let mut radii: Vec<Vec<Float>> =
                init.contact_bodies.iter().map(|b| vec![CONTACT_TOLERANCE; b.len()]).collect();
            for (t, frame) in heights.iter().enumerate() {
                for (b, bodies) in frame.iter().enumerate() {
                    if !force_active(grf, b, t) {
                        continue;
                    }
                    let closest = bodies
                        .iter()
                        .enumerate()
                        .min_by(|x, y| x.1 .1.total_cmp(&y.1 .1));
                    if let Some((c, &(_, dist))) = closest {
                        if dist > radii[b][c] {
                            radii[b][c] = dist;
                        }
                    }
                }
            }

            let default_corners = default_plate_corners(plates, T, ground_height);
            let mut outlines: Vec<Vec<Vector3<Float>>> = plates
                .iter()
                .filter(|p| !p.corners.is_empty())
                .map(|p| {
                    let mut corners = p.corners.clone();
                    sort_convex_corners(&mut corners);
                    corners
                })
                .collect();
            if !default_corners.is_empty() {
                outlines.push(default_corners.clone());
            }
            let over_a_plate =
                |p: &Vector3<Float>| outlines.iter().any(|o| convex_polygon_contains(p, o));

            let mut trial_active = Vec::with_capacity(T);
            let mut trial_in_contact = Vec::with_capacity(T);
            let mut trial_off_plate = Vec::with_capacity(T);
            let mut trial_missing = Vec::with_capacity(T);
            for (t, frame) in heights.iter().enumerate() {
                let mut active = vec![];
                let mut in_contact = vec![];
                let mut off_plate = vec![];
                for (b, bodies) in frame.iter().enumerate() {
                    let loaded = force_active(grf, b, t);
                    let touching = bodies
                        .iter()
                        .zip(radii[b].iter())
                        .any(|((_, dist), radius)| dist < radius);
                    let unmeasured =
                        touching && !loaded && !bodies.iter().any(|(p, _)| over_a_plate(p));
                    active.push(loaded);
                    in_contact.push(touching);
                    off_plate.push(unmeasured);
                }
                trial_missing.push(off_plate.iter().any(|off| *off));
                trial_active.push(active);
                trial_in_contact.push(in_contact);
                trial_off_plate.push(off_plate);
            }

            let missing = trial_missing.iter().filter(|m| **m).count();
            info!(
                "Trial {}: ground at {:.4} m ({}), {} of {} timesteps probably missing GRF",
                trial,
                ground_height,
                if flat { "flat" } else { "uneven" },
                missing,
                T
            );
            debug!("Trial {} contact sphere radii: {:?}", trial, radii);

            init.ground_height.push(ground_height);
            init.flat_ground.push(flat);
            init.default_force_plate_corners.push(default_corners);
            init.grf_body_contact_sphere_radius.push(radii);
            init.grf_body_force_active.push(trial_active);
            init.grf_body_sphere_in_contact.push(trial_in_contact);
            init.grf_body_off_force_plate.push(trial_off_plate);
            init.probably_missing_grf.push(trial_missing);
        }
    }
}

#[cfg(test)]
mod contacts_tests {
    use na::Vector6;

    use super::*;
    use crate::{
        assert_close,
        helpers::{build_floating_box, build_walker},
        skeleton::Skeleton,
    };

    fn square_plate(corners: Vec<Vector3<Float>>, timesteps: usize) -> ForcePlate {
        ForcePlate {
            corners,
            centers_of_pressure: vec![Vector3::zeros(); timesteps],
            forces: vec![Vector3::zeros(); timesteps],
            moments: vec![Vector3::zeros(); timesteps],
            ..Default::default()
        }
    }

    /// A box at each of `positions`, loaded on the frames in `loaded`
    fn box_trial(
        positions: &[Vector3<Float>],
        loaded: &[bool],
        plate: ForcePlate,
    ) -> (Skeleton, DynamicsInitialization) {
        let skeleton = build_floating_box(5.);
        let T = positions.len();
        let poses = DMatrix::from_fn(6, T, |i, t| if i < 3 { positions[t][i] } else { 0. });
        let mut grf = DMatrix::zeros(6, T);
        for (t, on) in loaded.iter().enumerate() {
            if *on {
                grf.set_column(t, &Vector6::new(0., 0., 0., 0., 50., 0.));
            }
        }
        let mut init = DynamicsInitialization {
            pose_trials: vec![poses],
            grf_trials: vec![grf],
            grf_bodies: vec![0],
            force_plate_trials: vec![vec![plate]],
            trial_timesteps: vec![0.01],
            ..Default::default()
        };
        init.capture_parameters(&skeleton);
        (skeleton, init)
    }

    fn unit_corners(height: Float) -> Vec<Vector3<Float>> {
        vec![
            vector![0., height, 0.],
            vector![1., height, 1.],
            vector![0., height, 1.],
            vector![1., height, 0.],
        ]
    }

    #[test]
    fn steps_off_the_plate_are_flagged() {
        // Arrange
        let positions = [
            vector![0.5, 0.2, 0.5],
            vector![0.5, 0.1, 0.5],
            vector![2., 0.1, 0.5],
            vector![0.5, 1., 0.5],
        ];
        let (skeleton, mut init) = box_trial(
            &positions,
            &[true, false, false, false],
            square_plate(unit_corners(0.), 4),
        );
        let fitter = DynamicsFitter::new(skeleton);

        // Act
        fitter.estimate_foot_ground_contacts(&mut init);

        // Assert
        assert_close!(init.grf_body_contact_sphere_radius[0][0][0], 0.2, 1e-12);
        assert_eq!(init.probably_missing_grf[0], vec![false, false, true, false]);
        assert_eq!(init.grf_body_force_active[0][0], vec![true]);
        assert_eq!(init.grf_body_sphere_in_contact[0][1], vec![true]);
        assert_eq!(init.grf_body_sphere_in_contact[0][3], vec![false]);
        assert_eq!(init.ground_height, vec![0.]);
        assert_eq!(init.flat_ground, vec![true]);
        assert!(init.default_force_plate_corners[0].is_empty());
        assert!(init.has_missing_grf_flags());
    }

    #[test]
    fn plates_without_outline_get_a_padded_default() {
        // Arrange
        let positions = [
            vector![0., 0.3, 0.],
            vector![0.25, 0.1, 0.],
            vector![0.5, 0.1, 0.],
        ];
        let mut plate = square_plate(vec![], 3);
        plate.centers_of_pressure = vec![
            vector![0., 0.05, 0.],
            vector![0.2, 0.02, 0.1],
            vector![0.1, 0.04, 0.],
        ];
        let (skeleton, mut init) = box_trial(&positions, &[true, false, false], plate);
        let fitter = DynamicsFitter::new(skeleton);

        // Act
        fitter.estimate_foot_ground_contacts(&mut init);

        // Assert
        assert_close!(init.ground_height[0], 0.02, 1e-12);
        let corners = &init.default_force_plate_corners[0];
        assert_eq!(corners.len(), 4);
        let min_x = corners.iter().map(|c| c.x).fold(Float::INFINITY, Float::min);
        let max_z = corners.iter().map(|c| c.z).fold(Float::NEG_INFINITY, Float::max);
        assert_close!(min_x, -0.1, 1e-12);
        assert_close!(max_z, 0.2, 1e-12);
        assert!(corners.iter().all(|c| c.y == 0.02));
        assert_eq!(init.probably_missing_grf[0], vec![false, false, true]);
    }

    #[test]
    fn uneven_plates_are_not_flat() {
        let mut corners = unit_corners(0.);
        corners[1].y = 0.01;
        let positions = [vector![0.5, 0.5, 0.5]; 3];
        let (skeleton, mut init) = box_trial(&positions, &[false; 3], square_plate(corners, 3));
        let fitter = DynamicsFitter::new(skeleton);

        fitter.estimate_foot_ground_contacts(&mut init);

        assert_eq!(init.flat_ground, vec![false]);
        assert_eq!(init.probably_missing_grf[0], vec![false; 3]);
    }

    #[test]
    fn resting_off_every_plate_is_always_flagged() {
        // Arrange
        let positions = [vector![3., 0., 3.]; 5];
        let (skeleton, mut init) =
            box_trial(&positions, &[false; 5], square_plate(unit_corners(0.), 5));
        let fitter = DynamicsFitter::new(skeleton);

        // Act
        fitter.estimate_foot_ground_contacts(&mut init);

        // Assert
        assert_eq!(init.probably_missing_grf[0], vec![true; 5]);
        assert_close!(init.grf_body_contact_sphere_radius[0][0][0], CONTACT_TOLERANCE, 1e-12);
    }

    #[test]
    fn rerunning_replaces_previous_results() {
        let positions = [vector![0.5, 0.2, 0.5], vector![2., 0.1, 0.5], vector![0.5, 0.2, 0.5]];
        let (skeleton, mut init) = box_trial(
            &positions,
            &[true, false, true],
            square_plate(unit_corners(0.), 3),
        );
        let fitter = DynamicsFitter::new(skeleton);

        fitter.estimate_foot_ground_contacts(&mut init);
        fitter.estimate_foot_ground_contacts(&mut init);

        assert_eq!(init.probably_missing_grf.len(), 1);
        assert_eq!(init.contact_bodies, vec![vec![0]]);
        assert_eq!(init.probably_missing_grf[0], vec![false, true, false]);
    }

    #[test]
    fn contact_bodies_stop_at_other_grf_bodies() {
        // Arrange
        let skeleton = build_walker();
        let pelvis = skeleton.body_index("pelvis").unwrap();
        let shank = skeleton.body_index("left_shank").unwrap();
        let foot = skeleton.body_index("left_foot").unwrap();
        let fitter = DynamicsFitter::new(skeleton);

        // Act
        let bodies = fitter.contact_bodies(&[shank, foot]);
        let everything = fitter.contact_bodies(&[pelvis]);

        // Assert
        assert_eq!(bodies, vec![vec![shank], vec![foot]]);
        assert_eq!(everything[0].len(), 7);
        assert_eq!(everything[0][0], pelvis);
    }
}
