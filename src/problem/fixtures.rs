use std::collections::HashMap;

use na::{dvector, vector, DMatrix, Vector3};

use crate::{
    dynamics_model::{DynamicsModel, Marker, MarkerMap},
    fitter::initialization::DynamicsInitialization,
    helpers::build_floating_pendulum,
    skeleton::Skeleton,
    types::Float,
    util::test_utils::{random_dvector, random_vector},
};

pub const DT: Float = 0.01;

/// A floating pendulum with one short trial carrying noisy markers, joint
/// centers, a GRF on the torso and parameters moved away from their
/// originals, so every loss term is active.
pub fn pendulum_initialization(timesteps: usize) -> (Skeleton, DynamicsInitialization) {
    let mut rng = rand::rng();
    let skeleton = build_floating_pendulum(5.);
    let torso = skeleton.body_index("torso").unwrap();
    let arm = skeleton.body_index("arm").unwrap();
    let n = skeleton.num_dofs();

    let base = random_dvector(&mut rng, n, 0.3);
    let rate = random_dvector(&mut rng, n, 1.0);
    let poses = DMatrix::from_fn(n, timesteps, |i, t| {
        let s = t as Float * DT;
        base[i] + rate[i] * s + 0.2 * (3. * s + i as Float).sin()
    });

    let mut marker_map = MarkerMap::new();
    marker_map.insert("arm_tip".into(), Marker::new(arm, vector![0., -0.3, 0.02]));
    marker_map.insert("torso_a".into(), Marker::new(torso, vector![0.1, 0.2, 0.05]));
    marker_map.insert("torso_b".into(), Marker::new(torso, vector![-0.1, 0., 0.1]));
    let names: Vec<String> = marker_map.keys().cloned().collect();
    let markers: Vec<Marker> = marker_map.values().cloned().collect();

    let mut observations = vec![];
    let mut joint_centers = DMatrix::zeros(3, timesteps);
    let mut joint_axis = DMatrix::zeros(6, timesteps);
    for t in 0..timesteps {
        let q = poses.column(t).into_owned();
        let positions = skeleton.marker_world_positions(&q, &markers);
        let mut frame = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            if t == 2 && name == "arm_tip" {
                continue;
            }
            let observed: Vector3<Float> =
                positions.fixed_rows::<3>(3 * i).into_owned() + random_vector(&mut rng, 0.01);
            frame.insert(name.clone(), observed);
        }
        observations.push(frame);

        let center = skeleton.joint_world_positions(&q, &[arm]);
        let center = Vector3::new(center[0], center[1], center[2]);
        joint_centers
            .fixed_view_mut::<3, 1>(0, t)
            .copy_from(&(center + random_vector(&mut rng, 0.01)));
        joint_axis
            .fixed_view_mut::<3, 1>(0, t)
            .copy_from(&(center + random_vector(&mut rng, 0.05)));
        joint_axis
            .fixed_view_mut::<3, 1>(3, t)
            .copy_from(&vector![0.1, 1., 0.2]);
    }

    let mut grf = DMatrix::from_fn(6, timesteps, |_, _| 0.);
    for t in 0..timesteps {
        let noise = random_dvector(&mut rng, 6, 5.);
        grf.set_column(t, &(noise + dvector![0., 0., 0., 0., 60., 0.]));
    }

    let mut missing = vec![false; timesteps];
    missing[1] = true;

    let mut init = DynamicsInitialization {
        pose_trials: vec![poses.clone()],
        original_pose_trials: vec![poses.add_scalar(0.01)],
        trial_timesteps: vec![DT],
        marker_observation_trials: vec![observations],
        grf_bodies: vec![torso],
        grf_trials: vec![grf],
        probably_missing_grf: vec![missing],
        joints: vec![arm],
        joint_weights: dvector![1.0],
        axis_weights: dvector![0.5],
        joint_centers: vec![joint_centers],
        joint_axis: vec![joint_axis],
        tracking_markers: vec!["torso_b".into()],
        original_marker_offsets: marker_map
            .iter()
            .map(|(name, m)| (name.clone(), m.offset + vector![0.01, -0.02, 0.005]))
            .collect(),
        marker_map,
        ..Default::default()
    };
    init.capture_parameters(&skeleton);
    init.group_masses *= 1.1;
    init.group_coms.add_scalar_mut(0.01);
    init.group_inertias *= 1.05;
    init.group_scales *= 1.02;

    (skeleton, init)
}
