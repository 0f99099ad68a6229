use na::Vector3;

use crate::{
    spatial::wrench::{self, Wrench},
    types::Float,
};

/// Force plate recordings, already converted to world frame and SI units.
/// `centers_of_pressure`, `forces` and `moments` hold one entry per timestep;
/// moments are free moments about the center of pressure.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ForcePlate {
    /// Plate outline on the ground, may be empty if unknown
    pub corners: Vec<Vector3<Float>>,
    pub world_origin: Vector3<Float>,
    pub centers_of_pressure: Vec<Vector3<Float>>,
    pub forces: Vec<Vector3<Float>>,
    pub moments: Vec<Vector3<Float>>,
}

impl ForcePlate {
    pub fn num_timesteps(&self) -> usize {
        self.forces.len()
    }

    /// Wrench about the world origin at timestep t
    pub fn wrench_at(&self, t: usize) -> Wrench {
        wrench::from_plate_reading(&self.centers_of_pressure[t], &self.forces[t], &self.moments[t])
    }
}
