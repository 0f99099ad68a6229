pub mod spatial_vector;
pub mod wrench;
