use na::{DMatrix, DVector};
use nalgebra_sparse::{factorization::CscCholesky, CooMatrix, CscMatrix};

use crate::{
    error::{FitError, FitResult},
    types::Float,
};

/// Finite-difference jerk stencil over four consecutive samples
const JERK_STAMP: [Float; 4] = [-1., 3., -3., 1.];

/// Removes jerk from time series of equal length. Each row is smoothed
/// independently by solving
///
/// ```text
/// min_x  |S x|² + r² |x - s|²
/// ```
///
/// where S stacks the weighted jerk stencils and r is the regularization
/// weight. The normal equations (SᵀS + r²I) x = r² s are factored once.
pub struct AccelerationSmoother {
    timesteps: usize,
    smoothing_weight: Float,
    regularization_weight: Float,
    factorization: Option<CscCholesky<Float>>,
}

impl AccelerationSmoother {
    pub fn new(
        timesteps: usize,
        smoothing_weight: Float,
        regularization_weight: Float,
    ) -> FitResult<Self> {
        let factorization = if timesteps == 0 {
            None
        } else {
            let r2 = regularization_weight * regularization_weight;
            let mut normal = CooMatrix::new(timesteps, timesteps);
            for i in 0..timesteps.saturating_sub(3) {
                for a in 0..4 {
                    for b in 0..4 {
                        let w2 = smoothing_weight * smoothing_weight;
                        normal.push(i + a, i + b, w2 * JERK_STAMP[a] * JERK_STAMP[b]);
                    }
                }
            }
            for i in 0..timesteps {
                normal.push(i, i, r2);
            }
            let factor = CscCholesky::factor(&CscMatrix::from(&normal)).map_err(|e| {
                FitError::SingularSystem(format!(
                    "smoother over {} timesteps with regularization {}: {:?}",
                    timesteps, regularization_weight, e
                ))
            })?;
            Some(factor)
        };

        Ok(AccelerationSmoother {
            timesteps,
            smoothing_weight,
            regularization_weight,
            factorization,
        })
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    /// Smooth every row of `series` (rows × timesteps). Constant rows, such
    /// as locked joints, are copied unchanged.
    pub fn smooth(&self, series: &DMatrix<Float>) -> DMatrix<Float> {
        assert_eq!(series.ncols(), self.timesteps, "series length mismatch");
        let mut smoothed = series.clone();
        let Some(factorization) = &self.factorization else {
            return smoothed;
        };

        let r2 = self.regularization_weight * self.regularization_weight;
        for row in 0..series.nrows() {
            let values = series.row(row);
            if values.max() == values.min() {
                continue;
            }
            let rhs = DVector::from_iterator(self.timesteps, values.iter().map(|v| v * r2));
            let solution = factorization.solve(&rhs);
            for t in 0..self.timesteps {
                smoothed[(row, t)] = solution[(t, 0)];
            }
        }
        smoothed
    }

    /// The objective minimized by `smooth`, summed over rows
    pub fn loss(&self, series: &DMatrix<Float>, original: &DMatrix<Float>) -> Float {
        let mut loss = 0.;
        for row in 0..series.nrows() {
            for i in 0..self.timesteps.saturating_sub(3) {
                let jerk: Float = (0..4).map(|j| JERK_STAMP[j] * series[(row, i + j)]).sum();
                loss += (self.smoothing_weight * jerk).powi(2);
            }
            for t in 0..self.timesteps {
                loss += (self.regularization_weight * (series[(row, t)] - original[(row, t)])).powi(2);
            }
        }
        loss
    }
}
