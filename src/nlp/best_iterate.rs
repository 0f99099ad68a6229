use na::DVector;

use crate::types::Float;

use super::IterationStats;

/// Iterates more infeasible than this are never kept
pub const MAX_BEST_INFEASIBILITY: Float = 1.0;

#[derive(Clone, Debug, PartialEq)]
pub struct BestIterate {
    pub iteration: usize,
    pub objective: Float,
    pub x: DVector<Float>,
}

/// Keeps the lowest-objective iterate among those that are close enough to
/// feasible.
#[derive(Clone, Debug, Default)]
pub struct BestIterateTracker {
    best: Option<BestIterate>,
}

impl BestIterateTracker {
    pub fn new() -> Self {
        BestIterateTracker { best: None }
    }

    /// Returns true when `x` became the new best iterate
    pub fn record(&mut self, stats: &IterationStats, x: &DVector<Float>) -> bool {
        if stats.inf_pr.abs() >= MAX_BEST_INFEASIBILITY || stats.objective.is_nan() {
            return false;
        }
        let improves = match &self.best {
            Some(best) => stats.objective < best.objective,
            None => true,
        };
        if improves {
            self.best = Some(BestIterate {
                iteration: stats.iteration,
                objective: stats.objective,
                x: x.clone(),
            });
        }
        improves
    }

    pub fn best(&self) -> Option<&BestIterate> {
        self.best.as_ref()
    }

    pub fn reset(&mut self) {
        self.best = None;
    }
}

#[cfg(test)]
mod best_iterate_tests {
    use na::dvector;

    use super::*;

    fn stats(iteration: usize, objective: Float, inf_pr: Float) -> IterationStats {
        IterationStats {
            iteration,
            objective,
            inf_pr,
            d_norm: 0.,
            alpha: 1.,
        }
    }

    #[test]
    fn keeps_lowest_feasible_objective() {
        // Arrange
        let mut tracker = BestIterateTracker::new();

        // Act
        tracker.record(&stats(0, 5., 0.5), &dvector![0.]);
        tracker.record(&stats(1, 1., 3.0), &dvector![1.]);
        tracker.record(&stats(2, 2., 0.1), &dvector![2.]);
        tracker.record(&stats(3, 4., 0.0), &dvector![3.]);

        // Assert
        let best = tracker.best().unwrap();
        assert_eq!(best.iteration, 2);
        assert_eq!(best.objective, 2.);
        assert_eq!(best.x, dvector![2.]);
    }

    #[test]
    fn nothing_recorded_when_always_infeasible() {
        let mut tracker = BestIterateTracker::new();
        assert!(!tracker.record(&stats(0, 1., 1.0), &dvector![0.]));
        assert!(tracker.best().is_none());
    }
}
