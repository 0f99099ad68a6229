//! Error types for dynamics fitting.

use thiserror::Error;

/// Errors that can occur while building or solving a dynamics fit.
#[derive(Debug, Error)]
pub enum FitError {
    /// The contact heuristic has not produced missing-GRF flags for every
    /// trial.
    #[error(
        "missing-GRF flags computed for {computed} of {trials} trials, \
         call estimate_foot_ground_contacts first"
    )]
    MissingGrfFlags {
        /// Trials with flags.
        computed: usize,
        /// Trials in the initialization.
        trials: usize,
    },

    /// A loss term evaluated to NaN.
    #[error("NaN in loss term: {term}")]
    NanInLoss {
        /// Name of the offending term.
        term: String,
    },

    /// A trial index past the end of the initialization.
    #[error("trial {trial} out of range, initialization has {trials} trials")]
    TrialOutOfRange {
        /// The requested trial.
        trial: usize,
        /// Number of trials.
        trials: usize,
    },

    /// Malformed construction input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A factorization or linear solve failed.
    #[error("singular system: {0}")]
    SingularSystem(String),
}

impl FitError {
    /// Creates an invalid input error.
    #[must_use]
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }

    /// Creates a NaN-in-loss error.
    #[must_use]
    pub fn nan_in(term: impl Into<String>) -> Self {
        Self::NanInLoss { term: term.into() }
    }
}

/// Result type for dynamics fitting.
pub type FitResult<T> = Result<T, FitError>;

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn missing_flags_message_names_the_fix() {
        let err = FitError::MissingGrfFlags {
            computed: 0,
            trials: 2,
        };
        assert!(err.to_string().contains("estimate_foot_ground_contacts"));
    }
}
