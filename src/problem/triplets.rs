use na::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CscMatrix};

use crate::types::Float;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Triplet {
    pub row: usize,
    pub col: usize,
    pub value: Float,
}

/// A sparse matrix under construction, as (row, col, value) entries.
/// Duplicate entries are summed on assembly.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseTriplets {
    nrows: usize,
    ncols: usize,
    entries: Vec<Triplet>,
}

impl SparseTriplets {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        SparseTriplets {
            nrows,
            ncols,
            entries: vec![],
        }
    }

    pub fn push(&mut self, row: usize, col: usize, value: Float) {
        assert!(
            row < self.nrows && col < self.ncols,
            "entry ({}, {}) outside {}x{} matrix",
            row,
            col,
            self.nrows,
            self.ncols
        );
        self.entries.push(Triplet { row, col, value });
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Triplet] {
        &self.entries
    }

    pub fn to_dense(&self) -> DMatrix<Float> {
        let mut dense = DMatrix::zeros(self.nrows, self.ncols);
        for e in self.entries.iter() {
            dense[(e.row, e.col)] += e.value;
        }
        dense
    }

    pub fn to_csc(&self) -> CscMatrix<Float> {
        let mut coo = CooMatrix::new(self.nrows, self.ncols);
        for e in self.entries.iter() {
            coo.push(e.row, e.col, e.value);
        }
        CscMatrix::from(&coo)
    }

    /// J x
    pub fn mul_vector(&self, x: &DVector<Float>) -> DVector<Float> {
        assert_eq!(x.len(), self.ncols);
        let mut y = DVector::zeros(self.nrows);
        for e in self.entries.iter() {
            y[e.row] += e.value * x[e.col];
        }
        y
    }

    /// Jᵀ y
    pub fn transpose_mul_vector(&self, y: &DVector<Float>) -> DVector<Float> {
        assert_eq!(y.len(), self.nrows);
        let mut x = DVector::zeros(self.ncols);
        for e in self.entries.iter() {
            x[e.col] += e.value * y[e.row];
        }
        x
    }
}

#[cfg(test)]
mod triplets_tests {
    use na::dvector;

    use super::*;
    use crate::assert_vec_close;

    #[test]
    fn duplicates_are_summed() {
        // Arrange
        let mut J = SparseTriplets::new(2, 3);
        J.push(0, 1, 1.5);
        J.push(0, 1, 0.5);
        J.push(1, 2, -1.);

        // Act
        let dense = J.to_dense();
        let csc = J.to_csc();

        // Assert
        assert_eq!(dense[(0, 1)], 2.);
        assert_eq!(csc.nnz(), 2);
        assert_vec_close!(J.mul_vector(&dvector![1., 1., 1.]), dvector![2., -1.], 1e-12);
        assert_vec_close!(J.transpose_mul_vector(&dvector![1., 2.]), dvector![0., 2., -2.], 1e-12);
    }

    #[test]
    #[should_panic]
    fn entries_outside_the_matrix_panic() {
        let mut J = SparseTriplets::new(2, 2);
        J.push(2, 0, 1.);
    }
}
