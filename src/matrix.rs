// src/matrix.rs

use crate::comm::{all_reduce_sum_array, Communicator};
use crate::vector::Vector;
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};

/// A dense matrix whose rows are optionally distributed across ranks.
///
/// Distributed matrices (e.g. the basis `U`) hold this rank's row block.
/// Non-distributed matrices (e.g. `S`, `U'`) are small and replicated; all
/// ranks compute them identically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    data: Array2<f64>,
    distributed: bool,
}

impl Matrix {
    pub fn zeros(num_rows: usize, num_cols: usize, distributed: bool) -> Self {
        Self {
            data: Array2::zeros((num_rows, num_cols)),
            distributed,
        }
    }

    /// The replicated `n x n` identity.
    pub fn identity(n: usize) -> Self {
        Self {
            data: Array2::eye(n),
            distributed: false,
        }
    }

    pub fn from_array(data: Array2<f64>, distributed: bool) -> Self {
        Self { data, distributed }
    }

    /// Replicated square matrix with `values` on the diagonal.
    pub fn from_diagonal(values: &Array1<f64>) -> Self {
        Self {
            data: Array2::from_diag(values),
            distributed: false,
        }
    }

    /// A single-column matrix holding `column`.
    pub fn from_column(column: &Vector) -> Self {
        let data = column.as_array().clone().insert_axis(ndarray::Axis(1));
        Self {
            data,
            distributed: column.distributed(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_columns(&self) -> usize {
        self.data.ncols()
    }

    pub fn distributed(&self) -> bool {
        self.distributed
    }

    pub fn as_array(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn into_array(self) -> Array2<f64> {
        self.data
    }

    pub fn item(&self, row: usize, col: usize) -> f64 {
        self.data[[row, col]]
    }

    pub fn column(&self, col: usize) -> Vector {
        Vector::from_array(self.data.column(col).to_owned(), self.distributed)
    }

    /// The diagonal as a vector (the singular values when `self` is `S`).
    pub fn diagonal(&self) -> Array1<f64> {
        self.data.diag().to_owned()
    }

    /// `self * other`. `other` must be replicated; the product is distributed
    /// exactly when `self` is. Purely local.
    pub fn mult(&self, other: &Matrix) -> Matrix {
        assert!(!other.distributed, "Right operand of a matrix product must not be distributed.");
        assert_eq!(
            self.num_columns(),
            other.num_rows(),
            "Cannot multiply a {}x{} matrix by a {}x{} matrix.",
            self.num_rows(),
            self.num_columns(),
            other.num_rows(),
            other.num_columns()
        );
        Matrix::from_array(self.data.dot(&other.data), self.distributed)
    }

    /// `self * v` for a replicated `v`. Purely local.
    pub fn mult_vector(&self, v: &Vector) -> Vector {
        assert!(!v.distributed(), "Right operand of a matrix-vector product must not be distributed.");
        assert_eq!(self.num_columns(), v.dim(), "Matrix-vector dimension mismatch.");
        Vector::from_array(self.data.dot(v.as_array()), self.distributed)
    }

    /// `self^T * other`. When both are distributed the row blocks are reduced
    /// across ranks and the replicated result is returned on every rank.
    pub fn transpose_mult(&self, other: &Matrix, comm: &dyn Communicator) -> Matrix {
        assert_eq!(
            self.distributed, other.distributed,
            "Transpose product needs both operands distributed or both replicated."
        );
        assert_eq!(self.num_rows(), other.num_rows(), "Transpose product row mismatch.");
        let mut local = self.data.t().dot(&other.data);
        if self.distributed {
            all_reduce_sum_array(comm, &mut local);
        }
        Matrix::from_array(local, false)
    }

    /// `self^T * v`, reduced across ranks when distributed. The result is replicated.
    pub fn transpose_mult_vector(&self, v: &Vector, comm: &dyn Communicator) -> Vector {
        assert_eq!(
            self.distributed,
            v.distributed(),
            "Transpose product needs both operands distributed or both replicated."
        );
        assert_eq!(self.num_rows(), v.dim(), "Transpose product row mismatch.");
        let mut local = self.data.t().dot(v.as_array());
        if self.distributed {
            all_reduce_sum_array(comm, &mut local);
        }
        Vector::from_array(local, false)
    }

    /// Returns `[self | column]`.
    pub fn with_appended_column(&self, column: &Vector) -> Matrix {
        assert_eq!(self.num_rows(), column.dim(), "Appended column has the wrong length.");
        assert_eq!(self.distributed, column.distributed(), "Appended column has the wrong distribution.");
        let mut data = Array2::zeros((self.num_rows(), self.num_columns() + 1));
        data.slice_mut(s![.., ..self.num_columns()]).assign(&self.data);
        data.column_mut(self.num_columns()).assign(column.as_array());
        Matrix::from_array(data, self.distributed)
    }

    /// Embeds a replicated `n x n` matrix in the top-left of an `(n+1) x (n+1)`
    /// matrix with a `1` in the new diagonal slot.
    pub fn bordered_with_unit_diagonal(&self) -> Matrix {
        assert!(!self.distributed, "Only replicated matrices can be bordered.");
        let (rows, cols) = self.data.dim();
        let mut data = Array2::zeros((rows + 1, cols + 1));
        data.slice_mut(s![..rows, ..cols]).assign(&self.data);
        data[[rows, cols]] = 1.0;
        Matrix::from_array(data, false)
    }

    /// Copy of the leading `n x n` block of a replicated matrix.
    pub fn leading_block(&self, n: usize) -> Matrix {
        assert!(!self.distributed, "Only replicated matrices have a leading block.");
        Matrix::from_array(self.data.slice(s![..n, ..n]).to_owned(), false)
    }

    /// `max |self^T self - I|`. Collective when distributed.
    pub fn orthogonality_error(&self, comm: &dyn Communicator) -> f64 {
        let gram = self.transpose_mult(self, comm);
        gram.data
            .indexed_iter()
            .map(|((i, j), &g)| if i == j { (g - 1.0).abs() } else { g.abs() })
            .fold(0.0, f64::max)
    }

    /// Modified Gram-Schmidt with one re-orthogonalization pass, in place.
    /// Collective when distributed: every rank performs the same sequence of reductions.
    pub fn orthogonalize(&mut self, comm: &dyn Communicator) {
        let num_cols = self.num_columns();
        for j in 0..num_cols {
            for _pass in 0..2 {
                for i in 0..j {
                    let col_i = self.data.column(i).to_owned();
                    let mut dot = [col_i.dot(&self.data.column(j))];
                    if self.distributed {
                        comm.all_reduce_sum(&mut dot);
                    }
                    self.data.column_mut(j).scaled_add(-dot[0], &col_i);
                }
            }
            let mut norm_sq = [self.data.column(j).dot(&self.data.column(j))];
            if self.distributed {
                comm.all_reduce_sum(&mut norm_sq);
            }
            let norm = norm_sq[0].sqrt();
            if norm > 0.0 {
                self.data.column_mut(j).mapv_inplace(|x| x / norm);
            }
        }
    }

    /// Re-orthogonalizes when the orthogonality error exceeds `tolerance`.
    /// Returns whether it did.
    pub fn reorthogonalize_if_needed(&mut self, tolerance: f64, comm: &dyn Communicator) -> bool {
        if self.orthogonality_error(comm) > tolerance {
            self.orthogonalize(comm);
            true
        } else {
            false
        }
    }
}

/// Orthogonality drift allowed before re-orthogonalizing a basis of `num_cols`
/// columns in a space of `global_dim` rows.
pub fn reorthogonalization_tolerance(global_dim: usize, num_cols: usize) -> f64 {
    f64::EPSILON * global_dim.max(num_cols) as f64
}
