// src/fast_update.rs

//! Brand's fast update.
//!
//! The basis is stored as `U = U_raw * U'`, where `U_raw` is the distributed
//! matrix of columns appended so far and `U'` is a small replicated rotation.
//! An update only touches `U'` (k x k work, no communication) plus, for a new
//! direction, one appended column of `U_raw`. The `dim x k` product, and the
//! drift check on the distributed columns, happen only when the basis is
//! requested.

use crate::comm::Communicator;
use crate::incremental_svd::{StrategyState, UpdateStrategy};
use crate::linalg_backends::{BackendQR, LinAlgBackendProvider};
use crate::matrix::{reorthogonalization_tolerance, Matrix};
use crate::vector::Vector;
use crate::ThreadSafeStdError;
use log::warn;
use ndarray::Axis;

#[derive(Debug)]
pub struct FastUpdate {
    global_dim: usize,
    /// Raw basis columns, `dim x k`, distributed.
    u: Matrix,
    /// Accumulated rotation `U'`, `k x k`, replicated.
    u_prime: Matrix,
    /// False when `U'` is exactly the identity.
    rotation_pending: bool,
    backend: LinAlgBackendProvider<f64>,
}

impl FastUpdate {
    pub fn new(dim: usize, global_dim: usize) -> Self {
        Self {
            global_dim,
            u: Matrix::zeros(dim, 0, true),
            u_prime: Matrix::identity(0),
            rotation_pending: false,
            backend: LinAlgBackendProvider::new(),
        }
    }

    /// The pending rotation `U'`.
    pub fn rotation(&self) -> &Matrix {
        &self.u_prime
    }

    /// Replaces a drifted `U'` by the Q factor of its QR decomposition, with
    /// column signs chosen so that `Q` stays close to `U'`.
    fn reorthogonalize_rotation(&mut self, comm: &dyn Communicator) -> Result<(), ThreadSafeStdError> {
        let k = self.u_prime.num_columns();
        let tolerance = reorthogonalization_tolerance(self.global_dim, k);
        let error = self.u_prime.orthogonality_error(comm);
        if error <= tolerance {
            return Ok(());
        }
        warn!("Re-orthogonalizing U' (orthogonality error {:.3e} > {:.3e}).", error, tolerance);
        let mut q = self.backend.qr_q_factor(self.u_prime.as_array())?;
        let alignment = q.t().dot(self.u_prime.as_array());
        for (i, mut column) in q.axis_iter_mut(Axis(1)).enumerate() {
            if alignment[[i, i]] < 0.0 {
                column.mapv_inplace(|x| -x);
            }
        }
        self.u_prime = Matrix::from_array(q, false);
        Ok(())
    }

    fn reorthogonalize_columns(&mut self, comm: &dyn Communicator) {
        let tolerance = reorthogonalization_tolerance(self.global_dim, self.u.num_columns());
        if self.u.reorthogonalize_if_needed(tolerance, comm) {
            warn!("Re-orthogonalized the raw basis columns.");
        }
    }
}

impl UpdateStrategy for FastUpdate {
    fn name(&self) -> &'static str {
        "fast update"
    }

    fn rank(&self) -> usize {
        self.u.num_columns()
    }

    fn build_initial_svd(&mut self, first_column: Vector) {
        self.u = Matrix::from_column(&first_column);
        self.u_prime = Matrix::identity(1);
        self.rotation_pending = false;
    }

    fn project(&self, sample: &Vector, comm: &dyn Communicator) -> Vector {
        let raw = self.u.transpose_mult_vector(sample, comm);
        self.u_prime.transpose_mult_vector(&raw, comm)
    }

    fn expand(&self, coefficients: &Vector) -> Vector {
        self.u.mult_vector(&self.u_prime.mult_vector(coefficients))
    }

    fn add_linearly_dependent_sample(
        &mut self,
        a: &Matrix,
        comm: &dyn Communicator,
    ) -> Result<(), ThreadSafeStdError> {
        self.u_prime = self.u_prime.mult(a);
        self.rotation_pending = true;
        self.reorthogonalize_rotation(comm)
    }

    fn add_new_sample(
        &mut self,
        j: &Vector,
        a: &Matrix,
        comm: &dyn Communicator,
    ) -> Result<(), ThreadSafeStdError> {
        self.u = self.u.with_appended_column(j);
        self.u_prime = self.u_prime.bordered_with_unit_diagonal().mult(a);
        self.rotation_pending = true;
        self.reorthogonalize_rotation(comm)
    }

    fn compute_basis(&mut self, comm: &dyn Communicator) -> &Matrix {
        if self.rotation_pending {
            self.u = self.u.mult(&self.u_prime);
            self.u_prime = Matrix::identity(self.u.num_columns());
            self.rotation_pending = false;
            self.reorthogonalize_columns(comm);
        }
        &self.u
    }

    fn save(&self) -> StrategyState {
        StrategyState {
            u: self.u.clone(),
            u_prime: Some(self.u_prime.clone()),
        }
    }

    fn restore(&mut self, state: StrategyState) -> Result<(), ThreadSafeStdError> {
        let u_prime = state.u_prime.ok_or("Saved fast-update state has no U' matrix.")?;
        if u_prime.num_rows() != state.u.num_columns() || u_prime.num_columns() != state.u.num_columns() {
            return Err(format!(
                "Saved U' is {}x{} but the basis has {} columns.",
                u_prime.num_rows(),
                u_prime.num_columns(),
                state.u.num_columns()
            )
            .into());
        }
        self.rotation_pending = u_prime != Matrix::identity(u_prime.num_rows());
        self.u = state.u;
        self.u_prime = u_prime;
        Ok(())
    }
}
