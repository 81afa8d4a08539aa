// src/standard_update.rs

use crate::comm::Communicator;
use crate::incremental_svd::{StrategyState, UpdateStrategy};
use crate::matrix::{reorthogonalization_tolerance, Matrix};
use crate::vector::Vector;
use crate::ThreadSafeStdError;
use log::warn;

/// Keeps the distributed basis materialized, rotating all `dim x k` rows on
/// every update. `compute_basis` is free.
#[derive(Debug)]
pub struct StandardUpdate {
    global_dim: usize,
    u: Matrix,
}

impl StandardUpdate {
    pub fn new(dim: usize, global_dim: usize) -> Self {
        Self {
            global_dim,
            u: Matrix::zeros(dim, 0, true),
        }
    }

    fn reorthogonalize(&mut self, comm: &dyn Communicator) {
        let tolerance = reorthogonalization_tolerance(self.global_dim, self.u.num_columns());
        if self.u.reorthogonalize_if_needed(tolerance, comm) {
            warn!("Re-orthogonalized the basis.");
        }
    }
}

impl UpdateStrategy for StandardUpdate {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn rank(&self) -> usize {
        self.u.num_columns()
    }

    fn build_initial_svd(&mut self, first_column: Vector) {
        self.u = Matrix::from_column(&first_column);
    }

    fn project(&self, sample: &Vector, comm: &dyn Communicator) -> Vector {
        self.u.transpose_mult_vector(sample, comm)
    }

    fn expand(&self, coefficients: &Vector) -> Vector {
        self.u.mult_vector(coefficients)
    }

    fn add_linearly_dependent_sample(
        &mut self,
        a: &Matrix,
        comm: &dyn Communicator,
    ) -> Result<(), ThreadSafeStdError> {
        self.u = self.u.mult(a);
        self.reorthogonalize(comm);
        Ok(())
    }

    fn add_new_sample(
        &mut self,
        j: &Vector,
        a: &Matrix,
        comm: &dyn Communicator,
    ) -> Result<(), ThreadSafeStdError> {
        self.u = self.u.with_appended_column(j).mult(a);
        self.reorthogonalize(comm);
        Ok(())
    }

    fn compute_basis(&mut self, _comm: &dyn Communicator) -> &Matrix {
        &self.u
    }

    fn save(&self) -> StrategyState {
        StrategyState {
            u: self.u.clone(),
            u_prime: None,
        }
    }

    fn restore(&mut self, state: StrategyState) -> Result<(), ThreadSafeStdError> {
        if state.u_prime.is_some() {
            return Err("Saved state carries a U' matrix; it was not written by the standard update.".into());
        }
        self.u = state.u;
        Ok(())
    }
}
