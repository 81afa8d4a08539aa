// src/vector.rs

use crate::comm::Communicator;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// A dense vector whose entries are optionally distributed across ranks.
///
/// A distributed vector holds only this rank's row block; reductions such as
/// [`Vector::inner_product`] combine the blocks through a [`Communicator`].
/// A non-distributed vector is replicated and every rank holds all of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    data: Array1<f64>,
    distributed: bool,
}

impl Vector {
    /// Creates a zero vector with `dim` local entries.
    pub fn zeros(dim: usize, distributed: bool) -> Self {
        Self {
            data: Array1::zeros(dim),
            distributed,
        }
    }

    /// Copies `values` into a new vector.
    pub fn from_slice(values: &[f64], distributed: bool) -> Self {
        Self {
            data: Array1::from(values.to_vec()),
            distributed,
        }
    }

    pub fn from_array(data: Array1<f64>, distributed: bool) -> Self {
        Self { data, distributed }
    }

    /// Number of entries held on this rank.
    pub fn dim(&self) -> usize {
        self.data.len()
    }

    pub fn distributed(&self) -> bool {
        self.distributed
    }

    pub fn as_array(&self) -> &Array1<f64> {
        &self.data
    }

    pub fn into_array(self) -> Array1<f64> {
        self.data
    }

    pub fn item(&self, i: usize) -> f64 {
        self.data[i]
    }

    pub fn set_item(&mut self, i: usize, value: f64) {
        self.data[i] = value;
    }

    /// Global inner product. Collective when the vectors are distributed.
    pub fn inner_product(&self, other: &Vector, comm: &dyn Communicator) -> f64 {
        assert_eq!(self.dim(), other.dim(), "Inner product of vectors with different local dimensions.");
        assert_eq!(
            self.distributed, other.distributed,
            "Inner product of a distributed and a non-distributed vector."
        );
        let mut ip = [self.data.dot(&other.data)];
        if self.distributed {
            comm.all_reduce_sum(&mut ip);
        }
        ip[0]
    }

    /// Global Euclidean norm. Collective when distributed.
    pub fn norm(&self, comm: &dyn Communicator) -> f64 {
        self.inner_product(self, comm).sqrt()
    }

    /// Global max-norm. Collective when distributed.
    pub fn max_abs(&self, comm: &dyn Communicator) -> f64 {
        let mut local = [self.data.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))];
        if self.distributed {
            comm.all_reduce_max(&mut local);
        }
        local[0]
    }

    /// Scales the vector to unit norm and returns the norm it had.
    pub fn normalize(&mut self, comm: &dyn Communicator) -> f64 {
        let norm = self.norm(comm);
        self.data.mapv_inplace(|x| x / norm);
        norm
    }

    pub fn plus(&self, other: &Vector) -> Vector {
        self.check_compatible(other);
        Vector::from_array(&self.data + &other.data, self.distributed)
    }

    pub fn minus(&self, other: &Vector) -> Vector {
        self.check_compatible(other);
        Vector::from_array(&self.data - &other.data, self.distributed)
    }

    /// `self + factor * other`, in place.
    pub fn scaled_add(&mut self, factor: f64, other: &Vector) {
        self.check_compatible(other);
        self.data.scaled_add(factor, &other.data);
    }

    pub fn scaled(&self, factor: f64) -> Vector {
        Vector::from_array(&self.data * factor, self.distributed)
    }

    fn check_compatible(&self, other: &Vector) {
        assert_eq!(self.dim(), other.dim(), "Vector dimensions differ: {} vs {}.", self.dim(), other.dim());
        assert_eq!(self.distributed, other.distributed, "Mixing distributed and non-distributed vectors.");
    }
}
