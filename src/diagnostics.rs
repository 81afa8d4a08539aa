// src/diagnostics.rs

use crate::linalg_backends::SVDOutput;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// How a sample was handled by the incremental update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleClass {
    /// First sample of a time interval.
    Initial,
    /// Linearly dependent, folded into `S` and the rotation.
    Dependent,
    /// Linearly dependent and dropped (`skip_linearly_dependent`).
    DependentSkipped,
    /// Linearly independent, grew the basis by one column.
    Independent,
    /// Linearly independent but the interval is full; not consumed.
    IntervalBoundary,
}

/// Per-sample record kept when `debug_algorithm` is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleDiagnostics {
    pub time: f64,
    pub sample_norm: f64,
    /// Norm of the part of the sample orthogonal to the basis.
    pub residual_norm: f64,
    /// `residual_norm / sample_norm`, the value compared against `linearity_tol`.
    pub residual_ratio: f64,
    pub class: SampleClass,
    pub rank_after: usize,
    pub singular_values: Vec<f64>,
    /// `||Q - A sigma W^T||_F / ||Q||_F` for the bordered system, when one was factored.
    pub small_svd_relative_error: Option<f64>,
}

/// Computes Frobenius norm for an f64 matrix.
pub fn compute_frob_norm_f64(matrix: &ArrayView2<f64>) -> f64 {
    if matrix.is_empty() {
        return 0.0;
    }
    matrix.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

/// Relative reconstruction error of an SVD of `matrix`.
pub fn svd_relative_reconstruction_error(matrix: &Array2<f64>, svd: &SVDOutput) -> f64 {
    let k = svd.s.len();
    let u_k = svd.u.slice(ndarray::s![.., ..k]);
    let vt_k = svd.vt.slice(ndarray::s![..k, ..]);
    let reconstructed = u_k.dot(&Array2::from_diag(&svd.s)).dot(&vt_k);
    let residual = matrix - &reconstructed;
    let norm = compute_frob_norm_f64(&matrix.view());
    let err = compute_frob_norm_f64(&residual.view());
    if norm > 0.0 {
        err / norm
    } else {
        err
    }
}
