// src/linalg_backends.rs

//! Dense decompositions of the small replicated systems.
//!
//! The incremental update only ever factors `(k+1) x (k+1)` matrices, so the
//! backend is chosen for robustness rather than throughput. LAPACK through
//! `ndarray-linalg` is the default; `backend_faer` switches to faer.

use crate::ThreadSafeStdError;
use ndarray::{Array1, Array2};
use std::marker::PhantomData;

/// Output of a full Singular Value Decomposition `M = U diag(s) V^T`.
#[derive(Debug)]
pub struct SVDOutput {
    /// Left singular vectors as columns.
    pub u: Array2<f64>,
    /// Singular values in descending order.
    pub s: Array1<f64>,
    /// Right singular vectors as rows.
    pub vt: Array2<f64>,
}

/// Trait for Singular Value Decomposition of small square matrices.
pub trait BackendSVD {
    fn svd(&self, matrix: &Array2<f64>) -> Result<SVDOutput, ThreadSafeStdError>;
}

/// Trait for QR decomposition, focusing on retrieving the Q factor.
pub trait BackendQR {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError>;
}

// --- NdarrayLinAlgBackend ---
use ndarray_linalg::{QR as NdLinalgQR, SVD as NdLinalgSVD};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> ThreadSafeStdError {
    Box::new(e)
}

impl BackendSVD for NdarrayLinAlgBackend {
    fn svd(&self, matrix: &Array2<f64>) -> Result<SVDOutput, ThreadSafeStdError> {
        if matrix.is_empty() {
            return Ok(SVDOutput {
                u: Array2::zeros((matrix.nrows(), matrix.nrows())),
                s: Array1::zeros(0),
                vt: Array2::zeros((matrix.ncols(), matrix.ncols())),
            });
        }
        let (u, s, vt) = matrix.svd(true, true).map_err(to_dyn_error)?;
        let u = u.ok_or("LAPACK SVD did not return left singular vectors.")?;
        let vt = vt.ok_or("LAPACK SVD did not return right singular vectors.")?;
        Ok(SVDOutput { u, s, vt })
    }
}

impl BackendQR for NdarrayLinAlgBackend {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        let (q_factor, _r) = matrix.qr().map_err(to_dyn_error)?;
        Ok(q_factor)
    }
}

// --- FaerLinAlgBackend ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{BackendQR, BackendSVD, SVDOutput};
    use crate::ThreadSafeStdError;
    use faer::linalg::solvers::Svd as FaerSolverSvd;
    use faer::{Mat, MatRef};
    use ndarray::{Array1, Array2};

    fn to_dyn_error_faer(msg: String) -> ThreadSafeStdError {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    fn ndarray_to_faer(matrix: &Array2<f64>) -> Mat<f64> {
        Mat::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[[i, j]])
    }

    fn faer_to_ndarray(matrix: MatRef<'_, f64>) -> Array2<f64> {
        Array2::from_shape_fn((matrix.nrows(), matrix.ncols()), |(i, j)| matrix[(i, j)])
    }

    impl BackendSVD for FaerLinAlgBackend {
        fn svd(&self, matrix: &Array2<f64>) -> Result<SVDOutput, ThreadSafeStdError> {
            if matrix.is_empty() {
                return Ok(SVDOutput {
                    u: Array2::zeros((matrix.nrows(), matrix.nrows())),
                    s: Array1::zeros(0),
                    vt: Array2::zeros((matrix.ncols(), matrix.ncols())),
                });
            }
            let faer_mat = ndarray_to_faer(matrix);
            let svd = FaerSolverSvd::new(faer_mat.as_ref())
                .map_err(|e| to_dyn_error_faer(format!("Faer SVD computation failed: {:?}", e)))?;
            let s_col = svd.S().column_vector();
            let s = Array1::from_shape_fn(s_col.nrows(), |i| s_col[i]);
            let u = faer_to_ndarray(svd.U());
            let vt = faer_to_ndarray(svd.V()).reversed_axes();
            Ok(SVDOutput { u, s, vt })
        }
    }

    impl BackendQR for FaerLinAlgBackend {
        fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
            if matrix.nrows() == 0 {
                return Ok(Array2::zeros((0, 0)));
            }
            let faer_mat = ndarray_to_faer(matrix);
            let q = faer_mat.as_ref().qr().compute_thin_Q();
            Ok(faer_to_ndarray(q.as_ref()))
        }
    }
}

/// Dispatches to the linear algebra backend selected by cargo features.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

impl BackendSVD for LinAlgBackendProvider<f64> {
    fn svd(&self, matrix: &Array2<f64>) -> Result<SVDOutput, ThreadSafeStdError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.svd(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.svd(matrix)
        }
    }
}

impl BackendQR for LinAlgBackendProvider<f64> {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.qr_q_factor(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.qr_q_factor(matrix)
        }
    }
}
