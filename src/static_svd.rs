// src/static_svd.rs

//! Batch SVD of the samples of a time interval.
//!
//! [`StaticSvd`] stores every sample of the current interval and factors the
//! whole snapshot matrix when the basis is requested. The global matrix is
//! assembled on every rank, so this does not scale; it is a reference for the
//! incremental algorithm on small problems. [`StaticSvdSampler`] takes a sample
//! at every step.

use crate::comm::{all_reduce_sum_array, Communicator};
use crate::config::StaticSvdConfig;
use crate::incremental_svd::SampleOutcome;
use crate::linalg_backends::{BackendSVD, LinAlgBackendProvider};
use crate::matrix::Matrix;
use crate::sampler::SvdSampler;
use crate::vector::Vector;
use crate::ThreadSafeStdError;
use log::{debug, info};
use ndarray::{s, Array1, Array2};
use std::sync::Arc;

#[derive(Debug)]
pub struct StaticSvd {
    config: StaticSvdConfig,
    comm: Arc<dyn Communicator>,
    backend: LinAlgBackendProvider<f64>,
    /// This rank's rows of the samples of the current interval.
    samples: Vec<Array1<f64>>,
    interval_open: bool,
    last_time: Option<f64>,
    time_interval_start_times: Vec<f64>,
    /// Basis rows and singular values, valid until the next sample.
    decomposition: Option<(Matrix, Array1<f64>)>,
}

impl StaticSvd {
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: StaticSvdConfig, comm: Arc<dyn Communicator>) -> Result<Self, ThreadSafeStdError> {
        config.validate()?;
        info!(
            "Created static SVD (rank {} of {}): local dim {}, up to {} samples per interval.",
            comm.rank(),
            comm.size(),
            config.dim,
            config.samples_per_time_interval
        );
        Ok(Self {
            config,
            comm,
            backend: LinAlgBackendProvider::new(),
            samples: Vec::new(),
            interval_open: false,
            last_time: None,
            time_interval_start_times: Vec::new(),
            decomposition: None,
        })
    }

    pub fn dim(&self) -> usize {
        self.config.dim
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// Samples stored in the current interval.
    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_new_time_interval(&self) -> bool {
        !self.interval_open || self.samples.len() >= self.config.samples_per_time_interval
    }

    pub fn num_basis_time_intervals(&self) -> usize {
        self.time_interval_start_times.len()
    }

    pub fn basis_interval_start_time(&self, which_interval: usize) -> f64 {
        assert!(
            which_interval < self.num_basis_time_intervals(),
            "Time interval {} requested but only {} exist.",
            which_interval,
            self.num_basis_time_intervals()
        );
        self.time_interval_start_times[which_interval]
    }

    pub fn time_interval_start_times(&self) -> &[f64] {
        &self.time_interval_start_times
    }

    /// Stores the sample taken at `time`. Zero samples are skipped. Collective.
    ///
    /// # Errors
    /// Never fails; the signature matches the incremental SVD.
    ///
    /// # Panics
    /// If `time` is negative or earlier than the previous sample, or the length
    /// is not `dim`.
    pub fn take_sample(&mut self, sample: &[f64], time: f64) -> Result<SampleOutcome, ThreadSafeStdError> {
        assert!(time >= 0.0, "Sample time must be non-negative, got {}.", time);
        assert_eq!(
            sample.len(),
            self.config.dim,
            "Sample has {} entries but this rank owns {} rows.",
            sample.len(),
            self.config.dim
        );
        if let Some(last) = self.last_time {
            assert!(time >= last, "Sample times must be non-decreasing: got {} after {}.", time, last);
        }
        self.last_time = Some(time);

        let u = Vector::from_slice(sample, true);
        if u.norm(self.comm.as_ref()) == 0.0 {
            debug!("Skipping zero sample at t = {}.", time);
            return Ok(SampleOutcome::LinearlyDependent { folded: false });
        }

        let outcome = if !self.interval_open {
            self.samples.clear();
            self.time_interval_start_times.push(time);
            self.interval_open = true;
            info!(
                "Started time interval {} at t = {}.",
                self.time_interval_start_times.len() - 1,
                time
            );
            SampleOutcome::InitialSvd
        } else if self.samples.len() >= self.config.samples_per_time_interval {
            debug!(
                "Sample at t = {} refused: interval holds {} samples.",
                time,
                self.samples.len()
            );
            return Ok(SampleOutcome::IntervalBoundary);
        } else {
            SampleOutcome::NewBasisVector
        };
        self.samples.push(Array1::from(sample.to_vec()));
        self.decomposition = None;
        Ok(outcome)
    }

    /// Ends the current interval and drops its samples.
    pub fn start_new_interval(&mut self) {
        info!(
            "Closing time interval {} after {} samples.",
            self.num_basis_time_intervals(),
            self.samples.len()
        );
        self.interval_open = false;
        self.samples.clear();
        self.decomposition = None;
    }

    /// Left singular vectors of the samples of the current interval, this
    /// rank's rows. Collective when the samples changed since the last call.
    ///
    /// # Errors
    /// Returns an error if the dense SVD fails.
    ///
    /// # Panics
    /// If no sample has been taken in the current interval.
    pub fn get_basis(&mut self) -> Result<&Matrix, ThreadSafeStdError> {
        Ok(&self.current_decomposition()?.0)
    }

    /// # Errors
    /// Returns an error if the dense SVD fails.
    pub fn get_singular_values(&mut self) -> Result<Array1<f64>, ThreadSafeStdError> {
        Ok(self.current_decomposition()?.1.clone())
    }

    fn current_decomposition(&mut self) -> Result<&(Matrix, Array1<f64>), ThreadSafeStdError> {
        assert!(
            self.interval_open && !self.samples.is_empty(),
            "No basis exists before the first sample of a time interval."
        );
        let decomposition = match self.decomposition.take() {
            Some(decomposition) => decomposition,
            None => self.decompose()?,
        };
        Ok(&*self.decomposition.insert(decomposition))
    }

    /// Assembles the global snapshot matrix on every rank and factors it.
    fn decompose(&self) -> Result<(Matrix, Array1<f64>), ThreadSafeStdError> {
        let comm = self.comm.as_ref();
        let dim = self.config.dim;
        let mut dims = vec![0.0; comm.size()];
        dims[comm.rank()] = dim as f64;
        comm.all_reduce_sum(&mut dims);
        let dims: Vec<usize> = dims.iter().map(|&d| d.round() as usize).collect();
        let offset: usize = dims[..comm.rank()].iter().sum();
        let global_dim: usize = dims.iter().sum();

        let num_samples = self.samples.len();
        let mut global = Array2::zeros((global_dim, num_samples));
        for (j, sample) in self.samples.iter().enumerate() {
            global.slice_mut(s![offset..offset + dim, j]).assign(sample);
        }
        all_reduce_sum_array(comm, &mut global);

        let svd = self.backend.svd(&global)?;
        let width = num_samples.min(global_dim);
        let basis = Matrix::from_array(svd.u.slice(s![offset..offset + dim, ..width]).to_owned(), true);
        let singular_values = svd.s.slice(s![..width]).to_owned();
        if self.config.debug_algorithm {
            debug!("Static SVD of {}x{} samples: S = {:?}", global_dim, num_samples, singular_values);
        }
        Ok((basis, singular_values))
    }
}

/// Samples at every step and hands each sample to a [`StaticSvd`].
#[derive(Debug)]
pub struct StaticSvdSampler {
    svd: StaticSvd,
}

impl StaticSvdSampler {
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: StaticSvdConfig, comm: Arc<dyn Communicator>) -> Result<Self, ThreadSafeStdError> {
        Ok(Self {
            svd: StaticSvd::new(config, comm)?,
        })
    }

    pub fn svd(&self) -> &StaticSvd {
        &self.svd
    }
}

impl SvdSampler for StaticSvdSampler {
    fn is_next_sample(&self, _time: f64) -> bool {
        true
    }

    fn take_sample(&mut self, u: &[f64], time: f64) -> Result<SampleOutcome, ThreadSafeStdError> {
        self.svd.take_sample(u, time)
    }

    /// Every step is sampled, so the next sample is due now.
    fn compute_next_sample_time(&mut self, u: &[f64], rhs: &[f64], time: f64) -> Result<f64, ThreadSafeStdError> {
        assert!(time >= 0.0, "Sample time must be non-negative, got {}.", time);
        let dim = self.svd.dim();
        if u.len() != dim || rhs.len() != dim {
            return Err(format!(
                "State and derivative must have {} entries, got {} and {}.",
                dim,
                u.len(),
                rhs.len()
            )
            .into());
        }
        Ok(time)
    }

    fn reset_dt(&mut self, _dt: f64) {}

    fn get_basis(&mut self) -> Result<&Matrix, ThreadSafeStdError> {
        self.svd.get_basis()
    }

    fn get_singular_values(&mut self) -> Result<Array1<f64>, ThreadSafeStdError> {
        self.svd.get_singular_values()
    }

    fn num_basis_time_intervals(&self) -> usize {
        self.svd.num_basis_time_intervals()
    }

    fn basis_interval_start_time(&self, which_interval: usize) -> f64 {
        self.svd.basis_interval_start_time(which_interval)
    }

    fn is_new_time_interval(&self) -> bool {
        self.svd.is_new_time_interval()
    }

    fn start_new_interval(&mut self) {
        self.svd.start_new_interval();
    }

    fn dim(&self) -> usize {
        self.svd.dim()
    }
}
