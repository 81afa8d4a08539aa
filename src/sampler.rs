// src/sampler.rs

//! Decides when a simulation should hand its state to the SVD.

use crate::comm::Communicator;
use crate::config::{IncrementalSvdConfig, SamplerConfig};
use crate::incremental_svd::{IncrementalSvd, SampleOutcome};
use crate::matrix::Matrix;
use crate::vector::Vector;
use crate::ThreadSafeStdError;
use log::{debug, info};
use ndarray::Array1;
use std::sync::Arc;

/// A sampling policy wrapped around an SVD.
pub trait SvdSampler: std::fmt::Debug {
    /// Whether a sample should be taken at `time`.
    fn is_next_sample(&self, time: f64) -> bool;

    /// Forwards the sample to the SVD.
    fn take_sample(&mut self, u: &[f64], time: f64) -> Result<SampleOutcome, ThreadSafeStdError>;

    /// Predicts the next sample time from the state `u` and its time derivative `rhs`.
    fn compute_next_sample_time(&mut self, u: &[f64], rhs: &[f64], time: f64) -> Result<f64, ThreadSafeStdError>;

    /// Overrides the current time between samples.
    fn reset_dt(&mut self, dt: f64);

    /// The basis of the current interval, this rank's rows. Collective.
    fn get_basis(&mut self) -> Result<&Matrix, ThreadSafeStdError>;

    fn get_singular_values(&mut self) -> Result<Array1<f64>, ThreadSafeStdError>;

    fn num_basis_time_intervals(&self) -> usize;

    fn basis_interval_start_time(&self, which_interval: usize) -> f64;

    fn is_new_time_interval(&self) -> bool;

    fn start_new_interval(&mut self);

    fn dim(&self) -> usize;
}

/// Error-controlled sampling: samples are spaced so that the part of the
/// state the current basis cannot represent grows by about `sampling_tol`
/// between samples.
#[derive(Debug)]
pub struct IncrementalSvdSampler {
    svd: IncrementalSvd,
    config: SamplerConfig,
    dt: f64,
    next_sample_time: f64,
}

impl IncrementalSvdSampler {
    /// Builds the sampler and its SVD. Collective over `comm`.
    ///
    /// # Errors
    /// Returns an error if either configuration is invalid or the SVD cannot
    /// be constructed.
    pub fn new(
        svd_config: IncrementalSvdConfig,
        config: SamplerConfig,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self, ThreadSafeStdError> {
        config.validate()?;
        let svd = IncrementalSvd::new(svd_config, comm)?;
        Ok(Self::with_svd(svd, config))
    }

    /// Wraps an existing SVD. `config` must already be valid.
    pub fn with_svd(svd: IncrementalSvd, config: SamplerConfig) -> Self {
        Self {
            dt: config.initial_dt,
            next_sample_time: 0.0,
            svd,
            config,
        }
    }

    pub fn svd(&self) -> &IncrementalSvd {
        &self.svd
    }

    pub fn svd_mut(&mut self) -> &mut IncrementalSvd {
        &mut self.svd
    }

    /// Current time between samples.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn next_sample_time(&self) -> f64 {
        self.next_sample_time
    }

    /// `x - U U^T x` on this rank's rows.
    fn unresolved_part(&mut self, x: &Vector) -> Vector {
        let comm = Arc::clone(self.svd.comm());
        let basis = self.svd.get_basis();
        let coefficients = basis.transpose_mult_vector(x, comm.as_ref());
        x.minus(&basis.mult_vector(&coefficients))
    }
}

impl SvdSampler for IncrementalSvdSampler {
    fn is_next_sample(&self, time: f64) -> bool {
        time >= self.next_sample_time
    }

    fn take_sample(&mut self, u: &[f64], time: f64) -> Result<SampleOutcome, ThreadSafeStdError> {
        self.svd.take_sample(u, time)
    }

    /// Adapts `dt` by `scale * sqrt(sampling_tol / ||eta + dt * eta_dot||_inf)`,
    /// where `eta` and `eta_dot` are the components of `u` and `rhs` outside
    /// the current basis. Collective over the SVD's communicator.
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
        let comm = Arc::clone(self.svd.comm());
        let u_vec = Vector::from_slice(u, true);
        if u_vec.norm(comm.as_ref()) == 0.0 {
            return Ok(self.next_sample_time);
        }
        if self.svd.rank() == 0 {
            debug!("No basis yet at t = {}; keeping next sample time {}.", time, self.next_sample_time);
            return Ok(self.next_sample_time);
        }

        let eta = self.unresolved_part(&u_vec);
        let eta_dot = self.unresolved_part(&Vector::from_slice(rhs, true));
        let mut predicted = eta;
        predicted.scaled_add(self.dt, &eta_dot);
        let global_norm = predicted.max_abs(comm.as_ref());

        let scale = (self.config.sampling_time_step_scale * (self.config.sampling_tol / global_norm).sqrt())
            .clamp(self.config.min_sampling_time_step_scale, self.config.max_sampling_time_step_scale);
        self.dt = (self.dt * scale).clamp(0.0, self.config.max_time_between_samples);
        self.next_sample_time = time + self.dt;
        debug!(
            "Unresolved norm {:.3e} at t = {}: dt scaled by {:.3} to {:.3e}, next sample at {}.",
            global_norm, time, scale, self.dt, self.next_sample_time
        );
        Ok(self.next_sample_time)
    }

    fn reset_dt(&mut self, dt: f64) {
        info!("Resetting sampling dt from {:.3e} to {:.3e}.", self.dt, dt);
        self.dt = dt;
    }

    fn get_basis(&mut self) -> Result<&Matrix, ThreadSafeStdError> {
        Ok(self.svd.get_basis())
    }

    fn get_singular_values(&mut self) -> Result<Array1<f64>, ThreadSafeStdError> {
        Ok(self.svd.get_singular_values())
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
