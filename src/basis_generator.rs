// src/basis_generator.rs

use crate::basis_io::BasisWriter;
use crate::comm::Communicator;
use crate::config::{IncrementalSvdConfig, SamplerConfig, StaticSvdConfig};
use crate::database::DatabaseFormat;
use crate::incremental_svd::SampleOutcome;
use crate::matrix::Matrix;
use crate::sampler::{IncrementalSvdSampler, SvdSampler};
use crate::static_svd::StaticSvdSampler;
use crate::ThreadSafeStdError;
use log::info;
use ndarray::Array1;
use std::path::Path;
use std::sync::Arc;

/// Drives a sampler through a simulation and writes the basis of every time
/// interval as it closes.
#[derive(Debug)]
pub struct SvdBasisGenerator<S: SvdSampler = IncrementalSvdSampler> {
    sampler: S,
    writer: Option<BasisWriter>,
}

impl SvdBasisGenerator<IncrementalSvdSampler> {
    /// An incremental-SVD generator. With `basis_file_name`, bases are written
    /// to `"{basis_file_name}.{rank:06}"`. Collective over `comm`.
    ///
    /// # Errors
    /// Returns an error if a configuration is invalid or the basis file
    /// cannot be created.
    pub fn incremental(
        svd_config: IncrementalSvdConfig,
        sampler_config: SamplerConfig,
        comm: Arc<dyn Communicator>,
        basis_file_name: Option<&Path>,
        format: DatabaseFormat,
    ) -> Result<Self, ThreadSafeStdError> {
        let rank = comm.rank();
        let sampler = IncrementalSvdSampler::new(svd_config, sampler_config, comm)?;
        let writer = basis_file_name
            .map(|base| BasisWriter::new(base, format, rank))
            .transpose()?;
        Ok(Self::new(sampler, writer))
    }
}

impl SvdBasisGenerator<StaticSvdSampler> {
    /// A generator that samples every step and factors each interval's
    /// samples in one batch. Collective over `comm`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the basis file
    /// cannot be created.
    pub fn static_svd(
        config: StaticSvdConfig,
        comm: Arc<dyn Communicator>,
        basis_file_name: Option<&Path>,
        format: DatabaseFormat,
    ) -> Result<Self, ThreadSafeStdError> {
        let rank = comm.rank();
        let sampler = StaticSvdSampler::new(config, comm)?;
        let writer = basis_file_name
            .map(|base| BasisWriter::new(base, format, rank))
            .transpose()?;
        Ok(Self::new(sampler, writer))
    }
}

impl<S: SvdSampler> SvdBasisGenerator<S> {
    pub fn new(sampler: S, writer: Option<BasisWriter>) -> Self {
        Self { sampler, writer }
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut S {
        &mut self.sampler
    }

    pub fn writer(&self) -> Option<&BasisWriter> {
        self.writer.as_ref()
    }

    pub fn is_next_sample(&self, time: f64) -> bool {
        assert!(time >= 0.0, "Sample time must be non-negative, got {}.", time);
        self.sampler.is_next_sample(time)
    }

    /// Adds a sample. When the current interval is full, its basis is
    /// written, the sampling step is reset to `dt`, and the sample starts the
    /// next interval; the returned outcome is then
    /// [`SampleOutcome::InitialSvd`].
    ///
    /// # Errors
    /// Returns an error if the SVD update or the basis write fails.
    pub fn take_sample(&mut self, u: &[f64], time: f64, dt: f64) -> Result<SampleOutcome, ThreadSafeStdError> {
        let outcome = self.sampler.take_sample(u, time)?;
        if outcome != SampleOutcome::IntervalBoundary {
            return Ok(outcome);
        }
        info!(
            "Time interval {} is full at t = {}; writing it and starting the next.",
            self.sampler.num_basis_time_intervals() - 1,
            time
        );
        self.sampler.reset_dt(dt);
        if let Some(writer) = self.writer.as_mut() {
            writer.write_basis(&mut self.sampler)?;
        }
        self.sampler.start_new_interval();
        self.sampler.take_sample(u, time)
    }

    /// Writes the basis of the last interval. Does nothing if no sample was taken.
    ///
    /// # Errors
    /// Returns an error if the basis write fails.
    pub fn end_samples(&mut self) -> Result<(), ThreadSafeStdError> {
        if self.sampler.num_basis_time_intervals() == 0 {
            info!("No samples were taken; no basis to write.");
            return Ok(());
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.write_basis(&mut self.sampler)?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error if the inputs do not match the local dimension.
    pub fn compute_next_sample_time(&mut self, u: &[f64], rhs: &[f64], time: f64) -> Result<f64, ThreadSafeStdError> {
        self.sampler.compute_next_sample_time(u, rhs, time)
    }

    /// # Errors
    /// Returns an error if the sampler cannot decompose its samples.
    pub fn get_basis(&mut self) -> Result<&Matrix, ThreadSafeStdError> {
        self.sampler.get_basis()
    }

    /// # Errors
    /// Returns an error if the sampler cannot decompose its samples.
    pub fn get_singular_values(&mut self) -> Result<Array1<f64>, ThreadSafeStdError> {
        self.sampler.get_singular_values()
    }

    pub fn num_basis_time_intervals(&self) -> usize {
        self.sampler.num_basis_time_intervals()
    }

    pub fn basis_interval_start_time(&self, which_interval: usize) -> f64 {
        self.sampler.basis_interval_start_time(which_interval)
    }
}
