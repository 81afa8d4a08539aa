// src/config.rs

use crate::ThreadSafeStdError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How the left singular vectors are updated when a sample is folded in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMethod {
    /// Brand's fast update: the basis is kept as raw columns times a small
    /// accumulated rotation and only materialized on request.
    FastUpdate,
    /// The basis is rotated explicitly on every update.
    Standard,
}

/// Parameters of an [`IncrementalSvd`](crate::IncrementalSvd).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncrementalSvdConfig {
    /// Number of rows of the state vector owned by this rank.
    pub dim: usize,
    /// A sample whose residual-to-sample norm ratio after projection onto the
    /// current basis falls below this value is linearly dependent.
    pub linearity_tol: f64,
    /// If true, linearly dependent samples are dropped instead of folded into `S`.
    pub skip_linearly_dependent: bool,
    /// Maximum rank of the basis within one time interval.
    pub samples_per_time_interval: usize,
    /// Write the decomposition state to disk when the object is dropped.
    /// Only a run with exactly one time interval is saved.
    pub save_state: bool,
    /// Resume from a previously saved state at construction, if one exists.
    pub restore_state: bool,
    /// Record per-sample diagnostics and log the small-system state.
    pub debug_algorithm: bool,
    pub update_method: UpdateMethod,
    /// Base path of the per-rank state file, `"{base}.{rank:06}"`.
    pub state_file_base: PathBuf,
}

impl Default for IncrementalSvdConfig {
    fn default() -> Self {
        IncrementalSvdConfig {
            dim: 1,
            linearity_tol: 1.0e-7,
            skip_linearly_dependent: false,
            samples_per_time_interval: 100,
            save_state: false,
            restore_state: false,
            debug_algorithm: false,
            update_method: UpdateMethod::FastUpdate,
            state_file_base: PathBuf::from("state"),
        }
    }
}

impl IncrementalSvdConfig {
    /// Defaults with the given local dimension.
    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    /// Checks the construction preconditions.
    pub fn validate(&self) -> Result<(), ThreadSafeStdError> {
        if self.dim == 0 {
            return Err("IncrementalSvdConfig.dim must be greater than 0.".into());
        }
        if !(self.linearity_tol > 0.0) || !self.linearity_tol.is_finite() {
            return Err(format!(
                "IncrementalSvdConfig.linearity_tol must be a positive finite number, got {}.",
                self.linearity_tol
            )
            .into());
        }
        if self.samples_per_time_interval == 0 {
            return Err("IncrementalSvdConfig.samples_per_time_interval must be greater than 0.".into());
        }
        if (self.save_state || self.restore_state) && self.state_file_base.as_os_str().is_empty() {
            return Err("IncrementalSvdConfig.state_file_base must be set when saving or restoring state.".into());
        }
        Ok(())
    }
}

/// Parameters of a [`StaticSvd`](crate::static_svd::StaticSvd).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticSvdConfig {
    /// Number of rows of the state vector owned by this rank.
    pub dim: usize,
    /// Samples stored per time interval before a new interval is required.
    pub samples_per_time_interval: usize,
    /// Log the singular values of every batch decomposition.
    pub debug_algorithm: bool,
}

impl Default for StaticSvdConfig {
    fn default() -> Self {
        StaticSvdConfig {
            dim: 1,
            samples_per_time_interval: 100,
            debug_algorithm: false,
        }
    }
}

impl StaticSvdConfig {
    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ThreadSafeStdError> {
        if self.dim == 0 {
            return Err("StaticSvdConfig.dim must be greater than 0.".into());
        }
        if self.samples_per_time_interval == 0 {
            return Err("StaticSvdConfig.samples_per_time_interval must be greater than 0.".into());
        }
        Ok(())
    }
}

/// Path of the per-rank file derived from `base`.
pub fn rank_file_name(base: &Path, rank: usize) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{:06}", rank));
    PathBuf::from(name)
}

/// Parameters of the adaptive sampling-interval policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Initial time between samples.
    pub initial_dt: f64,
    /// Error tolerance driving the step-size control.
    pub sampling_tol: f64,
    /// Upper bound on the time between samples.
    pub max_time_between_samples: f64,
    pub min_sampling_time_step_scale: f64,
    pub sampling_time_step_scale: f64,
    pub max_sampling_time_step_scale: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            initial_dt: 1.0e-2,
            sampling_tol: 1.0e-3,
            max_time_between_samples: f64::MAX,
            min_sampling_time_step_scale: 0.1,
            sampling_time_step_scale: 0.8,
            max_sampling_time_step_scale: 5.0,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), ThreadSafeStdError> {
        if !(self.initial_dt > 0.0) {
            return Err(format!("SamplerConfig.initial_dt must be positive, got {}.", self.initial_dt).into());
        }
        if !(self.sampling_tol > 0.0) {
            return Err(format!("SamplerConfig.sampling_tol must be positive, got {}.", self.sampling_tol).into());
        }
        if !(self.max_time_between_samples > 0.0) {
            return Err("SamplerConfig.max_time_between_samples must be positive.".into());
        }
        if self.min_sampling_time_step_scale < 0.0
            || self.sampling_time_step_scale < 0.0
            || self.max_sampling_time_step_scale < 0.0
        {
            return Err("SamplerConfig time step scales must be non-negative.".into());
        }
        if self.min_sampling_time_step_scale > self.max_sampling_time_step_scale {
            return Err(format!(
                "SamplerConfig.min_sampling_time_step_scale ({}) exceeds max_sampling_time_step_scale ({}).",
                self.min_sampling_time_step_scale, self.max_sampling_time_step_scale
            )
            .into());
        }
        Ok(())
    }
}
