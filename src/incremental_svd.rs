// src/incremental_svd.rs

//! The incremental SVD core.
//!
//! [`IncrementalSvd`] maintains a truncated decomposition `U S` of the matrix
//! whose columns are the samples seen so far in the current time interval.
//! For each new sample `u` it forms the projection `l = U^T u` and residual
//! `j = u - U l`, classifies the sample by `||j|| / ||u||`, factors the small
//! bordered system
//!
//! ```text
//!     Q = | S  l    |
//!         | 0  ||j|| |
//! ```
//!
//! and hands the left singular vectors of `Q` to an [`UpdateStrategy`], which
//! owns the distributed basis. `S` is replicated and owned here.

use crate::comm::Communicator;
use crate::config::{rank_file_name, IncrementalSvdConfig, UpdateMethod};
use crate::diagnostics::{svd_relative_reconstruction_error, SampleClass, SampleDiagnostics};
use crate::fast_update::FastUpdate;
use crate::linalg_backends::{BackendSVD, LinAlgBackendProvider};
use crate::matrix::Matrix;
use crate::standard_update::StandardUpdate;
use crate::vector::Vector;
use crate::ThreadSafeStdError;
use log::{debug, info, trace, warn};
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

/// The basis-side half of an incremental SVD update.
///
/// Implementations own the distributed left singular vectors. The core never
/// sees how they are stored; it only projects onto them, expands coefficients
/// through them, and asks for a materialized copy.
pub trait UpdateStrategy: Send + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Current number of basis columns, `k`.
    fn rank(&self) -> usize;

    /// Discards any previous basis and starts a new one from a unit-norm column.
    fn build_initial_svd(&mut self, first_column: Vector);

    /// `U^T sample`, replicated on every rank. Collective.
    fn project(&self, sample: &Vector, comm: &dyn Communicator) -> Vector;

    /// `U coefficients`, this rank's row block. Local.
    fn expand(&self, coefficients: &Vector) -> Vector;

    /// Rotates the basis by the leading `k x k` block `a` of the left singular
    /// vectors of the bordered system. The rank is unchanged.
    fn add_linearly_dependent_sample(
        &mut self,
        a: &Matrix,
        comm: &dyn Communicator,
    ) -> Result<(), ThreadSafeStdError>;

    /// Appends the unit residual `j` and rotates by the `(k+1) x (k+1)` matrix `a`.
    fn add_new_sample(
        &mut self,
        j: &Vector,
        a: &Matrix,
        comm: &dyn Communicator,
    ) -> Result<(), ThreadSafeStdError>;

    /// Materializes the basis. Calling it twice without an update in between
    /// returns the same matrix. Collective when it has work to do.
    fn compute_basis(&mut self, comm: &dyn Communicator) -> &Matrix;

    fn save(&self) -> StrategyState;

    fn restore(&mut self, state: StrategyState) -> Result<(), ThreadSafeStdError>;
}

/// Strategy-owned part of a saved decomposition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategyState {
    /// This rank's rows of the (raw) basis.
    pub u: Matrix,
    /// Pending rotation, for strategies that defer it.
    pub u_prime: Option<Matrix>,
}

/// Where the current time interval is in its life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalState {
    /// No decomposition; the next sample starts a time interval.
    Uninitialized,
    /// Exactly one sample, rank 1.
    HasInitialSvd,
    Accumulating { rank: usize },
    /// An independent sample arrived with the interval full. Samples are
    /// refused until [`IncrementalSvd::start_new_interval`] is called.
    IntervalBoundary { rank: usize },
}

/// Result of [`IncrementalSvd::take_sample`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// The sample started a time interval.
    InitialSvd,
    /// The sample added no new direction. `folded` is false when it was skipped.
    LinearlyDependent { folded: bool },
    /// The sample grew the basis by one column.
    NewBasisVector,
    /// The interval is full. The sample was not consumed; the caller should
    /// persist the current basis, call `start_new_interval` and resubmit it.
    IntervalBoundary,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedSvdState {
    update_method: UpdateMethod,
    time: f64,
    /// Time of the last consumed sample.
    last_time: f64,
    num_samples: usize,
    s: Matrix,
    strategy: StrategyState,
}

/// Incremental SVD of a row-distributed, column-growing snapshot matrix.
#[derive(Debug)]
pub struct IncrementalSvd {
    config: IncrementalSvdConfig,
    comm: Arc<dyn Communicator>,
    strategy: Box<dyn UpdateStrategy>,
    backend: LinAlgBackendProvider<f64>,
    /// Rows summed over all ranks.
    global_dim: usize,
    /// Singular values, `k x k`, replicated.
    s: Matrix,
    state: IntervalState,
    /// Samples consumed in the current interval, dependent ones included.
    num_samples: usize,
    last_time: Option<f64>,
    time_interval_start_times: Vec<f64>,
    diagnostics: Vec<SampleDiagnostics>,
}

impl IncrementalSvd {
    /// Creates the decomposition for this rank. Collective: every rank of
    /// `comm` must construct its instance with the same parameters.
    ///
    /// With `restore_state`, a state file written by [`IncrementalSvd::save_state`]
    /// is loaded if it exists.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a state file exists
    /// but cannot be read or does not match the configuration.
    pub fn new(config: IncrementalSvdConfig, comm: Arc<dyn Communicator>) -> Result<Self, ThreadSafeStdError> {
        config.validate()?;
        let global_dim = comm.all_reduce_sum_usize(config.dim);
        let strategy: Box<dyn UpdateStrategy> = match config.update_method {
            UpdateMethod::FastUpdate => Box::new(FastUpdate::new(config.dim, global_dim)),
            UpdateMethod::Standard => Box::new(StandardUpdate::new(config.dim, global_dim)),
        };
        info!(
            "Created incremental SVD (rank {} of {}): local dim {}, global dim {}, {} strategy.",
            comm.rank(),
            comm.size(),
            config.dim,
            global_dim,
            strategy.name()
        );
        let mut svd = Self {
            config,
            comm,
            strategy,
            backend: LinAlgBackendProvider::new(),
            global_dim,
            s: Matrix::zeros(0, 0, false),
            state: IntervalState::Uninitialized,
            num_samples: 0,
            last_time: None,
            time_interval_start_times: Vec::new(),
            diagnostics: Vec::new(),
        };
        if svd.config.restore_state {
            svd.restore_state()?;
        }
        Ok(svd)
    }

    pub fn config(&self) -> &IncrementalSvdConfig {
        &self.config
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// Rows of the state vector on this rank.
    pub fn dim(&self) -> usize {
        self.config.dim
    }

    pub fn global_dim(&self) -> usize {
        self.global_dim
    }

    /// Number of basis vectors in the current interval, 0 between intervals.
    pub fn rank(&self) -> usize {
        match self.state {
            IntervalState::Uninitialized => 0,
            _ => self.strategy.rank(),
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn state(&self) -> IntervalState {
        self.state
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// True when the next sample will start a time interval, or when the
    /// next linearly independent sample will be refused because the interval
    /// is full.
    pub fn is_new_time_interval(&self) -> bool {
        match self.state {
            IntervalState::Uninitialized | IntervalState::IntervalBoundary { .. } => true,
            _ => self.rank() >= self.config.samples_per_time_interval,
        }
    }

    pub fn num_basis_time_intervals(&self) -> usize {
        self.time_interval_start_times.len()
    }

    /// Start time of interval `which_interval`.
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

    /// The `k x k` singular value matrix of the current interval.
    pub fn get_singular_value_matrix(&self) -> &Matrix {
        &self.s
    }

    /// Singular values of the current interval in descending order.
    pub fn get_singular_values(&self) -> Array1<f64> {
        self.s.diagonal()
    }

    /// Per-sample records, populated only with `debug_algorithm`.
    pub fn diagnostics(&self) -> &[SampleDiagnostics] {
        &self.diagnostics
    }

    /// Materializes and returns the basis of the current interval. Collective:
    /// all ranks must call it together.
    pub fn compute_basis(&mut self) -> &Matrix {
        assert!(
            self.state != IntervalState::Uninitialized,
            "No basis exists before the first sample of a time interval."
        );
        self.strategy.compute_basis(self.comm.as_ref())
    }

    /// Same as [`IncrementalSvd::compute_basis`].
    pub fn get_basis(&mut self) -> &Matrix {
        self.compute_basis()
    }

    #[cfg(test)]
    pub(crate) fn strategy(&self) -> &dyn UpdateStrategy {
        self.strategy.as_ref()
    }

    /// Ends the current interval. The next sample builds a fresh decomposition.
    /// Persist the current basis first if it is needed.
    pub fn start_new_interval(&mut self) {
        info!(
            "Closing time interval {} with rank {} after {} samples.",
            self.num_basis_time_intervals(),
            self.rank(),
            self.num_samples
        );
        self.state = IntervalState::Uninitialized;
    }

    /// Starts a time interval from its first sample: `U = u/||u||`, `S = ||u||`.
    ///
    /// # Panics
    /// If an interval is already in progress, `time` is negative or earlier than
    /// the previous sample, the length is not `dim`, or the sample is zero.
    pub fn build_initial_svd(&mut self, sample: &[f64], time: f64) {
        assert_eq!(
            self.state,
            IntervalState::Uninitialized,
            "build_initial_svd called while a time interval is in progress."
        );
        self.check_sample_preconditions(sample, time);

        let u = Vector::from_slice(sample, true);
        let norm = u.norm(self.comm.as_ref());
        assert!(norm > 0.0, "The first sample of a time interval must be non-zero.");
        self.strategy.build_initial_svd(u.scaled(1.0 / norm));
        self.s = Matrix::from_array(Array2::from_elem((1, 1), norm), false);
        self.time_interval_start_times.push(time);
        self.num_samples = 1;
        self.last_time = Some(time);
        self.state = IntervalState::HasInitialSvd;

        info!(
            "Started time interval {} at t = {} (sample norm {:.6e}).",
            self.time_interval_start_times.len() - 1,
            time,
            norm
        );
        self.record(SampleDiagnostics {
            time,
            sample_norm: norm,
            residual_norm: norm,
            residual_ratio: 1.0,
            class: SampleClass::Initial,
            rank_after: 1,
            singular_values: vec![norm],
            small_svd_relative_error: None,
        });
    }

    /// Adds the sample taken at `time`.
    ///
    /// All ranks must call this in lockstep with their row blocks of the same
    /// global sample: the classification is computed from globally reduced norms
    /// so every rank takes the same branch.
    ///
    /// # Errors
    /// Returns an error if the small dense SVD fails.
    ///
    /// # Panics
    /// If `time` is negative or earlier than the previous sample, the length is
    /// not `dim`, or this is the first sample of an interval and it is zero.
    pub fn take_sample(&mut self, sample: &[f64], time: f64) -> Result<SampleOutcome, ThreadSafeStdError> {
        match self.state {
            IntervalState::Uninitialized => {
                self.build_initial_svd(sample, time);
                return Ok(SampleOutcome::InitialSvd);
            }
            IntervalState::IntervalBoundary { rank } => {
                self.check_sample_preconditions(sample, time);
                debug!("Sample at t = {} refused: interval is full at rank {}.", time, rank);
                return Ok(SampleOutcome::IntervalBoundary);
            }
            IntervalState::HasInitialSvd | IntervalState::Accumulating { .. } => {}
        }
        self.check_sample_preconditions(sample, time);
        self.last_time = Some(time);

        let comm_handle = Arc::clone(&self.comm);
        let comm = comm_handle.as_ref();
        let k = self.rank();

        let u = Vector::from_slice(sample, true);
        let sample_norm = u.norm(comm);
        let mut l = self.strategy.project(&u, comm);
        let mut residual = u.minus(&self.strategy.expand(&l));
        let residual_norm = residual.norm(comm);
        let residual_ratio = if sample_norm > 0.0 { residual_norm / sample_norm } else { 0.0 };

        if residual_ratio < self.config.linearity_tol {
            debug!(
                "Sample at t = {} is linearly dependent (residual ratio {:.3e} < {:.3e}).",
                time, residual_ratio, self.config.linearity_tol
            );
            if self.config.skip_linearly_dependent {
                self.record(SampleDiagnostics {
                    time,
                    sample_norm,
                    residual_norm,
                    residual_ratio,
                    class: SampleClass::DependentSkipped,
                    rank_after: k,
                    singular_values: self.s.diagonal().to_vec(),
                    small_svd_relative_error: None,
                });
                return Ok(SampleOutcome::LinearlyDependent { folded: false });
            }

            let q = self.construct_q(&l, 0.0);
            let svd = self.backend.svd(&q)?;
            let a = Matrix::from_array(svd.u.slice(s![..k, ..k]).to_owned(), false);
            let sigma = Matrix::from_diagonal(&svd.s.slice(s![..k]).to_owned());
            self.strategy.add_linearly_dependent_sample(&a, comm)?;
            self.s = sigma;
            self.num_samples += 1;
            self.state = IntervalState::Accumulating { rank: k };
            self.trace_small_system(&q, &a);
            let error = self.config.debug_algorithm.then(|| svd_relative_reconstruction_error(&q, &svd));
            self.record(SampleDiagnostics {
                time,
                sample_norm,
                residual_norm,
                residual_ratio,
                class: SampleClass::Dependent,
                rank_after: k,
                singular_values: self.s.diagonal().to_vec(),
                small_svd_relative_error: error,
            });
            return Ok(SampleOutcome::LinearlyDependent { folded: true });
        }

        if k >= self.config.samples_per_time_interval {
            info!(
                "Sample at t = {} is linearly independent but the time interval is full (rank {}); a new interval is required.",
                time, k
            );
            self.state = IntervalState::IntervalBoundary { rank: k };
            self.record(SampleDiagnostics {
                time,
                sample_norm,
                residual_norm,
                residual_ratio,
                class: SampleClass::IntervalBoundary,
                rank_after: k,
                singular_values: self.s.diagonal().to_vec(),
                small_svd_relative_error: None,
            });
            return Ok(SampleOutcome::IntervalBoundary);
        }

        // A second projection pass keeps j orthogonal to U when the residual is small.
        let correction = self.strategy.project(&residual, comm);
        residual = residual.minus(&self.strategy.expand(&correction));
        l = l.plus(&correction);
        let j_norm = residual.norm(comm);
        let j = residual.scaled(1.0 / j_norm);

        let q = self.construct_q(&l, j_norm);
        let svd = self.backend.svd(&q)?;
        let a = Matrix::from_array(svd.u.clone(), false);
        self.strategy.add_new_sample(&j, &a, comm)?;
        self.s = Matrix::from_diagonal(&svd.s);
        self.num_samples += 1;
        self.state = IntervalState::Accumulating { rank: k + 1 };
        debug!(
            "Sample at t = {} added a basis vector (residual ratio {:.3e}); rank is now {}.",
            time,
            residual_ratio,
            k + 1
        );
        self.trace_small_system(&q, &a);
        let error = self.config.debug_algorithm.then(|| svd_relative_reconstruction_error(&q, &svd));
        self.record(SampleDiagnostics {
            time,
            sample_norm,
            residual_norm: j_norm,
            residual_ratio,
            class: SampleClass::Independent,
            rank_after: k + 1,
            singular_values: self.s.diagonal().to_vec(),
            small_svd_relative_error: error,
        });
        Ok(SampleOutcome::NewBasisVector)
    }

    /// Writes this rank's decomposition to `"{state_file_base}.{rank:06}"`.
    ///
    /// Only a run with exactly one time interval and a live decomposition is
    /// saved, since resuming anything else is meaningless. Returns whether a
    /// file was written.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or serialization fails.
    pub fn save_state(&self) -> Result<bool, ThreadSafeStdError> {
        if self.num_basis_time_intervals() != 1 || self.state == IntervalState::Uninitialized {
            info!(
                "Not saving SVD state: {} time intervals, state {:?}.",
                self.num_basis_time_intervals(),
                self.state
            );
            return Ok(false);
        }
        let path = rank_file_name(&self.config.state_file_base, self.comm.rank());
        let saved = SavedSvdState {
            update_method: self.config.update_method,
            time: self.time_interval_start_times[0],
            last_time: self.last_time.unwrap_or(self.time_interval_start_times[0]),
            num_samples: self.num_samples,
            s: self.s.clone(),
            strategy: self.strategy.save(),
        };
        let file = File::create(&path).map_err(|e| format!("Failed to create state file at {:?}: {}", path, e))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(&saved, &mut writer, bincode::config::standard())
            .map_err(|e| format!("Failed to serialize SVD state: {}", e))?;
        info!("Saved SVD state of rank {} to {:?}.", self.comm.rank(), path);
        Ok(true)
    }

    fn restore_state(&mut self) -> Result<(), ThreadSafeStdError> {
        let path = rank_file_name(&self.config.state_file_base, self.comm.rank());
        if !path.exists() {
            info!("No SVD state at {:?}; starting from scratch.", path);
            return Ok(());
        }
        let file = File::open(&path).map_err(|e| format!("Failed to open state file at {:?}: {}", path, e))?;
        let mut reader = BufReader::new(file);
        let saved: SavedSvdState = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| format!("Failed to deserialize SVD state from {:?}: {}", path, e))?;

        if saved.update_method != self.config.update_method {
            return Err(format!(
                "State file {:?} was written by the {:?} update but this run uses {:?}.",
                path, saved.update_method, self.config.update_method
            )
            .into());
        }
        if saved.strategy.u.num_rows() != self.config.dim {
            return Err(format!(
                "State file {:?} holds {} rows but this rank owns {}.",
                path,
                saved.strategy.u.num_rows(),
                self.config.dim
            )
            .into());
        }
        let rank = saved.s.num_rows();
        if rank == 0 || saved.s.num_columns() != rank {
            return Err(format!("State file {:?} holds an invalid {}x{} S.", path, rank, saved.s.num_columns()).into());
        }
        self.strategy.restore(saved.strategy)?;
        if self.strategy.rank() != rank {
            return Err(format!(
                "State file {:?} is inconsistent: basis rank {} but S is {}x{}.",
                path,
                self.strategy.rank(),
                rank,
                rank
            )
            .into());
        }
        self.s = saved.s;
        self.num_samples = saved.num_samples;
        if saved.last_time < saved.time {
            return Err(format!(
                "State file {:?} has its last sample at t = {} before the interval start {}.",
                path, saved.last_time, saved.time
            )
            .into());
        }
        self.time_interval_start_times = vec![saved.time];
        self.last_time = Some(saved.last_time);
        self.state = if rank == 1 && saved.num_samples <= 1 {
            IntervalState::HasInitialSvd
        } else {
            IntervalState::Accumulating { rank }
        };
        info!("Restored SVD state of rank {} from {:?} (rank {}).", self.comm.rank(), path, rank);
        Ok(())
    }

    /// `[[S, l], [0, residual_norm]]`.
    fn construct_q(&self, l: &Vector, residual_norm: f64) -> Array2<f64> {
        let k = self.s.num_rows();
        let mut q = Array2::zeros((k + 1, k + 1));
        q.slice_mut(s![..k, ..k]).assign(self.s.as_array());
        q.slice_mut(s![..k, k]).assign(l.as_array());
        q[[k, k]] = residual_norm;
        q
    }

    fn check_sample_preconditions(&self, sample: &[f64], time: f64) {
        assert!(time >= 0.0, "Sample time must be non-negative, got {}.", time);
        assert_eq!(
            sample.len(),
            self.config.dim,
            "Sample has {} entries but this rank owns {} rows.",
            sample.len(),
            self.config.dim
        );
        if let Some(last) = self.last_time {
            assert!(
                time >= last,
                "Sample times must be non-decreasing: got {} after {}.",
                time,
                last
            );
        }
    }

    fn trace_small_system(&self, q: &Array2<f64>, a: &Matrix) {
        if self.config.debug_algorithm {
            debug!("Q = {:?}", q);
            debug!("A = {:?}", a.as_array());
            debug!("S = {:?}", self.s.diagonal());
        } else {
            trace!("Singular values: {:?}", self.s.diagonal());
        }
    }

    fn record(&mut self, entry: SampleDiagnostics) {
        if self.config.debug_algorithm {
            self.diagnostics.push(entry);
        }
    }
}

impl Drop for IncrementalSvd {
    fn drop(&mut self) {
        if self.config.save_state {
            if let Err(e) = self.save_state() {
                warn!("Failed to save SVD state on drop: {}", e);
            }
        }
    }
}
