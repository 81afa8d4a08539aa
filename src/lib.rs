// Incremental singular value decomposition for reduced-basis generation

#![doc = include_str!("../README.md")]

use std::error::Error;

pub mod basis_generator;
pub mod basis_io;
pub mod comm;
pub mod config;
pub mod database;
pub mod diagnostics;
pub mod fast_update;
pub mod incremental_svd;
pub mod linalg_backends;
pub mod matrix;
pub mod sampler;
pub mod standard_update;
pub mod static_svd;
pub mod vector;

#[cfg(test)]
mod incremental_svd_tests;

/// A thread-safe wrapper for standard dynamic errors,
/// so they implement `Send` and `Sync`.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

pub use basis_generator::SvdBasisGenerator;
pub use basis_io::{BasisReader, BasisWriter};
pub use comm::{Communicator, SingleProcess, ThreadGroup};
pub use config::{IncrementalSvdConfig, SamplerConfig, StaticSvdConfig, UpdateMethod};
pub use database::DatabaseFormat;
pub use incremental_svd::{IncrementalSvd, IntervalState, SampleOutcome, UpdateStrategy};
pub use matrix::Matrix;
pub use sampler::{IncrementalSvdSampler, SvdSampler};
pub use static_svd::{StaticSvd, StaticSvdSampler};
pub use vector::Vector;
