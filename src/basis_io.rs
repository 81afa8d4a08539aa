// src/basis_io.rs

//! Per-rank basis files.
//!
//! Interval `i` is stored under `time_{i:06}`, `num_rows_{i:06}`,
//! `num_cols_{i:06}`, `basis_{i:06}` (row-major) and
//! `singular_values_{i:06}`, next to a `num_time_intervals` count. Each rank
//! writes its own rows to `"{base}.{rank:06}"`.

use crate::config::rank_file_name;
use crate::database::{create_database, open_database, Database, DatabaseFormat};
use crate::matrix::Matrix;
use crate::sampler::SvdSampler;
use crate::ThreadSafeStdError;
use log::info;
use ndarray::{Array1, Array2};
use std::path::{Path, PathBuf};

fn key(prefix: &str, interval: usize) -> String {
    format!("{}_{:06}", prefix, interval)
}

/// Writes the basis of each finished time interval.
#[derive(Debug)]
pub struct BasisWriter {
    path: PathBuf,
    database: Box<dyn Database>,
    num_intervals_written: usize,
}

impl BasisWriter {
    /// Creates (or truncates) this rank's basis file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn new(base_file_name: &Path, format: DatabaseFormat, rank: usize) -> Result<Self, ThreadSafeStdError> {
        if base_file_name.as_os_str().is_empty() {
            return Err("BasisWriter needs a non-empty base file name.".into());
        }
        let path = rank_file_name(base_file_name, rank);
        let mut database = create_database(format, &path)?;
        database.put_integer("num_time_intervals", 0);
        database.flush()?;
        Ok(Self {
            path,
            database,
            num_intervals_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_intervals_written(&self) -> usize {
        self.num_intervals_written
    }

    /// Writes the sampler's current interval (the last one started).
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    ///
    /// # Panics
    /// If the sampler has no time interval yet.
    pub fn write_basis<S: SvdSampler + ?Sized>(&mut self, sampler: &mut S) -> Result<(), ThreadSafeStdError> {
        let num_intervals = sampler.num_basis_time_intervals();
        assert!(num_intervals > 0, "There is no basis to write before the first sample.");
        let interval = num_intervals - 1;
        let start_time = sampler.basis_interval_start_time(interval);
        let singular_values = sampler.get_singular_values()?;
        let basis = sampler.get_basis()?;
        self.write_interval(interval, start_time, basis, &singular_values)
    }

    /// Stores one interval and flushes the file, so it is readable after
    /// every interval.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write_interval(
        &mut self,
        interval: usize,
        start_time: f64,
        basis: &Matrix,
        singular_values: &Array1<f64>,
    ) -> Result<(), ThreadSafeStdError> {
        let db = self.database.as_mut();
        db.put_double(&key("time", interval), start_time);
        db.put_integer(&key("num_rows", interval), basis.num_rows() as i64);
        db.put_integer(&key("num_cols", interval), basis.num_columns() as i64);
        let row_major: Vec<f64> = basis.as_array().iter().copied().collect();
        db.put_double_array(&key("basis", interval), &row_major);
        db.put_double_array(&key("singular_values", interval), &singular_values.to_vec());
        self.num_intervals_written = self.num_intervals_written.max(interval + 1);
        db.put_integer("num_time_intervals", self.num_intervals_written as i64);
        db.flush()?;
        info!(
            "Wrote basis of interval {} (t = {}, {}x{}) to {:?}.",
            interval,
            start_time,
            basis.num_rows(),
            basis.num_columns(),
            self.path
        );
        Ok(())
    }

    /// Flushes and closes the file.
    ///
    /// # Errors
    /// Returns an error if the final write fails.
    pub fn close(mut self) -> Result<(), ThreadSafeStdError> {
        self.database.close()
    }
}

/// Reads the bases written by a [`BasisWriter`].
#[derive(Debug)]
pub struct BasisReader {
    path: PathBuf,
    database: Box<dyn Database>,
    time_interval_start_times: Vec<f64>,
    last_basis_index: Option<usize>,
}

impl BasisReader {
    /// Opens this rank's basis file.
    ///
    /// # Errors
    /// Returns an error if the file is missing or lacks the interval index.
    pub fn new(base_file_name: &Path, format: DatabaseFormat, rank: usize) -> Result<Self, ThreadSafeStdError> {
        let path = rank_file_name(base_file_name, rank);
        let database = open_database(format, &path)?;
        let num_intervals = database.get_integer("num_time_intervals")?;
        let num_intervals =
            usize::try_from(num_intervals).map_err(|_| format!("{:?} has a negative interval count.", path))?;
        let time_interval_start_times = (0..num_intervals)
            .map(|i| database.get_double(&key("time", i)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            path,
            database,
            time_interval_start_times,
            last_basis_index: None,
        })
    }

    pub fn num_time_intervals(&self) -> usize {
        self.time_interval_start_times.len()
    }

    pub fn time_interval_start_times(&self) -> &[f64] {
        &self.time_interval_start_times
    }

    /// The interval whose span `[start_i, start_{i+1})` contains `time`; the
    /// last interval for anything else.
    fn interval_for(&self, time: f64) -> usize {
        assert!(self.num_time_intervals() > 0, "{:?} holds no time intervals.", self.path);
        assert!(time >= 0.0, "Time must be non-negative, got {}.", time);
        let starts = &self.time_interval_start_times;
        (0..starts.len() - 1)
            .find(|&i| starts[i] <= time && time < starts[i + 1])
            .unwrap_or(starts.len() - 1)
    }

    /// Whether `time` falls in a different interval than the last basis
    /// returned by [`BasisReader::get_basis`].
    pub fn is_new_basis(&self, time: f64) -> bool {
        let interval = self.interval_for(time);
        self.last_basis_index != Some(interval)
    }

    /// This rank's rows of the basis for the interval containing `time`.
    ///
    /// # Errors
    /// Returns an error if the interval's entries are missing or inconsistent.
    pub fn get_basis(&mut self, time: f64) -> Result<Matrix, ThreadSafeStdError> {
        let interval = self.interval_for(time);
        let num_rows = self.database.get_integer(&key("num_rows", interval))?;
        let num_cols = self.database.get_integer(&key("num_cols", interval))?;
        let values = self.database.get_double_array(&key("basis", interval))?;
        let (num_rows, num_cols) = (
            usize::try_from(num_rows).map_err(|_| format!("Negative row count for interval {}.", interval))?,
            usize::try_from(num_cols).map_err(|_| format!("Negative column count for interval {}.", interval))?,
        );
        let data = Array2::from_shape_vec((num_rows, num_cols), values)
            .map_err(|e| format!("Basis of interval {} in {:?} is malformed: {}", interval, self.path, e))?;
        self.last_basis_index = Some(interval);
        Ok(Matrix::from_array(data, true))
    }

    /// Singular values for the interval containing `time`.
    ///
    /// # Errors
    /// Returns an error if the entry is missing.
    pub fn get_singular_values(&self, time: f64) -> Result<Array1<f64>, ThreadSafeStdError> {
        let interval = self.interval_for(time);
        Ok(Array1::from(self.database.get_double_array(&key("singular_values", interval))?))
    }
}
