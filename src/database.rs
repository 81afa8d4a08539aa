// src/database.rs

//! Flat key/value files for bases and singular values.
//!
//! A database is a map from string keys to integer or double arrays, held in
//! memory and written out on [`Database::flush`] or [`Database::close`].
//! Two on-disk formats exist: a compact bincode encoding and a line-oriented
//! text format (`key kind count v1 v2 ...`) that can be inspected by hand.

use crate::ThreadSafeStdError;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseFormat {
    /// bincode encoding of the key map.
    Binary,
    /// One entry per line.
    Text,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Entry {
    Integers(Vec<i64>),
    Doubles(Vec<f64>),
}

impl Entry {
    fn kind(&self) -> &'static str {
        match self {
            Entry::Integers(_) => "int",
            Entry::Doubles(_) => "double",
        }
    }
}

/// A keyed store of integer and double arrays.
pub trait Database: std::fmt::Debug {
    fn put_integer_array(&mut self, key: &str, values: &[i64]);

    fn put_double_array(&mut self, key: &str, values: &[f64]);

    fn put_integer(&mut self, key: &str, value: i64) {
        self.put_integer_array(key, &[value]);
    }

    fn put_double(&mut self, key: &str, value: f64) {
        self.put_double_array(key, &[value]);
    }

    fn get_integer_array(&self, key: &str) -> Result<Vec<i64>, ThreadSafeStdError>;

    fn get_double_array(&self, key: &str) -> Result<Vec<f64>, ThreadSafeStdError>;

    fn get_integer(&self, key: &str) -> Result<i64, ThreadSafeStdError> {
        single(key, self.get_integer_array(key)?)
    }

    fn get_double(&self, key: &str) -> Result<f64, ThreadSafeStdError> {
        single(key, self.get_double_array(key)?)
    }

    /// Writes pending changes to disk. A no-op for read-only databases.
    fn flush(&mut self) -> Result<(), ThreadSafeStdError>;

    /// Flushes and releases the database. Further puts panic.
    fn close(&mut self) -> Result<(), ThreadSafeStdError>;
}

fn single<T>(key: &str, mut values: Vec<T>) -> Result<T, ThreadSafeStdError> {
    if values.len() != 1 {
        return Err(format!("Key '{}' holds {} values, expected a scalar.", key, values.len()).into());
    }
    Ok(values.remove(0))
}

/// Creates (or truncates) a database at `path` and returns it open for writing.
///
/// # Errors
/// Returns an error if the file cannot be created.
pub fn create_database(format: DatabaseFormat, path: &Path) -> Result<Box<dyn Database>, ThreadSafeStdError> {
    let mut database = FileDatabase {
        path: path.to_path_buf(),
        format,
        entries: BTreeMap::new(),
        writable: true,
        dirty: true,
        closed: false,
    };
    database.flush()?;
    debug!("Created {:?} database at {:?}.", format, path);
    Ok(Box::new(database))
}

/// Opens an existing database at `path` read-only.
///
/// # Errors
/// Returns an error if the file is missing or malformed.
pub fn open_database(format: DatabaseFormat, path: &Path) -> Result<Box<dyn Database>, ThreadSafeStdError> {
    let file = File::open(path).map_err(|e| format!("Failed to open database at {:?}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let entries = match format {
        DatabaseFormat::Binary => bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| format!("Failed to decode database {:?}: {}", path, e))?,
        DatabaseFormat::Text => parse_text(reader, path)?,
    };
    debug!("Opened {:?} database at {:?}.", format, path);
    Ok(Box::new(FileDatabase {
        path: path.to_path_buf(),
        format,
        entries,
        writable: false,
        dirty: false,
        closed: false,
    }))
}

#[derive(Debug)]
struct FileDatabase {
    path: PathBuf,
    format: DatabaseFormat,
    entries: BTreeMap<String, Entry>,
    writable: bool,
    dirty: bool,
    closed: bool,
}

impl FileDatabase {
    fn put(&mut self, key: &str, entry: Entry) {
        assert!(!self.closed, "Cannot write '{}' to a closed database.", key);
        assert!(self.writable, "Cannot write '{}' to a database opened read-only.", key);
        assert!(
            !key.is_empty() && !key.chars().any(char::is_whitespace),
            "Database keys must be non-empty and free of whitespace, got '{}'.",
            key
        );
        self.entries.insert(key.to_string(), entry);
        self.dirty = true;
    }

    fn get(&self, key: &str) -> Result<&Entry, ThreadSafeStdError> {
        self.entries
            .get(key)
            .ok_or_else(|| format!("Key '{}' not found in database {:?}.", key, self.path).into())
    }

    fn write_text(&self, writer: &mut impl Write) -> std::io::Result<()> {
        for (key, entry) in &self.entries {
            write!(writer, "{} {}", key, entry.kind())?;
            match entry {
                Entry::Integers(values) => {
                    write!(writer, " {}", values.len())?;
                    for v in values {
                        write!(writer, " {}", v)?;
                    }
                }
                Entry::Doubles(values) => {
                    write!(writer, " {}", values.len())?;
                    // `Display` for f64 prints the shortest representation that round-trips.
                    for v in values {
                        write!(writer, " {}", v)?;
                    }
                }
            }
            writeln!(writer)?;
        }
        Ok(())
    }
}

fn parse_text(reader: impl BufRead, path: &Path) -> Result<BTreeMap<String, Entry>, ThreadSafeStdError> {
    let mut entries = BTreeMap::new();
    for (line_number, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("Failed to read {:?}: {}", path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |what: &str| format!("{:?} line {}: {}", path, line_number + 1, what);
        let mut fields = line.split_whitespace();
        let key = fields.next().ok_or_else(|| malformed("missing key"))?;
        let kind = fields.next().ok_or_else(|| malformed("missing kind"))?;
        let count: usize = fields
            .next()
            .ok_or_else(|| malformed("missing count"))?
            .parse()
            .map_err(|e| malformed(&format!("bad count: {}", e)))?;
        let values: Vec<&str> = fields.collect();
        if values.len() != count {
            return Err(malformed(&format!("expected {} values, found {}", count, values.len())).into());
        }
        let entry = match kind {
            "int" => Entry::Integers(
                values
                    .iter()
                    .map(|v| v.parse::<i64>())
                    .collect::<Result<_, _>>()
                    .map_err(|e| malformed(&format!("bad integer: {}", e)))?,
            ),
            "double" => Entry::Doubles(
                values
                    .iter()
                    .map(|v| v.parse::<f64>())
                    .collect::<Result<_, _>>()
                    .map_err(|e| malformed(&format!("bad double: {}", e)))?,
            ),
            other => return Err(malformed(&format!("unknown kind '{}'", other)).into()),
        };
        entries.insert(key.to_string(), entry);
    }
    Ok(entries)
}

impl Database for FileDatabase {
    fn put_integer_array(&mut self, key: &str, values: &[i64]) {
        self.put(key, Entry::Integers(values.to_vec()));
    }

    fn put_double_array(&mut self, key: &str, values: &[f64]) {
        self.put(key, Entry::Doubles(values.to_vec()));
    }

    fn get_integer_array(&self, key: &str) -> Result<Vec<i64>, ThreadSafeStdError> {
        match self.get(key)? {
            Entry::Integers(values) => Ok(values.clone()),
            Entry::Doubles(_) => Err(format!("Key '{}' holds doubles, not integers.", key).into()),
        }
    }

    fn get_double_array(&self, key: &str) -> Result<Vec<f64>, ThreadSafeStdError> {
        match self.get(key)? {
            Entry::Doubles(values) => Ok(values.clone()),
            Entry::Integers(_) => Err(format!("Key '{}' holds integers, not doubles.", key).into()),
        }
    }

    fn flush(&mut self) -> Result<(), ThreadSafeStdError> {
        if !self.writable || !self.dirty {
            return Ok(());
        }
        let file = File::create(&self.path).map_err(|e| format!("Failed to create database at {:?}: {}", self.path, e))?;
        let mut writer = BufWriter::new(file);
        match self.format {
            DatabaseFormat::Binary => {
                bincode::serde::encode_into_std_write(&self.entries, &mut writer, bincode::config::standard())
                    .map_err(|e| format!("Failed to encode database {:?}: {}", self.path, e))?;
            }
            DatabaseFormat::Text => {
                self.write_text(&mut writer)
                    .map_err(|e| format!("Failed to write database {:?}: {}", self.path, e))?;
            }
        }
        writer
            .flush()
            .map_err(|e| format!("Failed to flush database {:?}: {}", self.path, e))?;
        self.dirty = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ThreadSafeStdError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for FileDatabase {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!("Failed to write database {:?} on drop: {}", self.path, e);
            }
        }
    }
}
