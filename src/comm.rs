// src/comm.rs

//! Process-group context for row-distributed data.
//!
//! Every distributed vector and matrix in this crate is split into contiguous
//! row blocks, one per rank. The only communication the algorithms need are
//! all-reductions, so that is all a [`Communicator`] has to provide. All ranks
//! must issue the same reductions in the same order.

use ndarray::{Array, Dimension};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Collective operations over a fixed group of cooperating ranks.
pub trait Communicator: Send + Sync + std::fmt::Debug {
    /// Rank of the calling process within the group, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Element-wise sum of `values` across all ranks. Every rank receives the result.
    fn all_reduce_sum(&self, values: &mut [f64]);

    /// Element-wise maximum of `values` across all ranks. Every rank receives the result.
    fn all_reduce_max(&self, values: &mut [f64]);

    /// Sums a count across ranks (e.g. the global row dimension).
    fn all_reduce_sum_usize(&self, value: usize) -> usize {
        let mut buffer = [value as f64];
        self.all_reduce_sum(&mut buffer);
        buffer[0].round() as usize
    }
}

/// Sums an ndarray in place across all ranks, whatever its memory layout.
pub fn all_reduce_sum_array<D: Dimension>(comm: &dyn Communicator, array: &mut Array<f64, D>) {
    match array.as_slice_memory_order_mut() {
        Some(slice) => comm.all_reduce_sum(slice),
        None => {
            let mut buffer: Vec<f64> = array.iter().copied().collect();
            comm.all_reduce_sum(&mut buffer);
            array
                .iter_mut()
                .zip(buffer)
                .for_each(|(dst, reduced)| *dst = reduced);
        }
    }
}

/// The degenerate one-rank group. Reductions are no-ops.
#[derive(Debug, Default, Copy, Clone)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) {}

    fn all_reduce_max(&self, _values: &mut [f64]) {}
}

#[derive(Debug, Default)]
struct Rendezvous {
    arrived: usize,
    generation: u64,
    /// Set when a rank unwinds; every later or pending wait panics.
    broken: bool,
}

#[derive(Debug)]
struct ReductionTable {
    size: usize,
    rendezvous: Mutex<Rendezvous>,
    released: Condvar,
    slots: Mutex<Vec<Vec<f64>>>,
}

const PEER_PANICKED: &str = "A rank of the thread group panicked; the collective cannot complete.";

impl ReductionTable {
    /// Blocks until every rank has arrived.
    fn wait(&self) {
        let mut state = self.rendezvous.lock().unwrap_or_else(PoisonError::into_inner);
        if state.broken {
            drop(state);
            panic!("{}", PEER_PANICKED);
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return;
        }
        while state.generation == generation && !state.broken {
            state = self.released.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation == generation {
            drop(state);
            panic!("{}", PEER_PANICKED);
        }
    }

    fn break_group(&self) {
        let mut state = self.rendezvous.lock().unwrap_or_else(PoisonError::into_inner);
        state.broken = true;
        self.released.notify_all();
    }
}

/// An in-process group of ranks, one per thread.
///
/// Each rank publishes its contribution into a shared slot table, waits for the
/// others, and folds the slots in rank order. Because every rank folds the same
/// slots in the same order, the reduced values are bit-identical on all ranks.
///
/// A rank whose thread panics breaks the group when its handle is dropped, and
/// its peers panic at their next collective instead of waiting forever. A rank
/// that simply stops issuing collectives still blocks its peers.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    size: usize,
    table: Arc<ReductionTable>,
}

impl ThreadGroup {
    /// Creates the handles for a group of `size` ranks. Handle `i` has rank `i`
    /// and must be moved to its own thread.
    pub fn new(size: usize) -> Vec<ThreadGroup> {
        assert!(size > 0, "A thread group needs at least one rank.");
        let table = Arc::new(ReductionTable {
            size,
            rendezvous: Mutex::new(Rendezvous::default()),
            released: Condvar::new(),
            slots: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| ThreadGroup {
                rank,
                size,
                table: Arc::clone(&table),
            })
            .collect()
    }

    fn all_reduce(&self, values: &mut [f64], fold: fn(f64, f64) -> f64) {
        if self.size == 1 {
            return;
        }
        {
            let mut slots = self.table.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots[self.rank].clear();
            slots[self.rank].extend_from_slice(values);
        }
        self.table.wait();
        {
            let slots = self.table.slots.lock().unwrap_or_else(PoisonError::into_inner);
            for (rank, contribution) in slots.iter().enumerate() {
                assert_eq!(
                    contribution.len(),
                    values.len(),
                    "Rank {} contributed {} values to a reduction of {} values; ranks are out of lockstep.",
                    rank,
                    contribution.len(),
                    values.len()
                );
            }
            for (i, value) in values.iter_mut().enumerate() {
                let mut acc = slots[0][i];
                for contribution in slots.iter().skip(1) {
                    acc = fold(acc, contribution[i]);
                }
                *value = acc;
            }
        }
        // Nobody may overwrite a slot until every rank has read the table.
        self.table.wait();
    }
}

impl Drop for ThreadGroup {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.table.break_group();
        }
    }
}

impl Communicator for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) {
        self.all_reduce(values, |a, b| a + b);
    }

    fn all_reduce_max(&self, values: &mut [f64]) {
        self.all_reduce(values, f64::max);
    }
}
