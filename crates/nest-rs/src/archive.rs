//! Spike history of a neuron, read by plastic connections that target it.
//!
//! While at least one reader (one per plastic connection) is registered,
//! every output spike is appended together with the post-synaptic traces at
//! that instant. Readers announce how far they have consumed the history
//! through a watermark. An entry is erased once it lies below every
//! watermark and each registered reader has been handed it, except for the
//! newest such entry, kept so traces can still be evaluated from it.

use oldies_core::Time;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{vec_deque, BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

/// Tolerance when comparing spike times of archive entries (ms)
pub const STDP_EPS: f64 = 1.0e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArchiveError {
    #[error("History window ({t1}, {t2}] reaches back to {pruned_through} ms, which was already pruned")]
    WindowPruned { t1: Time, t2: Time, pruned_through: Time },

    #[error("Unknown archive reader {0:?}")]
    UnknownReader(ReaderId),

    #[error("Reader {reader:?} cannot move its watermark back from {current} to {requested} ms")]
    WatermarkRegressed {
        reader: ReaderId,
        current: Time,
        requested: Time,
    },
}

/// Decay constants of the post-synaptic traces (ms)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceConstants {
    pub tau_minus: f64,
    pub tau_minus_triplet: f64,
}

impl Default for TraceConstants {
    fn default() -> Self {
        Self {
            tau_minus: 20.0,
            tau_minus_triplet: 110.0,
        }
    }
}

/// One recorded output spike
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistEntry {
    pub t: Time,
    /// K- just after this spike
    pub trace_fast: f64,
    /// Triplet K- just after this spike
    pub trace_triplet: f64,
    /// How many times this entry was handed to readers, or skipped by a
    /// reader registered after it
    pub access_count: usize,
}

/// Trace values seen at some time, from the spikes strictly before it
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TraceValues {
    pub fast: f64,
    pub nearest_neighbor: f64,
    pub triplet: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReaderId(u64);

#[derive(Debug, Clone, Copy)]
struct Watermark(Time);

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Watermark {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Watermark {}

// ============================================================================
// ARCHIVE
// ============================================================================

#[derive(Debug, Clone)]
pub struct SpikeHistoryArchive {
    history: VecDeque<HistEntry>,
    constants: TraceConstants,
    kminus: f64,
    kminus_triplet: f64,
    last_spike: Option<Time>,
    readers: BTreeMap<ReaderId, Watermark>,
    watermarks: BTreeSet<(Watermark, ReaderId)>,
    next_reader: u64,
    pruned_through: Option<Time>,
}

impl SpikeHistoryArchive {
    pub fn new(constants: TraceConstants) -> Self {
        Self {
            history: VecDeque::new(),
            constants,
            kminus: 0.0,
            kminus_triplet: 0.0,
            last_spike: None,
            readers: BTreeMap::new(),
            watermarks: BTreeSet::new(),
            next_reader: 0,
            pruned_through: None,
        }
    }

    pub fn constants(&self) -> TraceConstants {
        self.constants
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn last_spike(&self) -> Option<Time> {
        self.last_spike
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Lowest watermark over registered readers
    pub fn min_watermark(&self) -> Option<Time> {
        self.watermarks.first().map(|(w, _)| w.0)
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistEntry> {
        self.history.iter()
    }

    /// Account for an output spike at `t`. The traces always advance; the
    /// entry is stored only while some reader is registered.
    ///
    /// # Panics
    /// If `t` precedes the previously recorded spike.
    pub fn record_spike(&mut self, t: Time) {
        if let Some(last) = self.last_spike {
            assert!(
                t >= last - STDP_EPS,
                "spike at {t} ms recorded after a later spike at {last} ms"
            );
            self.kminus *= ((last - t) / self.constants.tau_minus).exp();
            self.kminus_triplet *= ((last - t) / self.constants.tau_minus_triplet).exp();
        }
        self.kminus += 1.0;
        self.kminus_triplet += 1.0;
        self.last_spike = Some(t);

        if self.readers.is_empty() {
            return;
        }
        self.prune();
        self.history.push_back(HistEntry {
            t,
            trace_fast: self.kminus,
            trace_triplet: self.kminus_triplet,
            access_count: 0,
        });
    }

    /// Register a reader that will never ask for entries at or before
    /// `first_read_time`.
    ///
    /// Entries already erased cannot be handed out any more, so the reader's
    /// watermark starts no earlier than the last erased entry; see
    /// [`SpikeHistoryArchive::watermark`].
    pub fn register_reader(&mut self, first_read_time: Time) -> ReaderId {
        let first_read_time = self.pruned_through.map_or(first_read_time, |p| first_read_time.max(p));
        // entries this reader will never read count as already read by it
        for entry in self
            .history
            .iter_mut()
            .take_while(|e| e.t <= first_read_time + STDP_EPS)
        {
            entry.access_count += 1;
        }

        let id = ReaderId(self.next_reader);
        self.next_reader += 1;
        let mark = Watermark(first_read_time);
        self.readers.insert(id, mark);
        self.watermarks.insert((mark, id));
        id
    }

    /// Time up to which `reader` has consumed the history
    pub fn watermark(&self, reader: ReaderId) -> Result<Time, ArchiveError> {
        self.readers
            .get(&reader)
            .map(|w| w.0)
            .ok_or(ArchiveError::UnknownReader(reader))
    }

    /// The reader will never again read entries at or before `last_read_time`.
    pub fn unregister_reader(&mut self, reader: ReaderId, last_read_time: Time) -> Result<(), ArchiveError> {
        let current = *self
            .readers
            .get(&reader)
            .ok_or(ArchiveError::UnknownReader(reader))?;
        if last_read_time < current.0 - STDP_EPS {
            return Err(ArchiveError::WatermarkRegressed {
                reader,
                current: current.0,
                requested: last_read_time,
            });
        }
        let mark = Watermark(last_read_time.max(current.0));
        self.watermarks.remove(&(current, reader));
        self.watermarks.insert((mark, reader));
        self.readers.insert(reader, mark);
        self.prune();
        Ok(())
    }

    /// Drop a reader entirely, e.g. when its connection is deleted.
    pub fn remove_reader(&mut self, reader: ReaderId) -> Result<(), ArchiveError> {
        let mark = self
            .readers
            .remove(&reader)
            .ok_or(ArchiveError::UnknownReader(reader))?;
        self.watermarks.remove(&(mark, reader));
        self.prune();
        Ok(())
    }

    /// Erase head entries that lie below every watermark and were handed to
    /// every registered reader, keeping the newest of them as trace anchor.
    /// Without readers nothing is kept.
    fn prune(&mut self) {
        let Some(mark) = self.min_watermark() else {
            if let Some(newest) = self.history.back() {
                self.pruned_through = Some(newest.t);
            }
            self.history.clear();
            return;
        };
        let readers = self.readers.len();
        while self.history.len() > 1
            && self.history[1].t < mark - STDP_EPS
            && self.history[0].access_count >= readers
        {
            if let Some(erased) = self.history.pop_front() {
                self.pruned_through = Some(erased.t);
            }
        }
    }

    /// Entries with `t1 < t <= t2`, counted as read while iterating.
    pub fn read_window(&mut self, t1: Time, t2: Time) -> Result<HistoryWindow<'_>, ArchiveError> {
        if let Some(pruned_through) = self.pruned_through {
            if pruned_through >= t1 + STDP_EPS {
                return Err(ArchiveError::WindowPruned { t1, t2, pruned_through });
            }
        }
        let lo = t1 + STDP_EPS;
        let hi = t2 + STDP_EPS;
        let start = self.history.partition_point(|e| e.t < lo);
        let end = self.history.partition_point(|e| e.t < hi).max(start);
        Ok(HistoryWindow {
            inner: self.history.range_mut(start..end),
        })
    }

    /// Latest spike strictly before `t`, with its traces. The running traces
    /// cover the newest spike even when no reader was there to store it.
    fn latest_before(&self, t: Time) -> Option<HistEntry> {
        if let Some(last) = self.last_spike.filter(|&last| t - last > STDP_EPS) {
            return Some(HistEntry {
                t: last,
                trace_fast: self.kminus,
                trace_triplet: self.kminus_triplet,
                access_count: 0,
            });
        }
        self.history.iter().rev().find(|e| t - e.t > STDP_EPS).copied()
    }

    /// K- at time `t`, decayed from the latest spike strictly before `t`.
    pub fn value_at(&self, t: Time) -> f64 {
        self.latest_before(t)
            .map_or(0.0, |e| e.trace_fast * ((e.t - t) / self.constants.tau_minus).exp())
    }

    /// All-to-all, nearest-neighbour and triplet traces at `t`.
    pub fn traces_at(&self, t: Time) -> TraceValues {
        let Some(e) = self.latest_before(t) else {
            return TraceValues::default();
        };
        let decay = ((e.t - t) / self.constants.tau_minus).exp();
        TraceValues {
            fast: e.trace_fast * decay,
            nearest_neighbor: decay,
            triplet: e.trace_triplet * ((e.t - t) / self.constants.tau_minus_triplet).exp(),
        }
    }

    /// Forget all spikes; registered readers stay registered.
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.kminus = 0.0;
        self.kminus_triplet = 0.0;
        self.last_spike = None;
        self.pruned_through = None;
    }
}

/// Forward-only view over a history window
pub struct HistoryWindow<'a> {
    inner: vec_deque::IterMut<'a, HistEntry>,
}

impl Iterator for HistoryWindow<'_> {
    type Item = HistEntry;

    fn next(&mut self) -> Option<HistEntry> {
        let entry = self.inner.next()?;
        entry.access_count += 1;
        Some(*entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for HistoryWindow<'_> {}
