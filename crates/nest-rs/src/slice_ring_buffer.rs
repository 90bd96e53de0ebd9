//! Per-target queue of off-grid events.
//!
//! The ring holds one slot per min-delay slice, enough slots to cover every
//! delay up to the maximum. Spikes are appended unordered as they arrive and
//! are sorted once per slice by [`SliceRingBuffer::prepare_delivery`]; the
//! update loop then drains them step by step in chronological order.
//!
//! A neuron's own refractory period ends with a pseudo-event kept outside the
//! ring. There is never more than one pending.

use oldies_core::{PreciseTime, Step};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What a delivered event means to the receiving neuron
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Spike,
    RefractoryReturn,
}

/// One delivered event; the step is the one that was requested.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Offset back from the right edge of the step
    pub offset: f64,
    /// Zero for a refractory return
    pub weight: f64,
    pub kind: EventKind,
}

impl Delivery {
    pub fn is_refractory_return(&self) -> bool {
        self.kind == EventKind::RefractoryReturn
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct QueuedSpike {
    at: PreciseTime,
    weight: f64,
}

/// Ring buffer of spike slots indexed by slice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceRingBuffer {
    slots: Vec<Vec<QueuedSpike>>,
    min_delay: Step,
    origin: Step,
    active: usize,
    refractory: Option<PreciseTime>,
    last_requested: Option<Step>,
}

impl SliceRingBuffer {
    /// Delay extrema in steps; `min_delay` is also the slice length.
    pub fn new(min_delay: Step, max_delay: Step) -> Self {
        let mut buffer = Self {
            slots: Vec::new(),
            min_delay: 1,
            origin: 0,
            active: 0,
            refractory: None,
            last_requested: None,
        };
        buffer.resize(min_delay, max_delay);
        buffer
    }

    /// Re-dimension the ring for new delay extrema. Drops all content.
    pub fn resize(&mut self, min_delay: Step, max_delay: Step) {
        assert!(min_delay >= 1, "min_delay must be at least one step, got {min_delay}");
        let max_delay = max_delay.max(min_delay);
        let n_slots = (min_delay + max_delay + min_delay - 1) / min_delay;
        self.min_delay = min_delay;
        self.slots = vec![Vec::new(); n_slots as usize];
        self.clear();
    }

    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn min_delay(&self) -> Step {
        self.min_delay
    }

    /// Start step of the slice about to be updated.
    pub fn set_origin(&mut self, origin: Step) {
        self.origin = origin;
    }

    pub fn origin(&self) -> Step {
        self.origin
    }

    fn slot_index(&self, rel_delivery: Step) -> usize {
        let n = self.slots.len() as Step;
        ((self.origin / self.min_delay + rel_delivery / self.min_delay) % n) as usize
    }

    /// Queue a spike due `rel_delivery` steps after the current origin.
    ///
    /// `stamp` and `offset` give the exact arrival time; ordering is deferred
    /// to [`SliceRingBuffer::prepare_delivery`].
    pub fn add_spike(&mut self, rel_delivery: Step, stamp: Step, offset: f64, weight: f64) {
        assert!(
            rel_delivery >= 0,
            "spike for stamp {stamp} delivered into the past (relative step {rel_delivery})"
        );
        assert!(
            rel_delivery / self.min_delay < self.slots.len() as Step,
            "relative delivery {rel_delivery} exceeds ring capacity of {} slices",
            self.slots.len()
        );
        let idx = self.slot_index(rel_delivery);
        self.slots[idx].push(QueuedSpike {
            at: PreciseTime::new(stamp, offset),
            weight,
        });
    }

    /// Schedule the end of the refractory period.
    ///
    /// # Panics
    /// If a refractory return is already pending.
    pub fn add_refractory(&mut self, stamp: Step, offset: f64) {
        assert!(
            self.refractory.is_none(),
            "refractory return already pending at {:?}; cannot add another at stamp {stamp}",
            self.refractory
        );
        self.refractory = Some(PreciseTime::new(stamp, offset));
    }

    pub fn pending_refractory(&self) -> Option<PreciseTime> {
        self.refractory
    }

    /// Sort the current slice so the earliest event is taken first.
    pub fn prepare_delivery(&mut self) {
        self.active = self.slot_index(0);
        // descending, so `pop` yields the earliest
        self.slots[self.active].sort_by(|a, b| b.at.cmp(&a.at));
    }

    /// Next event due in step `requested_stamp`, if any.
    ///
    /// A refractory return is preferred over a spike at the same instant.
    /// With `accumulate`, spikes sharing the exact same time are summed into
    /// a single delivery.
    ///
    /// # Panics
    /// If `requested_stamp` is older than a stamp already requested, or if an
    /// event older than `requested_stamp` is still queued.
    pub fn get_next(&mut self, requested_stamp: Step, accumulate: bool) -> Option<Delivery> {
        if let Some(last) = self.last_requested {
            assert!(
                requested_stamp >= last,
                "out-of-order delivery request: stamp {requested_stamp} after {last}"
            );
        }
        self.last_requested = Some(requested_stamp);

        let slot = &mut self.slots[self.active];
        let next_spike = slot.last().copied();

        if let Some(refractory) = self.refractory {
            if next_spike.map_or(true, |s| refractory <= s.at) {
                assert!(
                    refractory.step >= requested_stamp,
                    "refractory return at stamp {} was never delivered (now at {requested_stamp})",
                    refractory.step
                );
                if refractory.step == requested_stamp {
                    self.refractory = None;
                    return Some(Delivery {
                        offset: refractory.offset,
                        weight: 0.0,
                        kind: EventKind::RefractoryReturn,
                    });
                }
                return None;
            }
        }

        let next = next_spike?;
        match next.at.step.cmp(&requested_stamp) {
            Ordering::Greater => None,
            Ordering::Less => panic!(
                "spike for stamp {} was never delivered (now at {requested_stamp})",
                next.at.step
            ),
            Ordering::Equal => {
                slot.pop();
                let mut weight = next.weight;
                if accumulate {
                    while let Some(same) = slot.last() {
                        if same.at.step != requested_stamp || same.at.offset != next.at.offset {
                            break;
                        }
                        weight += same.weight;
                        slot.pop();
                    }
                }
                Some(Delivery {
                    offset: next.at.offset,
                    weight,
                    kind: EventKind::Spike,
                })
            }
        }
    }

    /// Drop everything in the current slice (e.g. for a frozen neuron).
    pub fn discard_events(&mut self) {
        self.slots[self.active].clear();
    }

    /// Empty all slots and the refractory marker.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.refractory = None;
        self.last_requested = None;
        self.active = 0;
    }

    /// Queued spikes across all slots
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.refractory.is_none()
    }
}
