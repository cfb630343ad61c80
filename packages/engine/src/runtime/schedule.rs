// packages/engine/src/runtime/schedule.rs
//! Discrete-event schedule
//!
//! Logical time advances one unit per [`Schedule::step`], so processes
//! stepping in lockstep share a clock. Entries due at or before the new
//! time fire in `(time, ordering, insertion)` order; repeating entries are
//! re-queued `interval` later and fire at most once per step.

use crate::transport::ScheduleMeta;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::EntityId;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use tracing::trace;

/// Scheduling contract the migration layer relies on
pub trait Scheduler {
    /// Step `id` once at `time` (`None`: next step)
    fn schedule_once(&mut self, id: EntityId, ordering: i32, time: Option<f64>);

    /// Step `id` every `interval` from `time` (`None`: next step)
    fn schedule_repeating(&mut self, id: EntityId, ordering: i32, time: Option<f64>, interval: f64) -> Result<()>;

    /// Current logical time
    fn time(&self) -> f64;
}

#[derive(Debug, Clone, Copy)]
struct Key {
    time: f64,
    ordering: i32,
    seq: u64,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.ordering.cmp(&other.ordering))
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    key: Key,
    interval: Option<f64>,
}

/// Per-process agent schedule
#[derive(Debug, Default)]
pub struct Schedule {
    /// Min-heap; entries whose seq no longer matches `slots` are stale
    queue: BinaryHeap<Reverse<(Key, EntityId)>>,

    slots: HashMap<EntityId, Slot>,

    time: f64,

    steps: u64,

    next_seq: u64,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Number of scheduled entities
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Absolute time for a requested start; past times mean the next step
    fn resolve(&self, time: Option<f64>) -> f64 {
        match time {
            Some(t) if t.is_finite() && t > self.time => t,
            _ => self.time + 1.0,
        }
    }

    fn insert(&mut self, id: EntityId, ordering: i32, time: f64, interval: Option<f64>) {
        let key = Key {
            time,
            ordering,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.slots.insert(id, Slot { key, interval });
        self.queue.push(Reverse((key, id)));
    }

    /// Remove `id`, returning what a receiver needs to schedule it again
    pub fn unschedule(&mut self, id: EntityId) -> Option<ScheduleMeta> {
        let slot = self.slots.remove(&id)?;
        Some(match slot.interval {
            Some(interval) => ScheduleMeta::Repeating {
                ordering: slot.key.ordering,
                time: Some(slot.key.time),
                interval,
            },
            None => ScheduleMeta::Once {
                ordering: slot.key.ordering,
                time: Some(slot.key.time),
            },
        })
    }

    /// Schedule according to migrated metadata; `Static` is a no-op
    pub fn schedule_meta(&mut self, id: EntityId, meta: ScheduleMeta) -> Result<()> {
        match meta {
            ScheduleMeta::Static => Ok(()),
            ScheduleMeta::Once { ordering, time } => {
                self.schedule_once(id, ordering, time);
                Ok(())
            }
            ScheduleMeta::Repeating {
                ordering,
                time,
                interval,
            } => self.schedule_repeating(id, ordering, time, interval),
        }
    }

    /// Advance one time unit and return the entities due, in firing order
    pub fn step(&mut self) -> Vec<EntityId> {
        self.time += 1.0;
        self.steps += 1;

        let mut due = Vec::new();
        let mut requeue = Vec::new();
        while let Some(Reverse((key, id))) = self.queue.peek().copied() {
            if key.time > self.time {
                break;
            }
            self.queue.pop();
            let Some(slot) = self.slots.get(&id).copied() else {
                continue;
            };
            if slot.key.seq != key.seq {
                continue;
            }
            due.push(id);
            match slot.interval {
                Some(interval) => requeue.push((id, key.ordering, key.time + interval, interval)),
                None => {
                    self.slots.remove(&id);
                }
            }
        }
        for (id, ordering, time, interval) in requeue {
            let time = if time > self.time { time } else { self.time + 1.0 };
            self.insert(id, ordering, time, Some(interval));
        }
        trace!("Step {} at time {}: {} due", self.steps, self.time, due.len());
        due
    }
}

impl Scheduler for Schedule {
    fn schedule_once(&mut self, id: EntityId, ordering: i32, time: Option<f64>) {
        let time = self.resolve(time);
        self.insert(id, ordering, time, None);
    }

    fn schedule_repeating(&mut self, id: EntityId, ordering: i32, time: Option<f64>, interval: f64) -> Result<()> {
        if !(interval.is_finite() && interval > 0.0) {
            return Err(EngineError::Config(format!("repeat interval {} must be positive", interval)));
        }
        let time = self.resolve(time);
        self.insert(id, ordering, time, Some(interval));
        Ok(())
    }

    fn time(&self) -> f64 {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firing_order() {
        let mut schedule = Schedule::new();
        schedule.schedule_once(EntityId(1), 5, None);
        schedule.schedule_once(EntityId(2), 0, None);
        schedule.schedule_once(EntityId(3), 5, None);
        schedule.schedule_once(EntityId(4), 0, Some(2.0));

        assert_eq!(schedule.step(), vec![EntityId(2), EntityId(1), EntityId(3)]);
        assert_eq!(schedule.step(), vec![EntityId(4)]);
        assert!(schedule.step().is_empty());
        assert_eq!(schedule.time(), 3.0);
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_repeating() {
        let mut schedule = Schedule::new();
        schedule.schedule_repeating(EntityId(1), 0, None, 2.0).unwrap();
        schedule.schedule_repeating(EntityId(2), 0, None, 0.5).unwrap();
        assert!(schedule.schedule_repeating(EntityId(3), 0, None, 0.0).is_err());

        assert_eq!(schedule.step(), vec![EntityId(1), EntityId(2)]);
        assert_eq!(schedule.step(), vec![EntityId(2)]);
        assert_eq!(schedule.step(), vec![EntityId(1), EntityId(2)]);
        assert_eq!(schedule.len(), 2);
    }

    #[test]
    fn test_unschedule_carries_meta() {
        let mut schedule = Schedule::new();
        schedule.schedule_repeating(EntityId(1), 3, Some(4.0), 1.5).unwrap();
        schedule.schedule_once(EntityId(2), 1, None);
        schedule.step();

        assert_eq!(
            schedule.unschedule(EntityId(1)),
            Some(ScheduleMeta::Repeating {
                ordering: 3,
                time: Some(4.0),
                interval: 1.5
            })
        );
        assert_eq!(schedule.unschedule(EntityId(1)), None);
        // Already fired and gone
        assert_eq!(schedule.unschedule(EntityId(2)), None);
        assert!(schedule.step().is_empty());
    }

    #[test]
    fn test_reschedule_replaces_entry() {
        let mut schedule = Schedule::new();
        schedule.schedule_once(EntityId(1), 0, Some(5.0));
        schedule.schedule_once(EntityId(1), 0, None);
        assert_eq!(schedule.step(), vec![EntityId(1)]);
        for _ in 0..5 {
            assert!(schedule.step().is_empty());
        }
    }

    #[test]
    fn test_meta_past_time_means_next_step() {
        let mut schedule = Schedule::new();
        schedule.step();
        schedule.step();
        schedule
            .schedule_meta(EntityId(9), ScheduleMeta::Once { ordering: 0, time: Some(1.0) })
            .unwrap();
        schedule.schedule_meta(EntityId(10), ScheduleMeta::Static).unwrap();
        assert!(!schedule.contains(EntityId(10)));
        assert_eq!(schedule.step(), vec![EntityId(9)]);
    }
}
