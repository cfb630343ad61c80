// packages/engine/src/transport/envelope.rs
//! Migration envelope
//!
//! The unit carried between processes: a scenario payload plus everything
//! the receiver needs to put it back into a field and the schedule.

use crate::partition::geometry::RealPoint;
use crate::utils::ids::{EntityId, FieldId, ProcessId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scenario payload: a tagged union of every entity kind that can migrate.
///
/// Implementors are usually a serde enum with one variant per kind. The
/// entity id is what survives a round trip and keys the registry
/// bookkeeping; plain field values (e.g. grid cells) have none.
pub trait Payload: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    fn entity_id(&self) -> Option<EntityId>;
}

/// How the receiver schedules an arriving entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScheduleMeta {
    /// Not an agent; only placed in its field
    Static,

    /// Stepped once at `time` (`None`: the step after arrival)
    Once { ordering: i32, time: Option<f64> },

    /// Stepped every `interval` starting at `time` (`None`: the step after arrival)
    Repeating {
        ordering: i32,
        time: Option<f64>,
        interval: f64,
    },
}

impl ScheduleMeta {
    pub fn is_agent(&self) -> bool {
        !matches!(self, ScheduleMeta::Static)
    }
}

/// A payload in transit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P, const D: usize> {
    /// Process that queued this envelope
    pub source: ProcessId,

    /// Process that must receive it
    pub destination: ProcessId,

    /// Position in the target field
    pub location: Option<RealPoint<D>>,

    /// Target field
    pub field: Option<FieldId>,

    pub schedule: ScheduleMeta,

    /// Registry name to re-establish at the receiver
    pub exported_name: Option<String>,

    pub payload: P,
}

impl<P: Payload, const D: usize> Envelope<P, D> {
    pub fn entity_id(&self) -> Option<EntityId> {
        self.payload.entity_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_meta_agent() {
        assert!(!ScheduleMeta::Static.is_agent());
        assert!(ScheduleMeta::Once { ordering: 0, time: None }.is_agent());
        assert!(ScheduleMeta::Repeating { ordering: 1, time: Some(3.0), interval: 1.0 }.is_agent());
    }
}
