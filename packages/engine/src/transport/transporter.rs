// packages/engine/src/transport/transporter.rs
//! Batched entity migration between neighboring partitions
//!
//! # Protocol
//!
//! ```text
//! queue_transport ──▶ outgoing[neighbor] (no network effect)
//!                          │
//! exchange() ─────────────┴─▶ one batch per neighbor
//!                              sizes round, payload round
//!                          │
//!                          ▼
//!                     received queue ──▶ drain_received()
//! ```
//!
//! The number of network operations per step is bounded by the neighbor
//! count, however many entities move.

use crate::comm::Communicator;
use crate::observability::metrics as names;
use crate::partition::geometry::RealPoint;
use crate::partition::Partition;
use crate::registry::PublicationIndex;
use crate::transport::codec::{decode_batch, encode_batch};
use crate::transport::envelope::{Envelope, Payload, ScheduleMeta};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{FieldId, ProcessId};
use metrics::counter;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};

/// Transporter statistics
#[derive(Debug, Clone, Default)]
pub struct TransporterStats {
    pub queued: u64,
    pub sent: u64,
    pub received: u64,
    pub rerouted: u64,
    pub exchanges: u64,
    pub bytes_sent: u64,
}

/// Per-process migration buffer
pub struct Transporter<P, const D: usize> {
    pid: ProcessId,

    /// Sorted, as of the last reload
    neighbors: Vec<ProcessId>,

    /// Envelopes per destination, in queue order
    outgoing: BTreeMap<ProcessId, Vec<Envelope<P, D>>>,

    received: VecDeque<Envelope<P, D>>,

    /// Entity -> published registry name, shared with the registry
    publications: PublicationIndex,

    /// Names whose entities left this process since the last take
    migrated: Vec<String>,

    stats: TransporterStats,
}

impl<P: Payload, const D: usize> Transporter<P, D> {
    pub fn new(partition: &Partition<D>, publications: PublicationIndex) -> Self {
        Self {
            pid: partition.pid(),
            neighbors: partition.neighbors().to_vec(),
            outgoing: BTreeMap::new(),
            received: VecDeque::new(),
            publications,
            migrated: Vec::new(),
            stats: TransporterStats::default(),
        }
    }

    pub fn neighbors(&self) -> &[ProcessId] {
        &self.neighbors
    }

    /// Whether `destination` can be queued for right now
    pub fn check_destination(&self, destination: ProcessId) -> Result<()> {
        if destination == self.pid {
            return Err(EngineError::InvalidDestination(format!(
                "process {} cannot transport to itself",
                self.pid
            )));
        }
        if self.neighbors.binary_search(&destination).is_err() {
            return Err(EngineError::InvalidDestination(format!(
                "process {} is not a neighbor of {} (neighbors {:?})",
                destination, self.pid, self.neighbors
            )));
        }
        Ok(())
    }

    /// Buffer a payload for a neighbor.
    ///
    /// The caller must already have removed the entity from local storage
    /// and the schedule. If the entity holds a registry publication the name
    /// travels with it and is recorded as migrated.
    pub fn queue_transport(
        &mut self,
        payload: P,
        destination: ProcessId,
        location: Option<RealPoint<D>>,
        field: Option<FieldId>,
        schedule: ScheduleMeta,
    ) -> Result<()> {
        self.check_destination(destination)?;

        let exported_name = payload
            .entity_id()
            .and_then(|id| self.publications.get(&id).map(|name| name.value().clone()));
        if let Some(name) = &exported_name {
            debug!("Entity {:?} leaves {} holding publication {}", payload.entity_id(), self.pid, name);
            self.migrated.push(name.clone());
        }

        self.push(Envelope {
            source: self.pid,
            destination,
            location,
            field,
            schedule,
            exported_name,
            payload,
        });
        Ok(())
    }

    /// Pass on a received envelope that this process does not own
    pub fn forward(&mut self, mut envelope: Envelope<P, D>, destination: ProcessId) -> Result<()> {
        self.check_destination(destination)?;
        trace!("Forwarding {:?} from {} to {}", envelope.entity_id(), self.pid, destination);
        envelope.source = self.pid;
        envelope.destination = destination;
        self.push(envelope);
        Ok(())
    }

    fn push(&mut self, envelope: Envelope<P, D>) {
        self.stats.queued += 1;
        self.outgoing.entry(envelope.destination).or_default().push(envelope);
    }

    /// Envelopes waiting for the next exchange
    pub fn pending(&self) -> usize {
        self.outgoing.values().map(Vec::len).sum()
    }

    /// Flush every buffer to its neighbor and collect what they sent.
    ///
    /// Collective: every neighbor must call it in the same step. Returns the
    /// number of envelopes received.
    pub async fn exchange(&mut self, comm: &dyn Communicator) -> Result<usize> {
        if let Some(stray) = self.outgoing.keys().find(|d| self.neighbors.binary_search(*d).is_err()) {
            return Err(EngineError::ProtocolViolation(format!(
                "envelopes buffered for non-neighbor {} on {}",
                stray, self.pid
            )));
        }

        let mut batches = Vec::with_capacity(self.neighbors.len());
        let mut sent = 0u64;
        for neighbor in &self.neighbors {
            let envelopes = self.outgoing.remove(neighbor).unwrap_or_default();
            sent += envelopes.len() as u64;
            batches.push(encode_batch(&envelopes)?);
        }
        let bytes: u64 = batches.iter().map(|b| b.len() as u64).sum();

        let incoming = comm.neighbor_exchange(&self.neighbors, batches).await?;

        let mut received = 0usize;
        for (from, data) in self.neighbors.iter().zip(incoming) {
            for envelope in decode_batch::<P, D>(data)? {
                if envelope.destination != self.pid {
                    return Err(EngineError::ProtocolViolation(format!(
                        "process {} received an envelope for {} from {}",
                        self.pid, envelope.destination, from
                    )));
                }
                self.received.push_back(envelope);
                received += 1;
            }
        }

        self.stats.exchanges += 1;
        self.stats.sent += sent;
        self.stats.received += received as u64;
        self.stats.bytes_sent += bytes;
        counter!(names::ENVELOPES_SENT).increment(sent);
        counter!(names::ENVELOPES_RECEIVED).increment(received as u64);
        counter!(names::EXCHANGE_BYTES).increment(bytes);
        debug!("Process {} exchange: sent {}, received {}", self.pid, sent, received);
        Ok(received)
    }

    /// Take every received envelope, in arrival order
    pub fn drain_received(&mut self) -> Vec<Envelope<P, D>> {
        self.received.drain(..).collect()
    }

    /// Registry names that left with their entities since the last call
    pub fn take_migrated_names(&mut self) -> Vec<String> {
        std::mem::take(&mut self.migrated)
    }

    /// Adopt the partition's neighbor set after a commit.
    ///
    /// Buffered envelopes addressed to a process that is no longer a
    /// neighbor are re-targeted to the first hop toward their location.
    pub fn reload(&mut self, partition: &Partition<D>) -> Result<()> {
        self.neighbors = partition.neighbors().to_vec();

        let stale: Vec<ProcessId> = self
            .outgoing
            .keys()
            .copied()
            .filter(|d| self.neighbors.binary_search(d).is_err())
            .collect();
        for destination in stale {
            for mut envelope in self.outgoing.remove(&destination).unwrap_or_default() {
                let target = match envelope.location {
                    Some(location) => location,
                    None => partition.bounds_of(destination)?.real_center(),
                };
                let hop = partition.next_hop(&target)?;
                if hop == self.pid {
                    // The region came to us; deliver locally on the next drain
                    warn!("Envelope for {} now lands on {} itself", destination, self.pid);
                    envelope.destination = self.pid;
                    self.received.push_back(envelope);
                    continue;
                }
                envelope.destination = hop;
                self.stats.rerouted += 1;
                self.outgoing.entry(hop).or_default().push(envelope);
            }
        }
        debug!("Transporter {} reloaded, neighbors {:?}", self.pid, self.neighbors);
        Ok(())
    }

    pub fn stats(&self) -> TransporterStats {
        self.stats.clone()
    }
}
