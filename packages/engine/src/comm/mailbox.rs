// packages/engine/src/comm/mailbox.rs
//! Tagged receive queue
//!
//! All inbound messages of a process land on one channel. A receive for
//! `(from, tag)` takes the first matching message and stashes everything
//! else until someone asks for it, so per-sender, per-tag order is kept.

use crate::comm::Tag;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::ProcessId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::trace;

/// A message on the wire
#[derive(Debug, Clone)]
pub struct Message {
    pub from: ProcessId,
    pub tag: Tag,
    pub payload: Bytes,
}

pub struct Mailbox {
    inbox: tokio::sync::Mutex<UnboundedReceiver<Message>>,

    /// Messages received ahead of their matching `recv`
    stash: Mutex<HashMap<(ProcessId, Tag), VecDeque<Bytes>>>,
}

impl Mailbox {
    pub fn new(inbox: UnboundedReceiver<Message>) -> Self {
        Self {
            inbox: tokio::sync::Mutex::new(inbox),
            stash: Mutex::new(HashMap::new()),
        }
    }

    fn take_stashed(&self, from: ProcessId, tag: Tag) -> Option<Bytes> {
        self.stash.lock().get_mut(&(from, tag)).and_then(|queue| queue.pop_front())
    }

    /// Wait for the next message from `from` with `tag`
    pub async fn recv(&self, from: ProcessId, tag: Tag) -> Result<Bytes> {
        if let Some(payload) = self.take_stashed(from, tag) {
            return Ok(payload);
        }

        let mut inbox = self.inbox.lock().await;
        loop {
            // Another receiver may have stashed our message while we waited
            if let Some(payload) = self.take_stashed(from, tag) {
                return Ok(payload);
            }
            match inbox.recv().await {
                Some(message) if message.from == from && message.tag == tag => return Ok(message.payload),
                Some(message) => {
                    self.stash
                        .lock()
                        .entry((message.from, message.tag))
                        .or_default()
                        .push_back(message.payload);
                    trace!(
                        "Stashed {:?} from {} while waiting for {:?} from {} ({} stashed)",
                        message.tag,
                        message.from,
                        tag,
                        from,
                        self.stashed()
                    );
                }
                None => {
                    return Err(EngineError::CollectiveFailure(format!(
                        "inbox closed while waiting for {:?} from {}",
                        tag, from
                    )))
                }
            }
        }
    }

    /// Messages waiting in the stash
    pub fn stashed(&self) -> usize {
        self.stash.lock().values().map(|q| q.len()).sum()
    }
}
