//! In-flight request table

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::RequestError;

/// Outcome delivered to a waiting caller
pub type Outcome = std::result::Result<Value, RequestError>;

/// One request awaiting its response
#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub created_at: Instant,
    pub deadline: Instant,
    tx: oneshot::Sender<Outcome>,
}

/// Pending requests keyed by id
///
/// Each id has exactly one slot; every path out of the table (response,
/// expiry, connection loss) consumes it.
#[derive(Debug, Default)]
pub struct PendingTable {
    slots: HashMap<String, PendingRequest>,
}

impl PendingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot and return the receiver for its outcome
    pub fn insert(&mut self, id: String, now: Instant, deadline: Instant) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(
            id.clone(),
            PendingRequest {
                id,
                created_at: now,
                deadline,
                tx,
            },
        );
        rx
    }

    /// Deliver an outcome; false if the id is unknown or already gone
    pub fn resolve(&mut self, id: &str, outcome: Outcome) -> bool {
        match self.slots.remove(id) {
            Some(slot) => {
                // The caller may have stopped waiting
                let _ = slot.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Free a slot without delivering anything
    pub fn remove(&mut self, id: &str) -> Option<PendingRequest> {
        self.slots.remove(id)
    }

    /// Reject every pending request; returns how many there were
    pub fn reject_all(&mut self, error: &RequestError) -> usize {
        let count = self.slots.len();
        for (_, slot) in self.slots.drain() {
            let _ = slot.tx.send(Err(error.clone()));
        }
        count
    }

    /// Time out requests whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> usize {
        let overdue: Vec<String> = self
            .slots
            .values()
            .filter(|slot| slot.deadline <= now)
            .map(|slot| slot.id.clone())
            .collect();
        for id in &overdue {
            self.resolve(id, Err(RequestError::Timeout));
        }
        overdue.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
