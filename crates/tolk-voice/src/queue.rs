//! Bookkeeping for turns the remote peer has not finished yet.
//!
//! The remote "turn complete" signal carries no turn id. Confirmation therefore
//! assumes the peer completes turns in the order they were sent and never runs
//! two turns at once: [`TurnQueue::confirm_oldest`] always retires the oldest
//! outstanding entry. If the peer ever overlaps or reorders turns, confirmations
//! are misattributed; `fifo_assumption_misattributes_reordered_completions`
//! in the tests pins that behaviour down.

use crate::turn::TurnPackage;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Audio not yet on the wire (held locally or waiting for a connection)
    Pending,
    /// Sent, awaiting the remote turn-complete
    InFlight,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    turn: TurnPackage,
    state: EntryState,
}

/// FIFO of outstanding turns, each either pending or in flight
#[derive(Debug, Default)]
pub struct TurnQueue {
    entries: VecDeque<QueueEntry>,
}

impl TurnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a turn as pending
    pub fn enqueue(&mut self, turn: TurnPackage) {
        debug!(turn = %turn.id, "Turn queued");
        self.entries.push_back(QueueEntry {
            turn,
            state: EntryState::Pending,
        });
    }

    /// Mark one pending turn as sent. Returns false if no pending turn has that id.
    pub fn mark_sent(&mut self, id: &str) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.state == EntryState::Pending && e.turn.id == id)
        {
            Some(entry) => {
                entry.state = EntryState::InFlight;
                true
            }
            None => false,
        }
    }

    /// Move every pending turn to in-flight and return them in order.
    ///
    /// This is bookkeeping for mode transitions and burst flushes; it is not a
    /// remote confirmation.
    pub fn flush_all(&mut self) -> Vec<TurnPackage> {
        let mut flushed = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.state == EntryState::Pending {
                entry.state = EntryState::InFlight;
                flushed.push(entry.turn.clone());
            }
        }
        if !flushed.is_empty() {
            debug!(count = flushed.len(), "Pending turns flushed to in-flight");
        }
        flushed
    }

    /// Retire the oldest outstanding turn. False when nothing is outstanding.
    pub fn confirm_oldest(&mut self) -> bool {
        self.pop_oldest().is_some()
    }

    /// Retire and return the oldest outstanding turn
    pub fn pop_oldest(&mut self) -> Option<TurnPackage> {
        let entry = self.entries.pop_front()?;
        debug!(turn = %entry.turn.id, "Turn confirmed");
        Some(entry.turn)
    }

    /// Drop everything; used on disconnect and forced restarts
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    /// Number of pending turns
    pub fn len(&self) -> usize {
        self.count(EntryState::Pending)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.count(EntryState::InFlight)
    }

    pub fn is_pending_work(&self) -> bool {
        !self.entries.is_empty()
    }

    fn count(&self, state: EntryState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }
}
