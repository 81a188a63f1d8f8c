use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use turnstile_core::{SchedulerError, SessionId};

/// A session waiting for its turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub session_id: SessionId,
    pub enqueued_at: DateTime<Utc>,
}

/// Result of an enqueue. Positions are 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    Added { position: usize },
    AlreadyQueued { position: usize },
}

impl Enqueued {
    pub fn position(self) -> usize {
        match self {
            Self::Added { position } | Self::AlreadyQueued { position } => position,
        }
    }
}

/// FIFO waitlist holding each session at most once.
///
/// All operations take the same lock, so enqueue, dequeue and pop are
/// linearizable with respect to each other.
pub struct WaitingQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    max_depth: Option<usize>,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_depth: None,
        }
    }

    pub fn with_max_depth(max_depth: Option<usize>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_depth,
        }
    }

    /// Append unless already present. A duplicate is never an error, even
    /// when the queue is full.
    pub fn enqueue(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, SchedulerError> {
        let mut entries = self.entries.lock();
        if let Some(idx) = entries.iter().position(|e| &e.session_id == session_id) {
            return Ok(Enqueued::AlreadyQueued { position: idx + 1 });
        }
        if let Some(limit) = self.max_depth {
            if entries.len() >= limit {
                return Err(SchedulerError::CapacityExceeded { limit });
            }
        }
        entries.push_back(QueueEntry {
            session_id: session_id.clone(),
            enqueued_at: now,
        });
        Ok(Enqueued::Added {
            position: entries.len(),
        })
    }

    /// Remove the session wherever it sits. Returns whether it was queued.
    pub fn dequeue(&self, session_id: &SessionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| &e.session_id != session_id);
        entries.len() != before
    }

    pub fn pop_front(&self) -> Option<QueueEntry> {
        self.entries.lock().pop_front()
    }

    /// Put a popped entry back at the head.
    ///
    /// If the session re-enqueued in the meantime that later entry is
    /// dropped, keeping one entry per session. Ignores the depth limit.
    pub fn push_front(&self, entry: QueueEntry) {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.session_id != entry.session_id);
        entries.push_front(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// 1-based position of a session.
    pub fn position(&self, session_id: &SessionId) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|e| &e.session_id == session_id)
            .map(|idx| idx + 1)
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl Default for WaitingQueue {
    fn default() -> Self {
        Self::new()
    }
}
