//! The shared, serial processing queue.

use std::collections::VecDeque;

use crate::changelog::ChangeRecord;
use crate::remote::SourceId;

/// A record waiting to be applied.
#[derive(Debug, Clone)]
pub struct QueuedRecord {
    /// The record.
    pub record: ChangeRecord,
    /// Failed apply attempts so far.
    pub attempts: u32,
}

impl QueuedRecord {
    /// Source the record came from.
    pub fn source(&self) -> SourceId {
        self.record.source
    }

    /// Change number of the record.
    pub fn change_number(&self) -> u64 {
        self.record.change_number
    }
}

/// FIFO of records across all sources. Records of one source are appended in
/// change-number order; a failed record goes back to the front.
#[derive(Debug, Default)]
pub struct ProcessingQueue {
    items: VecDeque<QueuedRecord>,
}

impl ProcessingQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch from one poll, sorted by change number.
    pub fn push_batch(&mut self, mut records: Vec<ChangeRecord>) {
        records.sort_by_key(|r| r.change_number);
        self.items.extend(records.into_iter().map(|record| QueuedRecord {
            record,
            attempts: 0,
        }));
    }

    /// Put a record back at the head for retry.
    pub fn push_front(&mut self, item: QueuedRecord) {
        self.items.push_front(item);
    }

    /// Take the head.
    pub fn pop_front(&mut self) -> Option<QueuedRecord> {
        self.items.pop_front()
    }

    /// Look at the head.
    #[cfg(test)]
    pub fn front(&self) -> Option<&QueuedRecord> {
        self.items.front()
    }

    /// Number of queued records.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of queued records from `source`.
    pub fn pending_for(&self, source: SourceId) -> usize {
        self.items.iter().filter(|i| i.source() == source).count()
    }

    /// Drop every record of `source`, returning how many were removed.
    pub fn remove_source(&mut self, source: SourceId) -> usize {
        let before = self.items.len();
        self.items.retain(|i| i.source() != source);
        before - self.items.len()
    }

    /// Drop records of `source` numbered at or below `committed`.
    pub fn drop_committed(&mut self, source: SourceId, committed: u64) -> usize {
        let before = self.items.len();
        self.items
            .retain(|i| i.source() != source || i.change_number() > committed);
        before - self.items.len()
    }

    /// Iterate in queue order.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &QueuedRecord> {
        self.items.iter()
    }
}
