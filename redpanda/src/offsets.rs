//! Commit bookkeeping for out-of-order acknowledgements.
//!
//! Workers acknowledge deliveries in whatever order they finish, but a Kafka
//! commit says "everything before this offset is done". The tracker keeps the
//! delivered-but-unacknowledged offsets per partition and only ever reports a
//! commit position below the oldest of them.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionOffsets {
    outstanding: BTreeSet<i64>,
    highest_delivered: Option<i64>,
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn commit_position(&self) -> Option<i64> {
        match self.outstanding.first() {
            Some(&oldest) => Some(oldest),
            None => self.highest_delivered.map(|o| o + 1),
        }
    }
}

/// Tracks delivered and acknowledged offsets per topic partition.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `offset` was handed to the consumer.
    pub fn delivered(&mut self, topic: &str, partition: i32, offset: i64) {
        let entry = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        // The first delivery of a partition sits at the position it resumed from.
        entry.committed.get_or_insert(offset);
        entry.outstanding.insert(offset);
        entry.highest_delivered = Some(entry.highest_delivered.map_or(offset, |h| h.max(offset)));
    }

    /// Note that `offset` was acknowledged.
    ///
    /// Returns the offset to commit (the next one to read) when the
    /// acknowledged prefix of the partition grew.
    pub fn acknowledged(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let entry = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !entry.outstanding.remove(&offset) {
            return None;
        }
        let position = entry.commit_position()?;
        if entry.committed.is_some_and(|c| c >= position) {
            return None;
        }
        entry.committed = Some(position);
        Some(position)
    }

    /// Offsets delivered but not yet acknowledged, across partitions.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.partitions.values().map(|p| p.outstanding.len()).sum()
    }
}
