use std::collections::{BTreeMap, BTreeSet, HashMap};

// ============================================================================
// Offset Tracker
// ============================================================================
//
// Messages of one partition are processed concurrently and finish out of
// order. A partition's offset may only advance over a contiguous prefix of
// finished messages, otherwise a crash would skip an unfinished one.
//
// A failed message rewinds its partition: everything from that offset on is
// forgotten and will be read again after the consumer seeks back. Each start
// is stamped with the partition's generation, so completions of work that
// was forgotten by a rewind are ignored.
//
// ============================================================================

#[derive(Default)]
struct PartitionState {
    /// offset -> generation it was started in
    in_flight: BTreeMap<i64, u64>,
    finished: BTreeSet<i64>,
    committed: Option<i64>,
    generation: u64,
}

impl PartitionState {
    fn is_current(&self, offset: i64, generation: u64) -> bool {
        self.in_flight.get(&offset) == Some(&generation)
    }
}

#[derive(Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a received message. Returns the generation to hand back to
    /// `finish` or `rewind`.
    pub fn start(&mut self, topic: &str, partition: i32, offset: i64) -> u64 {
        let state = self.partitions.entry((topic.to_string(), partition)).or_default();
        state.in_flight.insert(offset, state.generation);
        state.generation
    }

    /// Mark `offset` finished. Returns the highest offset that is now safe to
    /// commit, when that moved forward.
    pub fn finish(&mut self, topic: &str, partition: i32, offset: i64, generation: u64) -> Option<i64> {
        let state = self.partitions.get_mut(&(topic.to_string(), partition))?;

        if !state.is_current(offset, generation) {
            return None;
        }
        state.in_flight.remove(&offset);
        state.finished.insert(offset);

        let horizon = state.in_flight.keys().next().copied();
        let safe: Vec<i64> = state
            .finished
            .iter()
            .copied()
            .take_while(|o| horizon.map_or(true, |h| *o < h))
            .collect();

        let highest = *safe.last()?;
        for o in &safe {
            state.finished.remove(o);
        }

        if state.committed.map_or(true, |c| highest > c) {
            state.committed = Some(highest);
            Some(highest)
        } else {
            None
        }
    }

    /// `offset` failed: drop it and everything after it in the partition. The
    /// failed offset stays as the commit horizon until it is started again.
    /// Returns false when the failure belongs to work an earlier rewind
    /// already forgot; the caller must only seek on true.
    pub fn rewind(&mut self, topic: &str, partition: i32, offset: i64, generation: u64) -> bool {
        let Some(state) = self.partitions.get_mut(&(topic.to_string(), partition)) else {
            return false;
        };
        if !state.is_current(offset, generation) {
            return false;
        }

        state.generation += 1;
        state.in_flight.retain(|o, _| *o < offset);
        state.finished.retain(|o| *o < offset);
        state.in_flight.insert(offset, state.generation);
        true
    }

    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(|p| p.in_flight.len()).sum()
    }

    /// Finished offsets held back behind an unfinished one
    pub fn retained(&self) -> usize {
        self.partitions.values().map(|p| p.finished.len()).sum()
    }
}
