//! In-memory ring of recent active headers.
//!
//! Difficulty retargeting reads a window of headers every block; this ring
//! keeps the recent tail of the active chain so those reads rarely touch
//! the store.

use std::collections::VecDeque;

use veil_core::types::{BlockHeader, Height};

use crate::store::RowId;

pub struct RecentStates {
    entries: VecDeque<(RowId, BlockHeader)>,
    capacity: usize,
}

impl RecentStates {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity.max(1)), capacity: capacity.max(1) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push the new tip. Non-consecutive heights reset the ring.
    pub fn push(&mut self, row: RowId, header: BlockHeader) {
        if let Some((_, back)) = self.entries.back() {
            if back.height + 1 != header.height {
                self.entries.clear();
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((row, header));
    }

    /// Header at `height`, if still in the ring.
    pub fn get(&self, height: Height) -> Option<&(RowId, BlockHeader)> {
        let front = self.entries.front()?.1.height;
        if height < front {
            return None;
        }
        self.entries.get((height - front) as usize)
    }

    /// Drop everything above `height`.
    pub fn rollback_to(&mut self, height: Height) {
        while let Some((_, back)) = self.entries.back() {
            if back.height <= height {
                break;
            }
            self.entries.pop_back();
        }
    }
}
