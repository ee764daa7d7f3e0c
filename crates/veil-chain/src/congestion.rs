//! Discovery of reachable-but-unapplied and disconnected tips.
//!
//! For every tip whose chain work could beat the cursor, the processor
//! walks backward collecting row ids until it hits a reachable ancestor,
//! genesis, or a missing prev link (then headers must be requested).
//! Walks are cached and merged across invocations so repeated discovery
//! over the same branches stays linear.

use std::collections::VecDeque;

use veil_core::types::Height;

use crate::store::RowId;

/// One walked chain hanging off an unreachable tip.
#[derive(Clone, Debug, Default)]
pub struct TipCongestion {
    /// Height of `rows[0]`, the tip itself.
    pub height: Height,
    /// Row ids downward from the tip: `rows[i]` sits at `height - i`.
    pub rows: VecDeque<RowId>,
    /// The walk ended on a missing prev link; headers must be fetched
    /// before any blocks.
    pub needs_hdrs: bool,
}

impl TipCongestion {
    /// Whether `(row, height)` lies on this walked chain.
    pub fn is_contained(&self, row: RowId, height: Height) -> bool {
        if height > self.height {
            return false;
        }
        let dh = (self.height - height) as usize;
        dh < self.rows.len() && self.rows[dh] == row
    }

    /// Height of the lowest collected row.
    pub fn lowest_height(&self) -> Height {
        self.height - (self.rows.len() as Height - 1)
    }
}

/// Cache of tip walks, merged across `enum_congestions` invocations.
#[derive(Default)]
pub struct CongestionCache {
    pub tips: Vec<TipCongestion>,
}

impl CongestionCache {
    pub fn clear(&mut self) {
        self.tips.clear();
    }

    /// Index of the entry containing `(row, height)`; with several matches,
    /// the one with the lowest tip height wins.
    pub fn find(&self, row: RowId, height: Height) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, tip) in self.tips.iter().enumerate() {
            if !tip.is_contained(row, height) {
                continue;
            }
            match best {
                Some(b) if self.tips[b].height <= tip.height => {}
                _ => best = Some(i),
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(height: Height, rows: &[RowId]) -> TipCongestion {
        TipCongestion { height, rows: rows.iter().copied().collect(), needs_hdrs: false }
    }

    #[test]
    fn containment_by_offset() {
        let t = entry(10, &[100, 99, 98]);
        assert!(t.is_contained(100, 10));
        assert!(t.is_contained(99, 9));
        assert!(t.is_contained(98, 8));
        assert!(!t.is_contained(97, 7));
        assert!(!t.is_contained(99, 10));
        assert!(!t.is_contained(100, 11));
    }

    #[test]
    fn lowest_height() {
        assert_eq!(entry(10, &[100, 99, 98]).lowest_height(), 8);
        assert_eq!(entry(5, &[50]).lowest_height(), 5);
    }

    #[test]
    fn find_prefers_lower_tip() {
        let mut cache = CongestionCache::default();
        cache.tips.push(entry(12, &[120, 119, 110, 109]));
        cache.tips.push(entry(10, &[110, 109]));
        // Row 110 appears in both; the lower tip wins.
        assert_eq!(cache.find(110, 10), Some(1));
    }

    #[test]
    fn find_missing() {
        let mut cache = CongestionCache::default();
        cache.tips.push(entry(10, &[110]));
        assert_eq!(cache.find(5, 5), None);
    }
}
