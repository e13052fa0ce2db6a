//! Live segments grouped into levels, and the merge policy between them.
//!
//! Level 0 receives every flush and is the newest; within a level a higher
//! sequence number is newer. When level 0 fills up it is merged, together
//! with every following level that would overflow from the result, into a
//! single segment one level further down.

use std::sync::Arc;

use segment::Segment;

/// One live segment and the sequence number it was written under.
#[derive(Debug, Clone)]
pub struct Slot {
    pub seq: u64,
    pub segment: Arc<Segment>,
}

/// An immutable snapshot of the live segment set.
#[derive(Debug, Clone, Default)]
pub struct Version {
    levels: Vec<Vec<Slot>>,
}

impl Version {
    /// Adds a segment as the newest of `level`.
    pub fn push(&mut self, level: usize, slot: Slot) {
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        let slots = &mut self.levels[level];
        slots.push(slot);
        slots.sort_by_key(|s| s.seq);
    }

    /// Every segment, newest first.
    pub fn newest_first(&self) -> Vec<Arc<Segment>> {
        self.levels
            .iter()
            .flat_map(|slots| slots.iter().rev())
            .map(|s| Arc::clone(&s.segment))
            .collect()
    }

    /// Segment counts per level, without trailing empty levels.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape: Vec<usize> = self.levels.iter().map(Vec::len).collect();
        while shape.last() == Some(&0) {
            shape.pop();
        }
        shape
    }

    pub fn segment_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Entries across all segments, shadowed ones included.
    pub fn entry_count(&self) -> u64 {
        self.levels.iter().flatten().map(|s| s.segment.len()).sum()
    }

    /// Deepest level holding at least one segment.
    pub fn deepest_level(&self) -> Option<usize> {
        self.levels.iter().rposition(|slots| !slots.is_empty())
    }

    /// Removes levels `0..=last`, returning their segments newest first.
    pub fn drain_through(&mut self, last: usize) -> Vec<Arc<Segment>> {
        let mut drained = Vec::new();
        for slots in self.levels.iter_mut().take(last + 1) {
            drained.extend(slots.drain(..).rev().map(|s| s.segment));
        }
        drained
    }

    /// Removes every segment, newest first.
    pub fn drain_all(&mut self) -> Vec<Arc<Segment>> {
        let segments = self.newest_first();
        self.levels.clear();
        segments
    }

    /// `(level, seq)` of every live segment, as recorded in the manifest.
    pub fn manifest_entries(&self) -> Vec<(u32, u64)> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, slots)| slots.iter().map(move |s| (level as u32, s.seq)))
            .collect()
    }

    /// The sole segment when the view is exactly one segment.
    pub fn single(&self) -> Option<&Arc<Segment>> {
        let mut all = self.levels.iter().flatten();
        match (all.next(), all.next()) {
            (Some(only), None) => Some(&only.segment),
            _ => None,
        }
    }
}

/// Decides whether a flush must be followed by a cascaded merge.
///
/// Returns the last level to merge; the merged segment goes to the level
/// after it. Level 0 is merged once it holds `max_level_count` segments;
/// each following level joins the merge if receiving one more segment
/// would make it full too.
pub fn cascade_depth(shape: &[usize], max_level_count: usize) -> Option<usize> {
    if shape.first().copied().unwrap_or(0) < max_level_count {
        return None;
    }
    let mut last = 0;
    while shape.get(last + 1).is_some_and(|&n| n + 1 >= max_level_count) {
        last += 1;
    }
    Some(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_merge_below_threshold() {
        assert_eq!(cascade_depth(&[], 3), None);
        assert_eq!(cascade_depth(&[2], 3), None);
        assert_eq!(cascade_depth(&[2, 9, 9], 3), None);
    }

    #[test]
    fn full_level_zero_merges_down_one() {
        assert_eq!(cascade_depth(&[3], 3), Some(0));
        assert_eq!(cascade_depth(&[3, 1], 3), Some(0));
        assert_eq!(cascade_depth(&[3, 0, 2], 3), Some(0));
    }

    #[test]
    fn cascade_continues_through_nearly_full_levels() {
        assert_eq!(cascade_depth(&[3, 2], 3), Some(1));
        assert_eq!(cascade_depth(&[3, 2, 2, 1], 3), Some(2));
        assert_eq!(cascade_depth(&[10, 9, 9, 9], 10), Some(3));
    }

    #[test]
    fn repeated_flushes_keep_levels_bounded() {
        // simulate the policy over many flushes without any files
        let max = 3;
        let mut shape: Vec<usize> = Vec::new();
        for _ in 0..200 {
            if shape.is_empty() {
                shape.push(0);
            }
            shape[0] += 1;
            if let Some(last) = cascade_depth(&shape, max) {
                for level in shape.iter_mut().take(last + 1) {
                    *level = 0;
                }
                if shape.len() <= last + 1 {
                    shape.push(0);
                }
                shape[last + 1] += 1;
            }
            assert!(shape.iter().all(|&n| n < max), "{shape:?}");
        }
        assert!(shape.len() <= 6);
    }
}
