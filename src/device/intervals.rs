use crate::device::request::ReqId;
use std::collections::BTreeMap;

/// IntervalMap tracks the sector ranges of in-flight requests so overlapping
/// submissions can be detected and serialised. Keyed by start sector; the
/// overlap scan is bounded by the largest interval ever inserted.
#[derive(Default)]
pub struct IntervalMap {
    by_start: BTreeMap<(u64, ReqId), Interval>,
    max_span: u64,
}

struct Interval {
    end: u64,
    /// Set when a conflicting submission is parked on this interval; its
    /// removal must re-drive the parked work.
    waiting: bool,
}

impl IntervalMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ReqId, sector: u64, size: u32) {
        let span = sectors(size);
        self.max_span = self.max_span.max(span);
        self.by_start.insert((sector, id), Interval {
            end: sector + span,
            waiting: false,
        });
    }

    /// Remove an interval; returns true when a parked submission was waiting
    /// on it.
    pub fn remove(&mut self, id: ReqId, sector: u64) -> bool {
        self.by_start
            .remove(&(sector, id))
            .map_or(false, |i| i.waiting)
    }

    /// First request overlapping `[sector, sector + size)`, if any.
    pub fn find_overlap(&self, sector: u64, size: u32) -> Option<ReqId> {
        let start = sector.saturating_sub(self.max_span);
        let end = sector + sectors(size);
        self.by_start
            .range((start, ReqId(0))..(end, ReqId(u64::MAX)))
            .find(|((s, _), i)| i.end > sector && *s < end)
            .map(|((_, id), _)| *id)
    }

    /// Flag every interval overlapping the range so their completion wakes
    /// the parked submission.
    pub fn mark_waiting(&mut self, sector: u64, size: u32) {
        let start = sector.saturating_sub(self.max_span);
        let end = sector + sectors(size);
        for ((s, _), i) in self.by_start.range_mut((start, ReqId(0))..(end, ReqId(u64::MAX))) {
            if i.end > sector && *s < end {
                i.waiting = true;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }
}

fn sectors(size: u32) -> u64 {
    (size as u64 + 511) >> 9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_detection() {
        let mut map = IntervalMap::new();
        map.insert(ReqId(1), 0, 8192); // sectors [0, 16)
        assert_eq!(map.find_overlap(4, 4096), Some(ReqId(1)));
        assert_eq!(map.find_overlap(16, 4096), None);
        assert_eq!(map.find_overlap(15, 512), Some(ReqId(1)));
    }

    #[test]
    fn waiting_flag_reported_on_remove() {
        let mut map = IntervalMap::new();
        map.insert(ReqId(1), 0, 8192);
        map.insert(ReqId(2), 100, 512);

        map.mark_waiting(4, 4096);
        assert!(map.remove(ReqId(1), 0));
        assert!(!map.remove(ReqId(2), 100));
        assert!(map.is_empty());
    }

    #[test]
    fn earlier_start_still_found() {
        let mut map = IntervalMap::new();
        map.insert(ReqId(9), 1000, 65536); // sectors [1000, 1128)
        assert_eq!(map.find_overlap(1100, 512), Some(ReqId(9)));
    }
}
