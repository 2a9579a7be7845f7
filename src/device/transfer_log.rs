use crate::device::request::ReqId;
use std::sync::atomic::{AtomicU64, Ordering};

const SLOT_EMPTY: u64 = u64::MAX;
const SLOT_BARRIER: u64 = u64::MAX - 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Slot {
    Empty,
    Barrier,
    Req(ReqId),
}

/// TransferLog is the ring of in-flight mirrored writes, partitioned into
/// epochs by barrier markers. In-ring order must equal on-wire order, so
/// `add` and `add_barrier` are only called while the caller holds the data
/// channel send permit.
///
/// Callers wrap the log in an RwLock: `add`, `add_barrier`, `release` and
/// `clear` under the write lock; `dependence` under the read lock. The only
/// mutation `dependence` performs is the monotone slot-to-Empty transition,
/// carried by an atomic store.
pub struct TransferLog {
    logger: slog::Logger,
    slots: Vec<AtomicU64>,
    begin: usize,
    end: usize,
    nr_issue: u32,
    nr_done: u32,
}

impl TransferLog {
    pub fn new(logger: slog::Logger, size: usize) -> Self {
        assert!(size >= 2, "transfer log needs room for a request and a barrier");
        let slots = (0..size).map(|_| AtomicU64::new(SLOT_EMPTY)).collect();
        TransferLog {
            logger,
            slots,
            begin: 0,
            end: 0,
            nr_issue: 1,
            nr_done: 0,
        }
    }

    fn slot(&self, idx: usize) -> Slot {
        match self.slots[idx].load(Ordering::Acquire) {
            SLOT_EMPTY => Slot::Empty,
            SLOT_BARRIER => Slot::Barrier,
            id => Slot::Req(ReqId(id)),
        }
    }

    fn push(&mut self, raw: u64) {
        self.slots[self.end].store(raw, Ordering::Release);
        self.end = self.advance(self.end);
        if self.end == self.begin {
            slog::crit!(self.logger, "transfer log too small, oldest epoch overwritten");
        }
    }

    /// Append a request at the tail of the current epoch.
    pub fn add(&mut self, id: ReqId) {
        debug_assert!(id.0 < SLOT_BARRIER);
        self.push(id.0);
    }

    /// Append a barrier marker closing the current epoch and return its
    /// ordinal for the wire.
    pub fn add_barrier(&mut self) -> u32 {
        self.push(SLOT_BARRIER);
        let nr = self.nr_issue;
        self.nr_issue += 1;
        nr
    }

    /// Highest barrier ordinal acknowledged so far.
    pub fn barrier_nr_done(&self) -> u32 {
        self.nr_done
    }

    /// Pop one epoch: everything up to and including the next barrier. The
    /// peer acks epochs in strictly increasing barrier order and reports how
    /// many writes it saw; both are verified and mismatches are protocol
    /// errors — logged, never silently repaired.
    pub fn release(&mut self, barrier_nr: u32, set_size: u32) -> Vec<ReqId> {
        let mut popped = Vec::new();
        // Blanked slots still belong to the epoch the peer counted.
        let mut epoch_size: u32 = 0;
        let mut saw_barrier = false;
        while self.begin != self.end {
            let slot = self.slot(self.begin);
            self.slots[self.begin].store(SLOT_EMPTY, Ordering::Release);
            self.begin = self.advance(self.begin);
            match slot {
                Slot::Barrier => {
                    saw_barrier = true;
                    break;
                }
                Slot::Req(id) => {
                    epoch_size += 1;
                    popped.push(id);
                }
                Slot::Empty => epoch_size += 1,
            }
        }

        if !saw_barrier {
            slog::crit!(self.logger, "barrier ack without a barrier in the log";
                "barrier_nr" => barrier_nr);
        }
        if barrier_nr != self.nr_done.wrapping_add(1) {
            slog::crit!(self.logger, "barrier acked out of order";
                "expected" => self.nr_done.wrapping_add(1), "reported" => barrier_nr);
        }
        self.nr_done = barrier_nr;

        if epoch_size != set_size {
            slog::crit!(self.logger, "epoch set size wrong";
                "found" => epoch_size, "reported" => set_size);
        }

        popped
    }

    /// Report whether `id` is still logged in the current (not yet
    /// barrier-closed) epoch. When found, its slot is blanked so transfer
    /// log cleanup will not touch the request again.
    pub fn dependence(&self, id: ReqId) -> bool {
        let mut p = self.end;
        loop {
            if p == self.begin {
                return false;
            }
            p = if p == 0 { self.slots.len() - 1 } else { p - 1 };
            match self.slot(p) {
                Slot::Barrier => return false,
                Slot::Req(found) if found == id => {
                    self.slots[p].store(SLOT_EMPTY, Ordering::Release);
                    return true;
                }
                _ => {}
            }
        }
    }

    /// Disconnect cleanup: hand back every live request in the ring (the
    /// caller dirties their ranges and terminates their network halves) and
    /// reinitialise. Barrier ordinals survive a reconnect.
    pub fn clear(&mut self) -> Vec<ReqId> {
        let mut live = Vec::new();
        let mut p = self.begin;
        while p != self.end {
            if let Slot::Req(id) = self.slot(p) {
                live.push(id);
            }
            self.slots[p].store(SLOT_EMPTY, Ordering::Release);
            p = self.advance(p);
        }
        self.begin = 0;
        self.end = 0;
        live
    }

    fn advance(&self, idx: usize) -> usize {
        let next = idx + 1;
        if next == self.slots.len() {
            0
        } else {
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(size: usize) -> TransferLog {
        TransferLog::new(slog::Logger::root(slog::Discard, slog::o!()), size)
    }

    #[test]
    fn release_pops_exactly_one_epoch() {
        let mut tl = log(16);
        tl.add(ReqId(1));
        tl.add(ReqId(2));
        let b1 = tl.add_barrier();
        tl.add(ReqId(3));
        let b2 = tl.add_barrier();

        assert_eq!(b1, 1);
        assert_eq!(b2, 2);

        assert_eq!(tl.release(b1, 2), vec![ReqId(1), ReqId(2)]);
        assert_eq!(tl.barrier_nr_done(), 1);
        assert_eq!(tl.release(b2, 1), vec![ReqId(3)]);
        assert_eq!(tl.barrier_nr_done(), 2);
    }

    #[test]
    fn release_with_wrong_set_size_still_advances() {
        let mut tl = log(16);
        for id in 0..4 {
            tl.add(ReqId(id));
        }
        let nr = tl.add_barrier();
        // Peer claims 3 writes, we logged 4: logged as protocol error, the
        // epoch is popped either way.
        let popped = tl.release(nr, 3);
        assert_eq!(popped.len(), 4);
        assert_eq!(tl.barrier_nr_done(), nr);
    }

    #[test]
    fn dependence_finds_only_current_epoch() {
        let mut tl = log(16);
        tl.add(ReqId(7));
        tl.add_barrier();
        tl.add(ReqId(8));

        // ReqId(7) is behind the barrier: older epoch.
        assert!(!tl.dependence(ReqId(7)));
        assert!(tl.dependence(ReqId(8)));
        // Slot was blanked; a second walk no longer finds it.
        assert!(!tl.dependence(ReqId(8)));
    }

    #[test]
    fn blanked_slot_counts_but_is_not_returned() {
        let mut tl = log(16);
        tl.add(ReqId(1));
        tl.add(ReqId(2));
        assert!(tl.dependence(ReqId(1)));
        let nr = tl.add_barrier();
        // The peer saw two writes in this epoch; the blanked one still
        // counts, only the live one comes back.
        assert_eq!(tl.release(nr, 2), vec![ReqId(2)]);
    }

    #[test]
    fn clear_returns_live_requests_and_reinitialises() {
        let mut tl = log(16);
        tl.add(ReqId(1));
        tl.add_barrier();
        tl.add(ReqId(2));
        tl.add(ReqId(3));

        let live = tl.clear();
        assert_eq!(live, vec![ReqId(1), ReqId(2), ReqId(3)]);
        assert!(!tl.dependence(ReqId(2)));

        // Ring usable again, barrier numbering continues.
        tl.add(ReqId(4));
        let nr = tl.add_barrier();
        assert_eq!(nr, 2);
        assert_eq!(tl.release(nr, 1), vec![ReqId(4)]);
    }

    #[test]
    fn wraps_around_the_ring() {
        let mut tl = log(4);
        for round in 0..5u64 {
            tl.add(ReqId(round * 2));
            tl.add(ReqId(round * 2 + 1));
            let nr = tl.add_barrier();
            let popped = tl.release(nr, 2);
            assert_eq!(popped, vec![ReqId(round * 2), ReqId(round * 2 + 1)]);
        }
        assert_eq!(tl.barrier_nr_done(), 5);
    }
}
