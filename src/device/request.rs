use crate::actor::Callback;
use crate::api::types::{ConnState, DiskState, Protocol};
use crate::device::device::{Device, ParkedSubmit, SubmitInput, SubmitOp};
use crate::device::{Counters, SyncState};
use crate::workers::SendWork;
use bytes::Bytes;
use std::fmt;
use std::io;
use tokio::time::Instant;

// Local half.
pub(crate) const RQ_LOCAL_PENDING: u32 = 1 << 0;
pub(crate) const RQ_LOCAL_COMPLETED: u32 = 1 << 1;
pub(crate) const RQ_LOCAL_OK: u32 = 1 << 2;
pub(crate) const RQ_LOCAL_ABORTED: u32 = 1 << 3;
pub(crate) const RQ_IN_ACT_LOG: u32 = 1 << 4;
pub(crate) const RQ_LOCAL_MASK: u32 = (1 << 5) - 1;

// Network half.
pub(crate) const RQ_NET_PENDING: u32 = 1 << 10;
pub(crate) const RQ_NET_QUEUED: u32 = 1 << 11;
pub(crate) const RQ_NET_SENT: u32 = 1 << 12;
pub(crate) const RQ_NET_OK: u32 = 1 << 13;
pub(crate) const RQ_NET_DONE: u32 = 1 << 14;
pub(crate) const RQ_NET_SIS: u32 = 1 << 15;
pub(crate) const RQ_EXP_RECEIVE_ACK: u32 = 1 << 16;
pub(crate) const RQ_EXP_WRITE_ACK: u32 = 1 << 17;
pub(crate) const RQ_NET_MASK: u32 = ((1 << 18) - 1) - ((1 << 10) - 1);

pub(crate) const RQ_WRITE: u32 = 1 << 20;
pub(crate) const RQ_POSTPONED: u32 = 1 << 21;

/// Request handle: slot index in the low word, reuse generation in the high
/// word, so a late ack for a freed request can never hit its successor.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReqId(pub u64);

impl ReqId {
    fn slot(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    fn assemble(slot: usize, generation: u32) -> ReqId {
        ReqId(((generation as u64) << 32) | slot as u64)
    }
}

impl fmt::Debug for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}.{}", self.slot(), self.generation())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("device is read-only while Secondary")]
    ReadOnly,
    #[error("request is not sector-aligned or exceeds device limits")]
    InvalidRequest,
    #[error("neither local nor remote data available")]
    NoData,
    #[error("local I/O error")]
    Io(#[source] io::Error),
    #[error("peer rejected the request or the connection was lost")]
    RemoteFailed,
    #[error("device actor has exited")]
    Shutdown,
}

/// Everything that can happen to a request during its life time. Processing
/// them through the single `req_mod` mutator inside the actor makes every
/// transition atomic with respect to every other.
#[derive(Debug)]
pub(crate) enum ReqEvent {
    // Submission.
    ToBeSent,
    ToBeSubmitted,
    QueueForNetRead,
    QueueForNetWrite,
    QueueForSendOos,
    // Sender thread.
    SendCanceled,
    SendFailed,
    HandedOverToNetwork,
    OosHandedToNetwork,
    ReadRetryRemoteCanceled,
    // Local endio.
    CompletedOk,
    WriteCompletedWithError,
    ReadCompletedWithError,
    ReadAheadCompletedWithError,
    AbortDiskIo,
    // Peer acks.
    WriteAckedByPeer,
    WriteAckedByPeerAndSis,
    RecvAckedByPeer,
    NegAcked,
    PostponeWrite,
    DiscardWrite,
    DataReceived(Bytes),
    BarrierAcked,
    // Connection events.
    ConnectionLostWhilePending,
    Resend,
    FailFrozenDiskIo,
    RestartFrozenDiskIo,
}

pub(crate) struct Request {
    pub sector: u64,
    pub size: u32,
    pub rq_state: u32,
    pub epoch: u32,
    pub start_time: Instant,
    pub read_ahead: bool,
    /// The host's completion callback; present means not yet signalled.
    pub completion: Option<Callback<Bytes, RequestError>>,
    /// Whether the local backing path is (still) used.
    pub local: bool,
    pub local_error: Option<io::Error>,
    /// Write payload.
    pub data: Option<Bytes>,
    /// Read payload from the local disk or the peer.
    pub read_data: Option<Bytes>,
    /// Registered in the read/write conflict map.
    pub in_interval: bool,
}

impl Request {
    pub(crate) fn new(
        sector: u64,
        size: u32,
        is_write: bool,
        read_ahead: bool,
        completion: Callback<Bytes, RequestError>,
        start_time: Instant,
    ) -> Self {
        Request {
            sector,
            size,
            rq_state: if is_write { RQ_WRITE } else { 0 },
            epoch: 0,
            start_time,
            read_ahead,
            completion: Some(completion),
            local: false,
            local_error: None,
            data: None,
            read_data: None,
            in_interval: false,
        }
    }

    pub(crate) fn fail(mut self, err: RequestError) {
        if let Some(cb) = self.completion.take() {
            cb.send(Err(err));
        }
    }

    fn sectors(&self) -> u64 {
        (self.size >> 9) as u64
    }
}

/// Slab of requests owned by the device; handles are index + generation.
pub(crate) struct RequestTable {
    slots: Vec<TableSlot>,
    free: Vec<usize>,
}

struct TableSlot {
    generation: u32,
    req: Option<Request>,
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        RequestTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, req: Request) -> ReqId {
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot];
                entry.req = Some(req);
                ReqId::assemble(slot, entry.generation)
            }
            None => {
                let slot = self.slots.len();
                self.slots.push(TableSlot {
                    generation: 0,
                    req: Some(req),
                });
                ReqId::assemble(slot, 0)
            }
        }
    }

    pub(crate) fn get(&self, id: ReqId) -> Option<&Request> {
        self.slots
            .get(id.slot())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.req.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ReqId) -> Option<&mut Request> {
        self.slots
            .get_mut(id.slot())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.req.as_mut())
    }

    pub(crate) fn remove(&mut self, id: ReqId) -> Option<Request> {
        let slot = self.slots.get_mut(id.slot())?;
        if slot.generation != id.generation() {
            return None;
        }
        let req = slot.req.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot());
        Some(req)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ReqId, &Request)> {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry
                .req
                .as_ref()
                .map(|req| (ReqId::assemble(slot, entry.generation), req))
        })
    }
}

impl Device {
    fn req_set(&mut self, id: ReqId, bits: u32) {
        if let Some(req) = self.requests.get_mut(id) {
            req.rq_state |= bits;
        }
    }

    fn req_clear(&mut self, id: ReqId, bits: u32) {
        if let Some(req) = self.requests.get_mut(id) {
            req.rq_state &= !bits;
        }
    }

    /// The single request-state mutator. Always runs inside the actor task,
    /// which is what makes the transitions atomic.
    pub(crate) fn req_mod(&mut self, id: ReqId, what: ReqEvent) {
        let Some(req) = self.requests.get(id) else {
            slog::debug!(self.logger, "event for freed request"; "id" => ?id, "what" => ?what);
            return;
        };
        let s = req.rq_state;
        let sector = req.sector;
        let size = req.size;
        let sectors = req.sectors();
        let is_write = s & RQ_WRITE != 0;

        match what {
            ReqEvent::ToBeSent => {
                if s & RQ_NET_MASK != 0 {
                    self.logic_bug(id, "ToBeSent with network bits already set");
                }
                let exp = match self.opts.protocol {
                    Protocol::C => RQ_EXP_WRITE_ACK,
                    Protocol::B => RQ_EXP_RECEIVE_ACK,
                    Protocol::A => 0,
                };
                self.req_set(id, RQ_NET_PENDING | exp);
                Counters::inc(&self.counters.ap_pending);
            }

            ReqEvent::ToBeSubmitted => {
                if s & RQ_LOCAL_MASK != 0 {
                    self.logic_bug(id, "ToBeSubmitted with local bits already set");
                }
                self.req_set(id, RQ_LOCAL_PENDING);
            }

            ReqEvent::CompletedOk => {
                if is_write {
                    Counters::add64(&self.counters.writ_sectors, sectors);
                } else {
                    Counters::add64(&self.counters.read_sectors, sectors);
                }
                self.req_set(id, RQ_LOCAL_COMPLETED | RQ_LOCAL_OK);
                self.req_clear(id, RQ_LOCAL_PENDING);
                self.req_may_be_completed_not_susp(id);
            }

            ReqEvent::AbortDiskIo => {
                self.req_set(id, RQ_LOCAL_ABORTED);
                self.req_may_be_completed_not_susp(id);
            }

            ReqEvent::WriteCompletedWithError => {
                self.req_set(id, RQ_LOCAL_COMPLETED);
                self.req_clear(id, RQ_LOCAL_PENDING);
                self.chk_io_error();
                self.req_may_be_completed_not_susp(id);
            }

            ReqEvent::ReadAheadCompletedWithError => {
                // Failing read-ahead is legal; it is never retried.
                self.req_set(id, RQ_LOCAL_COMPLETED);
                self.req_clear(id, RQ_LOCAL_PENDING);
                self.req_may_be_completed_not_susp(id);
            }

            ReqEvent::ReadCompletedWithError => {
                self.bitmap.set_range(sector, size, SyncState::OutOfSync);
                self.req_set(id, RQ_LOCAL_COMPLETED);
                self.req_clear(id, RQ_LOCAL_PENDING);
                self.chk_io_error();
                if s & RQ_NET_MASK != 0 {
                    self.logic_bug(id, "local read error on a request with network state");
                }
                if self.peer_readable() {
                    // Retry the read from the peer.
                    if let Some(req) = self.requests.get_mut(id) {
                        req.local = false;
                    }
                    self.req_mod(id, ReqEvent::ToBeSent);
                    self.req_mod(id, ReqEvent::QueueForNetRead);
                } else {
                    self.req_may_be_completed_not_susp(id);
                }
            }

            ReqEvent::QueueForNetRead => {
                // Register for conflict detection / answer matching; removed
                // again in req_may_be_completed.
                self.read_requests.insert(id, sector, size);
                self.req_set(id, RQ_NET_QUEUED);
                if let Some(req) = self.requests.get_mut(id) {
                    req.in_interval = true;
                }
                if s & RQ_NET_PENDING == 0 {
                    self.logic_bug(id, "QueueForNetRead without NET_PENDING");
                }
                self.queue_send(SendWork::ReadReq { id, sector, size });
            }

            ReqEvent::QueueForNetWrite => {
                if s & RQ_NET_PENDING == 0 {
                    self.logic_bug(id, "QueueForNetWrite without NET_PENDING");
                }
                self.req_set(id, RQ_NET_QUEUED);
                let data = self
                    .requests
                    .get(id)
                    .and_then(|r| r.data.clone())
                    .unwrap_or_default();
                self.queue_send(SendWork::DBlock { id, sector, data });

                // Close the epoch in case it outgrew the limit.
                if self.current_tle_writes >= self.opts.max_epoch_size {
                    self.start_new_epoch();
                }
            }

            ReqEvent::QueueForSendOos => {
                self.req_set(id, RQ_NET_QUEUED);
                self.queue_send(SendWork::OutOfSync { id, sector, size });
            }

            ReqEvent::ReadRetryRemoteCanceled | ReqEvent::SendCanceled | ReqEvent::SendFailed => {
                // Real cleanup happens in tl_clear; just take it off the
                // sender queue.
                self.req_clear(id, RQ_NET_QUEUED);
                self.req_may_be_completed_not_susp(id);
            }

            ReqEvent::HandedOverToNetwork => {
                if is_write {
                    Counters::add64(&self.counters.ap_in_flight, sectors);
                }
                if is_write && s & (RQ_EXP_RECEIVE_ACK | RQ_EXP_WRITE_ACK) == 0 {
                    // Protocol A: pretend it was successfully written on the
                    // peer. Durability still waits for the barrier ack.
                    if s & RQ_NET_PENDING != 0 {
                        Counters::dec(&self.counters.ap_pending);
                        self.req_clear(id, RQ_NET_PENDING);
                        self.req_set(id, RQ_NET_OK);
                    } // else: neg-ack was faster.
                }
                self.req_clear(id, RQ_NET_QUEUED);
                self.req_set(id, RQ_NET_SENT);
                self.req_may_be_completed_not_susp(id);
            }

            ReqEvent::OosHandedToNetwork => {
                // Was never PENDING, no longer QUEUED: done as far as this
                // connection is concerned.
                self.req_clear(id, RQ_NET_QUEUED);
                self.req_set(id, RQ_NET_DONE);
                self.req_may_be_completed_not_susp(id);
            }

            ReqEvent::ConnectionLostWhilePending => {
                if s & RQ_NET_PENDING != 0 {
                    Counters::dec(&self.counters.ap_pending);
                }
                if s & RQ_NET_SENT != 0
                    && is_write
                    && (s & RQ_NET_PENDING != 0
                        || s & (RQ_EXP_RECEIVE_ACK | RQ_EXP_WRITE_ACK) == 0)
                {
                    // The ack (or barrier ack) that would have deducted this
                    // will never arrive.
                    Counters::sub64(&self.counters.ap_in_flight, sectors);
                }
                self.req_clear(id, RQ_NET_OK | RQ_NET_PENDING);
                self.req_set(id, RQ_NET_DONE);
                // Allowed while suspended.
                self.req_may_be_completed(id);
            }

            ReqEvent::DiscardWrite => {
                // Conflicting write discarded by the peer; nothing to keep
                // in the log.
                self.req_set(id, RQ_NET_DONE);
                if s & RQ_EXP_WRITE_ACK == 0 {
                    self.protocol_error(id, "discard for a write not expecting a write ack");
                }
                self.ack_common(id);
            }

            ReqEvent::WriteAckedByPeer | ReqEvent::WriteAckedByPeerAndSis => {
                if matches!(what, ReqEvent::WriteAckedByPeerAndSis) {
                    self.req_set(id, RQ_NET_SIS);
                }
                if s & RQ_EXP_WRITE_ACK == 0 {
                    self.protocol_error(id, "write ack without EXP_WRITE_ACK");
                }
                self.ack_common(id);
            }

            ReqEvent::RecvAckedByPeer => {
                if s & RQ_EXP_RECEIVE_ACK == 0 {
                    self.protocol_error(id, "receive ack without EXP_RECEIVE_ACK");
                }
                self.ack_common(id);
            }

            ReqEvent::PostponeWrite => {
                if s & RQ_EXP_WRITE_ACK == 0 || s & RQ_NET_PENDING == 0 {
                    self.protocol_error(id, "postpone for a write not awaiting a write ack");
                }
                self.req_set(id, RQ_POSTPONED);
                self.req_may_be_completed_not_susp(id);
            }

            ReqEvent::NegAcked => {
                if s & RQ_NET_PENDING != 0 {
                    Counters::dec(&self.counters.ap_pending);
                    if is_write {
                        Counters::sub64(&self.counters.ap_in_flight, sectors);
                    }
                }
                self.req_clear(id, RQ_NET_OK | RQ_NET_PENDING);
                self.req_set(id, RQ_NET_DONE);
                self.req_may_be_completed_not_susp(id);
            }

            ReqEvent::FailFrozenDiskIo => {
                if s & RQ_LOCAL_COMPLETED == 0 {
                    return;
                }
                // Allowed while suspended.
                self.req_may_be_completed(id);
            }

            ReqEvent::RestartFrozenDiskIo => {
                if s & RQ_LOCAL_COMPLETED == 0 {
                    return;
                }
                if let Some(req) = self.requests.get_mut(id) {
                    req.local_error = None;
                }
                self.req_clear(id, RQ_LOCAL_COMPLETED);
                self.req_set(id, RQ_LOCAL_PENDING);
                self.submit_local(id);
            }

            ReqEvent::Resend => {
                // If NET_OK is set we got the ack before the connection was
                // lost and only the barrier ack is missing: pretend it
                // arrived. Handshake ensured the peer was not rebooted.
                if s & RQ_NET_OK == 0 {
                    self.req_set(id, RQ_NET_QUEUED);
                    self.req_clear(id, RQ_NET_SENT);
                    let work = if is_write {
                        let data = self
                            .requests
                            .get(id)
                            .and_then(|r| r.data.clone())
                            .unwrap_or_default();
                        SendWork::DBlock { id, sector, data }
                    } else {
                        SendWork::ReadReq { id, sector, size }
                    };
                    self.queue_send(work);
                    return;
                }
                self.req_mod(id, ReqEvent::BarrierAcked);
            }

            ReqEvent::BarrierAcked => {
                if !is_write {
                    return;
                }
                if s & RQ_NET_PENDING != 0 {
                    // Barrier came in before all requests were acked. If the
                    // connection dies now there is nothing left to clean
                    // them up with.
                    self.protocol_error(id, "barrier acked while request still pending");
                    Counters::dec(&self.counters.ap_pending);
                    Counters::sub64(&self.counters.ap_in_flight, sectors);
                    self.req_clear(id, RQ_NET_PENDING);
                }
                if s & RQ_NET_MASK != 0 {
                    self.req_set(id, RQ_NET_DONE);
                    if s & (RQ_EXP_RECEIVE_ACK | RQ_EXP_WRITE_ACK) == 0 && s & RQ_NET_PENDING == 0 {
                        // Protocol A: the deferred in-flight deduction.
                        Counters::sub64(&self.counters.ap_in_flight, sectors);
                    }
                }
                // Allowed while suspended.
                self.req_may_be_done(id);
            }

            ReqEvent::DataReceived(data) => {
                if s & RQ_NET_PENDING == 0 {
                    self.protocol_error(id, "data received for a request not pending");
                    return;
                }
                Counters::dec(&self.counters.ap_pending);
                if let Some(req) = self.requests.get_mut(id) {
                    req.read_data = Some(data);
                }
                self.req_clear(id, RQ_NET_PENDING);
                self.req_set(id, RQ_NET_OK | RQ_NET_DONE);
                self.req_may_be_completed_not_susp(id);
            }
        }
    }

    fn ack_common(&mut self, id: ReqId) {
        let Some(req) = self.requests.get(id) else {
            return;
        };
        let s = req.rq_state;
        let sectors = req.sectors();
        self.req_set(id, RQ_NET_OK);
        if s & RQ_NET_PENDING != 0 {
            Counters::dec(&self.counters.ap_pending);
            Counters::sub64(&self.counters.ap_in_flight, sectors);
            self.req_clear(id, RQ_NET_PENDING);
        } else {
            self.protocol_error(id, "ack for a request not pending");
        }
        self.req_may_be_completed_not_susp(id);
    }

    fn peer_readable(&self) -> bool {
        self.peer_disk == Some(DiskState::UpToDate)
            && self.conn.is_some()
            && matches!(
                self.cstate,
                ConnState::Connected | ConnState::SyncSource | ConnState::SyncTarget
            )
    }

    fn req_may_be_completed_not_susp(&mut self, id: ReqId) {
        if !self.suspended {
            self.req_may_be_completed(id);
        }
    }

    /// Signal upper-layer completion if both halves allow it, then check
    /// whether the request can be freed.
    pub(crate) fn req_may_be_completed(&mut self, id: ReqId) {
        let (s, sector, epoch, read_ahead, used_local, in_interval, has_completion) = {
            let Some(req) = self.requests.get(id) else {
                return;
            };
            (
                req.rq_state,
                req.sector,
                req.epoch,
                req.read_ahead,
                req.local,
                req.in_interval,
                req.completion.is_some(),
            )
        };

        // The host must not see a completion while the payload is still
        // queued for the sender, not yet acked, or in the local disk.
        if s & RQ_LOCAL_PENDING != 0 && s & RQ_LOCAL_ABORTED == 0 {
            return;
        }
        if s & RQ_NET_QUEUED != 0 {
            return;
        }
        if s & RQ_NET_PENDING != 0 {
            return;
        }

        if has_completion {
            let is_write = s & RQ_WRITE != 0;

            // Report success when at least one of the halves succeeded.
            let ok = s & RQ_LOCAL_OK != 0 || s & RQ_NET_OK != 0;

            if in_interval {
                let waiting = if is_write {
                    self.write_requests.remove(id, sector)
                } else {
                    self.read_requests.remove(id, sector)
                };
                if waiting {
                    self.wake_parked = true;
                }
                if let Some(req) = self.requests.get_mut(id) {
                    req.in_interval = false;
                }
            }

            // Close the current transfer log epoch before the host learns
            // about the write.
            if is_write && epoch == self.current_tle_nr && self.conn.is_some() {
                self.start_new_epoch();
            }

            // A failed remote read is retried through the submission path
            // when the local disk could still serve it.
            if !ok && !is_write && !read_ahead && !used_local && !self.local_failed {
                self.req_set(id, RQ_POSTPONED);
            }

            let Some(req) = self.requests.get_mut(id) else {
                return;
            };
            if req.rq_state & RQ_POSTPONED == 0 {
                let result = if ok {
                    Ok(req.read_data.take().unwrap_or_default())
                } else {
                    Err(match req.local_error.take() {
                        Some(e) => RequestError::Io(e),
                        None => RequestError::RemoteFailed,
                    })
                };
                if let Some(cb) = req.completion.take() {
                    cb.send(result);
                }
            }
        }

        self.req_may_be_done(id);
    }

    /// Free the request once the host was signalled and both halves are
    /// terminal. Writes flush their fate into the bitmap first.
    pub(crate) fn req_may_be_done(&mut self, id: ReqId) {
        let (s, sector, size, has_completion) = {
            let Some(req) = self.requests.get(id) else {
                return;
            };
            (req.rq_state, req.sector, req.size, req.completion.is_some())
        };

        if has_completion && s & RQ_POSTPONED == 0 {
            return;
        }
        if s & RQ_LOCAL_PENDING != 0 {
            return;
        }

        if s & RQ_NET_MASK != 0 && s & RQ_NET_DONE == 0 {
            // Network half still waiting for its barrier ack.
            return;
        }

        let is_write = s & RQ_WRITE != 0;

        if is_write {
            // A write not confirmed on both replicas leaves its range
            // out-of-sync; the bit is set before the request can be freed
            // so no completion races ahead of it.
            if s & RQ_NET_OK == 0 || s & RQ_LOCAL_OK == 0 {
                self.bitmap.set_range(sector, size, SyncState::OutOfSync);
            } else if s & RQ_NET_SIS != 0 {
                self.bitmap.set_range(sector, size, SyncState::InSync);
            }
            if s & RQ_LOCAL_MASK != 0 && s & RQ_IN_ACT_LOG != 0 {
                self.al.complete_io(sector, size);
            }
        }

        let req = self.requests.remove(id).expect("request is live");
        if s & RQ_POSTPONED != 0 {
            let op = if is_write {
                SubmitOp::Write {
                    data: req.data.unwrap_or_default(),
                }
            } else if req.read_ahead {
                SubmitOp::ReadAhead { size }
            } else {
                SubmitOp::Read { size }
            };
            if let Some(callback) = req.completion {
                self.retry_q.push_back(ParkedSubmit {
                    input: SubmitInput { sector, op },
                    callback,
                });
            }
        }
    }

    fn logic_bug(&self, id: ReqId, what: &str) {
        slog::error!(self.logger, "LOGIC BUG in request state machine";
            "id" => ?id, "detail" => what);
    }

    fn protocol_error(&self, id: ReqId, what: &str) {
        slog::crit!(self.logger, "protocol error"; "id" => ?id, "detail" => what);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Callback;
    use crate::api::options::MirrorOptions;
    use crate::api::types::{Protocol, ReadBalancing};
    use crate::device::device::test_support::{connected_device, TestDevice};
    use crate::device::device::{SubmitInput, SubmitOp};
    use crate::workers::SendWork;
    use tokio::sync::oneshot;

    fn options(protocol: Protocol) -> MirrorOptions {
        MirrorOptions {
            protocol,
            ..MirrorOptions::default()
        }
    }

    fn submit_write(
        td: &mut TestDevice,
        sector: u64,
        len: usize,
    ) -> oneshot::Receiver<Result<Bytes, RequestError>> {
        let (cb, rx) = Callback::detached();
        td.device.submit(
            SubmitInput {
                sector,
                op: SubmitOp::Write {
                    data: Bytes::from(vec![0xA5u8; len]),
                },
            },
            cb,
        );
        rx
    }

    /// Pop the queued data block and mimic the sender's critical section:
    /// ring-install together with the (virtual) wire write. Barrier work
    /// items are skipped; the tests close epochs by hand.
    fn hand_over(td: &mut TestDevice) -> ReqId {
        loop {
            let work = td.send_rx.try_recv().expect("expected queued send work");
            match work {
                SendWork::Barrier => continue,
                SendWork::DBlock { id, .. } => {
                    td.device.tl.write().unwrap().add(id);
                    td.device.req_mod(id, ReqEvent::HandedOverToNetwork);
                    return id;
                }
                other => panic!("expected a data block, got {:?}", other),
            }
        }
    }

    fn state_of(td: &TestDevice, id: ReqId) -> u32 {
        td.device.requests.get(id).expect("request is live").rq_state
    }

    #[tokio::test]
    async fn protocol_c_write_happy_path() {
        let mut td = connected_device(options(Protocol::C));
        let mut rx = submit_write(&mut td, 0, 4096);

        let id = hand_over(&mut td);
        let s = state_of(&td, id);
        assert_ne!(s & RQ_NET_SENT, 0);
        assert_ne!(s & RQ_NET_PENDING, 0, "protocol C still awaits the write ack");
        assert_ne!(s & RQ_EXP_WRITE_ACK, 0);
        assert_eq!(s & RQ_NET_QUEUED, 0);

        td.device.on_local_endio(id, Ok(None));
        assert_ne!(state_of(&td, id) & RQ_LOCAL_OK, 0);
        assert!(rx.try_recv().is_err(), "no completion before the peer ack");

        td.device.req_mod(id, ReqEvent::WriteAckedByPeerAndSis);
        let result = rx.await.expect("completion delivered");
        assert!(result.is_ok());

        // Still in the table until its epoch is barrier-acked.
        assert!(td.device.requests.get(id).is_some());
        assert_eq!(td.device.bitmap.count_dirty_in(0, 4096), 0);

        let barrier_nr = td.device.tl.write().unwrap().add_barrier();
        td.device.on_barrier_acked(barrier_nr, 1);
        assert!(td.device.requests.get(id).is_none(), "freed after barrier ack");
        assert_eq!(td.device.bitmap.count_dirty_in(0, 4096), 0);
    }

    #[tokio::test]
    async fn protocol_a_completes_on_handover_and_dirties_on_disconnect() {
        let mut td = connected_device(options(Protocol::A));
        let mut rx = submit_write(&mut td, 0, 4096);

        let id = hand_over(&mut td);
        let s = state_of(&td, id);
        assert_ne!(s & RQ_NET_OK, 0, "protocol A synthesises success at handover");
        assert_eq!(s & RQ_NET_PENDING, 0);

        assert!(rx.try_recv().is_err(), "local half still pending");
        td.device.on_local_endio(id, Ok(None));
        assert!(rx.await.expect("completion delivered").is_ok());

        // Connection dies before the barrier ack: everything still in the
        // transfer log goes out-of-sync.
        td.device.on_connection_lost(crate::workers::LostCause::BrokenPipe, None);
        assert!(td.device.requests.get(id).is_none());
        assert_eq!(td.device.bitmap.count_dirty_in(0, 4096), 1);
    }

    #[tokio::test]
    async fn neg_ack_completes_from_local_and_dirties() {
        let mut td = connected_device(options(Protocol::C));
        let rx = submit_write(&mut td, 8, 4096);

        let id = hand_over(&mut td);
        td.device.on_local_endio(id, Ok(None));
        td.device.req_mod(id, ReqEvent::NegAcked);

        // Local succeeded, so the host sees success; the range is dirty.
        assert!(rx.await.expect("completion delivered").is_ok());
        assert!(td.device.requests.get(id).is_none());
        assert_eq!(td.device.bitmap.count_dirty_in(8, 4096), 1);
    }

    #[tokio::test]
    async fn local_write_error_completes_from_peer_and_dirties() {
        let mut td = connected_device(options(Protocol::C));
        let rx = submit_write(&mut td, 0, 4096);

        let id = hand_over(&mut td);
        td.device
            .on_local_endio(id, Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")));
        td.device.req_mod(id, ReqEvent::WriteAckedByPeerAndSis);

        assert!(rx.await.expect("completion delivered").is_ok());
        assert!(td.device.local_failed, "disk error detaches the backing device");

        let barrier_nr = td.device.tl.write().unwrap().add_barrier();
        td.device.on_barrier_acked(barrier_nr, 1);
        assert_eq!(td.device.bitmap.count_dirty_in(0, 4096), 1);
    }

    #[tokio::test]
    async fn both_halves_failed_is_an_error() {
        let mut td = connected_device(options(Protocol::C));
        let rx = submit_write(&mut td, 0, 4096);

        let id = hand_over(&mut td);
        td.device
            .on_local_endio(id, Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")));
        td.device.req_mod(id, ReqEvent::NegAcked);

        let result = rx.await.expect("completion delivered");
        assert!(matches!(result, Err(RequestError::Io(_))));
        assert_eq!(td.device.bitmap.count_dirty_in(0, 4096), 1);
    }

    #[tokio::test]
    async fn conflicting_write_parks_until_holder_completes() {
        let mut td = connected_device(options(Protocol::C));
        let rx1 = submit_write(&mut td, 0, 8192);
        let id1 = hand_over(&mut td);

        // Overlapping write parks; nothing new on the sender queue.
        let _rx2 = submit_write(&mut td, 4, 4096);
        assert!(td.send_rx.try_recv().is_err());
        assert_eq!(td.device.parked.len(), 1);

        td.device.on_local_endio(id1, Ok(None));
        td.device.req_mod(id1, ReqEvent::WriteAckedByPeerAndSis);
        assert!(rx1.await.expect("completion delivered").is_ok());

        // The holder's completion wakes the parked submission.
        td.device.drain_deferred();
        assert_eq!(td.device.parked.len(), 0);
        let work = loop {
            match td.send_rx.try_recv().expect("second write now queued") {
                SendWork::Barrier => continue,
                work => break work,
            }
        };
        assert!(matches!(work, SendWork::DBlock { .. }));
    }

    #[tokio::test]
    async fn postponed_write_is_resubmitted() {
        let mut td = connected_device(options(Protocol::C));
        let mut rx = submit_write(&mut td, 0, 4096);

        let id = hand_over(&mut td);
        td.device.on_local_endio(id, Ok(None));
        td.device.req_mod(id, ReqEvent::PostponeWrite);
        // Peer resolves the conflict by discarding its side.
        td.device.req_mod(id, ReqEvent::NegAcked);

        assert!(rx.try_recv().is_err(), "postponed requests do not signal");
        assert!(td.device.requests.get(id).is_none());
        assert_eq!(td.device.retry_q.len(), 1);

        // The retry runs the whole submission again.
        td.device.drain_deferred();
        let id2 = hand_over(&mut td);
        assert_ne!(id.0, id2.0);
        td.device.on_local_endio(id2, Ok(None));
        td.device.req_mod(id2, ReqEvent::WriteAckedByPeerAndSis);
        assert!(rx.await.expect("completion delivered").is_ok());
    }

    #[tokio::test]
    async fn remote_read_completes_with_peer_bytes() {
        let mut opts = options(Protocol::C);
        opts.read_balancing = ReadBalancing::PreferRemote;
        let mut td = connected_device(opts);

        let (cb, rx) = Callback::detached();
        td.device.submit(
            SubmitInput {
                sector: 8,
                op: SubmitOp::Read { size: 4096 },
            },
            cb,
        );

        let work = td.send_rx.try_recv().expect("read request queued");
        let SendWork::ReadReq { id, sector, size } = work else {
            panic!("expected a read request, got {:?}", work);
        };
        assert_eq!(sector, 8);
        assert_eq!(size, 4096);

        td.device.req_mod(id, ReqEvent::HandedOverToNetwork);
        let payload = Bytes::from(vec![0x5Au8; 4096]);
        td.device.req_mod(id, ReqEvent::DataReceived(payload.clone()));

        let result = rx.await.expect("completion delivered").expect("read succeeds");
        assert_eq!(result, payload);
        assert!(td.device.requests.get(id).is_none());
    }

    #[tokio::test]
    async fn least_pending_prefers_the_idle_peer() {
        let mut opts = options(Protocol::C);
        opts.read_balancing = ReadBalancing::LeastPending;
        let mut td = connected_device(opts);

        // Local disk busy, peer idle: the read goes remote.
        for _ in 0..10 {
            Counters::inc(&td.device.counters.local_cnt);
        }
        let (cb, _rx) = Callback::detached();
        td.device.submit(
            SubmitInput {
                sector: 8,
                op: SubmitOp::Read { size: 4096 },
            },
            cb,
        );
        assert!(matches!(
            td.send_rx.try_recv(),
            Ok(SendWork::ReadReq { sector: 8, .. })
        ));
    }

    #[tokio::test]
    async fn local_read_error_retries_remotely() {
        let mut td = connected_device(options(Protocol::C));

        let (cb, rx) = Callback::detached();
        td.device.submit(
            SubmitInput {
                sector: 16,
                op: SubmitOp::Read { size: 4096 },
            },
            cb,
        );
        // PreferLocal: nothing on the wire yet, the read went to the disk.
        assert!(td.send_rx.try_recv().is_err());
        let id = td.device.requests.iter().next().expect("request is live").0;

        td.device
            .on_local_endio(id, Err(std::io::Error::new(std::io::ErrorKind::Other, "bad sector")));

        let work = td.send_rx.try_recv().expect("remote retry queued");
        let SendWork::ReadReq { id: rid, .. } = work else {
            panic!("expected a read request, got {:?}", work);
        };
        td.device.req_mod(rid, ReqEvent::HandedOverToNetwork);
        let payload = Bytes::from(vec![1u8; 4096]);
        td.device.req_mod(rid, ReqEvent::DataReceived(payload.clone()));

        let result = rx.await.expect("completion delivered").expect("served by the peer");
        assert_eq!(result, payload);
    }

    #[tokio::test]
    async fn suspended_submissions_wait_for_resume() {
        let mut td = connected_device(options(Protocol::C));
        td.device.suspend_io();

        let rx = submit_write(&mut td, 0, 4096);
        assert!(td.send_rx.try_recv().is_err());
        assert_eq!(td.device.retry_q.len(), 1);

        td.device.resume_io(false);
        td.device.drain_deferred();
        let id = hand_over(&mut td);
        td.device.on_local_endio(id, Ok(None));
        td.device.req_mod(id, ReqEvent::WriteAckedByPeerAndSis);
        assert!(rx.await.expect("completion delivered").is_ok());
    }

    #[tokio::test]
    async fn barrier_ack_while_pending_keeps_the_machine_live() {
        let mut td = connected_device(options(Protocol::C));
        let rx = submit_write(&mut td, 0, 4096);

        let id = hand_over(&mut td);
        td.device.on_local_endio(id, Ok(None));

        // Barrier ack arrives although the write ack never did: a protocol
        // error, logged, flags forced consistent.
        let barrier_nr = td.device.tl.write().unwrap().add_barrier();
        td.device.on_barrier_acked(barrier_nr, 1);

        let s = state_of(&td, id);
        assert_eq!(s & RQ_NET_PENDING, 0);
        assert_ne!(s & RQ_NET_DONE, 0);

        // The host completion is still deliverable.
        td.device.req_may_be_completed(id);
        assert!(rx.await.expect("completion delivered").is_ok());
    }

    #[tokio::test]
    async fn resend_requeues_an_unacked_write() {
        let mut td = connected_device(options(Protocol::C));
        let _rx = submit_write(&mut td, 0, 4096);

        let id = hand_over(&mut td);
        assert_ne!(state_of(&td, id) & RQ_NET_PENDING, 0);

        td.device.req_mod(id, ReqEvent::Resend);
        assert_ne!(state_of(&td, id) & RQ_NET_QUEUED, 0);
        let work = td.send_rx.try_recv().expect("resend queued");
        assert!(matches!(work, SendWork::DBlock { id: rid, .. } if rid == id));
    }

    #[tokio::test]
    async fn resend_after_ack_acts_as_barrier_ack() {
        let mut td = connected_device(options(Protocol::C));
        let rx = submit_write(&mut td, 0, 4096);

        let id = hand_over(&mut td);
        td.device.on_local_endio(id, Ok(None));
        td.device.req_mod(id, ReqEvent::WriteAckedByPeer);
        assert!(rx.await.expect("completion delivered").is_ok());

        // Only the barrier ack was lost with the old connection; RESEND
        // throws the request out of the log as if it had arrived.
        td.device.req_mod(id, ReqEvent::Resend);
        assert!(td.device.requests.get(id).is_none());
    }

    #[tokio::test]
    async fn canceled_remote_read_retries_locally_after_disconnect() {
        let mut opts = options(Protocol::C);
        opts.read_balancing = ReadBalancing::PreferRemote;
        let mut td = connected_device(opts);

        let (cb, rx) = Callback::detached();
        td.device.submit(
            SubmitInput {
                sector: 0,
                op: SubmitOp::Read { size: 4096 },
            },
            cb,
        );
        let work = td.send_rx.try_recv().expect("read request queued");
        let SendWork::ReadReq { id, .. } = work else {
            panic!("expected a read request, got {:?}", work);
        };

        td.device.req_mod(id, ReqEvent::ReadRetryRemoteCanceled);
        td.device
            .on_connection_lost(crate::workers::LostCause::BrokenPipe, None);
        assert!(td.device.requests.get(id).is_none());

        // The failed remote read re-enters the submission path and is
        // served by the local disk.
        td.device.drain_deferred();
        let (retry_id, _) = td.device.requests.iter().next().expect("retried request");
        td.device
            .on_local_endio(retry_id, Ok(Some(Bytes::from(vec![0u8; 4096]))));

        let result = rx.await.expect("completion delivered").expect("local retry");
        assert_eq!(result.len(), 4096);
    }

    #[tokio::test]
    async fn frozen_io_restarts_on_resume() {
        let mut td = connected_device(options(Protocol::C));
        let rx = submit_write(&mut td, 0, 4096);
        let id = hand_over(&mut td);

        // Suspension freezes completions, not transitions.
        td.device.suspend_io();
        td.device.on_local_endio(id, Ok(None));
        td.device.req_mod(id, ReqEvent::WriteAckedByPeerAndSis);
        assert!(td.device.requests.get(id).is_some());

        // Resume re-drives the frozen local half through the disk.
        td.device.resume_io(false);
        assert_ne!(state_of(&td, id) & RQ_LOCAL_PENDING, 0);
        td.device.on_local_endio(id, Ok(None));
        assert!(rx.await.expect("completion delivered").is_ok());
    }

    #[tokio::test]
    async fn frozen_io_can_be_failed_on_resume() {
        let mut td = connected_device(options(Protocol::C));
        let rx = submit_write(&mut td, 0, 4096);
        let id = hand_over(&mut td);

        td.device.suspend_io();
        td.device.on_local_endio(id, Ok(None));
        td.device.req_mod(id, ReqEvent::WriteAckedByPeerAndSis);

        td.device.resume_io(true);
        assert!(rx.await.expect("completion delivered").is_ok());
    }

    #[tokio::test]
    async fn discard_write_terminates_network_half() {
        let mut td = connected_device(options(Protocol::C));
        let rx = submit_write(&mut td, 0, 4096);

        let id = hand_over(&mut td);
        td.device.on_local_endio(id, Ok(None));
        td.device.req_mod(id, ReqEvent::DiscardWrite);

        assert!(rx.await.expect("completion delivered").is_ok());
        assert!(td.device.requests.get(id).is_none());
    }
}
