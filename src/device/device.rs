use crate::actor::{Callback, WeakActorClient};
use crate::api::options::MirrorOptionsValidated;
use crate::api::types::{ConnState, DeviceStatus, DiskState, OnCongestion, Protocol, ReadBalancing, Role};
use crate::blockdev::BlockTarget;
use crate::device::metadata::{compare, Authority, GenCounts, GenEvent, Metadata};
use crate::device::request::{
    ReqEvent, ReqId, Request, RequestError, RequestTable, RQ_IN_ACT_LOG, RQ_LOCAL_PENDING, RQ_NET_DONE,
    RQ_NET_MASK, RQ_NET_PENDING, RQ_WRITE,
};
use crate::device::{ActivityLog, Bitmap, Counters, IntervalMap, SyncState, TransferLog};
use crate::wire::packet::{PeerParams, PRO_VERSION};
use crate::workers::{AckWork, LostCause, SendWork, WorkerCommand};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("backing data is inconsistent; resync first")]
    InconsistentDisk,
    #[error("peer is primary")]
    PeerIsPrimary,
    #[error("device actor has exited")]
    ActorExited,
}

/// One submission from the host, as the actor sees it.
#[derive(Debug)]
pub(crate) struct SubmitInput {
    pub sector: u64,
    pub op: SubmitOp,
}

#[derive(Debug)]
pub(crate) enum SubmitOp {
    Read { size: u32 },
    ReadAhead { size: u32 },
    Write { data: Bytes },
}

impl SubmitOp {
    pub(crate) fn is_write(&self) -> bool {
        matches!(self, SubmitOp::Write { .. })
    }

    pub(crate) fn size(&self) -> u32 {
        match self {
            SubmitOp::Read { size } | SubmitOp::ReadAhead { size } => *size,
            SubmitOp::Write { data } => data.len() as u32,
        }
    }
}

/// Handles to the worker side of an attached connection.
pub(crate) struct Connection {
    pub sender_q: flume::Sender<SendWork>,
    pub ack_q: flume::Sender<AckWork>,
    pub stop: watch::Sender<WorkerCommand>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish()
    }
}

impl Connection {
    fn queue_send(&self, work: SendWork) {
        let _ = self.sender_q.send(work);
    }

    fn queue_ack(&self, work: AckWork) {
        let _ = self.ack_q.send(work);
    }
}

/// Everything a Device is built from.
pub(crate) struct DeviceSeed {
    pub logger: slog::Logger,
    pub opts: Arc<MirrorOptionsValidated>,
    pub target: Arc<dyn BlockTarget>,
    pub meta: Metadata,
    pub bitmap: Arc<Bitmap>,
    pub tl: Arc<RwLock<TransferLog>>,
    pub counters: Arc<Counters>,
    pub issue_barrier: Arc<AtomicBool>,
    pub actor: WeakActorClient,
    pub cstate_tx: watch::Sender<ConnState>,
}

/// The device core. Lives inside the actor task, which serialises every
/// mutation — the actor loop is the request lock.
pub(crate) struct Device {
    pub(crate) logger: slog::Logger,
    pub(crate) opts: Arc<MirrorOptionsValidated>,
    pub(crate) target: Arc<dyn BlockTarget>,
    pub(crate) actor: WeakActorClient,

    pub(crate) role: Role,
    pub(crate) cstate: ConnState,
    pub(crate) cstate_tx: watch::Sender<ConnState>,
    pub(crate) disk_state: DiskState,
    pub(crate) peer_disk: Option<DiskState>,
    pub(crate) peer_role: Option<Role>,
    pub(crate) suspended: bool,
    pub(crate) local_failed: bool,

    pub(crate) requests: RequestTable,
    pub(crate) write_requests: IntervalMap,
    pub(crate) read_requests: IntervalMap,
    pub(crate) parked: VecDeque<ParkedSubmit>,
    pub(crate) retry_q: VecDeque<ParkedSubmit>,
    pub(crate) wake_parked: bool,

    pub(crate) current_tle_nr: u32,
    pub(crate) current_tle_writes: u32,
    pub(crate) issue_barrier: Arc<AtomicBool>,
    pub(crate) resync_drained: bool,

    pub(crate) counters: Arc<Counters>,
    pub(crate) bitmap: Arc<Bitmap>,
    pub(crate) tl: Arc<RwLock<TransferLog>>,
    pub(crate) meta: Metadata,
    pub(crate) al: ActivityLog,

    pub(crate) conn: Option<Connection>,
    pub(crate) conn_seq: u64,
    pub(crate) rb_round_robin: bool,
}

pub(crate) struct ParkedSubmit {
    pub input: SubmitInput,
    pub callback: Callback<Bytes, RequestError>,
}

impl Device {
    pub(crate) fn new(seed: DeviceSeed) -> Self {
        Device {
            logger: seed.logger,
            opts: seed.opts,
            target: seed.target,
            actor: seed.actor,
            role: Role::Secondary,
            cstate: ConnState::StandAlone,
            cstate_tx: seed.cstate_tx,
            disk_state: DiskState::UpToDate,
            peer_disk: None,
            peer_role: None,
            suspended: false,
            local_failed: false,
            requests: RequestTable::new(),
            write_requests: IntervalMap::new(),
            read_requests: IntervalMap::new(),
            parked: VecDeque::new(),
            retry_q: VecDeque::new(),
            wake_parked: false,
            current_tle_nr: 0,
            current_tle_writes: 0,
            issue_barrier: seed.issue_barrier,
            resync_drained: false,
            counters: seed.counters,
            bitmap: seed.bitmap,
            tl: seed.tl,
            meta: seed.meta,
            al: ActivityLog::new(),
            conn: None,
            conn_seq: 0,
            rb_round_robin: false,
        }
    }

    fn set_cstate(&mut self, cstate: ConnState) {
        if self.cstate == cstate {
            return;
        }
        slog::info!(self.logger, "connection state change";
            "from" => ?self.cstate, "to" => ?cstate);
        self.cstate = cstate;
        let _ = self.cstate_tx.send(cstate);
        if let Some(conn) = &self.conn {
            conn.queue_ack(AckWork::CStateChanged {
                cstate: cstate.to_wire(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Submission path
    // ------------------------------------------------------------------

    pub(crate) fn submit(&mut self, input: SubmitInput, callback: Callback<Bytes, RequestError>) {
        let is_write = input.op.is_write();
        let sector = input.sector;
        let size = input.op.size();

        if let Err(e) = self.validate(sector, size, is_write) {
            callback.send(Err(e));
            return;
        }

        // Conflict resolution: a write overlapping an in-flight mirrored
        // write parks until the holder completes.
        if is_write {
            if let Some(holder) = self.write_requests.find_overlap(sector, size) {
                slog::trace!(self.logger, "write conflicts with in-flight request";
                    "sector" => sector, "holder" => ?holder);
                self.write_requests.mark_waiting(sector, size);
                self.parked.push_back(ParkedSubmit { input, callback });
                return;
            }
        }

        if self.suspended {
            // Push back and retry after resume.
            self.retry_q.push_back(ParkedSubmit { input, callback });
            return;
        }

        if self.cstate == ConnState::Ahead {
            self.maybe_resume_from_ahead();
        }

        let local_usable = !self.local_failed;
        let (data, is_read_ahead) = match input.op {
            SubmitOp::Write { data } => (Some(data), false),
            SubmitOp::ReadAhead { .. } => (None, true),
            SubmitOp::Read { .. } => (None, false),
        };

        let mut req = Request::new(sector, size, is_write, is_read_ahead, callback, Instant::now());
        req.local = local_usable;
        req.data = data;

        // Writes touching the local disk hold an activity log reference for
        // their whole life time.
        if is_write && req.local {
            self.al.begin_io(sector, size);
            req.rq_state |= RQ_IN_ACT_LOG;
        }

        let id = self.requests.insert(req);

        let mut remote_read = false;
        if !is_write {
            remote_read = self.find_peer_for_read(id);
            let req = self.requests.get(id).expect("just inserted");
            if !remote_read && !req.local {
                slog::error!(self.logger, "I/O error: neither local nor remote data";
                    "sector" => sector);
                let req = self.requests.remove(id).expect("just inserted");
                req.fail(RequestError::NoData);
                return;
            }
        }

        // Which transfer log epoch does this belong to?
        let epoch = self.current_tle_nr;
        if let Some(req) = self.requests.get_mut(id) {
            req.epoch = epoch;
        }
        if is_write {
            self.current_tle_writes += 1;
        }

        if is_write {
            let mut remote = self.should_do_remote();
            if remote {
                self.check_congested();
                remote = self.should_do_remote();
            }
            let send_oos = self.should_send_out_of_sync();

            if remote {
                self.write_requests.insert(id, sector, size);
                if let Some(req) = self.requests.get_mut(id) {
                    req.in_interval = true;
                }
                self.req_mod(id, ReqEvent::ToBeSent);
                self.req_mod(id, ReqEvent::QueueForNetWrite);
            } else if send_oos {
                self.bitmap.set_range(sector, size, SyncState::OutOfSync);
                self.req_mod(id, ReqEvent::QueueForSendOos);
            } else if !local_usable {
                slog::error!(self.logger, "I/O error: neither local nor remote disk";
                    "sector" => sector);
                let req = self.requests.remove(id).expect("present");
                req.fail(RequestError::NoData);
                return;
            }
        } else if remote_read {
            self.req_mod(id, ReqEvent::ToBeSent);
            self.req_mod(id, ReqEvent::QueueForNetRead);
        }

        let has_local = self.requests.get(id).map_or(false, |r| r.local);
        if has_local {
            self.req_mod(id, ReqEvent::ToBeSubmitted);
            self.submit_local(id);
        }

        self.req_may_be_completed(id);
    }

    fn validate(&self, sector: u64, size: u32, is_write: bool) -> Result<(), RequestError> {
        if is_write && self.role != Role::Primary {
            return Err(RequestError::ReadOnly);
        }
        if size == 0 || size % 512 != 0 || size > self.opts.max_bio_size {
            return Err(RequestError::InvalidRequest);
        }
        let end = sector
            .checked_mul(512)
            .and_then(|offset| offset.checked_add(size as u64));
        if end.map_or(true, |end| end > self.target.capacity()) {
            return Err(RequestError::InvalidRequest);
        }
        Ok(())
    }

    /// Apply the read-balancing policy. Returns true when the read goes to
    /// the peer; in that case the local reference is dropped.
    fn find_peer_for_read(&mut self, id: ReqId) -> bool {
        let (sector, size, mut local) = {
            let req = self.requests.get(id).expect("live request");
            (req.sector, req.size, req.local)
        };

        // We may read locally if the disk is up to date, or while
        // inconsistent when the whole range is already in sync.
        if local {
            let can_local = match self.disk_state {
                DiskState::UpToDate => true,
                DiskState::Inconsistent => self.bitmap.count_dirty_in(sector, size) == 0,
            };
            if !can_local {
                local = false;
            }
        }

        let peer_usable = self.peer_disk == Some(DiskState::UpToDate)
            && self.conn.is_some()
            && matches!(
                self.cstate,
                ConnState::Connected | ConnState::SyncSource | ConnState::SyncTarget
            );

        let rbm = self.opts.read_balancing;
        let go_remote = if !peer_usable {
            false
        } else if !local {
            true
        } else {
            match rbm {
                ReadBalancing::PreferLocal => false,
                ReadBalancing::PreferRemote => true,
                ReadBalancing::LeastPending => {
                    Counters::get(&self.counters.local_cnt)
                        > Counters::get(&self.counters.ap_pending)
                            + Counters::get(&self.counters.rs_pending)
                }
                ReadBalancing::RoundRobin => {
                    self.rb_round_robin = !self.rb_round_robin;
                    self.rb_round_robin
                }
                ReadBalancing::CongestedRemote => self.target.read_congested(),
                _ => {
                    let shift = rbm.stripe_shift().unwrap_or(15);
                    (sector >> (shift - 9)) & 1 == 1
                }
            }
        };

        let req = self.requests.get_mut(id).expect("live request");
        if go_remote {
            req.local = false;
        } else {
            req.local = local;
        }
        go_remote
    }

    pub(crate) fn should_do_remote(&self) -> bool {
        match self.peer_disk {
            Some(DiskState::UpToDate) => self.conn.is_some() && self.cstate != ConnState::Ahead,
            Some(DiskState::Inconsistent) => self.cstate == ConnState::SyncSource,
            None => false,
        }
    }

    pub(crate) fn should_send_out_of_sync(&self) -> bool {
        self.cstate == ConnState::Ahead
    }

    fn check_congested(&mut self) {
        if self.opts.on_congestion == OnCongestion::Block || self.cstate != ConnState::Connected {
            return;
        }

        let mut congested = false;
        if self.opts.cong_fill > 0
            && Counters::get64(&self.counters.ap_in_flight) >= self.opts.cong_fill
        {
            slog::info!(self.logger, "congestion-fill threshold reached");
            congested = true;
        }
        if self.al.used() >= self.opts.cong_extents {
            slog::info!(self.logger, "congestion-extents threshold reached");
            congested = true;
        }

        if congested {
            if self.current_tle_writes > 0 {
                self.start_new_epoch();
            }
            match self.opts.on_congestion {
                OnCongestion::PullAhead => {
                    self.peer_disk = Some(DiskState::Inconsistent);
                    self.set_cstate(ConnState::Ahead);
                }
                OnCongestion::Disconnect => self.on_connection_lost(LostCause::Disconnecting, None),
                OnCongestion::Block => {}
            }
        }
    }

    /// Congestion is over once nothing is in flight; go resync the blocks
    /// we only announced as out of sync.
    fn maybe_resume_from_ahead(&mut self) {
        if Counters::get64(&self.counters.ap_in_flight) == 0
            && self.al.used() < self.opts.cong_extents
        {
            slog::info!(self.logger, "congestion over, resyncing ahead backlog");
            self.begin_resync(Authority::IHaveGood);
        }
    }

    pub(crate) fn submit_local(&mut self, id: ReqId) {
        let (sector, size, data, is_write) = {
            let req = self.requests.get(id).expect("live request");
            (req.sector, req.size, req.data.clone(), req.rq_state & RQ_WRITE != 0)
        };
        let Some(actor) = self.actor.upgrade() else {
            return;
        };
        Counters::inc(&self.counters.local_cnt);
        let target = self.target.clone();
        tokio::spawn(async move {
            let result = if is_write {
                let data = data.expect("write request carries data");
                target.write_at(sector, data).await.map(|()| None)
            } else {
                target.read_at(sector, size).await.map(Some)
            };
            actor.local_endio(id, result).await;
        });
    }

    pub(crate) fn start_new_epoch(&mut self) {
        self.current_tle_nr = self.current_tle_nr.wrapping_add(1);
        self.current_tle_writes = 0;
        self.issue_barrier.store(true, Ordering::Release);
        if let Some(conn) = &self.conn {
            conn.queue_send(SendWork::Barrier);
        }
    }

    pub(crate) fn queue_send(&self, work: SendWork) {
        if let Some(conn) = &self.conn {
            conn.queue_send(work);
        }
    }

    pub(crate) fn queue_ack(&self, work: AckWork) {
        if let Some(conn) = &self.conn {
            conn.queue_ack(work);
        }
    }

    // ------------------------------------------------------------------
    // Worker-event entry points
    // ------------------------------------------------------------------

    pub(crate) fn on_local_endio(&mut self, id: ReqId, result: std::io::Result<Option<Bytes>>) {
        Counters::dec(&self.counters.local_cnt);
        let event = {
            let Some(req) = self.requests.get_mut(id) else {
                slog::debug!(self.logger, "late local completion for freed request"; "id" => ?id);
                return;
            };
            let is_write = req.rq_state & RQ_WRITE != 0;
            let is_read_ahead = req.read_ahead;
            match result {
                Ok(data) => {
                    req.read_data = data;
                    ReqEvent::CompletedOk
                }
                Err(e) => {
                    slog::error!(self.logger, "local I/O failed"; "id" => ?id, "error" => %e);
                    req.local_error = Some(e);
                    if is_write {
                        ReqEvent::WriteCompletedWithError
                    } else if is_read_ahead {
                        ReqEvent::ReadAheadCompletedWithError
                    } else {
                        ReqEvent::ReadCompletedWithError
                    }
                }
            }
        };
        self.req_mod(id, event);
    }

    pub(crate) fn on_barrier_acked(&mut self, barrier_nr: u32, set_size: u32) {
        let popped = self
            .tl
            .write()
            .expect("transfer log lock poisoned")
            .release(barrier_nr, set_size);
        for id in popped {
            if self.requests.get(id).is_some() {
                self.req_mod(id, ReqEvent::BarrierAcked);
            }
        }
    }

    pub(crate) fn on_resync_acked(&mut self, block_nr: u64, ok: bool) {
        Counters::dec(&self.counters.rs_pending);
        if ok {
            let ln2 = self.opts.ln2_block_size;
            let blocknr = (block_nr * 512) >> ln2;
            self.bitmap.set_bit(blocknr, ln2, SyncState::InSync);
        } else {
            slog::warn!(self.logger, "peer rejected resync block"; "block_nr" => block_nr);
        }
        self.maybe_finish_resync();
    }

    pub(crate) fn on_resync_drained(&mut self) {
        self.resync_drained = true;
        self.maybe_finish_resync();
    }

    fn maybe_finish_resync(&mut self) {
        if self.cstate != ConnState::SyncSource {
            return;
        }
        if !self.resync_drained || Counters::get(&self.counters.rs_pending) != 0 {
            return;
        }
        slog::info!(self.logger, "resync finished"; "dirty_left" => self.bitmap.total_dirty());
        self.resync_drained = false;
        self.peer_disk = Some(DiskState::UpToDate);
        self.meta.snapshot_bit_map_gen();
        self.write_metadata();
        self.set_cstate(ConnState::Connected);
    }

    // ------------------------------------------------------------------
    // Handshake & connection state
    // ------------------------------------------------------------------

    /// Returns the connection sequence number worker events must carry so
    /// a stale worker cannot tear down a successor connection.
    pub(crate) fn on_transport_attached(&mut self, conn: Connection) -> u64 {
        if self.conn.is_some() {
            slog::warn!(self.logger, "replacing an existing transport");
            self.on_connection_lost(LostCause::Disconnecting, None);
        }
        self.conn_seq += 1;
        self.conn = Some(conn);
        self.issue_barrier.store(false, Ordering::Release);
        self.set_cstate(ConnState::WFReportParams);
        self.conn_seq
    }

    pub(crate) fn our_params(&self) -> PeerParams {
        use crate::wire::packet::{STATE_CONSISTENT, STATE_PRIMARY};
        let mut state = 0;
        if self.role == Role::Primary {
            state |= STATE_PRIMARY;
        }
        if self.meta.consistent {
            state |= STATE_CONSISTENT;
        }
        PeerParams {
            size: self.target.capacity(),
            blksize: 1 << self.opts.ln2_block_size,
            state,
            protocol: self.opts.protocol.to_wire(),
            version: PRO_VERSION,
            gen_cnt: self.meta.gen.as_words(),
        }
    }

    pub(crate) fn on_handshake(&mut self, params: PeerParams) {
        if self.cstate != ConnState::WFReportParams {
            slog::warn!(self.logger, "unexpected ReportParams"; "cstate" => ?self.cstate);
            return;
        }
        if params.version != PRO_VERSION {
            slog::error!(self.logger, "peer protocol version mismatch";
                "ours" => PRO_VERSION, "peer" => params.version);
            self.drop_connection_standalone();
            return;
        }
        if Protocol::from_wire(params.protocol) != Some(self.opts.protocol) {
            slog::error!(self.logger, "peer replication protocol mismatch";
                "peer_raw" => params.protocol);
            self.drop_connection_standalone();
            return;
        }
        if params.size != self.target.capacity() {
            slog::error!(self.logger, "peer device size mismatch";
                "ours" => self.target.capacity(), "peer" => params.size);
            self.drop_connection_standalone();
            return;
        }
        if params.is_primary() && self.role == Role::Primary {
            slog::crit!(self.logger, "both nodes are primary, refusing connection");
            self.drop_connection_standalone();
            return;
        }

        self.peer_role = Some(if params.is_primary() {
            Role::Primary
        } else {
            Role::Secondary
        });

        let peer_gen = GenCounts::from_words(params.gen_cnt);
        let authority = compare(&self.meta.gen, &peer_gen);
        let quick = self.meta.syncq_ok(&peer_gen, params.is_consistent(), authority);
        slog::info!(self.logger, "handshake complete";
            "authority" => ?authority, "quick_sync" => quick,
            "peer_gen" => ?params.gen_cnt);

        // Each successful (re)connect advances the connected count.
        self.meta.inc(GenEvent::Reconnect);

        match authority {
            Authority::Tie => {
                self.peer_disk = Some(DiskState::UpToDate);
                self.meta.snapshot_bit_map_gen();
                self.write_metadata();
                self.set_cstate(ConnState::Connected);
            }
            Authority::IHaveGood => {
                if !quick {
                    self.bitmap.set_all_out_of_sync();
                }
                self.write_metadata();
                self.begin_resync(Authority::IHaveGood);
            }
            Authority::PeerHasGood => {
                if !quick {
                    self.bitmap.set_all_out_of_sync();
                }
                self.disk_state = DiskState::Inconsistent;
                self.meta.consistent = false;
                self.write_metadata();
                self.begin_resync(Authority::PeerHasGood);
            }
        }
    }

    fn begin_resync(&mut self, who_has_good: Authority) {
        match who_has_good {
            Authority::IHaveGood => {
                self.peer_disk = Some(DiskState::Inconsistent);
                self.set_cstate(ConnState::SyncSource);
            }
            Authority::PeerHasGood => {
                self.peer_disk = Some(DiskState::UpToDate);
                self.set_cstate(ConnState::SyncTarget);
            }
            Authority::Tie => {}
        }
    }

    pub(crate) fn on_peer_cstate(&mut self, raw: u32) {
        let Some(peer_cstate) = ConnState::from_wire(raw) else {
            slog::warn!(self.logger, "peer sent unknown cstate"; "raw" => raw);
            return;
        };
        slog::debug!(self.logger, "peer connection state"; "peer_cstate" => ?peer_cstate);

        match peer_cstate {
            ConnState::Connected if self.cstate == ConnState::SyncTarget => {
                // Sync source finished; our copy is whole again.
                self.disk_state = DiskState::UpToDate;
                self.meta.consistent = true;
                self.meta.snapshot_bit_map_gen();
                self.write_metadata();
                self.set_cstate(ConnState::Connected);
            }
            ConnState::SyncSource if self.cstate == ConnState::Connected => {
                // Peer went Ahead earlier and now resyncs us.
                self.set_cstate(ConnState::SyncTarget);
            }
            _ => {}
        }
    }

    fn drop_connection_standalone(&mut self) {
        self.stop_workers();
        self.conn = None;
        self.peer_disk = None;
        self.peer_role = None;
        self.set_cstate(ConnState::StandAlone);
    }

    fn stop_workers(&mut self) {
        if let Some(conn) = &self.conn {
            let _ = conn.stop.send(WorkerCommand::Exit);
        }
    }

    /// Network teardown: flow from transfer-log cleanup into bitmap
    /// dirtying, then terminate every network half so no completion is
    /// stranded.
    pub(crate) fn on_connection_lost(&mut self, cause: LostCause, conn_seq: Option<u64>) {
        if let Some(seq) = conn_seq {
            if seq != self.conn_seq {
                slog::debug!(self.logger, "connection-lost event from a stale worker";
                    "seq" => seq, "current" => self.conn_seq);
                return;
            }
        }
        if !matches!(
            self.cstate,
            ConnState::WFReportParams
                | ConnState::Connected
                | ConnState::SyncSource
                | ConnState::SyncTarget
                | ConnState::Ahead
        ) {
            return;
        }
        slog::warn!(self.logger, "connection lost"; "cause" => ?cause);

        self.stop_workers();
        self.conn = None;
        self.peer_disk = None;
        self.peer_role = None;

        if cause == LostCause::Timeout {
            self.meta.inc(GenEvent::AckTimeout);
        }
        self.set_cstate(match cause {
            LostCause::Timeout => ConnState::Timeout,
            LostCause::BrokenPipe => ConnState::BrokenPipe,
            LostCause::Disconnecting => ConnState::Unconnected,
        });

        self.tl_clear();
        self.write_metadata();
    }

    fn tl_clear(&mut self) {
        // Reinitialise the ring; the sweep below covers its requests too.
        let _ = self.tl.write().expect("transfer log lock poisoned").clear();

        let stranded: Vec<ReqId> = self
            .requests
            .iter()
            .filter(|(_, req)| req.rq_state & RQ_NET_MASK != 0 && req.rq_state & RQ_NET_DONE == 0)
            .map(|(id, _)| id)
            .collect();

        for id in stranded {
            // The bitmap bit must be set before the request can complete.
            let (sector, size, is_write) = {
                let req = self.requests.get(id).expect("swept request is live");
                (req.sector, req.size, req.rq_state & RQ_WRITE != 0)
            };
            if is_write {
                self.bitmap.set_range(sector, size, SyncState::OutOfSync);
            }
            self.req_mod(id, ReqEvent::ConnectionLostWhilePending);
        }
    }

    // ------------------------------------------------------------------
    // Watchdog
    // ------------------------------------------------------------------

    pub(crate) fn on_check_timeouts(&mut self) {
        let now = Instant::now();
        let net_deadline = self.opts.timeout * self.opts.ko_count;

        let oldest_net = self
            .requests
            .iter()
            .filter(|(_, r)| r.rq_state & RQ_NET_PENDING != 0)
            .map(|(_, r)| r.start_time)
            .min();
        if let Some(start) = oldest_net {
            if now.duration_since(start) >= net_deadline {
                slog::warn!(self.logger,
                    "peer failed to finish a request within ko-count * timeout");
                self.on_connection_lost(LostCause::Timeout, None);
            }
        }

        if let Some(disk_timeout) = self.opts.disk_timeout {
            let overdue: Vec<ReqId> = self
                .requests
                .iter()
                .filter(|(_, r)| {
                    r.rq_state & RQ_LOCAL_PENDING != 0
                        && now.duration_since(r.start_time) >= disk_timeout
                })
                .map(|(id, _)| id)
                .collect();
            if !overdue.is_empty() {
                slog::warn!(self.logger, "local backing device failed to meet the disk-timeout");
                self.chk_io_error();
                for id in overdue {
                    self.req_mod(id, ReqEvent::AbortDiskIo);
                }
            }
        }
    }

    pub(crate) fn chk_io_error(&mut self) {
        if !self.local_failed {
            slog::error!(self.logger, "detaching failed local disk");
            self.local_failed = true;
            self.disk_state = DiskState::Inconsistent;
        }
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    pub(crate) fn set_role(&mut self, role: Role, forced: bool) -> Result<(), AdminError> {
        if role == self.role {
            return Ok(());
        }
        if role == Role::Primary {
            if self.peer_role == Some(Role::Primary) {
                return Err(AdminError::PeerIsPrimary);
            }
            if self.disk_state == DiskState::Inconsistent && !forced {
                return Err(AdminError::InconsistentDisk);
            }
            self.meta.inc(if forced {
                GenEvent::ArbitraryPromotion
            } else {
                GenEvent::HumanIntervention
            });
        }
        slog::info!(self.logger, "role change"; "from" => ?self.role, "to" => ?role, "forced" => forced);
        self.role = role;
        self.write_metadata();
        Ok(())
    }

    pub(crate) fn suspend_io(&mut self) {
        self.suspended = true;
    }

    pub(crate) fn resume_io(&mut self, fail_frozen: bool) {
        self.suspended = false;
        let frozen: Vec<ReqId> = self.requests.iter().map(|(id, _)| id).collect();
        for id in frozen {
            self.req_mod(
                id,
                if fail_frozen {
                    ReqEvent::FailFrozenDiskIo
                } else {
                    ReqEvent::RestartFrozenDiskIo
                },
            );
        }
    }

    pub(crate) fn status(&self) -> DeviceStatus {
        DeviceStatus {
            cstate: self.cstate,
            role: self.role,
            peer_role: self.peer_role,
            disk_state: self.disk_state,
            peer_disk_state: self.peer_disk,
            dirty_blocks: self.bitmap.total_dirty(),
            ap_pending: Counters::get(&self.counters.ap_pending),
            rs_pending: Counters::get(&self.counters.rs_pending),
            unacked: Counters::get(&self.counters.unacked),
            ap_in_flight_sectors: Counters::get64(&self.counters.ap_in_flight),
            send_bytes: Counters::get64(&self.counters.send_bytes),
            recv_bytes: Counters::get64(&self.counters.recv_bytes),
            read_sectors: Counters::get64(&self.counters.read_sectors),
            written_sectors: Counters::get64(&self.counters.writ_sectors),
        }
    }

    pub(crate) fn write_metadata(&mut self) {
        let primary = self.role == Role::Primary;
        if let Err(e) = self.meta.write(primary) {
            slog::error!(self.logger, "error writing metadata record"; "error" => %e);
        }
    }

    // ------------------------------------------------------------------
    // Parked / postponed work
    // ------------------------------------------------------------------

    /// Re-drive submissions that were parked on a conflict or postponed.
    /// Called by the actor after every handled event.
    pub(crate) fn drain_deferred(&mut self) {
        if self.wake_parked {
            self.wake_parked = false;
            let parked: Vec<ParkedSubmit> = self.parked.drain(..).collect();
            for p in parked {
                self.submit(p.input, p.callback);
            }
        }
        if !self.suspended {
            while let Some(p) = self.retry_q.pop_front() {
                self.submit(p.input, p.callback);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::api::options::MirrorOptions;
    use crate::blockdev::MemDisk;
    use crate::device::metadata::VolatileMetadataStore;
    use tokio::sync::mpsc;

    /// A device with its actor queue and worker queues held open, for
    /// driving the state machine by hand.
    pub(crate) struct TestDevice {
        pub device: Device,
        pub client: ActorClient,
        pub actor_rx: mpsc::UnboundedReceiver<Event>,
        pub send_rx: flume::Receiver<SendWork>,
        pub ack_rx: flume::Receiver<AckWork>,
        pub disk: Arc<MemDisk>,
    }

    pub(crate) fn standalone_device(options: MirrorOptions) -> TestDevice {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let opts = Arc::new(MirrorOptionsValidated::try_from(options).unwrap());
        let disk = Arc::new(MemDisk::new(1 << 20));
        let meta = Metadata::read(logger.clone(), Box::new(VolatileMetadataStore::new()), false).unwrap();
        let bitmap = Arc::new(Bitmap::new(logger.clone(), disk.capacity()));
        let tl = Arc::new(RwLock::new(TransferLog::new(logger.clone(), opts.tl_size)));
        let (client, actor_rx) = ActorClient::new();
        let (cstate_tx, _cstate_rx) = watch::channel(ConnState::StandAlone);

        let device = Device::new(DeviceSeed {
            logger,
            opts,
            target: disk.clone(),
            meta,
            bitmap,
            tl,
            counters: Arc::new(Counters::default()),
            issue_barrier: Arc::new(AtomicBool::new(false)),
            actor: client.weak(),
            cstate_tx,
        });

        // Queues are unconnected while StandAlone; connected_device swaps
        // in live ones.
        let (_, send_rx) = flume::unbounded();
        let (_, ack_rx) = flume::unbounded();

        let mut td = TestDevice {
            device,
            client,
            actor_rx,
            send_rx,
            ack_rx,
            disk,
        };
        td.device.role = Role::Primary;
        td
    }

    /// Device wired as if a handshake had just completed.
    pub(crate) fn connected_device(options: MirrorOptions) -> TestDevice {
        let mut td = standalone_device(options);
        let (send_tx, send_rx) = flume::unbounded();
        let (ack_tx, ack_rx) = flume::unbounded();
        let (stop_tx, _stop_rx) = watch::channel(WorkerCommand::Run);
        td.device.conn = Some(Connection {
            sender_q: send_tx,
            ack_q: ack_tx,
            stop: stop_tx,
        });
        td.device.cstate = ConnState::Connected;
        td.device.peer_disk = Some(DiskState::UpToDate);
        td.device.peer_role = Some(Role::Secondary);
        td.send_rx = send_rx;
        td.ack_rx = ack_rx;
        td
    }
}
