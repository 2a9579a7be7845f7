use crate::actor::ActorClient;
use crate::api::options::MirrorOptionsValidated;
use crate::api::types::{ConnState, DeviceStatus, Role};
use crate::blockdev::BlockTarget;
use crate::device::{AdminError, Connection, Counters, RequestError, SubmitInput, SubmitOp, TransferLog};
use crate::device::Bitmap;
use crate::wire::channel::{split_stream, ChannelKind, FramedReceiver, FramedSender, PingRequest};
use crate::wire::packet::Packet;
use crate::workers::{
    run_asender, run_receiver, run_sender, run_syncer, AsenderCtx, LostCause, ReceiverCtx, SenderCtx,
    SyncerCtx, WorkerCommand, WorkerSet,
};
use bytes::Bytes;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};

/// The host-facing handle of one mirrored device: the `make_request` entry
/// points plus the administrative surface. Cheap to share behind an Arc.
pub struct DeviceHandle {
    pub(crate) logger: slog::Logger,
    pub(crate) actor: ActorClient,
    pub(crate) opts: Arc<MirrorOptionsValidated>,
    pub(crate) target: Arc<dyn BlockTarget>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) bitmap: Arc<Bitmap>,
    pub(crate) tl: Arc<RwLock<TransferLog>>,
    pub(crate) issue_barrier: Arc<AtomicBool>,
    pub(crate) cstate_rx: watch::Receiver<ConnState>,
    pub(crate) workers: Mutex<WorkerSet>,
}

impl DeviceHandle {
    /// Read `size` bytes at `sector`, served locally or from the peer per
    /// the read-balancing policy.
    pub async fn read(&self, sector: u64, size: u32) -> Result<Bytes, RequestError> {
        self.actor
            .submit(SubmitInput {
                sector,
                op: SubmitOp::Read { size },
            })
            .await
    }

    /// Speculative read; may fail without triggering a remote retry.
    pub async fn read_ahead(&self, sector: u64, size: u32) -> Result<Bytes, RequestError> {
        self.actor
            .submit(SubmitInput {
                sector,
                op: SubmitOp::ReadAhead { size },
            })
            .await
    }

    /// Write `data` at `sector`. Completion semantics depend on the
    /// configured protocol: A completes after the payload left for the
    /// network, B after the peer received it, C after the peer wrote it.
    pub async fn write(&self, sector: u64, data: Bytes) -> Result<(), RequestError> {
        self.actor
            .submit(SubmitInput {
                sector,
                op: SubmitOp::Write { data },
            })
            .await
            .map(|_| ())
    }

    /// Clamp a proposed addition to a bio of `bio_size` bytes against the
    /// device limit intersected with the backing device's merge limit. An
    /// empty bio is always allowed one vector regardless of size.
    pub fn merge_bvec(&self, bio_size: u32, proposed: u32) -> u32 {
        if bio_size == 0 {
            return proposed;
        }
        let limit = self.opts.max_bio_size.min(self.target.merge_limit());
        proposed.min(limit.saturating_sub(bio_size))
    }

    pub async fn set_role(&self, role: Role) -> Result<(), AdminError> {
        self.actor.set_role(role, false).await
    }

    /// Promote to Primary even with inconsistent backing data (the
    /// crash-induced arbitrary promotion).
    pub async fn force_primary(&self) -> Result<(), AdminError> {
        self.actor.set_role(Role::Primary, true).await
    }

    pub async fn suspend_io(&self) -> Result<(), AdminError> {
        self.actor.suspend_io().await
    }

    pub async fn resume_io(&self, fail_frozen: bool) -> Result<(), AdminError> {
        self.actor.resume_io(fail_frozen).await
    }

    pub async fn status(&self) -> Result<DeviceStatus, AdminError> {
        self.actor.status().await
    }

    /// Watchable connection state, in the order the device went through it.
    pub fn connection_state(&self) -> watch::Receiver<ConnState> {
        self.cstate_rx.clone()
    }

    /// Tear the connection down administratively.
    pub async fn disconnect(&self) {
        self.actor.connection_lost(LostCause::Disconnecting).await;
    }

    /// Attach an established transport pair (data channel, meta channel)
    /// and spawn the connection's worker tasks. The handshake runs
    /// immediately; watch `connection_state()` for the outcome.
    pub async fn attach_transport<D, M>(&self, data_stream: D, meta_stream: M) -> Result<(), AdminError>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
        M: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (data_rd, data_wr) = split_stream(data_stream);
        let (meta_rd, meta_wr) = split_stream(meta_stream);

        let ping_request = PingRequest::new();
        let data_out = Arc::new(Mutex::new(FramedSender::new(
            self.logger.clone(),
            ChannelKind::Data,
            data_wr,
            self.opts.timeout,
            ping_request.clone(),
        )));
        let data_in = FramedReceiver::new(data_rd);
        let meta_out = FramedSender::new(
            self.logger.clone(),
            ChannelKind::Meta,
            meta_wr,
            self.opts.ping_timeout,
            ping_request.clone(),
        );
        let meta_in = FramedReceiver::new(meta_rd);

        let (sender_q_tx, sender_q_rx) = flume::unbounded();
        let (ack_q_tx, ack_q_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = watch::channel(WorkerCommand::Run);

        // Register with the actor first so worker events find the
        // connection in place; it answers with our handshake parameters.
        let (params, conn_id) = self
            .actor
            .attach(Connection {
                sender_q: sender_q_tx,
                ack_q: ack_q_tx.clone(),
                stop: stop_tx,
            })
            .await?;

        // First frame on the data channel: who we are.
        {
            let mut ch = data_out.lock().await;
            if let Err(e) = ch.send(&Packet::ReportParams(params)).await {
                slog::error!(self.logger, "handshake send failed"; "error" => %e);
                self.actor.connection_lost(LostCause::BrokenPipe).await;
                return Ok(());
            }
        }

        let mut workers = self.workers.lock().await;
        workers.reap().await;
        let collect = workers.collect_flag();

        workers.adopt(tokio::spawn(run_sender(SenderCtx {
            logger: self.logger.new(slog::o!("task" => "sender")),
            work: sender_q_rx,
            data_out: data_out.clone(),
            tl: self.tl.clone(),
            issue_barrier: self.issue_barrier.clone(),
            counters: self.counters.clone(),
            actor: self.actor.clone(),
            stop: stop_rx.clone(),
            collect: collect.clone(),
            conn_id,
        })));

        workers.adopt(tokio::spawn(run_receiver(ReceiverCtx {
            logger: self.logger.new(slog::o!("task" => "receiver")),
            data_in,
            data_out: data_out.clone(),
            ack_q: ack_q_tx,
            actor: self.actor.clone(),
            target: self.target.clone(),
            bitmap: self.bitmap.clone(),
            counters: self.counters.clone(),
            opts: self.opts.clone(),
            stop: stop_rx.clone(),
            collect: collect.clone(),
            conn_id,
        })));

        workers.adopt(tokio::spawn(run_asender(AsenderCtx {
            logger: self.logger.new(slog::o!("task" => "asender")),
            meta_in,
            meta_out,
            ack_q: ack_q_rx,
            ping_request,
            actor: self.actor.clone(),
            counters: self.counters.clone(),
            opts: self.opts.clone(),
            stop: stop_rx.clone(),
            collect: collect.clone(),
            conn_id,
        })));

        workers.adopt(tokio::spawn(run_syncer(SyncerCtx {
            logger: self.logger.new(slog::o!("task" => "syncer")),
            cstate: self.cstate_rx.clone(),
            data_out,
            bitmap: self.bitmap.clone(),
            target: self.target.clone(),
            counters: self.counters.clone(),
            actor: self.actor.clone(),
            opts: self.opts.clone(),
            stop: stop_rx,
            collect,
            conn_id,
        })));

        Ok(())
    }
}
