use crate::api::types::{DeviceStatus, Role};
use crate::device::{AdminError, Connection, Device, ReqEvent, ReqId, RequestError, SubmitInput};
use crate::wire::packet::PeerParams;
use crate::workers::{LostCause, SendOutcome};
use bytes::Bytes;
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::io;
use tokio::sync::{mpsc, oneshot};

/// Every event that may touch request state funnels through this queue and
/// is handled on the single actor task: the actor loop is the request lock.
#[derive(Debug)]
pub(crate) enum Event {
    // Host: submit one bio-sized request.
    Submit(SubmitInput, Callback<Bytes, RequestError>),

    // Local endio: completion of a backing-device I/O.
    LocalEndio {
        id: ReqId,
        result: io::Result<Option<Bytes>>,
    },

    // Sender: a work item left (or failed to leave) on the wire.
    SenderReport { id: ReqId, outcome: SendOutcome },

    // Asender / receiver: the peer acknowledged a block.
    PeerAck { block_id: u64, kind: AckKind },

    // Asender: the peer acknowledged a whole epoch.
    BarrierAcked { barrier_nr: u32, set_size: u32 },

    // Asender: ack for a resync block (ID_SYNCER tagged).
    ResyncAcked { block_nr: u64, ok: bool },

    // Syncer: bitmap scan hit the end.
    ResyncDrained,

    // Wiring: a fresh transport was attached; reply with our handshake
    // parameters and the connection sequence number.
    TransportAttached(Connection, Callback<(PeerParams, u64), AdminError>),

    // Receiver: the peer's handshake parameters arrived.
    Handshake(PeerParams),

    // Receiver / asender: peer announced a connection state change.
    PeerCState { raw: u32 },

    // Any worker: the connection died. `conn_seq` is None for the
    // administrative teardown, which is never stale.
    ConnectionLost {
        cause: LostCause,
        conn_seq: Option<u64>,
    },

    // Asender watchdog tick.
    CheckTimeouts,

    // Administration.
    SetRole {
        role: Role,
        forced: bool,
        callback: Callback<(), AdminError>,
    },
    SuspendIo(Callback<(), AdminError>),
    ResumeIo {
        fail_frozen: bool,
        callback: Callback<(), AdminError>,
    },
    Status(Callback<DeviceStatus, AdminError>),
}

/// Peer acknowledgement variants, as decoded off the meta/data channels.
#[derive(Debug)]
pub(crate) enum AckKind {
    WriteAcked { set_in_sync: bool },
    RecvAcked,
    NegAcked,
    DataReceived(Bytes),
}

pub struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Debug for Callback<O, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish()
    }
}

impl<O: Debug, E: Error> Callback<O, E> {
    pub fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[cfg(test)]
impl<O: Debug, E: Error> Callback<O, E> {
    /// Build a detached callback plus the receiving end, for driving the
    /// state machine directly in tests.
    pub(crate) fn detached() -> (Self, oneshot::Receiver<Result<O, E>>) {
        let (tx, rx) = oneshot::channel();
        (Callback(tx), rx)
    }
}

#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::UnboundedSender<Event>,
}

/// Client that does not keep the actor alive; the device core holds one of
/// these so the event loop can exit once every real client is gone.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakUnboundedSender<Event>,
}

impl WeakActorClient {
    pub(crate) fn upgrade(&self) -> Option<ActorClient> {
        self.sender.upgrade().map(|sender| ActorClient { sender })
    }
}

impl ActorClient {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    fn send_to_actor(&self, event: Event) {
        // A dropped receiver means the device is gone; events may be
        // discarded at that point.
        let _ = self.sender.send(event);
    }

    pub(crate) async fn submit(&self, input: SubmitInput) -> Result<Bytes, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::Submit(input, Callback(tx)));
        rx.await.unwrap_or(Err(RequestError::Shutdown))
    }

    pub(crate) async fn local_endio(&self, id: ReqId, result: io::Result<Option<Bytes>>) {
        self.send_to_actor(Event::LocalEndio { id, result });
    }

    pub(crate) async fn sender_report(&self, id: ReqId, outcome: SendOutcome) {
        self.send_to_actor(Event::SenderReport { id, outcome });
    }

    pub(crate) async fn peer_ack(&self, block_id: u64, kind: AckKind) {
        self.send_to_actor(Event::PeerAck { block_id, kind });
    }

    pub(crate) async fn barrier_acked(&self, barrier_nr: u32, set_size: u32) {
        self.send_to_actor(Event::BarrierAcked { barrier_nr, set_size });
    }

    pub(crate) async fn resync_acked(&self, block_nr: u64, ok: bool) {
        self.send_to_actor(Event::ResyncAcked { block_nr, ok });
    }

    pub(crate) async fn resync_drained(&self) {
        self.send_to_actor(Event::ResyncDrained);
    }

    pub(crate) async fn attach(&self, conn: Connection) -> Result<(PeerParams, u64), AdminError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::TransportAttached(conn, Callback(tx)));
        rx.await.unwrap_or(Err(AdminError::ActorExited))
    }

    pub(crate) async fn handshake(&self, params: PeerParams) {
        self.send_to_actor(Event::Handshake(params));
    }

    pub(crate) async fn peer_cstate(&self, raw: u32) {
        self.send_to_actor(Event::PeerCState { raw });
    }

    pub(crate) async fn connection_lost(&self, cause: LostCause) {
        self.send_to_actor(Event::ConnectionLost { cause, conn_seq: None });
    }

    pub(crate) async fn connection_lost_from(&self, conn_seq: u64, cause: LostCause) {
        self.send_to_actor(Event::ConnectionLost {
            cause,
            conn_seq: Some(conn_seq),
        });
    }

    pub(crate) async fn check_timeouts(&self) {
        self.send_to_actor(Event::CheckTimeouts);
    }

    pub(crate) async fn set_role(&self, role: Role, forced: bool) -> Result<(), AdminError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::SetRole {
            role,
            forced,
            callback: Callback(tx),
        });
        rx.await.unwrap_or(Err(AdminError::ActorExited))
    }

    pub(crate) async fn suspend_io(&self) -> Result<(), AdminError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::SuspendIo(Callback(tx)));
        rx.await.unwrap_or(Err(AdminError::ActorExited))
    }

    pub(crate) async fn resume_io(&self, fail_frozen: bool) -> Result<(), AdminError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::ResumeIo {
            fail_frozen,
            callback: Callback(tx),
        });
        rx.await.unwrap_or(Err(AdminError::ActorExited))
    }

    pub(crate) async fn status(&self) -> Result<DeviceStatus, AdminError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_actor(Event::Status(Callback(tx)));
        rx.await.unwrap_or(Err(AdminError::ActorExited))
    }
}

/// DeviceActor owns the Device core and runs its event loop.
pub(crate) struct DeviceActor {
    logger: slog::Logger,
    receiver: mpsc::UnboundedReceiver<Event>,
    device: Device,
}

impl DeviceActor {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::UnboundedReceiver<Event>, device: Device) -> Self {
        DeviceActor {
            logger,
            receiver,
            device,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "actor event"; "event" => ?event);
            self.handle_event(event);
            // Re-drive submissions parked on conflicts or postponed for
            // retry, now that this event may have unblocked them.
            self.device.drain_deferred();
        }
        slog::debug!(self.logger, "device actor exiting");
    }

    // Must NOT be async: every handler runs to completion under the
    // actor's implicit lock.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Submit(input, callback) => {
                self.device.submit(input, callback);
            }
            Event::LocalEndio { id, result } => {
                self.device.on_local_endio(id, result);
            }
            Event::SenderReport { id, outcome } => {
                let event = match outcome {
                    SendOutcome::HandedOver => ReqEvent::HandedOverToNetwork,
                    SendOutcome::OosHandedOver => ReqEvent::OosHandedToNetwork,
                    SendOutcome::Canceled => ReqEvent::SendCanceled,
                    SendOutcome::Failed => ReqEvent::SendFailed,
                };
                self.device.req_mod(id, event);
            }
            Event::PeerAck { block_id, kind } => {
                let id = ReqId(block_id);
                let event = match kind {
                    AckKind::WriteAcked { set_in_sync: true } => ReqEvent::WriteAckedByPeerAndSis,
                    AckKind::WriteAcked { set_in_sync: false } => ReqEvent::WriteAckedByPeer,
                    AckKind::RecvAcked => ReqEvent::RecvAckedByPeer,
                    AckKind::NegAcked => ReqEvent::NegAcked,
                    AckKind::DataReceived(data) => ReqEvent::DataReceived(data),
                };
                self.device.req_mod(id, event);
            }
            Event::BarrierAcked { barrier_nr, set_size } => {
                self.device.on_barrier_acked(barrier_nr, set_size);
            }
            Event::ResyncAcked { block_nr, ok } => {
                self.device.on_resync_acked(block_nr, ok);
            }
            Event::ResyncDrained => {
                self.device.on_resync_drained();
            }
            Event::TransportAttached(conn, callback) => {
                let conn_seq = self.device.on_transport_attached(conn);
                callback.send(Ok((self.device.our_params(), conn_seq)));
            }
            Event::Handshake(params) => {
                self.device.on_handshake(params);
            }
            Event::PeerCState { raw } => {
                self.device.on_peer_cstate(raw);
            }
            Event::ConnectionLost { cause, conn_seq } => {
                self.device.on_connection_lost(cause, conn_seq);
            }
            Event::CheckTimeouts => {
                self.device.on_check_timeouts();
            }
            Event::SetRole { role, forced, callback } => {
                callback.send(self.device.set_role(role, forced));
            }
            Event::SuspendIo(callback) => {
                self.device.suspend_io();
                callback.send(Ok(()));
            }
            Event::ResumeIo { fail_frozen, callback } => {
                self.device.resume_io(fail_frozen);
                callback.send(Ok(()));
            }
            Event::Status(callback) => {
                callback.send(Ok(self.device.status()));
            }
        }
    }
}
