use crate::actor::ActorClient;
use crate::api::options::MirrorOptionsValidated;
use crate::api::types::Protocol;
use crate::blockdev::BlockTarget;
use crate::device::{Bitmap, Counters, SyncState};
use crate::wire::channel::{FramedReceiver, FramedSender, RecvError};
use crate::wire::packet::{Packet, ID_SYNCER};
use crate::workers::{CollectOnExit, LostCause, WorkerCommand};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::sync::Mutex;

pub(crate) struct ReceiverCtx {
    pub logger: slog::Logger,
    pub data_in: FramedReceiver,
    pub data_out: Arc<Mutex<FramedSender>>,
    pub ack_q: flume::Sender<crate::workers::AckWork>,
    pub actor: ActorClient,
    pub target: Arc<dyn BlockTarget>,
    pub bitmap: Arc<Bitmap>,
    pub counters: Arc<Counters>,
    pub opts: Arc<MirrorOptionsValidated>,
    pub stop: watch::Receiver<WorkerCommand>,
    pub collect: Arc<AtomicBool>,
    pub conn_id: u64,
}

/// Receiver task: the peer-to-us side of the data channel. Expects the
/// handshake frame first, then dispatches peer writes, read requests,
/// read replies and barriers.
pub(crate) async fn run_receiver(mut ctx: ReceiverCtx) {
    let _collect = CollectOnExit(ctx.collect.clone());
    let mut shaken = false;
    // Completed peer writes in the epoch being received.
    let mut epoch_size: u32 = 0;

    loop {
        let frame = tokio::select! {
            _ = ctx.stop.changed() => break,
            frame = ctx.data_in.recv() => frame,
        };

        let (pkt, frame_len) = match frame {
            Ok(ok) => ok,
            Err(RecvError::Closed) => {
                slog::info!(ctx.logger, "peer closed the data channel");
                ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                break;
            }
            Err(e) => {
                slog::error!(ctx.logger, "data channel receive failed"; "error" => %e);
                ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                break;
            }
        };
        Counters::add64(&ctx.counters.recv_bytes, frame_len as u64);

        if !shaken {
            match pkt {
                Packet::ReportParams(params) => {
                    shaken = true;
                    ctx.actor.handshake(params).await;
                    continue;
                }
                other => {
                    slog::crit!(ctx.logger, "peer spoke before the handshake";
                        "command" => ?other.command());
                    ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                    break;
                }
            }
        }

        match pkt {
            Packet::Data { block_nr, block_id, data } => {
                let size = data.len() as u32;
                if block_id == ID_SYNCER {
                    // Resync data: write it, ack it, never log it.
                    match ctx.target.write_at(block_nr, data).await {
                        Ok(()) => {
                            Counters::add64(&ctx.counters.writ_sectors, (size >> 9) as u64);
                            let ln2 = ctx.opts.ln2_block_size;
                            ctx.bitmap
                                .set_bit((block_nr * 512) >> ln2, ln2, SyncState::InSync);
                            let _ = ctx.ack_q.send(crate::workers::AckWork::WriteAck {
                                block_nr,
                                block_id: ID_SYNCER,
                            });
                        }
                        Err(e) => {
                            slog::error!(ctx.logger, "resync write failed"; "error" => %e);
                            let _ = ctx.ack_q.send(crate::workers::AckWork::NegAck {
                                block_nr,
                                block_id: ID_SYNCER,
                            });
                        }
                    }
                } else {
                    // Mirrored write from the (primary) peer. It counts
                    // into the epoch whatever its local fate, to match the
                    // sender's transfer log.
                    epoch_size += 1;
                    Counters::inc(&ctx.counters.unacked);
                    if ctx.opts.protocol == Protocol::B {
                        let _ = ctx.ack_q.send(crate::workers::AckWork::RecvAck { block_nr, block_id });
                    }
                    match ctx.target.write_at(block_nr, data).await {
                        Ok(()) => {
                            Counters::add64(&ctx.counters.writ_sectors, (size >> 9) as u64);
                            if ctx.opts.protocol == Protocol::C {
                                let _ = ctx
                                    .ack_q
                                    .send(crate::workers::AckWork::WriteAck { block_nr, block_id });
                            }
                        }
                        Err(e) => {
                            slog::error!(ctx.logger, "peer write failed locally"; "error" => %e);
                            ctx.bitmap.set_range(block_nr, size, SyncState::OutOfSync);
                            let _ = ctx.ack_q.send(crate::workers::AckWork::NegAck { block_nr, block_id });
                        }
                    }
                    Counters::dec(&ctx.counters.unacked);
                }
            }

            Packet::Barrier { barrier_nr } => {
                // All writes of the epoch have already been applied (they
                // are processed in wire order), so the epoch is drained.
                let _ = ctx.ack_q.send(crate::workers::AckWork::BarrierAck {
                    barrier_nr,
                    set_size: epoch_size,
                });
                epoch_size = 0;
            }

            Packet::DataRequest { block_nr, block_id, size } => {
                match ctx.target.read_at(block_nr, size).await {
                    Ok(data) => {
                        Counters::add64(&ctx.counters.read_sectors, (size >> 9) as u64);
                        let reply = Packet::DataReply { block_nr, block_id, data };
                        let mut ch = ctx.data_out.lock().await;
                        match ch.send(&reply).await {
                            Ok(n) => Counters::add64(&ctx.counters.send_bytes, n as u64),
                            Err(e) => {
                                drop(ch);
                                slog::error!(ctx.logger, "read reply send failed"; "error" => %e);
                                ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        slog::error!(ctx.logger, "peer read failed locally"; "error" => %e);
                        let _ = ctx.ack_q.send(crate::workers::AckWork::NegAck { block_nr, block_id });
                    }
                }
            }

            Packet::DataReply { block_id, data, .. } => {
                ctx.actor
                    .peer_ack(block_id, crate::actor::AckKind::DataReceived(data))
                    .await;
            }

            Packet::OutOfSync { block_nr, size } => {
                ctx.bitmap.set_range(block_nr, size, SyncState::OutOfSync);
            }

            Packet::ReportParams(params) => {
                ctx.actor.handshake(params).await;
            }

            Packet::CStateChanged { cstate } => {
                ctx.actor.peer_cstate(cstate).await;
            }

            other => {
                slog::warn!(ctx.logger, "unexpected packet on the data channel";
                    "command" => ?other.command());
            }
        }
    }

    slog::debug!(ctx.logger, "receiver task exiting");
}
