use crate::actor::ActorClient;
use crate::device::{Counters, TransferLog};
use crate::wire::channel::FramedSender;
use crate::wire::packet::Packet;
use crate::workers::{CollectOnExit, LostCause, SendOutcome, SendWork, WorkerCommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::sync::Mutex;

pub(crate) struct SenderCtx {
    pub logger: slog::Logger,
    pub work: flume::Receiver<SendWork>,
    pub data_out: Arc<Mutex<FramedSender>>,
    pub tl: Arc<RwLock<TransferLog>>,
    pub issue_barrier: Arc<AtomicBool>,
    pub counters: Arc<Counters>,
    pub actor: ActorClient,
    pub stop: watch::Receiver<WorkerCommand>,
    pub collect: Arc<AtomicBool>,
    pub conn_id: u64,
}

/// Sender task: drains the work queue onto the data channel.
///
/// The critical section: a pending barrier is appended to the transfer log
/// and written to the wire, and a data block is written and ring-installed,
/// all under the one data-channel send permit — this is what keeps epochs
/// on the wire identical to epochs in the log.
pub(crate) async fn run_sender(mut ctx: SenderCtx) {
    let _collect = CollectOnExit(ctx.collect.clone());
    loop {
        let work = tokio::select! {
            _ = ctx.stop.changed() => break,
            work = ctx.work.recv_async() => match work {
                Ok(work) => work,
                Err(_) => break,
            },
        };

        match work {
            SendWork::DBlock { id, sector, data } => {
                let mut ch = ctx.data_out.lock().await;

                if ctx.issue_barrier.swap(false, Ordering::AcqRel) {
                    let barrier_nr = ctx.tl.write().expect("transfer log lock poisoned").add_barrier();
                    match ch.send(&Packet::Barrier { barrier_nr }).await {
                        Ok(n) => Counters::add64(&ctx.counters.send_bytes, n as u64),
                        Err(e) => {
                            drop(ch);
                            slog::error!(ctx.logger, "barrier send failed"; "error" => %e);
                            ctx.actor.sender_report(id, SendOutcome::Failed).await;
                            ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                            break;
                        }
                    }
                }

                let pkt = Packet::Data {
                    block_nr: sector,
                    block_id: id.0,
                    data,
                };
                match ch.send(&pkt).await {
                    Ok(n) => {
                        Counters::add64(&ctx.counters.send_bytes, n as u64);
                        // Within the same permit as the wire write.
                        ctx.tl.write().expect("transfer log lock poisoned").add(id);
                        drop(ch);
                        ctx.actor.sender_report(id, SendOutcome::HandedOver).await;
                    }
                    Err(e) => {
                        drop(ch);
                        slog::error!(ctx.logger, "data send failed"; "error" => %e);
                        ctx.actor.sender_report(id, SendOutcome::Failed).await;
                        ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                        break;
                    }
                }
            }

            SendWork::ReadReq { id, sector, size } => {
                let mut ch = ctx.data_out.lock().await;
                let pkt = Packet::DataRequest {
                    block_nr: sector,
                    block_id: id.0,
                    size,
                };
                match ch.send(&pkt).await {
                    Ok(n) => {
                        Counters::add64(&ctx.counters.send_bytes, n as u64);
                        drop(ch);
                        ctx.actor.sender_report(id, SendOutcome::HandedOver).await;
                    }
                    Err(e) => {
                        drop(ch);
                        slog::error!(ctx.logger, "read request send failed"; "error" => %e);
                        ctx.actor.sender_report(id, SendOutcome::Failed).await;
                        ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                        break;
                    }
                }
            }

            SendWork::OutOfSync { id, sector, size } => {
                let mut ch = ctx.data_out.lock().await;
                let pkt = Packet::OutOfSync {
                    block_nr: sector,
                    size,
                };
                match ch.send(&pkt).await {
                    Ok(n) => {
                        Counters::add64(&ctx.counters.send_bytes, n as u64);
                        drop(ch);
                        ctx.actor.sender_report(id, SendOutcome::OosHandedOver).await;
                    }
                    Err(e) => {
                        drop(ch);
                        slog::error!(ctx.logger, "out-of-sync send failed"; "error" => %e);
                        ctx.actor.sender_report(id, SendOutcome::Failed).await;
                        ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                        break;
                    }
                }
            }

            SendWork::Barrier => {
                if !ctx.issue_barrier.swap(false, Ordering::AcqRel) {
                    continue;
                }
                let mut ch = ctx.data_out.lock().await;
                let barrier_nr = ctx.tl.write().expect("transfer log lock poisoned").add_barrier();
                match ch.send(&Packet::Barrier { barrier_nr }).await {
                    Ok(n) => Counters::add64(&ctx.counters.send_bytes, n as u64),
                    Err(e) => {
                        drop(ch);
                        slog::error!(ctx.logger, "barrier send failed"; "error" => %e);
                        ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                        break;
                    }
                }
            }
        }
    }

    // Anything still queued will never reach the wire on this connection.
    while let Ok(work) = ctx.work.try_recv() {
        match work {
            SendWork::DBlock { id, .. } | SendWork::ReadReq { id, .. } | SendWork::OutOfSync { id, .. } => {
                ctx.actor.sender_report(id, SendOutcome::Canceled).await;
            }
            SendWork::Barrier => {}
        }
    }

    slog::debug!(ctx.logger, "sender task exiting");
}
