use crate::actor::{AckKind, ActorClient};
use crate::api::options::MirrorOptionsValidated;
use crate::device::Counters;
use crate::wire::channel::{FramedReceiver, FramedSender, PingRequest, RecvError, SendError};
use crate::wire::packet::{Packet, ID_SYNCER};
use crate::workers::{AckWork, CollectOnExit, LostCause, WorkerCommand};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

pub(crate) struct AsenderCtx {
    pub logger: slog::Logger,
    pub meta_in: FramedReceiver,
    pub meta_out: FramedSender,
    pub ack_q: flume::Receiver<AckWork>,
    pub ping_request: Arc<PingRequest>,
    pub actor: ActorClient,
    pub counters: Arc<Counters>,
    pub opts: Arc<MirrorOptionsValidated>,
    pub stop: watch::Receiver<WorkerCommand>,
    pub collect: Arc<AtomicBool>,
    pub conn_id: u64,
}

/// Asender task: owns the meta channel. Dispatches incoming acks into the
/// state machine, writes the acks everyone else enqueues, answers pings,
/// probes the peer when the data channel stalls, and drives the
/// ack/disk-timeout watchdog.
pub(crate) async fn run_asender(mut ctx: AsenderCtx) {
    let _collect = CollectOnExit(ctx.collect.clone());
    let mut ping_deadline: Option<Instant> = None;
    let far_future = Duration::from_secs(24 * 3600);
    let mut watchdog = tokio::time::interval(ctx.opts.timeout / 2);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let ping_sleep = ping_deadline.unwrap_or_else(|| Instant::now() + far_future);

        tokio::select! {
            _ = ctx.stop.changed() => break,

            frame = ctx.meta_in.recv() => {
                let pkt = match frame {
                    Ok((pkt, n)) => {
                        Counters::add64(&ctx.counters.recv_bytes, n as u64);
                        pkt
                    }
                    Err(RecvError::Closed) => {
                        slog::info!(ctx.logger, "peer closed the meta channel");
                        ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                        break;
                    }
                    Err(e) => {
                        slog::error!(ctx.logger, "meta channel receive failed"; "error" => %e);
                        ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                        break;
                    }
                };

                match pkt {
                    Packet::BarrierAck { barrier_nr, set_size } => {
                        ctx.actor.barrier_acked(barrier_nr, set_size).await;
                    }
                    Packet::WriteAck { block_nr, block_id } => {
                        if block_id == ID_SYNCER {
                            ctx.actor.resync_acked(block_nr, true).await;
                        } else {
                            ctx.actor
                                .peer_ack(block_id, AckKind::WriteAcked { set_in_sync: true })
                                .await;
                        }
                    }
                    Packet::RecvAck { block_id, .. } => {
                        ctx.actor.peer_ack(block_id, AckKind::RecvAcked).await;
                    }
                    Packet::NegAck { block_nr, block_id } => {
                        if block_id == ID_SYNCER {
                            ctx.actor.resync_acked(block_nr, false).await;
                        } else {
                            ctx.actor.peer_ack(block_id, AckKind::NegAcked).await;
                        }
                    }
                    Packet::Ping => {
                        if let Err(e) = send_meta(&mut ctx, &Packet::PingAck).await {
                            slog::error!(ctx.logger, "ping ack send failed"; "error" => %e);
                            ctx.actor.connection_lost_from(ctx.conn_id, cause_of(&e)).await;
                            break;
                        }
                    }
                    Packet::PingAck => {
                        ping_deadline = None;
                    }
                    Packet::CStateChanged { cstate } => {
                        ctx.actor.peer_cstate(cstate).await;
                    }
                    other => {
                        slog::warn!(ctx.logger, "unexpected packet on the meta channel";
                            "command" => ?other.command());
                    }
                }
            }

            work = ctx.ack_q.recv_async() => {
                let Ok(work) = work else { break };
                let pkt = match work {
                    AckWork::RecvAck { block_nr, block_id } => Packet::RecvAck { block_nr, block_id },
                    AckWork::WriteAck { block_nr, block_id } => Packet::WriteAck { block_nr, block_id },
                    AckWork::NegAck { block_nr, block_id } => Packet::NegAck { block_nr, block_id },
                    AckWork::BarrierAck { barrier_nr, set_size } => {
                        Packet::BarrierAck { barrier_nr, set_size }
                    }
                    AckWork::CStateChanged { cstate } => Packet::CStateChanged { cstate },
                };
                if let Err(e) = send_meta(&mut ctx, &pkt).await {
                    slog::error!(ctx.logger, "meta send failed"; "error" => %e);
                    ctx.actor.connection_lost_from(ctx.conn_id, cause_of(&e)).await;
                    break;
                }
            }

            _ = ctx.ping_request.raised() => {
                // The data channel asked for a liveness probe.
                match send_meta(&mut ctx, &Packet::Ping).await {
                    Ok(()) => {
                        if ping_deadline.is_none() {
                            ping_deadline = Some(Instant::now() + ctx.opts.ping_timeout);
                        }
                    }
                    Err(e) => {
                        slog::error!(ctx.logger, "ping send failed"; "error" => %e);
                        ctx.actor.connection_lost_from(ctx.conn_id, cause_of(&e)).await;
                        break;
                    }
                }
            }

            _ = tokio::time::sleep_until(ping_sleep) => {
                if ping_deadline.take().is_some() {
                    slog::error!(ctx.logger, "ping ack timed out");
                    ctx.actor.connection_lost_from(ctx.conn_id, LostCause::Timeout).await;
                    break;
                }
            }

            _ = watchdog.tick() => {
                ctx.actor.check_timeouts().await;
            }
        }
    }

    slog::debug!(ctx.logger, "asender task exiting");
}

async fn send_meta(ctx: &mut AsenderCtx, pkt: &Packet) -> Result<(), SendError> {
    let n = ctx.meta_out.send(pkt).await?;
    Counters::add64(&ctx.counters.send_bytes, n as u64);
    Ok(())
}

fn cause_of(e: &SendError) -> LostCause {
    match e {
        SendError::Timeout => LostCause::Timeout,
        _ => LostCause::BrokenPipe,
    }
}
