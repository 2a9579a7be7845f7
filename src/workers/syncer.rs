use crate::actor::ActorClient;
use crate::api::options::MirrorOptionsValidated;
use crate::api::types::ConnState;
use crate::blockdev::BlockTarget;
use crate::device::{Bitmap, Counters};
use crate::wire::channel::FramedSender;
use crate::wire::packet::{Packet, ID_SYNCER};
use crate::workers::{CollectOnExit, LostCause, WorkerCommand};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::time::Duration;

pub(crate) struct SyncerCtx {
    pub logger: slog::Logger,
    pub cstate: watch::Receiver<ConnState>,
    pub data_out: Arc<Mutex<FramedSender>>,
    pub bitmap: Arc<Bitmap>,
    pub target: Arc<dyn BlockTarget>,
    pub counters: Arc<Counters>,
    pub actor: ActorClient,
    pub opts: Arc<MirrorOptionsValidated>,
    pub stop: watch::Receiver<WorkerCommand>,
    pub collect: Arc<AtomicBool>,
    pub conn_id: u64,
}

/// Syncer task: while this node is SyncSource, walk the dirty bitmap and
/// resend the authoritative copy of each out-of-sync block, tagged with
/// ID_SYNCER so the peer acks without logging.
pub(crate) async fn run_syncer(mut ctx: SyncerCtx) {
    let _collect = CollectOnExit(ctx.collect.clone());

    loop {
        // Wait to become sync source (or to be stopped).
        while *ctx.cstate.borrow() != ConnState::SyncSource {
            tokio::select! {
                _ = ctx.stop.changed() => return,
                changed = ctx.cstate.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let ln2 = ctx.opts.ln2_block_size;
        let block_size = 1u32 << ln2;
        slog::info!(ctx.logger, "resync starting";
            "dirty_blocks" => ctx.bitmap.total_dirty(), "block_size" => block_size);
        ctx.bitmap.reset(ln2);

        'scan: loop {
            if *ctx.stop.borrow() == WorkerCommand::Exit {
                return;
            }
            if *ctx.cstate.borrow() != ConnState::SyncSource {
                break 'scan;
            }

            // Bound the number of un-acked resync blocks in flight.
            if Counters::get(&ctx.counters.rs_pending) >= ctx.opts.sync_window {
                tokio::time::sleep(Duration::from_millis(2)).await;
                continue;
            }

            let Some(blocknr) = ctx.bitmap.next_dirty(ln2) else {
                ctx.actor.resync_drained().await;
                break 'scan;
            };
            let sector = blocknr << (ln2 - 9);

            let data = match ctx.target.read_at(sector, block_size).await {
                Ok(data) => data,
                Err(e) => {
                    slog::error!(ctx.logger, "resync read failed, block stays dirty";
                        "sector" => sector, "error" => %e);
                    continue;
                }
            };

            Counters::inc(&ctx.counters.rs_pending);
            let pkt = Packet::Data {
                block_nr: sector,
                block_id: ID_SYNCER,
                data,
            };
            let mut ch = ctx.data_out.lock().await;
            match ch.send(&pkt).await {
                Ok(n) => Counters::add64(&ctx.counters.send_bytes, n as u64),
                Err(e) => {
                    drop(ch);
                    Counters::dec(&ctx.counters.rs_pending);
                    slog::error!(ctx.logger, "resync send failed"; "error" => %e);
                    ctx.actor.connection_lost_from(ctx.conn_id, LostCause::BrokenPipe).await;
                    return;
                }
            }
        }

        // Wait out the tail of the sync (acks drain via the asender) or the
        // next trigger.
        tokio::select! {
            _ = ctx.stop.changed() => return,
            changed = ctx.cstate.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
