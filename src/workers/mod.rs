mod asender;
mod receiver;
mod sender;
mod syncer;

pub(crate) use asender::run_asender;
pub(crate) use asender::AsenderCtx;
pub(crate) use receiver::run_receiver;
pub(crate) use receiver::ReceiverCtx;
pub(crate) use sender::run_sender;
pub(crate) use sender::SenderCtx;
pub(crate) use syncer::run_syncer;
pub(crate) use syncer::SyncerCtx;

use crate::device::ReqId;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Why a connection went away.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum LostCause {
    Timeout,
    BrokenPipe,
    Disconnecting,
}

/// Stop control for the worker tasks of one connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum WorkerCommand {
    Run,
    Exit,
}

/// Work items for the sender task: a tagged request handle, dispatched on
/// the tag. Queue order is wire order.
#[derive(Debug)]
pub(crate) enum SendWork {
    DBlock { id: ReqId, sector: u64, data: Bytes },
    ReadReq { id: ReqId, sector: u64, size: u32 },
    OutOfSync { id: ReqId, sector: u64, size: u32 },
    Barrier,
}

/// Acks and notifications owed to the peer. Only the asender writes to the
/// meta channel; everyone else enqueues here.
#[derive(Debug)]
pub(crate) enum AckWork {
    RecvAck { block_nr: u64, block_id: u64 },
    WriteAck { block_nr: u64, block_id: u64 },
    NegAck { block_nr: u64, block_id: u64 },
    BarrierAck { barrier_nr: u32, set_size: u32 },
    CStateChanged { cstate: u32 },
}

/// Outcome a sender work item reports back into the state machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SendOutcome {
    HandedOver,
    OosHandedOver,
    Canceled,
    Failed,
}

/// Terminated worker handles are reaped by the owner once the collect flag
/// went up; a fresh attach must not leak the previous connection's tasks.
pub(crate) struct WorkerSet {
    collect: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerSet {
    pub(crate) fn new() -> Self {
        WorkerSet {
            collect: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    pub(crate) fn collect_flag(&self) -> Arc<AtomicBool> {
        self.collect.clone()
    }

    pub(crate) fn adopt(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Await handles of workers that flagged termination.
    pub(crate) async fn reap(&mut self) {
        if !self.collect.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut live = Vec::new();
        for handle in self.handles.drain(..) {
            if handle.is_finished() {
                let _ = handle.await;
            } else {
                live.push(handle);
            }
        }
        self.handles = live;
    }
}

/// RAII guard: raises the collect flag when a worker task returns.
pub(crate) struct CollectOnExit(pub Arc<AtomicBool>);

impl Drop for CollectOnExit {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}
