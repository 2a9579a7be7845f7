mod activity_log;
mod bitmap;
mod device;
mod intervals;
mod metadata;
mod request;
mod transfer_log;

pub use bitmap::Bitmap;
pub use bitmap::SyncState;
pub use bitmap::BM_BLOCK_SHIFT;
pub use bitmap::BM_BLOCK_SIZE;
pub use metadata::compare;
pub use metadata::Authority;
pub use metadata::FileMetadataStore;
pub use metadata::GenCounts;
pub use metadata::GenEvent;
pub use metadata::Metadata;
pub use metadata::MetadataStore;
pub use metadata::VolatileMetadataStore;
pub use device::AdminError;
pub use request::RequestError;

pub(crate) use activity_log::ActivityLog;
pub(crate) use device::Connection;
pub(crate) use device::Device;
pub(crate) use device::DeviceSeed;
pub(crate) use device::SubmitInput;
pub(crate) use device::SubmitOp;
pub(crate) use intervals::IntervalMap;
pub(crate) use request::ReqEvent;
pub(crate) use request::ReqId;
pub(crate) use request::Request;
pub(crate) use request::RequestTable;
pub(crate) use transfer_log::TransferLog;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Per-device counters shared between the actor and the worker tasks.
#[derive(Default)]
pub struct Counters {
    /// Mirrored requests awaiting a peer ack.
    pub(crate) ap_pending: AtomicU32,
    /// Resync data packets awaiting a peer ack.
    pub(crate) rs_pending: AtomicU32,
    /// Peer writes we still owe an ack for.
    pub(crate) unacked: AtomicU32,
    /// Sectors handed to the network and not yet acked or barrier-acked.
    pub(crate) ap_in_flight: AtomicU64,
    /// Local backing I/Os in flight.
    pub(crate) local_cnt: AtomicU32,
    pub(crate) send_bytes: AtomicU64,
    pub(crate) recv_bytes: AtomicU64,
    pub(crate) read_sectors: AtomicU64,
    pub(crate) writ_sectors: AtomicU64,
}

impl Counters {
    pub(crate) fn inc(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec(counter: &AtomicU32) {
        let prev = counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "counter underflow");
    }

    pub(crate) fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::Acquire)
    }

    pub(crate) fn add64(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn sub64(counter: &AtomicU64, n: u64) {
        counter.fetch_sub(n, Ordering::AcqRel);
    }

    pub(crate) fn get64(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Acquire)
    }
}
