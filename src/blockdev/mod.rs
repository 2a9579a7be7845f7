mod mem_disk;

pub use mem_disk::MemDisk;

use bytes::Bytes;
use std::io;

pub const SECTOR_SIZE: u64 = 512;

/// BlockTarget is the local backing storage a device mirrors. The core only
/// needs submit/endio semantics: an async call that resolves when the blocks
/// are durable (write) or available (read).
#[async_trait::async_trait]
pub trait BlockTarget: Send + Sync {
    async fn read_at(&self, sector: u64, size: u32) -> io::Result<Bytes>;

    async fn write_at(&self, sector: u64, data: Bytes) -> io::Result<()>;

    /// Device capacity in bytes.
    fn capacity(&self) -> u64;

    /// Largest single request the backing device accepts, in bytes.
    /// Mirrors a lower-level merge_bvec limit.
    fn merge_limit(&self) -> u32 {
        u32::MAX
    }

    /// Whether the backing device currently reports read congestion.
    /// Consulted by the `CongestedRemote` read-balancing policy.
    fn read_congested(&self) -> bool {
        false
    }
}
