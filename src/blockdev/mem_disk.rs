use crate::blockdev::{BlockTarget, SECTOR_SIZE};
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

// Theoretically-durable backing storage. Production deployments wire a real
// block device behind the BlockTarget trait; the in-memory target exists so
// the engine (and its tests) can run a full pair without touching hardware.
pub struct MemDisk {
    capacity: u64,
    blocks: RwLock<Vec<u8>>,
    fail_io: AtomicBool,
}

impl MemDisk {
    pub fn new(capacity: u64) -> Self {
        MemDisk {
            capacity,
            blocks: RwLock::new(vec![0u8; capacity as usize]),
            fail_io: AtomicBool::new(false),
        }
    }

    /// Make every subsequent I/O fail. Used to exercise the local-disk error
    /// paths.
    pub fn set_failing(&self, failing: bool) {
        self.fail_io.store(failing, Ordering::Release);
    }

    fn check_range(&self, offset: u64, len: u64, capacity: u64) -> io::Result<()> {
        if self.fail_io.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected disk failure"));
        }
        if offset.checked_add(len).map_or(true, |end| end > capacity) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("I/O beyond end of device: offset={} len={}", offset, len),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlockTarget for MemDisk {
    async fn read_at(&self, sector: u64, size: u32) -> io::Result<Bytes> {
        let blocks = self.blocks.read().await;
        let offset = sector * SECTOR_SIZE;
        self.check_range(offset, size as u64, blocks.len() as u64)?;
        let offset = offset as usize;
        Ok(Bytes::copy_from_slice(&blocks[offset..offset + size as usize]))
    }

    async fn write_at(&self, sector: u64, data: Bytes) -> io::Result<()> {
        let mut blocks = self.blocks.write().await;
        let offset = sector * SECTOR_SIZE;
        self.check_range(offset, data.len() as u64, blocks.len() as u64)?;
        let offset = offset as usize;
        blocks[offset..offset + data.len()].copy_from_slice(&data);
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let disk = MemDisk::new(8192);
        disk.write_at(2, Bytes::from_static(b"hello")).await.unwrap();
        let out = disk.read_at(2, 5).await.unwrap();
        assert_eq!(&out[..], b"hello");
    }

    #[tokio::test]
    async fn rejects_out_of_range() {
        let disk = MemDisk::new(1024);
        assert!(disk.read_at(2, 4096).await.is_err());
        assert!(disk.write_at(4, Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn injected_failure() {
        let disk = MemDisk::new(1024);
        disk.set_failing(true);
        assert!(disk.read_at(0, 512).await.is_err());
        disk.set_failing(false);
        assert!(disk.read_at(0, 512).await.is_ok());
    }
}
